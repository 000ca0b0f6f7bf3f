use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use cdc_core::{
    ConsumerGroup, Error, GroupSession, LogMessage, OffsetMarker, PartitionClaim, Result,
};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::TopicPartitionList;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::{GroupContext, RebalanceEvent};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    /// Kafka brokers
    pub brokers: Vec<String>,

    /// Topic to consume from and publish to
    pub topic: String,

    /// Consumer group ID
    pub group_id: String,

    /// Where a group without committed offsets starts ("earliest" or "latest")
    pub auto_offset_reset: String,

    pub session_timeout_ms: u64,

    /// How often marked offsets are committed
    pub auto_commit_interval_ms: u64,

    /// Producer delivery timeout
    pub message_timeout_ms: u64,

    /// Messages buffered per partition claim
    pub claim_buffer: usize,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            topic: "cdc-events".to_string(),
            group_id: "cdc-indexer".to_string(),
            auto_offset_reset: "earliest".to_string(),
            session_timeout_ms: 30000,
            auto_commit_interval_ms: 5000,
            message_timeout_ms: 30000,
            claim_buffer: 64,
        }
    }
}

impl KafkaConfig {
    pub fn consumer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", self.brokers.join(","))
            .set("group.id", &self.group_id)
            .set("enable.auto.commit", "true")
            .set(
                "auto.commit.interval.ms",
                self.auto_commit_interval_ms.to_string(),
            )
            // Offsets are stored only once a message is marked
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", self.session_timeout_ms.to_string())
            .set("enable.partition.eof", "false");
        config
    }

    pub fn producer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", self.brokers.join(","))
            .set("message.timeout.ms", self.message_timeout_ms.to_string());
        config
    }
}

struct Shared {
    consumer: StreamConsumer<GroupContext>,
    rebalances: tokio::sync::Mutex<mpsc::UnboundedReceiver<RebalanceEvent>>,
    errors: mpsc::UnboundedSender<Error>,
    subscribed: AtomicBool,
}

impl Shared {
    /// Leave the group; the next join subscribes again and every partition
    /// restarts from its committed offset
    fn reset(&self) {
        self.consumer.unsubscribe();
        self.subscribed.store(false, Ordering::SeqCst);
    }
}

async fn recv_owned(consumer: &StreamConsumer<GroupContext>) -> KafkaResult<LogMessage> {
    let message = consumer.recv().await?;
    Ok(LogMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        payload: message
            .payload()
            .map(Bytes::copy_from_slice)
            .unwrap_or_default(),
    })
}

/// Consumer group membership backed by a single rdkafka consumer that is
/// reused across sessions
pub struct KafkaConsumerGroup {
    config: KafkaConfig,
    shared: Arc<Shared>,
    errors: Mutex<Option<mpsc::UnboundedReceiver<Error>>>,
}

impl KafkaConsumerGroup {
    pub fn new(config: KafkaConfig) -> Result<Self> {
        let (rebalances_tx, rebalances_rx) = mpsc::unbounded_channel();
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();

        info!(
            "Creating consumer group '{}' on brokers {:?}",
            config.group_id, config.brokers
        );
        let consumer: StreamConsumer<GroupContext> = config
            .consumer_config()
            .create_with_context(GroupContext::new(rebalances_tx, errors_tx.clone()))
            .map_err(|e| Error::Connection(format!("Failed to create consumer group: {}", e)))?;

        Ok(Self {
            config,
            shared: Arc::new(Shared {
                consumer,
                rebalances: tokio::sync::Mutex::new(rebalances_rx),
                errors: errors_tx,
                subscribed: AtomicBool::new(false),
            }),
            errors: Mutex::new(Some(errors_rx)),
        })
    }

    /// Poll the consumer until the broker assigns partitions. `None` means a
    /// message showed up with no assignment in place.
    async fn wait_for_assignment(
        &self,
        rebalances: &mut mpsc::UnboundedReceiver<RebalanceEvent>,
    ) -> Result<Option<Vec<(String, i32)>>> {
        loop {
            let received = tokio::select! {
                biased;
                event = rebalances.recv() => match event {
                    Some(RebalanceEvent::Assigned(partitions)) => return Ok(Some(partitions)),
                    Some(RebalanceEvent::Revoked(_)) => continue,
                    None => {
                        return Err(Error::Connection(
                            "Rebalance notifications closed".to_string(),
                        ))
                    }
                },
                received = recv_owned(&self.shared.consumer) => received,
            };

            match received {
                Ok(message) => {
                    warn!(
                        "Received {}[{}]@{} before any assignment",
                        message.topic, message.partition, message.offset
                    );
                    return Ok(None);
                }
                Err(e) => {
                    let _ = self
                        .shared
                        .errors
                        .send(Error::Connection(format!("Consumer error: {}", e)));
                }
            }
        }
    }
}

#[async_trait]
impl ConsumerGroup for KafkaConsumerGroup {
    async fn join(&self) -> Result<Box<dyn GroupSession>> {
        let mut rebalances = self.shared.rebalances.lock().await;

        let partitions = loop {
            if !self.shared.subscribed.load(Ordering::SeqCst) {
                self.shared
                    .consumer
                    .subscribe(&[self.config.topic.as_str()])
                    .map_err(|e| {
                        Error::Connection(format!(
                            "Failed to subscribe to '{}': {}",
                            self.config.topic, e
                        ))
                    })?;
                self.shared.subscribed.store(true, Ordering::SeqCst);
                info!(
                    "Subscribed to '{}' as group '{}'",
                    self.config.topic, self.config.group_id
                );
            }

            match self.wait_for_assignment(&mut rebalances).await? {
                Some(partitions) => break partitions,
                None => self.shared.reset(),
            }
        };
        drop(rebalances);

        Ok(Box::new(KafkaSession::start(
            self.shared.clone(),
            partitions,
            self.config.claim_buffer,
        )))
    }

    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<Error>> {
        self.errors.lock().ok()?.take()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionExit {
    /// Partitions were revoked or reassigned
    Revoked,
    /// A message arrived for a partition this session does not own
    Unassigned,
    /// A message arrived for a paused partition while one was still parked
    Overrun,
    /// A claim stopped reading
    ClaimDropped,
    Stopped,
}

impl SessionExit {
    fn ended_by_broker(self) -> bool {
        matches!(self, SessionExit::Revoked | SessionExit::Unassigned)
    }
}

type PartitionKey = (String, i32);

#[derive(Debug, PartialEq, Eq)]
enum Routed {
    Delivered,
    /// The claim's buffer is full; the message is held until it has room and
    /// the partition has to be paused meanwhile
    Parked(PartitionKey),
    Overrun,
    Unassigned,
    ClaimDropped,
}

#[derive(Debug, PartialEq, Eq)]
enum Released {
    /// A parked message reached its claim; the partition can be resumed
    Resume(PartitionKey),
    ClaimDropped,
}

/// Per-partition claim buffers. A full buffer parks at most one message for
/// that partition only, so a slow claim never blocks its siblings.
struct Router {
    routes: HashMap<PartitionKey, mpsc::Sender<LogMessage>>,
    parked: HashMap<PartitionKey, LogMessage>,
    permits: JoinSet<(PartitionKey, Option<mpsc::OwnedPermit<LogMessage>>)>,
}

impl Router {
    fn new(routes: HashMap<PartitionKey, mpsc::Sender<LogMessage>>) -> Self {
        Self {
            routes,
            parked: HashMap::new(),
            permits: JoinSet::new(),
        }
    }

    fn route(&mut self, message: LogMessage) -> Routed {
        let key = (message.topic.clone(), message.partition);
        if self.parked.contains_key(&key) {
            return Routed::Overrun;
        }
        let Some(route) = self.routes.get(&key) else {
            return Routed::Unassigned;
        };

        match route.try_send(message) {
            Ok(()) => Routed::Delivered,
            Err(TrySendError::Closed(_)) => Routed::ClaimDropped,
            Err(TrySendError::Full(message)) => {
                let permit = route.clone().reserve_owned();
                let waiting = key.clone();
                self.permits
                    .spawn(async move { (waiting, permit.await.ok()) });
                self.parked.insert(key.clone(), message);
                Routed::Parked(key)
            }
        }
    }

    /// Hand the next parked message to its claim once the claim has room.
    /// Pending while nothing is parked.
    async fn release(&mut self) -> Released {
        match self.permits.join_next().await {
            None => std::future::pending().await,
            Some(Ok((key, Some(permit)))) => {
                if let Some(message) = self.parked.remove(&key) {
                    permit.send(message);
                }
                Released::Resume(key)
            }
            Some(Ok((_, None))) | Some(Err(_)) => Released::ClaimDropped,
        }
    }

    fn parked_partitions(&self) -> Vec<PartitionKey> {
        self.parked.keys().cloned().collect()
    }
}

fn partition_list(keys: &[PartitionKey]) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::new();
    for (topic, partition) in keys {
        tpl.add_partition(topic, *partition);
    }
    tpl
}

/// Routes consumed messages to the claim owning their partition, in order
async fn dispatch(
    shared: Arc<Shared>,
    routes: HashMap<PartitionKey, mpsc::Sender<LogMessage>>,
    stop: CancellationToken,
) -> SessionExit {
    let mut router = Router::new(routes);
    let exit = route_messages(&shared, &mut router, &stop).await;

    let parked = router.parked_partitions();
    if !parked.is_empty() {
        if let Err(e) = shared.consumer.resume(&partition_list(&parked)) {
            warn!("Failed to resume partitions {:?}: {}", parked, e);
        }
    }
    exit
}

async fn route_messages(
    shared: &Shared,
    router: &mut Router,
    stop: &CancellationToken,
) -> SessionExit {
    let mut rebalances = shared.rebalances.lock().await;

    loop {
        let received = tokio::select! {
            biased;
            _ = stop.cancelled() => return SessionExit::Stopped,
            _ = rebalances.recv() => return SessionExit::Revoked,
            released = router.release() => {
                match released {
                    Released::Resume(key) => {
                        debug!("Resuming {}[{}]", key.0, key.1);
                        if let Err(e) = shared.consumer.resume(&partition_list(&[key])) {
                            let _ = shared
                                .errors
                                .send(Error::Connection(format!("Failed to resume partition: {}", e)));
                        }
                        continue;
                    }
                    Released::ClaimDropped => return SessionExit::ClaimDropped,
                }
            }
            received = recv_owned(&shared.consumer) => received,
        };

        // A rebalance served by the same poll applies before its messages
        if rebalances.try_recv().is_ok() {
            return SessionExit::Revoked;
        }

        let message = match received {
            Ok(message) => message,
            Err(e) => {
                let _ = shared
                    .errors
                    .send(Error::Connection(format!("Consumer error: {}", e)));
                continue;
            }
        };
        let (topic, partition, offset) = (message.topic.clone(), message.partition, message.offset);

        match router.route(message) {
            Routed::Delivered => {}
            Routed::Parked(key) => {
                debug!("Claim buffer for {}[{}] is full, pausing", key.0, key.1);
                if let Err(e) = shared.consumer.pause(&partition_list(&[key])) {
                    let _ = shared
                        .errors
                        .send(Error::Connection(format!("Failed to pause partition: {}", e)));
                }
            }
            Routed::Overrun => {
                warn!(
                    "Received {}[{}]@{} while the partition was paused",
                    topic, partition, offset
                );
                return SessionExit::Overrun;
            }
            Routed::Unassigned => {
                warn!(
                    "Received {}[{}]@{} for a partition outside this session",
                    topic, partition, offset
                );
                return SessionExit::Unassigned;
            }
            Routed::ClaimDropped => return SessionExit::ClaimDropped,
        }
    }
}

struct KafkaSession {
    shared: Arc<Shared>,
    claims: Vec<Box<dyn PartitionClaim>>,
    stop: CancellationToken,
    dispatcher: Option<JoinHandle<SessionExit>>,
    exit: Option<SessionExit>,
}

impl KafkaSession {
    fn start(shared: Arc<Shared>, partitions: Vec<(String, i32)>, buffer: usize) -> Self {
        let stop = CancellationToken::new();
        let mut routes = HashMap::new();
        let mut claims: Vec<Box<dyn PartitionClaim>> = Vec::with_capacity(partitions.len());

        for (topic, partition) in partitions {
            let (tx, rx) = mpsc::channel(buffer.max(1));
            routes.insert((topic.clone(), partition), tx);
            claims.push(Box::new(KafkaClaim {
                topic,
                partition,
                messages: rx,
                stop: stop.clone(),
            }));
        }

        let dispatcher = tokio::spawn(dispatch(shared.clone(), routes, stop.clone()));

        Self {
            shared,
            claims,
            stop,
            dispatcher: Some(dispatcher),
            exit: None,
        }
    }

    async fn wait_dispatcher(&mut self) {
        if let Some(handle) = self.dispatcher.as_mut() {
            let exit = handle.await.unwrap_or(SessionExit::Stopped);
            self.dispatcher = None;
            self.exit = Some(exit);
        }
    }
}

#[async_trait]
impl GroupSession for KafkaSession {
    fn take_claims(&mut self) -> Vec<Box<dyn PartitionClaim>> {
        std::mem::take(&mut self.claims)
    }

    fn marker(&self) -> Arc<dyn OffsetMarker> {
        Arc::new(KafkaOffsetMarker {
            shared: self.shared.clone(),
        })
    }

    async fn done(&mut self) {
        self.wait_dispatcher().await;
        if !self.exit.is_some_and(SessionExit::ended_by_broker) {
            // Claim failures surface through the claims themselves
            std::future::pending::<()>().await;
        }
    }

    fn stop(&self) {
        self.stop.cancel();
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        self.stop.cancel();
        self.wait_dispatcher().await;

        let shared = self.shared.clone();
        let committed =
            tokio::task::spawn_blocking(move || shared.consumer.commit_consumer_state(CommitMode::Sync))
                .await
                .map_err(|e| Error::Pipeline(format!("Commit task failed: {}", e)))?;
        match committed {
            Ok(()) => debug!("Committed marked offsets"),
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {
                debug!("No marked offsets to commit")
            }
            Err(e) => warn!("Failed to commit marked offsets: {}", e),
        }

        if self.exit != Some(SessionExit::Revoked) {
            info!("Leaving consumer group to restart from committed offsets");
            self.shared.reset();
        }
        Ok(())
    }
}

struct KafkaClaim {
    topic: String,
    partition: i32,
    messages: mpsc::Receiver<LogMessage>,
    stop: CancellationToken,
}

#[async_trait]
impl PartitionClaim for KafkaClaim {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition(&self) -> i32 {
        self.partition
    }

    async fn next_message(&mut self) -> Option<LogMessage> {
        // Buffered messages are dropped on stop; they were never marked
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => None,
            message = self.messages.recv() => message,
        }
    }
}

/// Offset handed to `rd_kafka_offset_store` for a processed message.
/// librdkafka stores `offset + 1` itself, which makes the committed position
/// the next message to read.
fn store_position(message: &LogMessage) -> i64 {
    message.offset
}

struct KafkaOffsetMarker {
    shared: Arc<Shared>,
}

impl OffsetMarker for KafkaOffsetMarker {
    fn mark(&self, message: &LogMessage) -> Result<()> {
        self.shared
            .consumer
            .store_offset(&message.topic, message.partition, store_position(message))
            .map_err(|e| {
                Error::Connection(format!(
                    "Failed to mark {}[{}]@{}: {}",
                    message.topic, message.partition, message.offset, e
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = KafkaConfig::default();
        assert_eq!(config.brokers, vec!["localhost:9092".to_string()]);
        assert_eq!(config.topic, "cdc-events");
        assert_eq!(config.group_id, "cdc-indexer");
        assert_eq!(config.auto_offset_reset, "earliest");
    }

    #[test]
    fn test_consumer_config_stores_offsets_explicitly() {
        let config = KafkaConfig {
            brokers: vec!["k1:9092".to_string(), "k2:9092".to_string()],
            ..Default::default()
        };
        let client = config.consumer_config();

        assert_eq!(client.get("bootstrap.servers"), Some("k1:9092,k2:9092"));
        assert_eq!(client.get("group.id"), Some("cdc-indexer"));
        assert_eq!(client.get("enable.auto.commit"), Some("true"));
        assert_eq!(client.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(client.get("auto.offset.reset"), Some("earliest"));
    }

    #[test]
    fn test_producer_config() {
        let client = KafkaConfig::default().producer_config();
        assert_eq!(client.get("bootstrap.servers"), Some("localhost:9092"));
        assert_eq!(client.get("message.timeout.ms"), Some("30000"));
        assert_eq!(client.get("group.id"), None);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: KafkaConfig =
            serde_json::from_value(serde_json::json!({"topic": "nodes"})).unwrap();
        assert_eq!(config.topic, "nodes");
        assert_eq!(config.group_id, "cdc-indexer");
        assert_eq!(config.claim_buffer, 64);
    }

    #[test]
    fn test_session_exit_by_broker() {
        assert!(SessionExit::Revoked.ended_by_broker());
        assert!(SessionExit::Unassigned.ended_by_broker());
        assert!(!SessionExit::Overrun.ended_by_broker());
        assert!(!SessionExit::ClaimDropped.ended_by_broker());
        assert!(!SessionExit::Stopped.ended_by_broker());
    }

    fn log_message(partition: i32, offset: i64) -> LogMessage {
        LogMessage {
            topic: "cdc-events".to_string(),
            partition,
            offset,
            payload: Bytes::from(format!("{{\"offset\":{}}}", offset)),
        }
    }

    fn key(partition: i32) -> PartitionKey {
        ("cdc-events".to_string(), partition)
    }

    #[test]
    fn test_store_position_is_the_processed_offset() {
        // librdkafka commits the stored offset plus one
        assert_eq!(store_position(&log_message(0, 10)), 10);
        assert_eq!(store_position(&log_message(3, 0)), 0);
    }

    #[tokio::test]
    async fn test_router_delivers_in_order() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut router = Router::new(HashMap::from([(key(0), tx)]));

        for offset in 0..3 {
            assert_eq!(router.route(log_message(0, offset)), Routed::Delivered);
        }
        for offset in 0..3 {
            assert_eq!(rx.recv().await.unwrap().offset, offset);
        }
    }

    #[tokio::test]
    async fn test_full_claim_parks_only_its_partition() {
        let (slow_tx, mut slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(1);
        let mut router = Router::new(HashMap::from([(key(0), slow_tx), (key(1), fast_tx)]));

        assert_eq!(router.route(log_message(0, 0)), Routed::Delivered);
        assert_eq!(router.route(log_message(0, 1)), Routed::Parked(key(0)));
        assert_eq!(router.parked_partitions(), vec![key(0)]);

        // The sibling partition keeps flowing
        assert_eq!(router.route(log_message(1, 0)), Routed::Delivered);
        assert_eq!(fast_rx.recv().await.unwrap().offset, 0);

        // Nothing more is accepted for the paused partition until it drains
        assert_eq!(router.route(log_message(0, 2)), Routed::Overrun);

        assert_eq!(slow_rx.recv().await.unwrap().offset, 0);
        assert_eq!(router.release().await, Released::Resume(key(0)));
        assert_eq!(slow_rx.recv().await.unwrap().offset, 1);
        assert!(router.parked_partitions().is_empty());
        assert_eq!(router.route(log_message(0, 2)), Routed::Delivered);
    }

    #[tokio::test]
    async fn test_release_waits_while_nothing_is_parked() {
        let (tx, _rx) = mpsc::channel(1);
        let mut router = Router::new(HashMap::from([(key(0), tx)]));

        let released =
            tokio::time::timeout(std::time::Duration::from_millis(20), router.release()).await;
        assert!(released.is_err());
    }

    #[tokio::test]
    async fn test_router_unassigned_and_dropped_claims() {
        let (tx, rx) = mpsc::channel(1);
        let mut router = Router::new(HashMap::from([(key(0), tx)]));

        assert_eq!(router.route(log_message(7, 0)), Routed::Unassigned);

        assert_eq!(router.route(log_message(0, 0)), Routed::Delivered);
        assert_eq!(router.route(log_message(0, 1)), Routed::Parked(key(0)));
        drop(rx);
        assert_eq!(router.release().await, Released::ClaimDropped);
    }
}
