//! In-memory stand-ins for the broker, index and producer used by unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    ConsumerGroup, DocumentIndex, Error, GroupSession, LogMessage, LogProducer, OffsetMarker,
    PartitionClaim, Result,
};

pub const TOPIC: &str = "cdc-events";

pub fn message(partition: i32, offset: i64, payload: &str) -> LogMessage {
    LogMessage {
        topic: TOPIC.to_string(),
        partition,
        offset,
        payload: Bytes::copy_from_slice(payload.as_bytes()),
    }
}

pub fn event_json(key: &str, hostname: &str) -> String {
    format!(
        r#"{{"after":{{"key":"{}","value":{{"type":1,"object":{{"id":"{}","hostname":"{}"}}}}}},"op":"c","ts_ms":1000}}"#,
        key, key, hostname
    )
}

/// Index that keeps documents in a map and records every call in order
#[derive(Default)]
pub struct MemoryIndex {
    pub documents: Mutex<HashMap<(String, String), Bytes>>,
    /// `("start" | "end", id)` in the order upserts began and completed
    pub calls: Mutex<Vec<(&'static str, String)>>,
    pub failing_ids: Mutex<Vec<String>>,
    pub panicking_ids: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl MemoryIndex {
    pub fn fail_on(&self, id: &str) {
        self.failing_ids.lock().unwrap().push(id.to_string());
    }

    pub fn panic_on(&self, id: &str) {
        self.panicking_ids.lock().unwrap().push(id.to_string());
    }

    pub fn document(&self, index: &str, id: &str) -> Option<Bytes> {
        self.documents
            .lock()
            .unwrap()
            .get(&(index.to_string(), id.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.documents.lock().unwrap().len()
    }
}

#[async_trait]
impl DocumentIndex for MemoryIndex {
    async fn upsert(&self, index: &str, id: &str, body: Bytes) -> Result<()> {
        let panics = self.panicking_ids.lock().unwrap().iter().any(|p| p == id);
        if panics {
            panic!("index blew up on {}", id);
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.calls.lock().unwrap().push(("start", id.to_string()));

        tokio::task::yield_now().await;

        let result = if self.failing_ids.lock().unwrap().iter().any(|f| f == id) {
            Err(Error::Index {
                status: 503,
                body: "unavailable".to_string(),
            })
        } else {
            self.documents
                .lock()
                .unwrap()
                .insert((index.to_string(), id.to_string()), body);
            Ok(())
        };

        self.calls.lock().unwrap().push(("end", id.to_string()));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Commit cursor that remembers every mark
#[derive(Default)]
pub struct MemoryMarker {
    pub marked: Mutex<Vec<(i32, i64)>>,
}

impl MemoryMarker {
    pub fn marked(&self) -> Vec<(i32, i64)> {
        self.marked.lock().unwrap().clone()
    }
}

impl OffsetMarker for MemoryMarker {
    fn mark(&self, message: &LogMessage) -> Result<()> {
        self.marked
            .lock()
            .unwrap()
            .push((message.partition, message.offset));
        Ok(())
    }
}

pub struct MemoryClaim {
    partition: i32,
    messages: VecDeque<LogMessage>,
    /// When set the stream stays open after the queue drains, until cancelled
    hold_open: Option<CancellationToken>,
}

impl MemoryClaim {
    pub fn new(partition: i32, messages: Vec<LogMessage>) -> Self {
        Self {
            partition,
            messages: messages.into(),
            hold_open: None,
        }
    }
}

#[async_trait]
impl PartitionClaim for MemoryClaim {
    fn topic(&self) -> &str {
        TOPIC
    }

    fn partition(&self) -> i32 {
        self.partition
    }

    async fn next_message(&mut self) -> Option<LogMessage> {
        if let Some(message) = self.messages.pop_front() {
            return Some(message);
        }
        if let Some(stop) = &self.hold_open {
            stop.cancelled().await;
        }
        None
    }
}

/// What one `join` hands out
#[derive(Default)]
pub struct SessionPlan {
    pub claims: Vec<(i32, Vec<LogMessage>)>,
    /// Claims stay open until the session is stopped
    pub hold_open: bool,
    /// The broker ends the session right away
    pub broker_ends: bool,
}

#[derive(Default)]
pub struct MemoryGroup {
    pub plans: Mutex<VecDeque<SessionPlan>>,
    pub joins: AtomicUsize,
    pub closed: Arc<AtomicUsize>,
    pub marker: Arc<MemoryMarker>,
    pub errors: Mutex<Option<mpsc::UnboundedReceiver<Error>>>,
    pub errors_tx: Mutex<Option<mpsc::UnboundedSender<Error>>>,
}

impl MemoryGroup {
    pub fn new(plans: Vec<SessionPlan>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            plans: Mutex::new(plans.into()),
            errors: Mutex::new(Some(rx)),
            errors_tx: Mutex::new(Some(tx)),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ConsumerGroup for MemoryGroup {
    async fn join(&self) -> Result<Box<dyn GroupSession>> {
        self.joins.fetch_add(1, Ordering::SeqCst);
        let plan = self
            .plans
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::Connection("group is closed".to_string()))?;

        let stop = CancellationToken::new();
        let claims = plan
            .claims
            .into_iter()
            .map(|(partition, messages)| {
                let mut claim = MemoryClaim::new(partition, messages);
                if plan.hold_open {
                    claim.hold_open = Some(stop.clone());
                }
                Box::new(claim) as Box<dyn PartitionClaim>
            })
            .collect();

        Ok(Box::new(MemorySession {
            claims,
            marker: self.marker.clone(),
            stop,
            broker_ends: plan.broker_ends,
            closed: self.closed.clone(),
        }))
    }

    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<Error>> {
        self.errors.lock().unwrap().take()
    }
}

pub struct MemorySession {
    claims: Vec<Box<dyn PartitionClaim>>,
    marker: Arc<MemoryMarker>,
    stop: CancellationToken,
    broker_ends: bool,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl GroupSession for MemorySession {
    fn take_claims(&mut self) -> Vec<Box<dyn PartitionClaim>> {
        std::mem::take(&mut self.claims)
    }

    fn marker(&self) -> Arc<dyn OffsetMarker> {
        self.marker.clone()
    }

    async fn done(&mut self) {
        if !self.broker_ends {
            std::future::pending::<()>().await;
        }
    }

    fn stop(&self) {
        self.stop.cancel();
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Producer that accepts everything and can inject failures or a cancellation
#[derive(Default)]
pub struct MemoryProducer {
    pub sent: Mutex<Vec<(String, Vec<u8>)>>,
    pub flushes: AtomicUsize,
    /// Report a delivery failure for the n-th (1-based) accepted record
    pub fail_delivery_of: Option<usize>,
    /// Reject the n-th (1-based) send outright
    pub reject_send_of: Option<usize>,
    /// Cancel once this many records have been accepted
    pub cancel_after: Option<(usize, CancellationToken)>,
    pub errors: Mutex<Option<mpsc::UnboundedReceiver<Error>>>,
    pub errors_tx: Mutex<Option<mpsc::UnboundedSender<Error>>>,
}

impl MemoryProducer {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            errors: Mutex::new(Some(rx)),
            errors_tx: Mutex::new(Some(tx)),
            ..Default::default()
        }
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl LogProducer for MemoryProducer {
    async fn send(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let attempt = self.sent_count() + 1;
        if self.reject_send_of == Some(attempt) {
            return Err(Error::Connection("broker unreachable".to_string()));
        }

        self.sent
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_vec()));

        if self.fail_delivery_of == Some(attempt) {
            if let Some(tx) = self.errors_tx.lock().unwrap().as_ref() {
                let _ = tx.send(Error::Connection("message timed out".to_string()));
            }
        }
        if let Some((after, token)) = &self.cancel_after {
            if attempt == *after {
                token.cancel();
            }
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<Error>> {
        self.errors.lock().unwrap().take()
    }
}
