use cdc_core::Error;
use rdkafka::client::ClientContext;
use rdkafka::consumer::{ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::TopicPartitionList;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RebalanceEvent {
    Assigned(Vec<(String, i32)>),
    Revoked(Vec<(String, i32)>),
}

/// Forwards rebalance notifications and client errors out of librdkafka's
/// callbacks into channels the async side can wait on
pub(crate) struct GroupContext {
    rebalances: mpsc::UnboundedSender<RebalanceEvent>,
    errors: mpsc::UnboundedSender<Error>,
}

impl GroupContext {
    pub(crate) fn new(
        rebalances: mpsc::UnboundedSender<RebalanceEvent>,
        errors: mpsc::UnboundedSender<Error>,
    ) -> Self {
        Self { rebalances, errors }
    }
}

fn partitions(tpl: &TopicPartitionList) -> Vec<(String, i32)> {
    tpl.elements()
        .iter()
        .map(|elem| (elem.topic().to_string(), elem.partition()))
        .collect()
}

impl ClientContext for GroupContext {
    fn error(&self, error: KafkaError, reason: &str) {
        let _ = self
            .errors
            .send(Error::Connection(format!("{} ({})", error, reason)));
    }
}

impl ConsumerContext for GroupContext {
    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        let event = match rebalance {
            Rebalance::Assign(tpl) => {
                let assigned = partitions(tpl);
                info!("Partitions assigned: {:?}", assigned);
                RebalanceEvent::Assigned(assigned)
            }
            Rebalance::Revoke(tpl) => {
                let revoked = partitions(tpl);
                info!("Partitions revoked: {:?}", revoked);
                RebalanceEvent::Revoked(revoked)
            }
            Rebalance::Error(e) => {
                let _ = self
                    .errors
                    .send(Error::Connection(format!("Rebalance failed: {}", e)));
                return;
            }
        };
        let _ = self.rebalances.send(event);
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!("Committed offsets for {} partition(s)", offsets.count()),
            Err(e) => warn!("Offset commit failed: {}", e),
        }
    }
}
