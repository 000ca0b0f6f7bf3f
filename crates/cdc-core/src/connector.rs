use std::sync::Arc;

use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// A record pulled from one partition of the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Bytes,
}

/// Membership in a consumer group
#[async_trait]
pub trait ConsumerGroup: Send + Sync {
    /// Join the group and wait until the broker hands out this member's claims.
    /// An error here is not recoverable by rejoining.
    async fn join(&self) -> Result<Box<dyn GroupSession>>;

    /// Transport-level errors raised outside of any claim.
    /// Returns `None` once the stream has been handed out.
    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<Error>>;
}

/// One generation of group membership
#[async_trait]
pub trait GroupSession: Send {
    /// Partition claims assigned for this session. Empty after the first call.
    fn take_claims(&mut self) -> Vec<Box<dyn PartitionClaim>>;

    /// Commit cursor shared by every claim of the session
    fn marker(&self) -> Arc<dyn OffsetMarker>;

    /// Resolves once the broker side ends the session (rebalance, shutdown)
    async fn done(&mut self);

    /// Stop delivering messages; every claim stream closes
    fn stop(&self);

    /// Commit what was marked and release the session
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Ordered message stream for one assigned partition
#[async_trait]
pub trait PartitionClaim: Send {
    fn topic(&self) -> &str;

    fn partition(&self) -> i32;

    /// Next message in offset order, `None` once the stream is closed
    async fn next_message(&mut self) -> Option<LogMessage>;
}

pub trait OffsetMarker: Send + Sync {
    /// Record `message` as processed; the partition resumes after it on restart
    fn mark(&self, message: &LogMessage) -> Result<()>;
}
