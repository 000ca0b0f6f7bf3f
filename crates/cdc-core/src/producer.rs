use crate::{Error, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Trait for appending records to the log
#[async_trait]
pub trait LogProducer: Send + Sync {
    /// Hand a record to the transport. Resolves once it has been accepted
    /// for delivery, not once it is delivered.
    async fn send(&self, topic: &str, payload: &[u8]) -> Result<()>;

    /// Wait for every accepted record to be delivered or failed
    async fn flush(&self) -> Result<()>;

    /// Delivery failures reported after `send` returned.
    /// Returns `None` once the stream has been handed out.
    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<Error>>;
}
