use std::sync::Arc;

use crate::{document_id, DocumentIndex, Error, Event, LogMessage, OffsetMarker, PartitionClaim, Result};
use tracing::{debug, error, info};

/// Indexes the messages of one partition claim, one at a time and in offset order
pub struct ClaimProcessor {
    index: Arc<dyn DocumentIndex>,
    index_name: String,
}

impl ClaimProcessor {
    pub fn new(index: Arc<dyn DocumentIndex>, index_name: impl Into<String>) -> Self {
        Self {
            index,
            index_name: index_name.into(),
        }
    }

    /// Consume the claim until its stream closes.
    ///
    /// A message is marked only after its upsert succeeded. The first failure
    /// ends the claim, leaving that message and everything after it unmarked
    /// so the next session redelivers them.
    pub async fn process(
        &self,
        mut claim: Box<dyn PartitionClaim>,
        marker: Arc<dyn OffsetMarker>,
    ) -> Result<u64> {
        let topic = claim.topic().to_string();
        let partition = claim.partition();
        info!("[{}/{}] Claim processor started", topic, partition);

        let mut indexed = 0u64;
        while let Some(message) = claim.next_message().await {
            if let Err(e) = self.index_message(&message).await {
                error!(
                    "[{}/{}] Failed to index message at offset {}: {}",
                    topic, partition, message.offset, e
                );
                return Err(e);
            }

            marker.mark(&message)?;
            indexed += 1;
        }

        info!(
            "[{}/{}] Claim stream closed after {} indexed events",
            topic, partition, indexed
        );
        Ok(indexed)
    }

    async fn index_message(&self, message: &LogMessage) -> Result<()> {
        let event = Event::from_slice(&message.payload).map_err(|source| Error::Malformed {
            topic: message.topic.clone(),
            partition: message.partition,
            offset: message.offset,
            source,
        })?;

        let key = event.document_key().ok_or_else(|| Error::MissingKey {
            topic: message.topic.clone(),
            partition: message.partition,
            offset: message.offset,
        })?;

        debug!(
            "Upserting {:?} event for '{}' (ts {:?})",
            event.operation(),
            key,
            event.timestamp()
        );

        // The raw payload is the document body, byte for byte
        self.index
            .upsert(&self.index_name, &document_id(key), message.payload.clone())
            .await?;

        info!("Successfully indexed {}", key);
        Ok(())
    }
}
