use std::collections::HashMap;
use std::sync::Arc;

use crate::{ClaimProcessor, ConsumerGroup, Error, GroupSession, Result};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Why a session stopped being active
#[derive(Debug)]
pub enum SessionEnd {
    /// The broker ended the session (rebalance or shutdown)
    Rebalanced,
    /// A claim stream closed on its own
    ClaimClosed { topic: String, partition: i32 },
    /// A claim processor failed
    ClaimFailed {
        topic: String,
        partition: i32,
        error: Error,
    },
}

/// Owns group membership: joins, runs one processor per claim, and rejoins
/// after every session, whatever ended it
pub struct SessionCoordinator {
    group: Arc<dyn ConsumerGroup>,
    processor: Arc<ClaimProcessor>,
    max_sessions: Option<u64>,
}

impl SessionCoordinator {
    pub fn new(group: Arc<dyn ConsumerGroup>, processor: ClaimProcessor) -> Self {
        Self {
            group,
            processor: Arc::new(processor),
            max_sessions: None,
        }
    }

    /// Stop after this many sessions instead of rejoining forever
    pub fn with_max_sessions(mut self, max_sessions: u64) -> Self {
        self.max_sessions = Some(max_sessions);
        self
    }

    /// Run until joining the group fails. Session failures never end the loop.
    pub async fn run(&self) -> Result<()> {
        if let Some(errors) = self.group.take_errors() {
            tokio::spawn(observe_errors(errors));
        }

        let mut generation = 0u64;
        loop {
            if self.max_sessions.is_some_and(|max| generation >= max) {
                info!("Session limit of {} reached", generation);
                return Ok(());
            }

            info!("Joining consumer group");
            let session = self.group.join().await.map_err(|e| {
                error!("Failed to join consumer group: {}", e);
                e
            })?;
            generation += 1;

            match self.run_session(generation, session).await {
                SessionEnd::Rebalanced => {
                    info!("Session {} ended by rebalance, rejoining", generation)
                }
                SessionEnd::ClaimClosed { topic, partition } => info!(
                    "Session {} ended after claim {}/{} closed, rejoining",
                    generation, topic, partition
                ),
                SessionEnd::ClaimFailed {
                    topic,
                    partition,
                    error,
                } => warn!(
                    "Session {} torn down after claim {}/{} failed: {}; rejoining",
                    generation, topic, partition, error
                ),
            }
        }
    }

    /// Active until the broker ends the session or the first claim returns,
    /// then drains every claim and closes the session.
    pub async fn run_session(
        &self,
        generation: u64,
        mut session: Box<dyn GroupSession>,
    ) -> SessionEnd {
        let marker = session.marker();
        let claims = session.take_claims();
        info!(
            "Session {} active with {} partition claim(s)",
            generation,
            claims.len()
        );

        let mut workers = JoinSet::new();
        let mut owners = HashMap::new();
        for claim in claims {
            let processor = self.processor.clone();
            let marker = marker.clone();
            let topic = claim.topic().to_string();
            let partition = claim.partition();
            let handle = workers.spawn({
                let topic = topic.clone();
                async move {
                    let result = processor.process(claim, marker).await;
                    (topic, partition, result)
                }
            });
            owners.insert(handle.id(), (topic, partition));
        }

        let end = tokio::select! {
            _ = session.done() => SessionEnd::Rebalanced,
            Some(joined) = workers.join_next() => match joined {
                Ok((topic, partition, Ok(_))) => SessionEnd::ClaimClosed { topic, partition },
                Ok((topic, partition, Err(error))) => SessionEnd::ClaimFailed { topic, partition, error },
                Err(e) => {
                    let (topic, partition) = owners.remove(&e.id()).unwrap_or_default();
                    SessionEnd::ClaimFailed {
                        topic,
                        partition,
                        error: Error::Pipeline(format!("Claim processor panicked: {}", e)),
                    }
                }
            },
        };

        // Draining: close every stream and let in-flight upserts finish
        session.stop();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((topic, partition, Ok(indexed))) => info!(
                    "[{}/{}] Claim drained, {} events indexed this session",
                    topic, partition, indexed
                ),
                Ok((topic, partition, Err(e))) => {
                    warn!("[{}/{}] Claim stopped with error: {}", topic, partition, e)
                }
                Err(e) => {
                    let (topic, partition) = owners.remove(&e.id()).unwrap_or_default();
                    error!("[{}/{}] Claim processor panicked: {}", topic, partition, e)
                }
            }
        }

        if let Err(e) = session.close().await {
            warn!("Failed to close session {}: {}", generation, e);
        }
        end
    }
}

/// Log transport errors; never affects the pipeline
async fn observe_errors(mut errors: mpsc::UnboundedReceiver<Error>) {
    while let Some(e) = errors.recv().await {
        error!("Consumer group error: {}", e);
    }
}
