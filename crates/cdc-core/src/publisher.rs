use std::path::Path;
use std::sync::Arc;

use crate::{Error, LogProducer, Result};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishSummary {
    pub accepted: usize,
    pub total: usize,
    pub cancelled: bool,
}

/// Read pre-serialized events, one per line. Blank lines are skipped.
pub async fn read_event_lines(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let file = File::open(path.as_ref()).await?;
    let mut lines = BufReader::new(file).lines();

    let mut events = Vec::new();
    while let Some(line) = lines.next_line().await? {
        if !line.trim().is_empty() {
            events.push(line);
        }
    }
    Ok(events)
}

/// Appends bootstrap events to a single topic
pub struct Publisher {
    producer: Arc<dyn LogProducer>,
    topic: String,
}

impl Publisher {
    pub fn new(producer: Arc<dyn LogProducer>, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }

    /// Publish `events` in order until they run out, the transport reports an
    /// error, or `cancel` fires. Cancellation is checked between sends and is
    /// not an error. Every accepted event is flushed before returning.
    pub async fn run(&self, events: Vec<String>, cancel: CancellationToken) -> Result<PublishSummary> {
        let total = events.len();
        let mut errors = self.producer.take_errors();
        let mut accepted = 0usize;
        let mut cancelled = false;

        info!("Publishing {} events to '{}'", total, self.topic);

        for event in &events {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Shutting down publisher on cancellation signal");
                    cancelled = true;
                    break;
                }
                Some(e) = next_error(&mut errors) => {
                    return Err(self.abort(accepted, total, e));
                }
                sent = self.producer.send(&self.topic, event.as_bytes()) => {
                    match sent {
                        Ok(()) => accepted += 1,
                        Err(e) => return Err(self.abort(accepted, total, e)),
                    }
                }
            }
        }

        self.producer
            .flush()
            .await
            .map_err(|e| self.abort(accepted, total, e))?;

        // Failures reported while flushing
        if let Some(rx) = errors.as_mut() {
            if let Ok(e) = rx.try_recv() {
                return Err(self.abort(accepted, total, e));
            }
        }

        if !cancelled {
            info!(
                "Successfully published {} events out of {} events",
                accepted, total
            );
        }
        Ok(PublishSummary {
            accepted,
            total,
            cancelled,
        })
    }

    fn abort(&self, accepted: usize, total: usize, source: Error) -> Error {
        error!("Received error from producer: {}", source);
        Error::Publish {
            accepted,
            total,
            source: Box::new(source),
        }
    }
}

async fn next_error(errors: &mut Option<mpsc::UnboundedReceiver<Error>>) -> Option<Error> {
    match errors {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
