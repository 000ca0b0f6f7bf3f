use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use cdc_core::{Error, LogProducer, Result};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::KafkaConfig;

/// Pause before retrying when librdkafka's local queue is full
const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(100);

/// Asynchronous producer: `send` returns once librdkafka queued the record,
/// delivery outcomes are watched in the background
pub struct KafkaProducer {
    producer: FutureProducer,
    flush_timeout: Duration,
    deliveries: TaskTracker,
    errors_tx: mpsc::UnboundedSender<Error>,
    errors: Mutex<Option<mpsc::UnboundedReceiver<Error>>>,
}

impl KafkaProducer {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = config
            .producer_config()
            .create()
            .map_err(|e| Error::Connection(format!("Failed to create async kafka producer: {}", e)))?;

        info!("Kafka producer created for brokers {:?}", config.brokers);

        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        Ok(Self {
            producer,
            flush_timeout: Duration::from_millis(config.message_timeout_ms),
            deliveries: TaskTracker::new(),
            errors_tx,
            errors: Mutex::new(Some(errors_rx)),
        })
    }
}

#[async_trait]
impl LogProducer for KafkaProducer {
    async fn send(&self, topic: &str, payload: &[u8]) -> Result<()> {
        loop {
            let record = FutureRecord::<(), [u8]>::to(topic).payload(payload);
            match self.producer.send_result(record) {
                Ok(delivery) => {
                    let errors = self.errors_tx.clone();
                    self.deliveries.spawn(async move {
                        let failure = match delivery.await {
                            Ok(Ok(_)) => return,
                            Ok(Err((e, _))) => format!("Delivery failed: {}", e),
                            Err(_) => "Delivery cancelled".to_string(),
                        };
                        let _ = errors.send(Error::Connection(failure));
                    });
                    return Ok(());
                }
                Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), _)) => {
                    debug!("Producer queue full, waiting");
                }
                Err((e, _)) => {
                    return Err(Error::Connection(format!("Failed to enqueue message: {}", e)));
                }
            }
            tokio::time::sleep(QUEUE_FULL_BACKOFF).await;
        }
    }

    async fn flush(&self) -> Result<()> {
        let producer = self.producer.clone();
        let timeout = self.flush_timeout;
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| Error::Pipeline(format!("Flush task failed: {}", e)))?
            .map_err(|e| Error::Connection(format!("Failed to flush producer: {}", e)))?;

        // Every delivery outcome has been reported once its watcher exits
        self.deliveries.close();
        self.deliveries.wait().await;
        self.deliveries.reopen();
        Ok(())
    }

    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<Error>> {
        self.errors.lock().ok()?.take()
    }
}
