mod context;
mod kafka_connector;
mod producer;

pub use kafka_connector::{KafkaConfig, KafkaConsumerGroup};
pub use producer::KafkaProducer;
