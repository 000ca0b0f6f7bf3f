mod event;
mod connector;
mod destination;
mod producer;
mod document_id;
mod pipeline;
mod coordinator;
mod publisher;
mod error;

#[cfg(test)]
mod testing;

pub use event::{After, ConnectionState, Event, Labels, Object, Operation, ProcessConf, Value};
pub use connector::{ConsumerGroup, GroupSession, LogMessage, OffsetMarker, PartitionClaim};
pub use destination::DocumentIndex;
pub use producer::LogProducer;
pub use document_id::document_id;
pub use pipeline::ClaimProcessor;
pub use coordinator::{SessionCoordinator, SessionEnd};
pub use publisher::{read_event_lines, PublishSummary, Publisher};
pub use error::{Error, Result};
