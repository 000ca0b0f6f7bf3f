use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Malformed event at {topic}[{partition}]@{offset}: {source}")]
    Malformed {
        topic: String,
        partition: i32,
        offset: i64,
        #[source]
        source: serde_json::Error,
    },

    #[error("Event at {topic}[{partition}]@{offset} has an empty after.key")]
    MissingKey {
        topic: String,
        partition: i32,
        offset: i64,
    },

    #[error("Document id '{0}' cannot be addressed in a URL path")]
    InvalidDocumentId(String),

    #[error("Index responded with status {status}: {body}")]
    Index { status: u16, body: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Publish aborted after {accepted} of {total} events: {source}")]
    Publish {
        accepted: usize,
        total: usize,
        #[source]
        source: Box<Error>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
