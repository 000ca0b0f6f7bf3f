use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Trait for document indexes
#[async_trait]
pub trait DocumentIndex: Send + Sync {
    /// Create or replace the document `id` in `index` with `body`.
    /// A non-success response is an error.
    async fn upsert(&self, index: &str, id: &str, body: Bytes) -> Result<()>;
}
