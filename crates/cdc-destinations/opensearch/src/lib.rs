mod opensearch_destination;

pub use opensearch_destination::{OpenSearchConfig, OpenSearchIndex};
