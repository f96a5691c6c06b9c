//! Error types for cloud operations.

use thiserror::Error;

use crate::models::NodeId;

/// Errors surfaced by a [`CloudClient`](crate::CloudClient) backend.
#[derive(Debug, Error)]
pub enum CloudError {
    /// The store does not know the given node.
    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    /// The store rejected the request.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// A stored record could not be decoded.
    #[error("malformed record for {id}: {source}")]
    Malformed {
        /// Node the record belongs to.
        id: NodeId,
        /// Underlying decode failure.
        #[source]
        source: serde_json::Error,
    },

    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Local I/O failed while talking to the store.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
