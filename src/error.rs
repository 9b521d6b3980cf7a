use thiserror::Error;

/// Error kinds surfaced by the indexer core.
///
/// Storage write failures on the indexing path are treated as bugs and panic
/// at the call site instead of travelling through this enum; everything the
/// caller can act on is represented here.
#[derive(Debug, Error)]
pub enum AppError {
    /// Bad caller input: malformed hex address, unparsable time string,
    /// invalid batch identity. No state change has happened.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Point lookup miss. Normal signal; paginated queries translate this
    /// into an empty page instead of surfacing it.
    #[error("not found: {0}")]
    NotFound(String),

    /// Upstream node call failed. The worker that hit this exits and lets
    /// failover restart the pipeline.
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// The upstream node answered but its data is internally inconsistent,
    /// e.g. a block whose transactions have no receipts yet. Worth retrying
    /// before giving up on the node.
    #[error("inconsistent upstream data: {0}")]
    Inconsistent(String),

    /// Embedded store error on a read path.
    #[error("storage failure: {0}")]
    Storage(String),
}

impl AppError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::NotFound(_))
    }
}

impl From<rocksdb::Error> for AppError {
    fn from(e: rocksdb::Error) -> Self {
        AppError::Storage(e.to_string())
    }
}
