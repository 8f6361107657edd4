// Error taxonomy for the ingestion pipeline.
//
// Stage-level failures (connectivity, metadata, download) abort a run. File-level failures
// (unresolved type, bulk write) are produced by the loader, logged, and never escape a run.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Store unreachable: {0}")]
    Connectivity(String),

    #[error("Metadata fetch failed: {0}")]
    MetadataFetch(String),

    #[error("Archive download failed: {0}")]
    Download(String),

    #[error("Cannot map staged file {path} to a collection: {reason}")]
    UnresolvedType { path: String, reason: String },

    #[error("Bulk write into {collection} failed for {failed} of {total} records: {reason}")]
    BulkWrite {
        collection: String,
        inserted: usize,
        failed: usize,
        total: usize,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IngestError {
    /// Whether this error aborts a load instead of failing a single file.
    pub fn is_fatal(&self) -> bool {
        matches!(self, IngestError::Connectivity(_))
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
