use std::path::PathBuf;

use logreplay_storage::StorageError;

/// Errors that abort an ingestion run.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("cannot read source directory {path}: {source}")]
    SourceDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("batch size must be at least 1")]
    InvalidBatchSize,

    #[error(transparent)]
    Storage(#[from] StorageError),
}
