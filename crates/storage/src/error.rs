/// All errors that can be returned by a ReplayStorage implementation.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The record was consumed by another caller between lookup and claim.
    #[error("call {row} in table {table} is already claimed")]
    AlreadyClaimed { table: String, row: i64 },

    /// The record's instance is bound to a different live caller.
    #[error("instance {instance_uuid} in table {table} is bound to another caller")]
    InstanceBound {
        table: String,
        instance_uuid: String,
    },

    /// The table was cleared after the candidate was read; its row ids are no
    /// longer meaningful.
    #[error("table {table} moved from generation {expected} to {found}")]
    StaleGeneration {
        table: String,
        expected: u64,
        found: u64,
    },

    /// No call table with this name is registered.
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// No stored call with this id.
    #[error("call not found: {table}/{row}")]
    CallNotFound { table: String, row: i64 },

    /// Table name rejected by the schema registry.
    #[error("invalid table name {name:?}: {reason}")]
    InvalidTableName { name: String, reason: String },

    /// An existing table does not match the call record schema descriptor.
    #[error("schema mismatch on table {table}: {reason}")]
    SchemaMismatch { table: String, reason: String },

    /// The database is locked by another writer (e.g. a running ingestion).
    #[error("storage busy: {0}")]
    Busy(String),

    /// A stored column could not be decoded.
    #[error("corrupt record in table {table}: {reason}")]
    Corrupt { table: String, reason: String },

    /// A backend-specific storage error (DB connection, I/O, etc.).
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// True for the outcomes of a lost claim race. The caller may retry with
    /// another candidate.
    pub fn is_claim_conflict(&self) -> bool {
        matches!(
            self,
            StorageError::AlreadyClaimed { .. }
                | StorageError::InstanceBound { .. }
                | StorageError::StaleGeneration { .. }
        )
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                StorageError::Busy(e.to_string())
            }
            _ => StorageError::Backend(e.to_string()),
        }
    }
}
