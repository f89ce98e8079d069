//! Event Store for the log replay service.
//!
//! Recorded calls live in named call tables. Each table carries a
//! generation counter that advances whenever its contents are replaced, so a
//! claim prepared against old contents is rejected instead of consuming a
//! record from a newer load.

pub mod conformance;
mod error;
mod memory;
mod record;
pub mod schema;
mod signature;
mod sqlite;
mod traits;

pub use error::StorageError;
pub use memory::{MemorySnapshot, MemoryStorage};
pub use record::{
    format_timestamp, parse_timestamp, CallFilter, CallId, CallRecord, Candidate, Claim,
    EventType, InputParams, RecordedResponse, StoredCall,
};
pub use schema::{keys, validate_table_name, DEFAULT_TABLE};
pub use signature::{normalize_value, param_signature};
pub use sqlite::{SqliteSnapshot, SqliteStorage};
pub use traits::ReplayStorage;
