use async_trait::async_trait;

use crate::error::StorageError;
use crate::record::{CallFilter, CallRecord, Candidate, Claim, StoredCall};

/// The storage trait for the replay Event Store.
///
/// A `ReplayStorage` implementation owns named call record tables, the table
/// registry, and the settings collection.
///
/// ## Snapshot Semantics
///
/// Ingestion writes go through `&mut Self::Snapshot`, a type representing an
/// in-progress transaction. The lifecycle is:
///
/// 1. `begin_snapshot()`: start a transaction, returns a `Snapshot`
/// 2. Call mutating methods with `&mut snapshot`
/// 3. `commit_snapshot(snapshot)`: commit and consume the transaction
///    OR `abort_snapshot(snapshot)`: roll back and consume the transaction
///
/// If a `Snapshot` is dropped without committing, nothing it staged becomes
/// visible.
///
/// ## Atomic Claims
///
/// `claim_call` is a conditional update: it succeeds only if the record is
/// still unconsumed, its instance is not bound to a different caller, and the
/// table generation is the one the candidate was read from. Otherwise it
/// returns `AlreadyClaimed`, `InstanceBound` or `StaleGeneration` and changes
/// nothing. Two concurrent claims of one record never both succeed.
///
/// ## Generations
///
/// `clear_table` bumps the table generation on commit. Row ids read before
/// the bump are rejected by `claim_call`.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync + 'static` to be used in axum
/// application state and across async task boundaries.
#[async_trait]
pub trait ReplayStorage: Send + Sync + 'static {
    /// The snapshot (transaction) type used by this storage backend.
    type Snapshot: Send;

    // ── Snapshot lifecycle ────────────────────────────────────────────────────

    /// Begin a new snapshot (transaction).
    async fn begin_snapshot(&self) -> Result<Self::Snapshot, StorageError>;

    /// Commit a snapshot, making all mutations durable.
    async fn commit_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    /// Abort (roll back) a snapshot, discarding all mutations.
    async fn abort_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    // ── Table writes (within snapshot) ───────────────────────────────────────

    /// Create and register `table` with the call record schema if absent.
    ///
    /// Returns `Err(StorageError::SchemaMismatch)` if a table of that name
    /// exists with a different schema, and `InvalidTableName` for names the
    /// registry rejects.
    async fn ensure_table(
        &self,
        snapshot: &mut Self::Snapshot,
        table: &str,
    ) -> Result<(), StorageError>;

    /// Delete every row of `table` and bump its generation. Returns the number
    /// of rows removed.
    async fn clear_table(
        &self,
        snapshot: &mut Self::Snapshot,
        table: &str,
    ) -> Result<u64, StorageError>;

    /// Insert call records. Rows duplicating an existing
    /// `(instance_uuid, activity_uuid, endpoint_name, input_params)` are
    /// ignored. Returns the number of rows actually inserted.
    async fn insert_call_records(
        &self,
        snapshot: &mut Self::Snapshot,
        table: &str,
        records: &[CallRecord],
    ) -> Result<usize, StorageError>;

    // ── Queries (outside snapshot) ───────────────────────────────────────────

    /// Whether a registered call table of this name exists.
    async fn table_exists(&self, table: &str) -> Result<bool, StorageError>;

    /// Names of all registered call tables, sorted.
    async fn list_tables(&self) -> Result<Vec<String>, StorageError>;

    /// Current generation of `table`.
    async fn table_generation(&self, table: &str) -> Result<u64, StorageError>;

    /// Unconsumed records of `table` with the given parameter signature,
    /// ordered by `call_timestamp`, then row.
    async fn find_candidates(
        &self,
        table: &str,
        signature: &str,
    ) -> Result<Vec<Candidate>, StorageError>;

    /// Atomically mark a candidate consumed by `claim.caller` and return the
    /// claimed record.
    async fn claim_call(&self, table: &str, claim: &Claim) -> Result<StoredCall, StorageError>;

    /// Stored calls of `table` in insertion order.
    ///
    /// - `limit`: maximum number of results (0 = no limit)
    async fn list_calls(&self, table: &str, limit: usize)
        -> Result<Vec<StoredCall>, StorageError>;

    /// Count the rows of `table` matching `filter`.
    async fn count_calls(&self, table: &str, filter: CallFilter) -> Result<u64, StorageError>;

    // ── Settings ─────────────────────────────────────────────────────────────

    /// Read a setting. `None` if the key was never written.
    async fn get_setting(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Create or overwrite a setting.
    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StorageError>;
}
