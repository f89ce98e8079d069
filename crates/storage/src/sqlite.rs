//! SQLite backend.
//!
//! Every operation opens its own short-lived connection; nothing holds a
//! connection across operations except a [`SqliteSnapshot`], which owns one
//! connection with an open `BEGIN IMMEDIATE` transaction. All rusqlite calls
//! run on tokio's blocking pool.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use time::OffsetDateTime;

use crate::error::StorageError;
use crate::record::{
    format_timestamp, parse_timestamp, CallFilter, CallId, CallRecord, Candidate, Claim,
    EventType, RecordedResponse, StoredCall,
};
use crate::schema::{
    quote_ident, validate_table_name, CALL_TABLE_SCHEMA, REGISTRY_TABLE, SETTINGS_TABLE,
};
use crate::traits::ReplayStorage;

/// Busy timeout applied to every connection.
const BUSY_TIMEOUT: Duration = Duration::from_millis(2000);

/// Columns selected when decoding a stored call, in `RawCall` order.
const CALL_COLUMNS: &str = "rowid, instance_uuid, activity_uuid, endpoint_name, call_timestamp, \
     input_params_json, responses_json, event_type, spawns_instance, consumed_by, consumed_at";

/// SQLite-backed Event Store.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    path: PathBuf,
}

/// An open `BEGIN IMMEDIATE` transaction on a dedicated connection.
///
/// Dropping it closes the connection, which rolls the transaction back.
pub struct SqliteSnapshot {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open (or create) the database at `path` and its internal collections.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let storage = Self { path: path.into() };
        let conn = storage.connect()?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {settings} (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {registry} (
                name TEXT PRIMARY KEY,
                schema_version INTEGER NOT NULL,
                generation INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );",
            settings = quote_ident(SETTINGS_TABLE),
            registry = quote_ident(REGISTRY_TABLE),
        ))?;
        tracing::debug!(path = %storage.path.display(), "opened sqlite event store");
        Ok(storage)
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection, StorageError> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        Ok(conn)
    }
}

// ── Registry helpers ─────────────────────────────────────────────────────────

fn registered_generation(conn: &Connection, table: &str) -> Result<Option<u64>, StorageError> {
    let generation: Option<i64> = conn
        .query_row(
            &format!(
                "SELECT generation FROM {} WHERE name = ?1",
                quote_ident(REGISTRY_TABLE)
            ),
            params![table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(generation.map(|g| g as u64))
}

fn require_generation(conn: &Connection, table: &str) -> Result<u64, StorageError> {
    registered_generation(conn, table)?.ok_or_else(|| StorageError::TableNotFound(table.to_string()))
}

fn existing_columns(conn: &Connection, table: &str) -> Result<Vec<String>, StorageError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

fn create_table_sql(table: &str) -> String {
    let columns: Vec<String> = CALL_TABLE_SCHEMA
        .columns
        .iter()
        .map(|c| {
            format!(
                "{} {}{}",
                c.name,
                c.sql_type,
                if c.nullable { "" } else { " NOT NULL" }
            )
        })
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {table_q} ({columns}, UNIQUE ({unique}));
         CREATE INDEX IF NOT EXISTS {index_q} ON {table_q} (signature, call_timestamp);",
        table_q = quote_ident(table),
        columns = columns.join(", "),
        unique = CALL_TABLE_SCHEMA.unique.join(", "),
        index_q = quote_ident(&format!("{table}__signature")),
    )
}

fn ensure_table_on(conn: &Connection, table: &str) -> Result<(), StorageError> {
    validate_table_name(table)?;

    let registered_version: Option<i64> = conn
        .query_row(
            &format!(
                "SELECT schema_version FROM {} WHERE name = ?1",
                quote_ident(REGISTRY_TABLE)
            ),
            params![table],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(version) = registered_version {
        if version != i64::from(CALL_TABLE_SCHEMA.version) {
            return Err(StorageError::SchemaMismatch {
                table: table.to_string(),
                reason: format!(
                    "registered with schema version {version}, expected {}",
                    CALL_TABLE_SCHEMA.version
                ),
            });
        }
    }

    let columns = existing_columns(conn, table)?;
    if columns.is_empty() {
        conn.execute_batch(&create_table_sql(table))?;
        tracing::info!(table, "created call table");
    } else {
        CALL_TABLE_SCHEMA.check_columns(table, columns.iter().map(String::as_str))?;
    }

    if registered_version.is_none() {
        conn.execute(
            &format!(
                "INSERT INTO {} (name, schema_version, generation, created_at) VALUES (?1, ?2, 0, ?3)",
                quote_ident(REGISTRY_TABLE)
            ),
            params![
                table,
                i64::from(CALL_TABLE_SCHEMA.version),
                format_timestamp(OffsetDateTime::now_utc())
            ],
        )?;
    }
    Ok(())
}

// ── Row decoding ─────────────────────────────────────────────────────────────

struct RawCall {
    row: i64,
    instance_uuid: String,
    activity_uuid: String,
    endpoint_name: String,
    call_timestamp: String,
    input_params_json: String,
    responses_json: String,
    event_type: String,
    spawns_instance: bool,
    consumed_by: Option<String>,
    consumed_at: Option<String>,
}

impl RawCall {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            row: row.get(0)?,
            instance_uuid: row.get(1)?,
            activity_uuid: row.get(2)?,
            endpoint_name: row.get(3)?,
            call_timestamp: row.get(4)?,
            input_params_json: row.get(5)?,
            responses_json: row.get(6)?,
            event_type: row.get(7)?,
            spawns_instance: row.get::<_, i64>(8)? != 0,
            consumed_by: row.get(9)?,
            consumed_at: row.get(10)?,
        })
    }

    fn decode(self, table: &str, generation: u64) -> Result<StoredCall, StorageError> {
        let corrupt = |reason: String| StorageError::Corrupt {
            table: table.to_string(),
            reason: format!("row {}: {}", self.row, reason),
        };
        let call_timestamp = parse_timestamp(&self.call_timestamp)
            .ok_or_else(|| corrupt(format!("bad call_timestamp {:?}", self.call_timestamp)))?;
        let input_params = serde_json::from_str(&self.input_params_json)
            .map_err(|e| corrupt(format!("input_params_json: {e}")))?;
        let responses: Vec<RecordedResponse> = serde_json::from_str(&self.responses_json)
            .map_err(|e| corrupt(format!("responses_json: {e}")))?;
        let event_type = EventType::parse(&self.event_type)
            .ok_or_else(|| corrupt(format!("unknown event_type {:?}", self.event_type)))?;
        let consumed_at = match &self.consumed_at {
            Some(ts) => Some(
                parse_timestamp(ts).ok_or_else(|| corrupt(format!("bad consumed_at {ts:?}")))?,
            ),
            None => None,
        };
        Ok(StoredCall {
            id: CallId {
                generation,
                row: self.row,
            },
            record: CallRecord {
                instance_uuid: self.instance_uuid,
                activity_uuid: self.activity_uuid,
                endpoint_name: self.endpoint_name,
                call_timestamp,
                input_params,
                responses,
                event_type,
                spawns_instance: self.spawns_instance,
            },
            consumed_by: self.consumed_by,
            consumed_at,
        })
    }
}

fn load_call(
    conn: &Connection,
    table: &str,
    generation: u64,
    row: i64,
) -> Result<StoredCall, StorageError> {
    let raw = conn
        .query_row(
            &format!(
                "SELECT {CALL_COLUMNS} FROM {} WHERE rowid = ?1",
                quote_ident(table)
            ),
            params![row],
            RawCall::from_row,
        )
        .optional()?
        .ok_or_else(|| StorageError::CallNotFound {
            table: table.to_string(),
            row,
        })?;
    raw.decode(table, generation)
}

// ── Blocking pool ────────────────────────────────────────────────────────────

/// Run a blocking SQLite operation on the blocking thread pool so a lock wait
/// never parks an async worker.
async fn run_blocking<T, F>(op: F) -> Result<T, StorageError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| StorageError::Backend(format!("blocking task failed: {e}")))?
}

impl SqliteStorage {
    /// Run `op` on a fresh connection on the blocking pool.
    async fn with_connection<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let storage = self.clone();
        run_blocking(move || {
            let mut conn = storage.connect()?;
            op(&mut conn)
        })
        .await
    }
}

impl SqliteSnapshot {
    /// Run `op` on the snapshot's connection on the blocking pool.
    async fn with_connection<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        run_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| StorageError::Backend("snapshot connection poisoned".to_string()))?;
            op(&conn)
        })
        .await
    }
}

// ── ReplayStorage ────────────────────────────────────────────────────────────

#[async_trait]
impl ReplayStorage for SqliteStorage {
    type Snapshot = SqliteSnapshot;

    async fn begin_snapshot(&self) -> Result<SqliteSnapshot, StorageError> {
        let storage = self.clone();
        let conn = run_blocking(move || {
            let conn = storage.connect()?;
            conn.execute_batch("BEGIN IMMEDIATE")?;
            Ok(conn)
        })
        .await?;
        Ok(SqliteSnapshot {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn commit_snapshot(&self, snapshot: SqliteSnapshot) -> Result<(), StorageError> {
        snapshot
            .with_connection(|conn| Ok(conn.execute_batch("COMMIT")?))
            .await
    }

    async fn abort_snapshot(&self, snapshot: SqliteSnapshot) -> Result<(), StorageError> {
        snapshot
            .with_connection(|conn| Ok(conn.execute_batch("ROLLBACK")?))
            .await
    }

    async fn ensure_table(
        &self,
        snapshot: &mut SqliteSnapshot,
        table: &str,
    ) -> Result<(), StorageError> {
        let table = table.to_string();
        snapshot
            .with_connection(move |conn| ensure_table_on(conn, &table))
            .await
    }

    async fn clear_table(
        &self,
        snapshot: &mut SqliteSnapshot,
        table: &str,
    ) -> Result<u64, StorageError> {
        let table = table.to_string();
        snapshot
            .with_connection(move |conn| {
                require_generation(conn, &table)?;
                let removed = conn.execute(&format!("DELETE FROM {}", quote_ident(&table)), [])?;
                conn.execute(
                    &format!(
                        "UPDATE {} SET generation = generation + 1 WHERE name = ?1",
                        quote_ident(REGISTRY_TABLE)
                    ),
                    params![table],
                )?;
                Ok(removed as u64)
            })
            .await
    }

    async fn insert_call_records(
        &self,
        snapshot: &mut SqliteSnapshot,
        table: &str,
        records: &[CallRecord],
    ) -> Result<usize, StorageError> {
        let table = table.to_string();
        let records = records.to_vec();
        snapshot
            .with_connection(move |conn| {
                require_generation(conn, &table)?;
                let mut stmt = conn.prepare(&format!(
                    "INSERT OR IGNORE INTO {} (
                        instance_uuid, activity_uuid, endpoint_name, call_timestamp,
                        input_params_json, responses_json, event_type, spawns_instance, signature
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    quote_ident(&table)
                ))?;
                let mut inserted = 0usize;
                for record in &records {
                    let responses_json = serde_json::to_string(&record.responses)
                        .map_err(|e| StorageError::Backend(format!("serialize responses: {e}")))?;
                    inserted += stmt.execute(params![
                        record.instance_uuid,
                        record.activity_uuid,
                        record.endpoint_name,
                        format_timestamp(record.call_timestamp),
                        record.input_params_json(),
                        responses_json,
                        record.event_type.as_str(),
                        i64::from(record.spawns_instance),
                        record.signature(),
                    ])?;
                }
                Ok(inserted)
            })
            .await
    }

    async fn table_exists(&self, table: &str) -> Result<bool, StorageError> {
        let table = table.to_string();
        self.with_connection(move |conn| Ok(registered_generation(conn, &table)?.is_some()))
            .await
    }

    async fn list_tables(&self) -> Result<Vec<String>, StorageError> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT name FROM {} ORDER BY name",
                quote_ident(REGISTRY_TABLE)
            ))?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(names)
        })
        .await
    }

    async fn table_generation(&self, table: &str) -> Result<u64, StorageError> {
        let table = table.to_string();
        self.with_connection(move |conn| require_generation(conn, &table))
            .await
    }

    async fn find_candidates(
        &self,
        table: &str,
        signature: &str,
    ) -> Result<Vec<Candidate>, StorageError> {
        let table = table.to_string();
        let signature = signature.to_string();
        self.with_connection(move |conn| find_candidates_on(conn, &table, &signature))
            .await
    }

    async fn claim_call(&self, table: &str, claim: &Claim) -> Result<StoredCall, StorageError> {
        let table = table.to_string();
        let claim = claim.clone();
        self.with_connection(move |conn| claim_call_on(conn, &table, &claim))
            .await
    }

    async fn list_calls(
        &self,
        table: &str,
        limit: usize,
    ) -> Result<Vec<StoredCall>, StorageError> {
        let table = table.to_string();
        self.with_connection(move |conn| {
            let tx = conn.transaction()?;
            let generation = require_generation(&tx, &table)?;
            let limit = if limit == 0 { -1 } else { limit as i64 };
            let mut stmt = tx.prepare(&format!(
                "SELECT {CALL_COLUMNS} FROM {} ORDER BY rowid LIMIT ?1",
                quote_ident(&table)
            ))?;
            let raws = stmt
                .query_map(params![limit], RawCall::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            raws.into_iter()
                .map(|raw| raw.decode(&table, generation))
                .collect()
        })
        .await
    }

    async fn count_calls(&self, table: &str, filter: CallFilter) -> Result<u64, StorageError> {
        let table = table.to_string();
        self.with_connection(move |conn| {
            require_generation(conn, &table)?;
            let mut sql = format!("SELECT COUNT(*) FROM {} WHERE 1 = 1", quote_ident(&table));
            match filter.consumed {
                Some(true) => sql.push_str(" AND consumed_by IS NOT NULL"),
                Some(false) => sql.push_str(" AND consumed_by IS NULL"),
                None => {}
            }
            let count: i64 = match filter.event_type {
                Some(event_type) => {
                    sql.push_str(" AND event_type = ?1");
                    conn.query_row(&sql, params![event_type.as_str()], |row| row.get(0))?
                }
                None => conn.query_row(&sql, [], |row| row.get(0))?,
            };
            Ok(count as u64)
        })
        .await
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StorageError> {
        let key = key.to_string();
        self.with_connection(move |conn| {
            let value = conn
                .query_row(
                    &format!(
                        "SELECT value FROM {} WHERE key = ?1",
                        quote_ident(SETTINGS_TABLE)
                    ),
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value)
        })
        .await
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let key = key.to_string();
        let value = value.to_string();
        self.with_connection(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {} (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    quote_ident(SETTINGS_TABLE)
                ),
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }
}

fn find_candidates_on(
    conn: &mut Connection,
    table: &str,
    signature: &str,
) -> Result<Vec<Candidate>, StorageError> {
    // Read generation and rows from one consistent snapshot.
    let tx = conn.transaction()?;
    let generation = require_generation(&tx, table)?;
    let table_q = quote_ident(table);
    let mut stmt = tx.prepare(&format!(
        "SELECT t.rowid, t.instance_uuid, t.call_timestamp, t.event_type,
                (SELECT b.consumed_by FROM {table_q} b
                  WHERE b.instance_uuid = t.instance_uuid AND b.consumed_by IS NOT NULL
                  LIMIT 1)
           FROM {table_q} t
          WHERE t.signature = ?1 AND t.consumed_by IS NULL
          ORDER BY t.call_timestamp, t.rowid"
    ))?;
    let rows = stmt
        .query_map(params![signature], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(row, instance_uuid, ts, event_type, bound_to)| {
            let corrupt = |reason: String| StorageError::Corrupt {
                table: table.to_string(),
                reason: format!("row {row}: {reason}"),
            };
            Ok(Candidate {
                id: CallId { generation, row },
                instance_uuid,
                call_timestamp: parse_timestamp(&ts)
                    .ok_or_else(|| corrupt(format!("bad call_timestamp {ts:?}")))?,
                event_type: EventType::parse(&event_type)
                    .ok_or_else(|| corrupt(format!("unknown event_type {event_type:?}")))?,
                bound_to,
            })
        })
        .collect()
}

fn claim_call_on(
    conn: &mut Connection,
    table: &str,
    claim: &Claim,
) -> Result<StoredCall, StorageError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let generation = require_generation(&tx, table)?;
    if generation != claim.id.generation {
        return Err(StorageError::StaleGeneration {
            table: table.to_string(),
            expected: claim.id.generation,
            found: generation,
        });
    }

    let table_q = quote_ident(table);
    let changed = tx.execute(
        &format!(
            "UPDATE {table_q} SET consumed_by = ?1, consumed_at = ?2
              WHERE rowid = ?3 AND consumed_by IS NULL
                AND NOT EXISTS (
                    SELECT 1 FROM {table_q} o
                     WHERE o.instance_uuid = {table_q}.instance_uuid
                       AND o.consumed_by IS NOT NULL AND o.consumed_by <> ?1)"
        ),
        params![claim.caller, format_timestamp(claim.claimed_at), claim.id.row],
    )?;

    if changed == 0 {
        let state: Option<(Option<String>, String)> = tx
            .query_row(
                &format!("SELECT consumed_by, instance_uuid FROM {table_q} WHERE rowid = ?1"),
                params![claim.id.row],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        return Err(match state {
            None => StorageError::CallNotFound {
                table: table.to_string(),
                row: claim.id.row,
            },
            Some((Some(_), _)) => StorageError::AlreadyClaimed {
                table: table.to_string(),
                row: claim.id.row,
            },
            Some((None, instance_uuid)) => StorageError::InstanceBound {
                table: table.to_string(),
                instance_uuid,
            },
        });
    }

    let call = load_call(&tx, table, generation, claim.id.row)?;
    tx.commit()?;
    Ok(call)
}
