//! Directory ingestion: parse every trace, then write all records in one
//! snapshot so a failed run leaves the table as it was.

use std::path::{Path, PathBuf};

use logreplay_storage::{keys, CallRecord, ReplayStorage};
use serde::{Deserialize, Serialize};

use crate::assemble::{assemble, classify};
use crate::error::IngestError;
use crate::xes::parse_trace;

/// Suffix of the trace files picked up from a source directory.
pub const TRACE_SUFFIX: &str = ".xes.yaml";

/// Default number of records written per insert batch.
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// What happens to existing rows of the target table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestMode {
    /// Clear the table, then insert.
    #[default]
    Replace,
    /// Insert next to the existing rows.
    Append,
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub mode: IngestMode,
    pub batch_size: usize,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            mode: IngestMode::Replace,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Summary of an ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub table: String,
    pub mode: IngestMode,
    /// Trace files read.
    pub files: usize,
    /// Trace files that could not be read (I/O error or not UTF-8).
    pub skipped_files: usize,
    /// Well-formed events read across all files.
    pub events: usize,
    /// Malformed entries skipped.
    pub skipped: usize,
    /// Call records assembled.
    pub records: usize,
    /// Rows actually written.
    pub inserted: usize,
    /// Records ignored because an identical row already existed.
    pub duplicates: usize,
    /// Distinct process instances seen.
    pub instances: usize,
    /// Records marked as the start of their instance.
    pub start_records: usize,
    /// Rows removed by replace mode.
    pub cleared: u64,
}

/// Trace files of `dir`, in lexical order.
pub fn trace_files(dir: &Path) -> Result<Vec<PathBuf>, IngestError> {
    let source_err = |source| IngestError::SourceDir {
        path: dir.to_path_buf(),
        source,
    };
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(source_err)? {
        let path = entry.map_err(source_err)?.path();
        let is_trace = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(TRACE_SUFFIX));
        if is_trace && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Ingest every trace file of `dir` into `table`.
///
/// All files are parsed before anything is written. The table is created if
/// absent; in replace mode it is cleared within the same snapshot as the
/// inserts, so readers see either the old or the new contents. On success the
/// `last_loaded_directory` setting records `dir`.
pub async fn ingest_directory<S: ReplayStorage>(
    storage: &S,
    dir: &Path,
    table: &str,
    options: &IngestOptions,
) -> Result<IngestReport, IngestError> {
    if options.batch_size == 0 {
        return Err(IngestError::InvalidBatchSize);
    }
    let files = trace_files(dir)?;
    let mut report = IngestReport {
        table: table.to_string(),
        mode: options.mode,
        ..IngestReport::default()
    };

    let mut records = Vec::new();
    for path in &files {
        let source = path.display().to_string();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(file = %source, error = %e, "skipping unreadable trace file");
                report.skipped_files += 1;
                continue;
            }
        };
        report.files += 1;
        let parsed = parse_trace(&source, &text);
        let events = parsed.events.len();
        let assembled = assemble(&source, parsed.events);
        tracing::debug!(
            file = %source,
            events,
            skipped = parsed.skipped,
            records = assembled.records.len(),
            unfinished = assembled.unfinished,
            truncated = parsed.truncated,
            "parsed trace file"
        );
        report.events += events;
        report.skipped += parsed.skipped;
        records.extend(assembled.records);
    }

    report.start_records = classify(&mut records);
    report.records = records.len();
    report.instances = records
        .windows(2)
        .filter(|w| w[0].instance_uuid != w[1].instance_uuid)
        .count()
        + usize::from(!records.is_empty());

    let mut snapshot = storage.begin_snapshot().await?;
    match write_records(storage, &mut snapshot, table, &records, options).await {
        Ok((cleared, inserted)) => {
            storage.commit_snapshot(snapshot).await?;
            report.cleared = cleared;
            report.inserted = inserted;
            report.duplicates = report.records - inserted;
        }
        Err(e) => {
            if let Err(abort_err) = storage.abort_snapshot(snapshot).await {
                tracing::warn!(error = %abort_err, "failed to roll back ingestion snapshot");
            }
            return Err(e.into());
        }
    }

    let loaded = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    storage
        .set_setting(keys::LAST_LOADED_DIRECTORY, &loaded.display().to_string())
        .await?;

    tracing::info!(
        table,
        mode = ?report.mode,
        files = report.files,
        records = report.records,
        inserted = report.inserted,
        duplicates = report.duplicates,
        skipped = report.skipped,
        skipped_files = report.skipped_files,
        "ingestion complete"
    );
    Ok(report)
}

async fn write_records<S: ReplayStorage>(
    storage: &S,
    snapshot: &mut S::Snapshot,
    table: &str,
    records: &[CallRecord],
    options: &IngestOptions,
) -> Result<(u64, usize), logreplay_storage::StorageError> {
    storage.ensure_table(snapshot, table).await?;
    let cleared = match options.mode {
        IngestMode::Replace => storage.clear_table(snapshot, table).await?,
        IngestMode::Append => 0,
    };
    let mut inserted = 0;
    for batch in records.chunks(options.batch_size) {
        inserted += storage.insert_call_records(snapshot, table, batch).await?;
        tracing::debug!(table, batch = batch.len(), inserted, "wrote batch");
    }
    Ok((cleared, inserted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{ORDER_TRACE, SPAWN_TRACE};
    use logreplay_storage::{
        param_signature, CallFilter, Claim, EventType, InputParams, MemoryStorage, SqliteStorage,
        StorageError,
    };
    use serde_json::json;
    use time::macros::datetime;

    fn trace_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("01-order.xes.yaml"), ORDER_TRACE).unwrap();
        std::fs::write(dir.path().join("02-spawn.xes.yaml"), SPAWN_TRACE).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a trace").unwrap();
        dir
    }

    fn old_record(i: i64) -> CallRecord {
        let mut input_params = InputParams::new();
        input_params.insert("n".to_string(), json!(i));
        CallRecord {
            instance_uuid: format!("old-{i}"),
            activity_uuid: "x".to_string(),
            endpoint_name: "legacy".to_string(),
            call_timestamp: datetime!(2023-01-01 00:00:00 UTC),
            input_params,
            responses: Vec::new(),
            event_type: EventType::Start,
            spawns_instance: false,
        }
    }

    #[test]
    fn trace_files_are_filtered_and_sorted() {
        let dir = trace_dir();
        let names: Vec<String> = trace_files(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["01-order.xes.yaml", "02-spawn.xes.yaml"]);
    }

    #[tokio::test]
    async fn replace_ingest_reports_and_stores() {
        let dir = trace_dir();
        let storage = MemoryStorage::new();
        let report = ingest_directory(&storage, dir.path(), "calls", &IngestOptions::default())
            .await
            .unwrap();

        assert_eq!(report.files, 2);
        assert_eq!(report.events, 14);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.records, 5);
        assert_eq!(report.inserted, 5);
        assert_eq!(report.duplicates, 0);
        assert_eq!(report.instances, 2);
        assert_eq!(report.start_records, 2);

        let starts = storage
            .count_calls(
                "calls",
                CallFilter {
                    event_type: Some(EventType::Start),
                    ..CallFilter::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(starts, report.instances as u64);

        let loaded = storage
            .get_setting(keys::LAST_LOADED_DIRECTORY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            Path::new(&loaded),
            dir.path().canonicalize().unwrap().as_path()
        );
    }

    #[tokio::test]
    async fn replace_leaves_exactly_the_new_rows() {
        let dir = trace_dir();
        let db = tempfile::tempdir().unwrap();
        let storage = SqliteStorage::open(db.path().join("events.db")).unwrap();
        let mut snap = storage.begin_snapshot().await.unwrap();
        storage.ensure_table(&mut snap, "calls").await.unwrap();
        let prior: Vec<_> = (0..3).map(old_record).collect();
        storage
            .insert_call_records(&mut snap, "calls", &prior)
            .await
            .unwrap();
        storage.commit_snapshot(snap).await.unwrap();

        let report = ingest_directory(&storage, dir.path(), "calls", &IngestOptions::default())
            .await
            .unwrap();
        assert_eq!(report.cleared, 3);

        let rows = storage.list_calls("calls", 0).await.unwrap();
        assert_eq!(rows.len(), 5);
        assert!(rows.iter().all(|r| !r.record.instance_uuid.starts_with("old-")));
    }

    #[tokio::test]
    async fn append_keeps_rows_and_counts_duplicates() {
        let dir = trace_dir();
        let storage = MemoryStorage::new();
        let options = IngestOptions {
            mode: IngestMode::Append,
            batch_size: 2,
        };
        let first = ingest_directory(&storage, dir.path(), "calls", &options)
            .await
            .unwrap();
        assert_eq!(first.inserted, 5);

        let second = ingest_directory(&storage, dir.path(), "calls", &options)
            .await
            .unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates, 5);
        assert_eq!(second.cleared, 0);
        assert_eq!(
            storage
                .count_calls("calls", CallFilter::default())
                .await
                .unwrap(),
            5
        );
    }

    #[tokio::test]
    async fn unreadable_trace_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("01-order.xes.yaml"), ORDER_TRACE).unwrap();
        std::fs::write(dir.path().join("02-bad.xes.yaml"), [0xff_u8, 0xfe, 0x00]).unwrap();
        let storage = MemoryStorage::new();
        let report = ingest_directory(&storage, dir.path(), "calls", &IngestOptions::default())
            .await
            .unwrap();

        assert_eq!(report.files, 1);
        assert_eq!(report.skipped_files, 1);
        assert!(report.inserted > 0);
        assert_eq!(
            storage
                .count_calls("calls", CallFilter::default())
                .await
                .unwrap(),
            report.inserted as u64
        );
    }

    #[tokio::test]
    async fn missing_directory_writes_nothing() {
        let storage = MemoryStorage::new();
        let err = ingest_directory(
            &storage,
            Path::new("/definitely/not/here"),
            "calls",
            &IngestOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, IngestError::SourceDir { .. }), "{err}");
        assert!(!storage.table_exists("calls").await.unwrap());
    }

    #[tokio::test]
    async fn storage_failure_aborts_the_run() {
        let dir = trace_dir();
        let storage = MemoryStorage::new();
        let err = ingest_directory(&storage, dir.path(), "_private", &IngestOptions::default())
            .await
            .unwrap_err();
        assert!(
            matches!(err, IngestError::Storage(StorageError::InvalidTableName { .. })),
            "{err}"
        );
        assert!(storage.list_tables().await.unwrap().is_empty());
        assert!(storage
            .get_setting(keys::LAST_LOADED_DIRECTORY)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn zero_batch_size_is_rejected() {
        let dir = trace_dir();
        let storage = MemoryStorage::new();
        let options = IngestOptions {
            mode: IngestMode::Replace,
            batch_size: 0,
        };
        let err = ingest_directory(&storage, dir.path(), "calls", &options)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::InvalidBatchSize));
    }

    #[tokio::test]
    async fn ingested_call_is_found_by_its_parameters() {
        let dir = trace_dir();
        let storage = MemoryStorage::new();
        ingest_directory(&storage, dir.path(), "calls", &IngestOptions::default())
            .await
            .unwrap();

        let mut params = InputParams::new();
        params.insert("orderId".to_string(), json!(42));
        let signature = param_signature("submitOrder", &params);
        let candidate = storage
            .find_candidates("calls", &signature)
            .await
            .unwrap()
            .into_iter()
            .next()
            .expect("submitOrder candidate");
        let claimed = storage
            .claim_call(
                "calls",
                &Claim {
                    id: candidate.id,
                    caller: "live".to_string(),
                    claimed_at: datetime!(2024-06-01 00:00:00 UTC),
                },
            )
            .await
            .unwrap();
        assert_eq!(claimed.record.responses.len(), 1);
        assert_eq!(claimed.record.responses[0].offset_ms, 1500);
        assert_eq!(
            claimed.record.responses[0].payload,
            json!([{ "name": "result", "mimetype": "application/json", "data": "{\"status\":\"ok\"}" }])
        );
        assert_eq!(claimed.record.event_type, EventType::Start);
    }
}
