use std::path::Path;
use std::process;

use logreplay_ingest::{ingest_directory, IngestError, IngestMode, IngestOptions, IngestReport};
use logreplay_storage::{keys, ReplayStorage, SqliteStorage, StorageError, DEFAULT_TABLE};

use crate::{report_error, runtime, OutputFormat};

pub(crate) struct IngestArgs<'a> {
    pub(crate) dir: &'a Path,
    pub(crate) db: &'a Path,
    pub(crate) table: Option<&'a str>,
    pub(crate) append: bool,
    pub(crate) batch_size: usize,
}

pub(crate) fn cmd_ingest(args: IngestArgs<'_>, output: OutputFormat, quiet: bool) {
    let storage = match SqliteStorage::open(args.db) {
        Ok(s) => s,
        Err(e) => {
            let msg = format!("error opening '{}': {}", args.db.display(), e);
            report_error(&msg, output, quiet);
            process::exit(1);
        }
    };

    let options = IngestOptions {
        mode: if args.append {
            IngestMode::Append
        } else {
            IngestMode::Replace
        },
        batch_size: args.batch_size,
    };

    let rt = runtime(output, quiet);
    let result = rt.block_on(async {
        let table = ingest_table(&storage, args.table).await?;
        ingest_directory(&storage, args.dir, &table, &options).await
    });

    match result {
        Ok(report) => print_report(&report, output, quiet),
        Err(e) => {
            let msg = match &e {
                IngestError::SourceDir { .. } => e.to_string(),
                _ => format!("ingestion of '{}' failed: {}", args.dir.display(), e),
            };
            report_error(&msg, output, quiet);
            process::exit(1);
        }
    }
}

/// Target table: the flag, else the `active_table` setting, else the default.
pub(crate) async fn ingest_table<S: ReplayStorage>(
    storage: &S,
    flag: Option<&str>,
) -> Result<String, StorageError> {
    if let Some(table) = flag.map(str::trim).filter(|t| !t.is_empty()) {
        return Ok(table.to_string());
    }
    Ok(storage
        .get_setting(keys::ACTIVE_TABLE)
        .await?
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| DEFAULT_TABLE.to_string()))
}

fn print_report(report: &IngestReport, output: OutputFormat, quiet: bool) {
    match output {
        OutputFormat::Json => {
            let pretty = serde_json::to_string_pretty(report)
                .unwrap_or_else(|e| format!("{{\"error\": \"serialization error: {}\"}}", e));
            println!("{}", pretty);
        }
        OutputFormat::Text => {
            if quiet {
                return;
            }
            let mode = match report.mode {
                IngestMode::Replace => "replace",
                IngestMode::Append => "append",
            };
            println!(
                "Ingested {} file(s) into table '{}' ({})",
                report.files, report.table, mode
            );
            if report.skipped_files > 0 {
                println!("  unreadable files skipped: {}", report.skipped_files);
            }
            println!("  events:    {} ({} skipped)", report.events, report.skipped);
            println!(
                "  records:   {} ({} inserted, {} duplicate, {} cleared)",
                report.records, report.inserted, report.duplicates, report.cleared
            );
            println!(
                "  instances: {} ({} start records)",
                report.instances, report.start_records
            );
        }
    }
}
