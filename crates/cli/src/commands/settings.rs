use std::path::Path;
use std::process;

use logreplay_storage::{keys, validate_table_name, ReplayStorage, SqliteStorage, StorageError};

use crate::{report_error, runtime, OutputFormat};

fn open_storage(db: &Path, output: OutputFormat, quiet: bool) -> SqliteStorage {
    match SqliteStorage::open(db) {
        Ok(s) => s,
        Err(e) => {
            let msg = format!("error opening '{}': {}", db.display(), e);
            report_error(&msg, output, quiet);
            process::exit(1);
        }
    }
}

pub(crate) fn cmd_settings_get(db: &Path, key: &str, output: OutputFormat, quiet: bool) {
    let storage = open_storage(db, output, quiet);
    let rt = runtime(output, quiet);
    match rt.block_on(storage.get_setting(key)) {
        Ok(Some(value)) => print_setting(key, &value, output),
        Ok(None) => {
            report_error(&format!("setting '{}' is not set", key), output, quiet);
            process::exit(1);
        }
        Err(e) => {
            report_error(&format!("error reading setting '{}': {}", key, e), output, quiet);
            process::exit(1);
        }
    }
}

pub(crate) fn cmd_settings_set(
    db: &Path,
    key: &str,
    value: &str,
    output: OutputFormat,
    quiet: bool,
) {
    let storage = open_storage(db, output, quiet);
    let rt = runtime(output, quiet);
    match rt.block_on(store_setting(&storage, key, value)) {
        Ok(()) => {
            if !quiet || output == OutputFormat::Json {
                print_setting(key, value, output);
            }
        }
        Err(e) => {
            report_error(&format!("error writing setting '{}': {}", key, e), output, quiet);
            process::exit(1);
        }
    }
}

/// Write a setting. Keys that name a call table must hold a valid table name.
pub(crate) async fn store_setting<S: ReplayStorage>(
    storage: &S,
    key: &str,
    value: &str,
) -> Result<(), StorageError> {
    if key == keys::ACTIVE_TABLE || key == keys::REPLAY_TABLE {
        validate_table_name(value)?;
    }
    storage.set_setting(key, value).await
}

fn print_setting(key: &str, value: &str, output: OutputFormat) {
    match output {
        OutputFormat::Text => println!("{}", value),
        OutputFormat::Json => {
            let json = serde_json::json!({ "key": key, "value": value });
            println!("{}", json);
        }
    }
}
