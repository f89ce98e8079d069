//! Schema registry: the descriptor every call table is created from and
//! validated against.

use crate::error::StorageError;

/// Name of the settings collection.
pub const SETTINGS_TABLE: &str = "_settings";

/// Name of the table registry.
pub const REGISTRY_TABLE: &str = "_tables";

/// Call table used when no setting names one.
pub const DEFAULT_TABLE: &str = "calls";

/// Maximum length of a call table name.
pub const MAX_TABLE_NAME_LEN: usize = 64;

/// Well-known setting keys.
pub mod keys {
    /// Default table for ingestion and administration.
    pub const ACTIVE_TABLE: &str = "active_table";
    /// Table served by the matching engine.
    pub const REPLAY_TABLE: &str = "replay_table";
    /// Source directory of the most recent ingestion.
    pub const LAST_LOADED_DIRECTORY: &str = "last_loaded_directory";
}

/// A column of the call record schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub sql_type: &'static str,
    pub nullable: bool,
}

/// A versioned table schema descriptor.
#[derive(Debug, Clone, Copy)]
pub struct TableSchema {
    pub version: u32,
    pub columns: &'static [ColumnDef],
    /// Columns of the uniqueness constraint used to ignore duplicate inserts.
    pub unique: &'static [&'static str],
}

const fn col(name: &'static str, sql_type: &'static str, nullable: bool) -> ColumnDef {
    ColumnDef {
        name,
        sql_type,
        nullable,
    }
}

/// The call record table schema.
pub const CALL_TABLE_SCHEMA: TableSchema = TableSchema {
    version: 1,
    columns: &[
        col("instance_uuid", "TEXT", false),
        col("activity_uuid", "TEXT", false),
        col("endpoint_name", "TEXT", false),
        col("call_timestamp", "TEXT", false),
        col("input_params_json", "TEXT", false),
        col("responses_json", "TEXT", false),
        col("event_type", "TEXT", false),
        col("spawns_instance", "INTEGER", false),
        col("signature", "TEXT", false),
        col("consumed_by", "TEXT", true),
        col("consumed_at", "TEXT", true),
    ],
    unique: &[
        "instance_uuid",
        "activity_uuid",
        "endpoint_name",
        "input_params_json",
    ],
};

impl TableSchema {
    /// Check that a table with the given column names satisfies this schema.
    pub fn check_columns<'a, I>(&self, table: &str, found: I) -> Result<(), StorageError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let found: Vec<&str> = found.into_iter().collect();
        let missing: Vec<&str> = self
            .columns
            .iter()
            .map(|c| c.name)
            .filter(|name| !found.contains(name))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(StorageError::SchemaMismatch {
                table: table.to_string(),
                reason: format!("missing columns: {}", missing.join(", ")),
            })
        }
    }
}

/// Validate a call table name.
///
/// Names are 1 to 64 characters of `[A-Za-z0-9_-]` and may not start with
/// `_`, which is reserved for internal collections.
pub fn validate_table_name(name: &str) -> Result<(), StorageError> {
    let reject = |reason: &str| {
        Err(StorageError::InvalidTableName {
            name: name.to_string(),
            reason: reason.to_string(),
        })
    };
    if name.is_empty() {
        return reject("must not be empty");
    }
    if name.len() > MAX_TABLE_NAME_LEN {
        return reject("longer than 64 characters");
    }
    if name.starts_with('_') {
        return reject("names starting with '_' are reserved");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return reject("only ASCII letters, digits, '_' and '-' are allowed");
    }
    Ok(())
}

/// Quote an identifier for SQL.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_names() {
        for name in ["calls", "exp-1", "coopis_2010", "A"] {
            assert!(validate_table_name(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn rejects_reserved_and_odd_names() {
        let long = "x".repeat(65);
        for name in ["", "_settings", "a b", "calls;drop", "t\"x", long.as_str()] {
            assert!(
                matches!(
                    validate_table_name(name),
                    Err(StorageError::InvalidTableName { .. })
                ),
                "{name}"
            );
        }
    }

    #[test]
    fn column_check_reports_missing_columns() {
        let all: Vec<&str> = CALL_TABLE_SCHEMA.columns.iter().map(|c| c.name).collect();
        assert!(CALL_TABLE_SCHEMA.check_columns("t", all.iter().copied()).is_ok());

        let legacy = ["instance_uuid", "activity_uuid", "endpoint_name"];
        let err = CALL_TABLE_SCHEMA
            .check_columns("t", legacy.iter().copied())
            .unwrap_err();
        assert!(err.to_string().contains("signature"));
    }

    #[test]
    fn quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("calls"), "\"calls\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
