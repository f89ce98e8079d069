//! Log Ingestion Pipeline: turns CPEE XES-YAML traces into call records.
//!
//! Each activity of a trace becomes at most one record; its calling event
//! supplies the parameters and every receiving event adds a response,
//! timed relative to the call.

pub mod assemble;
mod error;
pub mod pipeline;
pub mod xes;

#[cfg(test)]
mod fixtures;

pub use error::IngestError;
pub use pipeline::{
    ingest_directory, trace_files, IngestMode, IngestOptions, IngestReport, DEFAULT_BATCH_SIZE,
};
pub use xes::{parse_trace, Lifecycle, ParsedTrace, TraceEvent};
