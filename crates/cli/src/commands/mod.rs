pub(crate) mod ingest;
pub(crate) mod settings;
