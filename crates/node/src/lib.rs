//! Single-process runtime node: wiring plus JSON-line command ingestion.

pub mod app;
pub mod ingest;
