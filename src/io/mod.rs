//! File input and output: text ingestion, columnar writers, JSON export.

pub mod curve;
pub mod export;
pub mod ingest;
