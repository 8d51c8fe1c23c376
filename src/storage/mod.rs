//! Storage engine: blob store, Parquet codec, segments, manifest, event log.
//!
//! Layout of a branch named `events`:
//! - `events/manifest.json` — the ordered segment list
//! - `events/seg-*.parquet` — immutable event segments
//! - `events.parquet` — legacy single-file form, read-only compatibility

use thiserror::Error;

mod blob;
mod log;
mod manifest;
mod parquet;
mod segment;

pub use blob::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use log::{merge_logs, CompactionStats, EventLog};
pub use manifest::Manifest;
pub use parquet::{
    ColumnMeta, ColumnStats, ColumnType, ColumnValue, FileMetadata, ParquetCodec, RowGroupMeta,
    TableColumn, TableSchema, WriteOptions,
};
pub use segment::{
    append_events, count_events, deduplicate_events, event_table_schema, read_event_batches,
    read_events_from_segments, read_events_in_range, read_segment_events, validate_event_order,
    write_events, write_events_to_segment, AppendOutcome, SegmentBatchWriter, SegmentMeta,
    SegmentWriteOptions,
};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Parquet write failed at '{path}': {cause}")]
    ParquetWrite { path: String, cause: String },

    #[error("Parquet read failed at '{path}': {cause}")]
    ParquetRead { path: String, cause: String },

    #[error("Invalid segment: {0}")]
    InvalidSegment(String),

    #[error("Compaction failed: {0}")]
    Compaction(String),
}

/// Blob key of the manifest for a branch.
pub fn manifest_path(branch: &str) -> String {
    format!("{}/manifest.json", branch)
}

/// Blob key of a content-addressed segment file.
pub fn segment_path(branch: &str, checksum: &str) -> String {
    let short = &checksum[..checksum.len().min(16)];
    format!("{}/seg-{}.parquet", branch, short)
}

/// Blob key of the legacy single-file log.
pub fn legacy_log_path(branch: &str) -> String {
    format!("{}.parquet", branch)
}
