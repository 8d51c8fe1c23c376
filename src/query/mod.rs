//! Query layer: filter evaluation, columnar aggregation, variant shredding
//! and Parquet-side filtered scans.

use thiserror::Error;

use crate::storage::StorageError;

pub mod aggregate;
pub mod filter;
pub mod scan;
pub mod shred;

pub use aggregate::{
    aggregate, empty_outcome, AggregateOutcome, AggregateSpec, AggregateStats, Aggregation,
};
pub use filter::{Filter, VectorQuery};
pub use scan::{scan_parquet, ScanOutcome};
pub use shred::{data_shred_fields, ShredConfig, DEFAULT_DATA_SHRED_FIELDS};

/// Query-layer errors.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("invalid aggregation: {0}")]
    InvalidAggregate(String),

    #[error("invalid cursor: {0}")]
    InvalidCursor(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
