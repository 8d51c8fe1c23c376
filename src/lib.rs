//! # ParqueDB
//!
//! A schema-directed, event-sourced document store whose on-disk
//! representation is columnar Parquet.
//!
//! ## Architecture
//!
//! - **models**: Core data structures (entities, events, relationships, schemas)
//! - **config**: Configuration loading and validation
//! - **storage**: Blob store, Parquet codec, segments, manifest, event log
//! - **mutate**: Update-operator algebra, path access, hook registry
//! - **query**: Filter evaluation, columnar aggregation, variant shredding
//! - **projection**: In-memory state reconstructed from the event log
//! - **relations**: Forward/reverse relationship resolution
//! - **db**: The public database facade

pub mod config;
pub mod db;
pub mod models;
pub mod mutate;
pub mod projection;
pub mod query;
pub mod relations;
pub mod storage;

pub use db::{Db, DbError};
pub use models::*;
