//! Mutation layer: update-operator algebra, dotted-path access and the typed
//! hook registry.

use thiserror::Error;

use crate::models::{IdError, SchemaError};
use crate::storage::StorageError;

mod hooks;
mod operators;
mod path;

pub use hooks::{HookContext, HookHandle, HookPhase, HookRegistry};
pub use operators::{
    apply_operators, validate_update_operators, ApplyOptions, ApplyOutcome,
};
pub use path::FieldPath;

/// Errors surfaced by mutation execution. Nothing is recovered internally;
/// every failure reaches the caller.
#[derive(Debug, Error)]
pub enum MutationError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Id(#[from] IdError),

    #[error("entity '{0}' already exists")]
    DuplicateId(String),

    #[error("entity '{0}' not found")]
    NotFound(String),

    #[error("version conflict: expected {expected}, actual {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    #[error("cannot resolve relationship '{field}' target '{target}'")]
    RelationshipResolution { field: String, target: String },

    #[error("path component '{0}' is not allowed")]
    PrototypePollution(String),

    #[error("invalid update: {0}")]
    InvalidUpdate(String),

    #[error("hook '{hook}' rejected the operation: {message}")]
    Hook { hook: String, message: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}
