//! Core data models for ParqueDB.

mod entity;
mod event;
mod ids;
mod relationship;
mod schema;

pub use entity::*;
pub use event::*;
pub use ids::*;
pub use relationship::*;
pub use schema::*;
