//! Entity model: a document with identity, versioning and audit fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::EntityId;

/// A stored document. System fields live in the header; user fields (including
/// relationship values) are carried in the flattened `fields` map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    /// Stable identity, set at creation, never changes.
    #[serde(rename = "$id")]
    pub id: EntityId,

    /// Logical type name (separate from the namespace).
    #[serde(rename = "$type")]
    pub entity_type: String,

    /// Human display name.
    pub name: String,

    /// Monotonically increasing per accepted mutation, starting at 1.
    pub version: u64,

    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,

    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,

    #[serde(rename = "createdBy", skip_serializing_if = "Option::is_none", default)]
    pub created_by: Option<EntityId>,

    #[serde(rename = "updatedBy", skip_serializing_if = "Option::is_none", default)]
    pub updated_by: Option<EntityId>,

    /// Soft-delete mark. When set, `deleted_by` is set too.
    #[serde(rename = "deletedAt", skip_serializing_if = "Option::is_none", default)]
    pub deleted_at: Option<DateTime<Utc>>,

    #[serde(rename = "deletedBy", skip_serializing_if = "Option::is_none", default)]
    pub deleted_by: Option<EntityId>,

    /// User fields: scalars, nested objects, arrays, relationship values.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Entity {
    /// Create a fresh entity at version 1.
    pub fn new(
        id: EntityId,
        entity_type: String,
        name: String,
        fields: Map<String, Value>,
        now: DateTime<Utc>,
        actor: Option<EntityId>,
    ) -> Self {
        Self {
            id,
            entity_type,
            name,
            version: 1,
            created_at: now,
            updated_at: now,
            created_by: actor.clone(),
            updated_by: actor,
            deleted_at: None,
            deleted_by: None,
            fields,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Bump the version and audit fields for an accepted mutation.
    pub fn touch(&mut self, now: DateTime<Utc>, actor: Option<EntityId>) {
        self.version += 1;
        self.updated_at = now;
        self.updated_by = actor;
    }

    pub fn mark_deleted(&mut self, now: DateTime<Utc>, actor: Option<EntityId>) {
        self.deleted_at = Some(now);
        self.deleted_by = actor.clone().or_else(|| self.updated_by.clone());
    }

    pub fn clear_deleted(&mut self) {
        self.deleted_at = None;
        self.deleted_by = None;
    }

    /// Full JSON snapshot, used for event `before`/`after` payloads.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Entity {
        let mut fields = Map::new();
        fields.insert("title".to_string(), json!("Hello"));
        Entity::new(
            EntityId::new("posts", "p1").unwrap(),
            "Post".to_string(),
            "Hello".to_string(),
            fields,
            Utc::now(),
            None,
        )
    }

    #[test]
    fn test_new_entity_version_one() {
        let e = sample();
        assert_eq!(e.version, 1);
        assert_eq!(e.created_at, e.updated_at);
        assert!(!e.is_deleted());
    }

    #[test]
    fn test_touch_bumps_version() {
        let mut e = sample();
        let actor = EntityId::new("users", "admin").unwrap();
        e.touch(Utc::now(), Some(actor.clone()));
        assert_eq!(e.version, 2);
        assert_eq!(e.updated_by, Some(actor));
        assert!(e.created_at <= e.updated_at);
    }

    #[test]
    fn test_delete_sets_both_marks() {
        let mut e = sample();
        let actor = EntityId::new("users", "admin").unwrap();
        e.mark_deleted(Utc::now(), Some(actor.clone()));
        assert!(e.is_deleted());
        assert_eq!(e.deleted_by, Some(actor));

        e.clear_deleted();
        assert!(!e.is_deleted());
        assert!(e.deleted_by.is_none());
    }

    #[test]
    fn test_serialization_uses_directive_keys() {
        let e = sample();
        let value = e.to_value();
        assert_eq!(value["$id"], json!("posts/p1"));
        assert_eq!(value["$type"], json!("Post"));
        assert_eq!(value["title"], json!("Hello"));
        // Unset soft-delete marks are omitted entirely.
        assert!(value.get("deletedAt").is_none());
    }

    #[test]
    fn test_value_round_trip() {
        let e = sample();
        let back = Entity::from_value(&e.to_value()).unwrap();
        assert_eq!(back.id, e.id);
        assert_eq!(back.version, e.version);
        assert_eq!(back.fields, e.fields);
    }
}
