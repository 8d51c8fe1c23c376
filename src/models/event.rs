//! Append-only mutation events.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{EntityId, IdError};

/// The four mutation kinds recorded in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventOp {
    #[serde(rename = "CREATE")]
    Create,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "RESTORE")]
    Restore,
}

impl EventOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOp::Create => "CREATE",
            EventOp::Update => "UPDATE",
            EventOp::Delete => "DELETE",
            EventOp::Restore => "RESTORE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATE" => Some(EventOp::Create),
            "UPDATE" => Some(EventOp::Update),
            "DELETE" => Some(EventOp::Delete),
            "RESTORE" => Some(EventOp::Restore),
            _ => None,
        }
    }
}

/// One record in the append-only log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Sortable, globally unique id (26-char ULID layout).
    pub id: String,

    /// Millisecond wall-time at append.
    pub ts: i64,

    pub op: EventOp,

    /// Target entity in `namespace:localId` form.
    pub target: String,

    /// Snapshot before the mutation; `None` for CREATE.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub before: Option<Value>,

    /// Snapshot after the mutation; `None` for DELETE.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub after: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub actor: Option<EntityId>,

    /// May carry the raw update-operator payload for audit/merge.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metadata: Option<Value>,
}

impl Event {
    pub fn new(id: String, ts: i64, op: EventOp, target: String) -> Self {
        Self {
            id,
            ts,
            op,
            target,
            before: None,
            after: None,
            actor: None,
            metadata: None,
        }
    }

    pub fn with_before(mut self, before: Value) -> Self {
        self.before = Some(before);
        self
    }

    pub fn with_after(mut self, after: Value) -> Self {
        self.after = Some(after);
        self
    }

    pub fn with_actor(mut self, actor: Option<EntityId>) -> Self {
        self.actor = actor;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Decode the target back into an [`EntityId`].
    pub fn entity_id(&self) -> Result<EntityId, IdError> {
        EntityId::from_target(&self.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_op_serialization_is_screaming_case() {
        assert_eq!(serde_json::to_string(&EventOp::Create).unwrap(), "\"CREATE\"");
        assert_eq!(serde_json::to_string(&EventOp::Restore).unwrap(), "\"RESTORE\"");
    }

    #[test]
    fn test_op_parse_round_trip() {
        for op in [EventOp::Create, EventOp::Update, EventOp::Delete, EventOp::Restore] {
            assert_eq!(EventOp::parse(op.as_str()), Some(op));
        }
        assert_eq!(EventOp::parse("UPSERT"), None);
    }

    #[test]
    fn test_event_builder() {
        let event = Event::new("01ABC".to_string(), 1000, EventOp::Create, "posts:p1".to_string())
            .with_after(json!({"$id": "posts/p1"}))
            .with_actor(Some(EntityId::new("users", "admin").unwrap()));

        assert!(event.before.is_none());
        assert!(event.after.is_some());
        assert_eq!(event.entity_id().unwrap().to_string(), "posts/p1");
    }

    #[test]
    fn test_event_serialization_omits_absent_fields() {
        let event = Event::new("01ABC".to_string(), 1000, EventOp::Delete, "posts:p1".to_string());
        let value = serde_json::to_value(&event).unwrap();
        assert!(value.get("before").is_none());
        assert!(value.get("after").is_none());
        assert_eq!(value["op"], json!("DELETE"));
    }
}
