//! Relationship values: single-valued links and ordered link sets.

use serde_json::{Map, Value};

use super::EntityId;

/// Reserved metadata keys inside serialized relationship sets.
pub const REL_COUNT_KEY: &str = "$count";
pub const REL_NEXT_KEY: &str = "$next";

/// A single-valued edge: exactly one `displayName -> EntityId` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelLink {
    pub display_name: String,
    pub target: EntityId,
}

impl RelLink {
    pub fn new(display_name: String, target: EntityId) -> Self {
        Self {
            display_name,
            target,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(
            self.display_name.clone(),
            Value::String(self.target.to_string()),
        );
        Value::Object(map)
    }

    /// Parse from a one-entry object. Returns `None` for any other shape.
    pub fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        let mut user_entries = map.iter().filter(|(k, _)| !k.starts_with('$'));
        let (name, target) = user_entries.next()?;
        if user_entries.next().is_some() {
            return None;
        }
        let target = EntityId::parse(target.as_str()?).ok()?;
        Some(Self::new(name.clone(), target))
    }
}

/// One entry of a multi-valued edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelEntry {
    pub display_name: String,
    pub target: EntityId,
}

/// A multi-valued edge: insertion-ordered `displayName -> EntityId` entries
/// plus sidecar metadata (`$count`, `$next`). The metadata never mixes with
/// user entries internally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelSet {
    entries: Vec<RelEntry>,
    pub count: Option<u64>,
    pub next: Option<String>,
}

impl RelSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, collapsing duplicates by display name (first wins).
    pub fn insert(&mut self, display_name: String, target: EntityId) {
        if self.entries.iter().any(|e| e.display_name == display_name) {
            return;
        }
        self.entries.push(RelEntry {
            display_name,
            target,
        });
    }

    pub fn remove(&mut self, display_name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.display_name != display_name);
        self.entries.len() != before
    }

    pub fn remove_target(&mut self, target: &EntityId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| &e.target != target);
        self.entries.len() != before
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> &[RelEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_target(&self, target: &EntityId) -> bool {
        self.entries.iter().any(|e| &e.target == target)
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        for entry in &self.entries {
            map.insert(
                entry.display_name.clone(),
                Value::String(entry.target.to_string()),
            );
        }
        if let Some(count) = self.count {
            map.insert(REL_COUNT_KEY.to_string(), Value::from(count));
        }
        if let Some(next) = &self.next {
            map.insert(REL_NEXT_KEY.to_string(), Value::String(next.clone()));
        }
        Value::Object(map)
    }

    /// Parse from an object, splitting reserved `$`-keys into the sidecar and
    /// dropping entries that are not valid entity-id strings.
    pub fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        let mut set = RelSet::new();
        for (key, val) in map {
            if key == REL_COUNT_KEY {
                set.count = val.as_u64();
            } else if key == REL_NEXT_KEY {
                set.next = val.as_str().map(|s| s.to_string());
            } else if !key.starts_with('$') {
                if let Some(target) = val.as_str().and_then(|s| EntityId::parse(s).ok()) {
                    set.insert(key.clone(), target);
                }
            }
        }
        Some(set)
    }
}

/// Relationship mutation extracted from `$link` / `$unlink` operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipOp {
    pub kind: RelOpKind,
    /// The relationship field being mutated.
    pub predicate: String,
    /// Target references (raw strings; resolution happens in the executor).
    /// Empty with `kind == Unlink` means "remove all".
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelOpKind {
    Link,
    Unlink,
}
