//! State projection: replaying the event log into an in-memory keyed store.
//!
//! Replay groups events by target and applies them in id order: CREATE sets
//! the state, UPDATE replaces it with `after`, DELETE keeps the last `before`
//! plus the deletion marks, RESTORE clears them. Reads are soft-delete aware.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::models::{Entity, EntityId, Event, EventOp};
use crate::query::filter::{lookup_path, total_compare, Filter};
use crate::query::QueryError;

/// Options for [`Projection::find`].
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub limit: Option<usize>,
    pub cursor: Option<String>,
    /// `{field: 1 | -1}` sort specification; default is most recent
    /// `updatedAt` first.
    pub sort: Option<Value>,
    pub include_deleted: bool,
}

/// A page of query results.
#[derive(Debug, Clone)]
pub struct FindResult {
    pub items: Vec<Entity>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
    pub total: Option<u64>,
}

impl FindResult {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            has_more: false,
            next_cursor: None,
            total: Some(0),
        }
    }
}

/// The in-memory entity store keyed by `namespace/localId`.
#[derive(Debug, Default)]
pub struct Projection {
    entities: HashMap<String, Entity>,
}

impl Projection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the full store from an ordered event log.
    pub fn replay(events: &[Event]) -> Self {
        let mut projection = Self::new();
        for event in events {
            projection.apply_event(event);
        }
        projection
    }

    /// Apply a single event. Events must arrive in id order per target.
    pub fn apply_event(&mut self, event: &Event) {
        let Ok(id) = event.entity_id() else {
            return;
        };
        let key = id.to_string();
        match event.op {
            EventOp::Create | EventOp::Update => {
                if let Some(entity) = event.after.as_ref().and_then(Entity::from_value) {
                    self.entities.insert(key, entity);
                }
            }
            EventOp::Delete => {
                let hard = event
                    .metadata
                    .as_ref()
                    .and_then(|m| m.get("hard"))
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                if hard {
                    self.entities.remove(&key);
                    return;
                }
                // Keep the last pre-delete snapshot, marked as a tombstone.
                let snapshot = event
                    .before
                    .as_ref()
                    .and_then(Entity::from_value)
                    .or_else(|| self.entities.get(&key).cloned());
                if let Some(mut entity) = snapshot {
                    if entity.deleted_at.is_none() {
                        entity.deleted_at = Some(millis_to_datetime(event.ts));
                        entity.deleted_by =
                            event.actor.clone().or_else(|| entity.updated_by.clone());
                    }
                    self.entities.insert(key, entity);
                }
            }
            EventOp::Restore => {
                if let Some(entity) = event.after.as_ref().and_then(Entity::from_value) {
                    self.entities.insert(key, entity);
                } else if let Some(entity) = self.entities.get_mut(&key) {
                    entity.clear_deleted();
                }
            }
        }
    }

    /// Fetch one entity. Soft-deleted entities are hidden unless asked for.
    pub fn get(&self, id: &EntityId, include_deleted: bool) -> Option<&Entity> {
        let entity = self.entities.get(&id.to_string())?;
        if entity.is_deleted() && !include_deleted {
            return None;
        }
        Some(entity)
    }

    /// Raw lookup, tombstones included.
    pub fn get_any(&self, id: &EntityId) -> Option<&Entity> {
        self.entities.get(&id.to_string())
    }

    pub fn insert(&mut self, entity: Entity) {
        self.entities.insert(entity.id.to_string(), entity);
    }

    pub fn remove(&mut self, id: &EntityId) -> Option<Entity> {
        self.entities.remove(&id.to_string())
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Live entities of a namespace, most recently updated first.
    pub fn namespace_entities(&self, namespace: &str, include_deleted: bool) -> Vec<&Entity> {
        let mut entities: Vec<&Entity> = self
            .entities
            .values()
            .filter(|e| e.id.namespace() == namespace)
            .filter(|e| include_deleted || !e.is_deleted())
            .collect();
        entities.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        entities
    }

    /// Filtered, sorted, cursor-paginated query over one namespace.
    pub fn find(
        &self,
        namespace: &str,
        filter: &Value,
        opts: &FindOptions,
    ) -> Result<FindResult, QueryError> {
        let parsed = Filter::parse(filter)?;

        let mut matched: Vec<(&Entity, Map<String, Value>)> = Vec::new();
        for entity in self.namespace_entities(namespace, opts.include_deleted) {
            let doc = entity_document(entity);
            if parsed.matches(&doc) {
                matched.push((entity, doc));
            }
        }

        // A vector condition ranks by similarity and keeps the top K.
        if let Some(vector) = parsed.vector_query() {
            let mut scored: Vec<(f64, (&Entity, Map<String, Value>))> = matched
                .into_iter()
                .filter_map(|(entity, doc)| {
                    let value = lookup_path(&doc, &vector.field)?;
                    let score =
                        crate::query::filter::cosine_similarity(&vector.query, value)?;
                    Some((score, (entity, doc)))
                })
                .collect();
            scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
            matched = scored
                .into_iter()
                .take(vector.top_k)
                .map(|(_, pair)| pair)
                .collect();
        } else if let Some(sort) = &opts.sort {
            let keys: Vec<(String, i64)> = sort
                .as_object()
                .map(|obj| {
                    obj.iter()
                        .map(|(field, dir)| (field.clone(), dir.as_i64().unwrap_or(1)))
                        .collect()
                })
                .unwrap_or_default();
            matched.sort_by(|(_, a), (_, b)| {
                for (field, dir) in &keys {
                    let av = lookup_path(a, field).unwrap_or(&Value::Null);
                    let bv = lookup_path(b, field).unwrap_or(&Value::Null);
                    let ord = total_compare(av, bv);
                    if ord != std::cmp::Ordering::Equal {
                        return if *dir < 0 { ord.reverse() } else { ord };
                    }
                }
                std::cmp::Ordering::Equal
            });
        }

        let total = matched.len();
        let offset = match &opts.cursor {
            Some(cursor) => parse_cursor(cursor)?,
            None => 0,
        };
        let limit = opts.limit.unwrap_or(usize::MAX);

        let page: Vec<Entity> = matched
            .iter()
            .skip(offset)
            .take(limit)
            .map(|(entity, _)| (*entity).clone())
            .collect();
        let consumed = offset.saturating_add(page.len());
        let has_more = consumed < total;

        Ok(FindResult {
            items: page,
            has_more,
            next_cursor: has_more.then(|| format!("o:{}", consumed)),
            total: Some(total as u64),
        })
    }
}

/// The JSON document view of an entity: system fields plus user fields.
pub fn entity_document(entity: &Entity) -> Map<String, Value> {
    entity
        .to_value()
        .as_object()
        .cloned()
        .unwrap_or_default()
}

fn parse_cursor(cursor: &str) -> Result<usize, QueryError> {
    cursor
        .strip_prefix("o:")
        .and_then(|rest| rest.parse::<usize>().ok())
        .ok_or_else(|| QueryError::InvalidCursor(cursor.to_string()))
}

fn millis_to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ts)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(ns: &str, local: &str, version: u64, fields: Value) -> Entity {
        Entity {
            id: EntityId::new(ns, local).unwrap(),
            entity_type: "Post".to_string(),
            name: local.to_string(),
            version,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            created_by: None,
            updated_by: None,
            deleted_at: None,
            deleted_by: None,
            fields: fields.as_object().cloned().unwrap(),
        }
    }

    fn create_event(id: &str, ts: i64, e: &Entity) -> Event {
        Event::new(id.to_string(), ts, EventOp::Create, e.id.target()).with_after(e.to_value())
    }

    #[test]
    fn test_replay_lifecycle() {
        let v1 = entity("posts", "p1", 1, json!({"title": "Hi"}));
        let mut v2 = v1.clone();
        v2.version = 2;
        v2.fields.insert("title".to_string(), json!("Hi 2"));

        let events = vec![
            create_event("01A", 100, &v1),
            Event::new("01B".to_string(), 200, EventOp::Update, v1.id.target())
                .with_before(v1.to_value())
                .with_after(v2.to_value()),
            Event::new("01C".to_string(), 300, EventOp::Delete, v1.id.target())
                .with_before(v2.to_value()),
        ];

        let projection = Projection::replay(&events);
        let id = EntityId::new("posts", "p1").unwrap();

        assert!(projection.get(&id, false).is_none());
        let tombstone = projection.get(&id, true).unwrap();
        assert!(tombstone.is_deleted());
        assert_eq!(tombstone.fields["title"], json!("Hi 2"));
        assert_eq!(tombstone.version, 2);
    }

    #[test]
    fn test_restore_clears_marks() {
        let v1 = entity("posts", "p1", 1, json!({}));
        let mut restored = v1.clone();
        restored.version = 3;

        let events = vec![
            create_event("01A", 100, &v1),
            Event::new("01B".to_string(), 200, EventOp::Delete, v1.id.target())
                .with_before(v1.to_value()),
            Event::new("01C".to_string(), 300, EventOp::Restore, v1.id.target())
                .with_after(restored.to_value()),
        ];

        let projection = Projection::replay(&events);
        let id = EntityId::new("posts", "p1").unwrap();
        let entity = projection.get(&id, false).unwrap();
        assert!(!entity.is_deleted());
        assert_eq!(entity.version, 3);
    }

    #[test]
    fn test_hard_delete_removes_entirely() {
        let v1 = entity("posts", "p1", 1, json!({}));
        let events = vec![
            create_event("01A", 100, &v1),
            Event::new("01B".to_string(), 200, EventOp::Delete, v1.id.target())
                .with_before(v1.to_value())
                .with_metadata(json!({"hard": true})),
        ];

        let projection = Projection::replay(&events);
        let id = EntityId::new("posts", "p1").unwrap();
        assert!(projection.get(&id, true).is_none());
        assert_eq!(projection.len(), 0);
    }

    #[test]
    fn test_namespace_listing_orders_by_updated_at() {
        let mut projection = Projection::new();
        let mut older = entity("posts", "old", 1, json!({}));
        older.updated_at = Utc::now() - chrono::Duration::hours(1);
        let newer = entity("posts", "new", 1, json!({}));
        let other_ns = entity("users", "u1", 1, json!({}));
        projection.insert(older);
        projection.insert(newer);
        projection.insert(other_ns);

        let listed = projection.namespace_entities("posts", false);
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id.local_id(), "new");
        assert_eq!(listed[1].id.local_id(), "old");
    }

    #[test]
    fn test_find_filters_and_paginates() {
        let mut projection = Projection::new();
        for i in 0..5 {
            projection.insert(entity(
                "posts",
                &format!("p{i}"),
                1,
                json!({"rank": i, "status": if i % 2 == 0 { "even" } else { "odd" }}),
            ));
        }

        let result = projection
            .find(
                "posts",
                &json!({"status": "even"}),
                &FindOptions {
                    limit: Some(2),
                    sort: Some(json!({"rank": 1})),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(result.items.len(), 2);
        assert_eq!(result.total, Some(3));
        assert!(result.has_more);
        assert_eq!(result.items[0].fields["rank"], json!(0));

        let next = projection
            .find(
                "posts",
                &json!({"status": "even"}),
                &FindOptions {
                    limit: Some(2),
                    cursor: result.next_cursor.clone(),
                    sort: Some(json!({"rank": 1})),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(next.items.len(), 1);
        assert!(!next.has_more);
        assert!(next.next_cursor.is_none());
        assert_eq!(next.items[0].fields["rank"], json!(4));
    }

    #[test]
    fn test_find_empty_namespace() {
        let projection = Projection::new();
        let result = projection
            .find("ghosts", &json!({}), &FindOptions::default())
            .unwrap();
        assert!(result.items.is_empty());
        assert!(!result.has_more);
        assert_eq!(result.total, Some(0));
    }

    #[test]
    fn test_find_excludes_deleted_by_default() {
        let mut projection = Projection::new();
        let mut dead = entity("posts", "dead", 1, json!({}));
        dead.deleted_at = Some(Utc::now());
        projection.insert(dead);
        projection.insert(entity("posts", "alive", 1, json!({})));

        let result = projection
            .find("posts", &json!({}), &FindOptions::default())
            .unwrap();
        assert_eq!(result.items.len(), 1);

        let with_deleted = projection
            .find(
                "posts",
                &json!({}),
                &FindOptions {
                    include_deleted: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(with_deleted.items.len(), 2);
    }

    #[test]
    fn test_find_filters_on_system_fields() {
        let mut projection = Projection::new();
        projection.insert(entity("posts", "p1", 3, json!({})));
        projection.insert(entity("posts", "p2", 1, json!({})));

        let result = projection
            .find(
                "posts",
                &json!({"version": {"$gte": 2}}),
                &FindOptions::default(),
            )
            .unwrap();
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].id.local_id(), "p1");
    }

    #[test]
    fn test_find_vector_ranking() {
        let mut projection = Projection::new();
        projection.insert(entity("docs", "a", 1, json!({"embedding": [1.0, 0.0]})));
        projection.insert(entity("docs", "b", 1, json!({"embedding": [0.0, 1.0]})));
        projection.insert(entity("docs", "c", 1, json!({"embedding": [0.9, 0.1]})));

        let result = projection
            .find(
                "docs",
                &json!({"$vector": {"query": [1.0, 0.0], "field": "embedding", "topK": 2}}),
                &FindOptions::default(),
            )
            .unwrap();

        assert_eq!(result.items.len(), 2);
        assert_eq!(result.items[0].id.local_id(), "a");
        assert_eq!(result.items[1].id.local_id(), "c");
    }

    #[test]
    fn test_bad_cursor_is_error() {
        let projection = Projection::new();
        let err = projection
            .find(
                "posts",
                &json!({}),
                &FindOptions {
                    cursor: Some("garbage".to_string()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, QueryError::InvalidCursor(_)));
    }
}
