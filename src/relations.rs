//! Relationship resolution: forward and reverse edges computed from the
//! projection, with pagination and hydration support.

use serde_json::{Map, Value};

use crate::models::{
    Entity, EntityId, FieldKind, RelLink, RelSet, SchemaRegistry, TypeDef,
};
use crate::projection::{entity_document, FindResult, Projection};
use crate::query::filter::{lookup_path, total_compare, Filter};
use crate::query::QueryError;

/// A normalized forward reference extracted from a create input or `$link`
/// payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRef {
    /// Fully qualified target id.
    pub target: EntityId,
    /// Display name for the edge entry (target name or local id).
    pub display_name: String,
    /// Inline object payload, when the reference was given as a document
    /// (used by auto-create).
    pub payload: Option<Map<String, Value>>,
}

/// Normalize one forward-field value into references. Invalid entries are
/// dropped; duplicates collapse by display name later (RelSet semantics).
///
/// Accepted shapes: a local-id string, a full `ns/localId` string, an inline
/// object carrying the `$id`-directive field, or an array of those.
pub fn normalize_forward_refs(
    value: &Value,
    target_type: Option<&TypeDef>,
    target_namespace: &str,
) -> Vec<ForwardRef> {
    let mut refs = Vec::new();
    match value {
        Value::Array(items) => {
            for item in items {
                refs.extend(normalize_forward_refs(item, target_type, target_namespace));
            }
        }
        Value::String(s) => {
            if s.is_empty() {
                return refs;
            }
            let target = if s.contains('/') {
                EntityId::parse(s).ok()
            } else {
                EntityId::new(target_namespace, s).ok()
            };
            if let Some(target) = target {
                refs.push(ForwardRef {
                    display_name: target.local_id().to_string(),
                    target,
                    payload: None,
                });
            }
        }
        Value::Object(obj) => {
            // An inline document: derive the local id from the target type's
            // `$id` directive. Objects without it are silently skipped.
            let id_field = target_type.and_then(|def| def.id_field.as_deref());
            let local = id_field
                .and_then(|field| obj.get(field))
                .and_then(|v| v.as_str());
            let Some(local) = local else {
                return refs;
            };
            if let Ok(target) = EntityId::new(target_namespace, local) {
                let display = target_type
                    .and_then(|def| def.name_field.as_deref())
                    .and_then(|field| obj.get(field))
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .unwrap_or(local);
                refs.push(ForwardRef {
                    target,
                    display_name: display.to_string(),
                    payload: Some(obj.clone()),
                });
            }
        }
        _ => {}
    }
    refs
}

/// Options for [`RelationResolver::get_related`].
#[derive(Debug, Clone, Default)]
pub struct RelatedOptions {
    pub filter: Option<Value>,
    pub sort: Option<Value>,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
    pub include_deleted: bool,
}

/// Resolves edges against a projection snapshot.
pub struct RelationResolver<'a> {
    projection: &'a Projection,
    schemas: &'a SchemaRegistry,
}

impl<'a> RelationResolver<'a> {
    pub fn new(projection: &'a Projection, schemas: &'a SchemaRegistry) -> Self {
        Self {
            projection,
            schemas,
        }
    }

    /// Outbound single edge: at most one `displayName -> EntityId` pair.
    pub fn outbound_single(&self, entity: &Entity, field: &str) -> Option<RelLink> {
        let value = entity.fields.get(field)?;
        if let Some(link) = RelLink::from_value(value) {
            return Some(link);
        }
        // A raw id string normalizes to a link keyed by local id.
        let id = value.as_str().and_then(|s| EntityId::parse(s).ok())?;
        Some(RelLink::new(id.local_id().to_string(), id))
    }

    /// Outbound multi edge, truncated to `max` entries with `$count`/`$next`.
    pub fn outbound_multi(&self, entity: &Entity, field: &str, max: Option<usize>) -> RelSet {
        let mut set = entity
            .fields
            .get(field)
            .and_then(RelSet::from_value)
            .unwrap_or_default();
        truncate_set(&mut set, max);
        set
    }

    /// Inbound edge `<- SourceType.sourceField[]`: scan the projection for
    /// live sources whose forward field references the entity.
    pub fn inbound(
        &self,
        target: &EntityId,
        source_type: &str,
        source_field: &str,
        max: Option<usize>,
    ) -> RelSet {
        if max == Some(0) {
            let mut set = RelSet::new();
            set.count = Some(0);
            return set;
        }
        let source_ns = self.schemas.namespace_for_type(source_type);
        let mut set = RelSet::new();
        for source in self.projection.namespace_entities(&source_ns, false) {
            if source.entity_type != source_type {
                continue;
            }
            let Some(value) = source.fields.get(source_field) else {
                continue;
            };
            if references_target(value, target) {
                set.insert(display_name_of(source), source.id.clone());
            }
        }
        truncate_set(&mut set, max);
        set
    }

    /// Replace relationship fields with resolved edge values; inbound fields
    /// are added from the reverse scan. Soft-deleted targets are filtered
    /// from forward sets lazily here (edges are never cascaded on delete).
    pub fn hydrate(&self, entity: &Entity, max_inbound: Option<usize>) -> Entity {
        let Some(def) = self.schemas.get(&entity.entity_type) else {
            return entity.clone();
        };
        let mut hydrated = entity.clone();
        for (field, field_def) in &def.fields {
            match &field_def.kind {
                FieldKind::OutboundRel { many: false, .. } => {
                    if let Some(link) = self.outbound_single(entity, field) {
                        if self.target_visible(&link.target) {
                            hydrated.fields.insert(field.clone(), link.to_value());
                        } else {
                            hydrated.fields.remove(field);
                        }
                    }
                }
                FieldKind::OutboundRel { many: true, .. } => {
                    if entity.fields.contains_key(field) {
                        let mut set = self.outbound_multi(entity, field, max_inbound);
                        let hidden: Vec<EntityId> = set
                            .entries()
                            .iter()
                            .filter(|e| !self.target_visible(&e.target))
                            .map(|e| e.target.clone())
                            .collect();
                        for target in hidden {
                            set.remove_target(&target);
                        }
                        hydrated.fields.insert(field.clone(), set.to_value());
                    }
                }
                FieldKind::InboundRel {
                    target_type,
                    source_field,
                } => {
                    if max_inbound == Some(0) {
                        hydrated.fields.remove(field);
                        continue;
                    }
                    let set =
                        self.inbound(&entity.id, target_type, source_field, max_inbound);
                    hydrated.fields.insert(field.clone(), set.to_value());
                }
                _ => {}
            }
        }
        hydrated
    }

    fn target_visible(&self, target: &EntityId) -> bool {
        self.projection.get(target, false).is_some()
    }

    /// Fetch the entities behind one relationship field, then filter, sort
    /// and paginate the fetched targets (not the edges).
    pub fn get_related(
        &self,
        id: &EntityId,
        predicate: &str,
        opts: &RelatedOptions,
    ) -> Result<FindResult, QueryError> {
        let Some(entity) = self.projection.get(id, opts.include_deleted) else {
            return Ok(FindResult::empty());
        };
        let Some(def) = self.schemas.get(&entity.entity_type) else {
            return Ok(FindResult::empty());
        };
        let Some(field_def) = def.field(predicate) else {
            return Ok(FindResult::empty());
        };

        let target_ids: Vec<EntityId> = match &field_def.kind {
            FieldKind::OutboundRel { many: false, .. } => self
                .outbound_single(entity, predicate)
                .map(|link| vec![link.target])
                .unwrap_or_default(),
            FieldKind::OutboundRel { many: true, .. } => self
                .outbound_multi(entity, predicate, None)
                .entries()
                .iter()
                .map(|e| e.target.clone())
                .collect(),
            FieldKind::InboundRel {
                target_type,
                source_field,
            } => self
                .inbound(&entity.id, target_type, source_field, None)
                .entries()
                .iter()
                .map(|e| e.target.clone())
                .collect(),
            _ => Vec::new(),
        };

        let targets: Vec<Entity> = target_ids
            .iter()
            .filter_map(|tid| self.projection.get(tid, opts.include_deleted))
            .cloned()
            .collect();

        paginate_entities(targets, opts)
    }
}

fn truncate_set(set: &mut RelSet, max: Option<usize>) {
    let total = set.len() as u64;
    if let Some(max) = max {
        if set.len() > max {
            let keep: Vec<(String, EntityId)> = set
                .entries()
                .iter()
                .take(max)
                .map(|e| (e.display_name.clone(), e.target.clone()))
                .collect();
            set.clear();
            for (name, target) in keep {
                set.insert(name, target);
            }
            set.count = Some(total);
            set.next = Some(format!("o:{}", max));
            return;
        }
    }
    set.count = Some(total);
}

fn display_name_of(entity: &Entity) -> String {
    if entity.name.is_empty() {
        entity.id.local_id().to_string()
    } else {
        entity.name.clone()
    }
}

/// Does a stored forward value reference the given target?
fn references_target(value: &Value, target: &EntityId) -> bool {
    let full = target.to_string();
    match value {
        Value::String(s) => s == &full,
        Value::Array(items) => items.iter().any(|v| references_target(v, target)),
        Value::Object(map) => map
            .iter()
            .filter(|(k, _)| !k.starts_with('$'))
            .any(|(_, v)| v.as_str() == Some(full.as_str())),
        _ => false,
    }
}

/// Filter/sort/limit/cursor over an already-fetched entity list, sharing the
/// cursor format of [`Projection::find`].
pub fn paginate_entities(
    entities: Vec<Entity>,
    opts: &RelatedOptions,
) -> Result<FindResult, QueryError> {
    let filter = opts.filter.clone().unwrap_or_else(|| Value::Object(Map::new()));
    let parsed = Filter::parse(&filter)?;

    let mut matched: Vec<(Entity, Map<String, Value>)> = entities
        .into_iter()
        .map(|e| {
            let doc = entity_document(&e);
            (e, doc)
        })
        .filter(|(_, doc)| parsed.matches(doc))
        .collect();

    if let Some(sort) = &opts.sort {
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
        Some(cursor) => cursor
            .strip_prefix("o:")
            .and_then(|rest| rest.parse::<usize>().ok())
            .ok_or_else(|| QueryError::InvalidCursor(cursor.clone()))?,
        None => 0,
    };
    let limit = opts.limit.unwrap_or(usize::MAX);

    let page: Vec<Entity> = matched
        .into_iter()
        .skip(offset)
        .take(limit)
        .map(|(e, _)| e)
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
