//! The ParqueDB facade: schema-directed CRUD, queries, relationships,
//! aggregation and compaction over one branch of the event log.
//!
//! The write path is serialized by an intrinsic lock held for the whole
//! mutation, including event emission and the post-hook phase. Reads serve
//! from the in-memory projection rebuilt from the log on first use.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{ConfigError, DbConfig};
use crate::models::{
    Entity, EntityId, Event, EventIdGenerator, EventOp, FieldKind, IdError, RelLink, RelOpKind,
    RelSet, SchemaError, SchemaRegistry, TypeDef, generate_local_id,
};
use crate::mutate::{
    apply_operators, ApplyOptions, HookContext, HookHandle, HookPhase, HookRegistry,
    MutationError,
};
use crate::projection::{FindOptions, FindResult, Projection};
use crate::query::aggregate::{aggregate as run_aggregate, empty_outcome, AggregateOutcome, AggregateSpec};
use crate::query::shred::{data_shred_fields, prepare_shredded_variant_data};
use crate::query::{QueryError, ShredConfig};
use crate::relations::{normalize_forward_refs, RelatedOptions, RelationResolver};
use crate::storage::{
    BlobStore, ColumnType, ColumnValue, CompactionStats, EventLog, FsBlobStore, ParquetCodec,
    StorageError, TableColumn, TableSchema, WriteOptions,
};

/// Every error the facade can surface.
#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Mutation(#[from] MutationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Id(#[from] IdError),
}

impl From<SchemaError> for DbError {
    fn from(e: SchemaError) -> Self {
        DbError::Mutation(MutationError::Schema(e))
    }
}

/// System fields that update operators must not touch.
const SYSTEM_FIELDS: &[&str] = &[
    "$id",
    "$type",
    "version",
    "createdAt",
    "updatedAt",
    "createdBy",
    "updatedBy",
    "deletedAt",
    "deletedBy",
];

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub actor: Option<EntityId>,
    /// Opt-in: create stub targets for unresolved forward references.
    pub auto_create: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnDocument {
    Before,
    #[default]
    After,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub actor: Option<EntityId>,
    pub upsert: bool,
    pub expected_version: Option<u64>,
    pub return_document: ReturnDocument,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    pub actor: Option<EntityId>,
    pub hard: bool,
}

#[derive(Debug, Clone)]
pub struct GetOptions {
    pub include_deleted: bool,
    pub hydrate: bool,
    pub max_inbound: Option<usize>,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            include_deleted: false,
            hydrate: true,
            max_inbound: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub deleted_count: u64,
}

type EventCallback = Box<dyn Fn(&Event) + Send + Sync>;

struct DbInner {
    schemas: SchemaRegistry,
    log: EventLog,
    projection: Option<Projection>,
    hooks: HookRegistry,
    id_gen: EventIdGenerator,
    default_actor: Option<EntityId>,
    event_callbacks: Vec<EventCallback>,
}

/// A ParqueDB instance over one branch. Safe to share; one writer at a time.
pub struct Db {
    inner: Mutex<DbInner>,
}

impl Db {
    /// Open a database over the filesystem root in the config.
    pub fn open(config: DbConfig, schemas: SchemaRegistry) -> Result<Self, DbError> {
        config.validate()?;
        let root: PathBuf = config.data_dir.clone();
        Self::with_store(config, schemas, Arc::new(FsBlobStore::new(root)))
    }

    /// Open a database over any blob store (e.g. in-memory for tests).
    pub fn with_store(
        config: DbConfig,
        schemas: SchemaRegistry,
        blob: Arc<dyn BlobStore>,
    ) -> Result<Self, DbError> {
        config.validate()?;
        let log = EventLog::new(
            blob,
            &config.branch,
            config.max_buffered_events,
            config.max_events_per_segment,
            config.compaction_config(),
        );
        info!("Opened ParqueDB branch '{}'", config.branch);
        Ok(Self {
            inner: Mutex::new(DbInner {
                schemas,
                log,
                projection: None,
                hooks: HookRegistry::new(),
                id_gen: EventIdGenerator::new(),
                default_actor: None,
                event_callbacks: Vec::new(),
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DbInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn set_default_actor(&self, actor: Option<EntityId>) {
        self.lock().default_actor = actor;
    }

    /// Register a mutation hook.
    pub fn register_hook<F>(&self, phase: HookPhase, hook: F) -> HookHandle
    where
        F: Fn(&HookContext<'_>) -> Result<(), MutationError> + Send + Sync + 'static,
    {
        self.lock().hooks.register(phase, hook)
    }

    pub fn remove_hook(&self, handle: HookHandle) -> bool {
        self.lock().hooks.remove(handle)
    }

    /// Register a callback invoked for every accepted event, before the
    /// mutating call returns.
    pub fn on_event<F>(&self, callback: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.lock().event_callbacks.push(Box::new(callback));
    }

    // ---- write surface ----

    pub fn create(
        &self,
        namespace: &str,
        input: Value,
        opts: &CreateOptions,
    ) -> Result<Entity, DbError> {
        let mut inner = self.lock();
        inner.create(namespace, input, opts, true)
    }

    pub fn update(
        &self,
        namespace: &str,
        local_id: &str,
        update: Value,
        opts: &UpdateOptions,
    ) -> Result<Option<Entity>, DbError> {
        let mut inner = self.lock();
        inner.update(namespace, local_id, update, opts)
    }

    pub fn delete(
        &self,
        namespace: &str,
        local_id: &str,
        opts: &DeleteOptions,
    ) -> Result<DeleteOutcome, DbError> {
        let mut inner = self.lock();
        inner.delete(namespace, local_id, opts)
    }

    pub fn restore(&self, namespace: &str, local_id: &str) -> Result<Option<Entity>, DbError> {
        let mut inner = self.lock();
        inner.restore(namespace, local_id)
    }

    // ---- read surface ----

    pub fn get(
        &self,
        namespace: &str,
        local_id: &str,
        opts: &GetOptions,
    ) -> Result<Option<Entity>, DbError> {
        let mut inner = self.lock();
        let id = EntityId::new(namespace, local_id)?;
        inner.ensure_projection()?;
        let inner = &*inner;
        let Some(projection) = inner.projection.as_ref() else {
            return Ok(None);
        };
        let Some(entity) = projection.get(&id, opts.include_deleted).cloned() else {
            return Ok(None);
        };
        if !opts.hydrate {
            return Ok(Some(entity));
        }
        let resolver = RelationResolver::new(projection, &inner.schemas);
        Ok(Some(resolver.hydrate(&entity, opts.max_inbound)))
    }

    pub fn find(
        &self,
        namespace: &str,
        filter: &Value,
        opts: &FindOptions,
    ) -> Result<FindResult, DbError> {
        let mut inner = self.lock();
        inner.ensure_projection()?;
        match inner.projection.as_ref() {
            Some(projection) => Ok(projection.find(namespace, filter, opts)?),
            None => Ok(FindResult::empty()),
        }
    }

    pub fn get_related(
        &self,
        namespace: &str,
        local_id: &str,
        predicate: &str,
        opts: &RelatedOptions,
    ) -> Result<FindResult, DbError> {
        let mut inner = self.lock();
        let id = EntityId::new(namespace, local_id)?;
        inner.ensure_projection()?;
        let inner = &*inner;
        let Some(projection) = inner.projection.as_ref() else {
            return Ok(FindResult::empty());
        };
        let resolver = RelationResolver::new(projection, &inner.schemas);
        Ok(resolver.get_related(&id, predicate, opts)?)
    }

    /// Columnar aggregation over a namespace's live entities, evaluated on
    /// the exported Parquet representation.
    pub fn aggregate(&self, namespace: &str, spec: &Value) -> Result<AggregateOutcome, DbError> {
        let spec = AggregateSpec::parse(spec)?;
        let mut inner = self.lock();
        match inner.export_namespace(namespace)? {
            Some(bytes) => Ok(run_aggregate(namespace, &bytes, &spec)?),
            None => Ok(empty_outcome(&spec)),
        }
    }

    /// Materialize a namespace's live entities as an entity Parquet file
    /// (built-in columns plus the shredded `$data` variant column).
    pub fn export_namespace(&self, namespace: &str) -> Result<Option<Vec<u8>>, DbError> {
        self.lock().export_namespace(namespace)
    }

    /// The shredding configuration in effect for a namespace.
    pub fn shred_config(&self, namespace: &str) -> ShredConfig {
        let mut inner = self.lock();
        let _ = inner.ensure_projection();
        inner.shred_config(namespace)
    }

    // ---- maintenance surface ----

    pub fn begin_bulk_operation(&self) {
        self.lock().log.begin_bulk();
    }

    pub fn end_bulk_operation(&self, flush: bool, compact: bool) -> Result<u64, DbError> {
        Ok(self.lock().log.end_bulk(flush, compact)?)
    }

    /// Merge all segments into one; returns the number of events compacted.
    pub fn compact(&self) -> Result<u64, DbError> {
        Ok(self.lock().log.compact()?)
    }

    pub fn compaction_stats(&self) -> Result<CompactionStats, DbError> {
        Ok(self.lock().log.stats()?)
    }

    /// Flush buffered events and drop cached state.
    pub fn dispose(&self) -> Result<(), DbError> {
        let mut inner = self.lock();
        inner.log.dispose()?;
        inner.projection = None;
        Ok(())
    }
}

impl DbInner {
    fn ensure_projection(&mut self) -> Result<(), DbError> {
        if self.projection.is_none() {
            let events = self.log.read_all()?;
            debug!("Rebuilding projection from {} events", events.len());
            self.projection = Some(Projection::replay(&events));
        }
        Ok(())
    }

    fn actor_for(&self, explicit: &Option<EntityId>) -> Option<EntityId> {
        explicit.clone().or_else(|| self.default_actor.clone())
    }

    fn next_event(&mut self, op: EventOp, target: String) -> Event {
        let id = self.id_gen.next_id();
        Event::new(id, Utc::now().timestamp_millis(), op, target)
    }

    fn emit(&mut self, event: &Event) -> Result<(), DbError> {
        for callback in &self.event_callbacks {
            callback(event);
        }
        self.log.append(vec![event.clone()])?;
        Ok(())
    }

    fn shred_config(&mut self, namespace: &str) -> ShredConfig {
        let mut fields: Vec<String> = Vec::new();
        let types: Vec<String> = self
            .projection
            .as_ref()
            .map(|p| {
                p.namespace_entities(namespace, true)
                    .iter()
                    .map(|e| e.entity_type.clone())
                    .collect::<std::collections::BTreeSet<_>>()
                    .into_iter()
                    .collect()
            })
            .unwrap_or_default();
        if types.is_empty() {
            fields = data_shred_fields(None);
        } else {
            for type_name in types {
                for field in data_shred_fields(self.schemas.get(&type_name)) {
                    if !fields.contains(&field) {
                        fields.push(field);
                    }
                }
            }
        }
        ShredConfig::new("$data", fields)
    }

    fn export_namespace(&mut self, namespace: &str) -> Result<Option<Vec<u8>>, DbError> {
        self.ensure_projection()?;
        let config = self.shred_config(namespace);
        let projection = match &self.projection {
            Some(p) => p,
            None => return Ok(None),
        };
        let entities = projection.namespace_entities(namespace, false);
        if entities.is_empty() {
            return Ok(None);
        }

        let mut ids = Vec::with_capacity(entities.len());
        let mut names = Vec::with_capacity(entities.len());
        let mut versions = Vec::with_capacity(entities.len());
        let mut created = Vec::with_capacity(entities.len());
        let mut updated = Vec::with_capacity(entities.len());
        let mut documents: Vec<Map<String, Value>> = Vec::with_capacity(entities.len());
        for entity in &entities {
            ids.push(ColumnValue::Str(entity.id.to_string()));
            names.push(ColumnValue::Str(entity.name.clone()));
            versions.push(ColumnValue::Int(entity.version as i64));
            created.push(ColumnValue::Int(entity.created_at.timestamp_millis()));
            updated.push(ColumnValue::Int(entity.updated_at.timestamp_millis()));

            // The variant column holds the user fields plus `$type`.
            let mut document = entity.fields.clone();
            document.insert("$type".to_string(), Value::String(entity.entity_type.clone()));
            documents.push(document);
        }

        let variant =
            prepare_shredded_variant_data(&documents, &config.shred_fields, &config.column_name);

        let mut schema = vec![
            TableColumn::required("$id", ColumnType::String),
            TableColumn::required("name", ColumnType::String),
            TableColumn::required("version", ColumnType::Int64),
            TableColumn::required("createdAt", ColumnType::Int64),
            TableColumn::required("updatedAt", ColumnType::Int64),
        ];
        let mut columns = vec![ids, names, versions, created, updated];

        for (name, values) in &variant.column_data {
            let column_type = infer_column_type(values);
            schema.push(TableColumn::optional(name, column_type));
            columns.push(values.iter().map(|v| to_cell(v, column_type)).collect());
        }

        let bytes = ParquetCodec::write_table_opts(
            namespace,
            &TableSchema::new(schema),
            &columns,
            WriteOptions::default(),
        )?;
        Ok(Some(bytes))
    }

    // ---- create ----

    fn create(
        &mut self,
        namespace: &str,
        input: Value,
        opts: &CreateOptions,
        allow_auto_create: bool,
    ) -> Result<Entity, DbError> {
        let input = input
            .as_object()
            .cloned()
            .ok_or_else(|| SchemaError::Validation {
                field: "$type".to_string(),
                message: "create input must be an object".to_string(),
            })?;
        let entity_type = input
            .get("$type")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| SchemaError::Validation {
                field: "$type".to_string(),
                message: "missing $type".to_string(),
            })?;

        let type_def = self.schemas.get(&entity_type).cloned();
        if let Some(def) = &type_def {
            def.validate_input(&input)?;
        }

        let local_id = derive_local_id(&input, type_def.as_ref())?;
        let id = EntityId::new(namespace, &local_id)?;

        self.ensure_projection()?;
        if let Some(existing) = self
            .projection
            .as_ref()
            .and_then(|p| p.get_any(&id))
        {
            if !existing.is_deleted() {
                return Err(MutationError::DuplicateId(id.to_string()).into());
            }
            // Re-creating over a tombstone replaces it with a fresh record.
            debug!("Replacing tombstone at '{}'", id);
        }

        let name = derive_name(&input, type_def.as_ref(), &entity_type, &local_id);

        let mut fields: Map<String, Value> = input
            .iter()
            .filter(|(k, _)| !k.starts_with('$') && k.as_str() != "name")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        // Normalize declared forward-relationship fields, auto-creating stub
        // targets when opted in.
        if let Some(def) = &type_def {
            self.resolve_forward_fields(
                def,
                &mut fields,
                opts,
                allow_auto_create && opts.auto_create,
            )?;
        }

        let actor = self.actor_for(&opts.actor);
        let entity = Entity::new(
            id.clone(),
            entity_type,
            name,
            fields,
            Utc::now(),
            actor.clone(),
        );

        let pre_ctx = HookContext {
            namespace,
            op: EventOp::Create,
            entity: Some(&entity),
            event: None,
            update: None,
        };
        self.hooks.run(HookPhase::PreMutation, &pre_ctx)?;
        self.hooks.run(HookPhase::PreCreate, &pre_ctx)?;

        let event = self
            .next_event(EventOp::Create, id.target())
            .with_after(entity.to_value())
            .with_actor(actor);

        if let Some(projection) = self.projection.as_mut() {
            projection.insert(entity.clone());
        }
        self.emit(&event)?;

        let post_ctx = HookContext {
            namespace,
            op: EventOp::Create,
            entity: Some(&entity),
            event: Some(&event),
            update: None,
        };
        self.hooks.run(HookPhase::PostCreate, &post_ctx)?;
        self.hooks.run(HookPhase::PostMutation, &post_ctx)?;

        Ok(entity)
    }

    /// Replace declared forward-relationship inputs with normalized edge
    /// values, creating stubs for missing targets when enabled.
    fn resolve_forward_fields(
        &mut self,
        def: &TypeDef,
        fields: &mut Map<String, Value>,
        opts: &CreateOptions,
        auto_create: bool,
    ) -> Result<(), DbError> {
        for (field, field_def) in &def.fields {
            let FieldKind::OutboundRel {
                target_type, many, ..
            } = &field_def.kind
            else {
                continue;
            };
            let Some(raw) = fields.get(field).cloned() else {
                continue;
            };

            let target_ns = self.schemas.namespace_for_type(target_type);
            let target_def = self.schemas.get(target_type).cloned();
            let refs = normalize_forward_refs(&raw, target_def.as_ref(), &target_ns);

            let mut resolved: Vec<(String, EntityId)> = Vec::new();
            for forward in refs {
                let existing_live = self
                    .projection
                    .as_ref()
                    .and_then(|p| p.get(&forward.target, false))
                    .is_some();
                if !existing_live {
                    if !auto_create {
                        return Err(MutationError::RelationshipResolution {
                            field: field.clone(),
                            target: forward.target.to_string(),
                        }
                        .into());
                    }
                    self.create_stub(target_type, &forward, opts)?;
                }
                // Duplicate references collapse by display name.
                if !resolved.iter().any(|(name, _)| name == &forward.display_name) {
                    resolved.push((forward.display_name, forward.target));
                }
            }

            if *many {
                let mut set = RelSet::new();
                for (name, target) in resolved {
                    set.insert(name, target);
                }
                fields.insert(field.clone(), set.to_value());
            } else {
                match resolved.into_iter().next() {
                    Some((name, target)) => {
                        fields.insert(field.clone(), RelLink::new(name, target).to_value());
                    }
                    None => {
                        fields.remove(field);
                    }
                }
            }
        }
        Ok(())
    }

    /// Create a stub target with only identity fields. Auto-create is not
    /// transitive: inner references of an inline payload must already
    /// resolve, and a failure surfaces after the stub is committed.
    fn create_stub(
        &mut self,
        target_type: &str,
        forward: &crate::relations::ForwardRef,
        opts: &CreateOptions,
    ) -> Result<(), DbError> {
        let target_def = self.schemas.get(target_type).cloned();
        let mut stub_input = Map::new();
        stub_input.insert("$type".to_string(), Value::String(target_type.to_string()));
        if let Some(def) = &target_def {
            if let Some(id_field) = &def.id_field {
                stub_input.insert(
                    id_field.clone(),
                    Value::String(forward.target.local_id().to_string()),
                );
            }
            if let Some(name_field) = &def.name_field {
                stub_input.insert(
                    name_field.clone(),
                    Value::String(forward.display_name.clone()),
                );
            }
        }
        if !stub_input.contains_key("name") {
            stub_input.insert("name".to_string(), Value::String(forward.display_name.clone()));
        }

        let stub_opts = CreateOptions {
            actor: opts.actor.clone(),
            auto_create: false,
        };
        // If the id has no $id directive backing, fall back to the reference
        // local id via the `$id`-less create path: derive_local_id would
        // generate a fresh id, so pin it explicitly.
        if target_def.as_ref().and_then(|d| d.id_field.as_ref()).is_none() {
            stub_input.insert(
                "$localId".to_string(),
                Value::String(forward.target.local_id().to_string()),
            );
        }
        self.create(
            forward.target.namespace(),
            Value::Object(stub_input),
            &stub_opts,
            false,
        )?;

        // Non-transitive: inline payload sub-references must already exist.
        if let (Some(payload), Some(def)) = (&forward.payload, &target_def) {
            for (field, field_def) in &def.fields {
                let FieldKind::OutboundRel { target_type, .. } = &field_def.kind else {
                    continue;
                };
                let Some(sub_value) = payload.get(field) else {
                    continue;
                };
                let sub_ns = self.schemas.namespace_for_type(target_type);
                let sub_def = self.schemas.get(target_type).cloned();
                for sub in normalize_forward_refs(sub_value, sub_def.as_ref(), &sub_ns) {
                    let live = self
                        .projection
                        .as_ref()
                        .and_then(|p| p.get(&sub.target, false))
                        .is_some();
                    if !live {
                        return Err(MutationError::RelationshipResolution {
                            field: field.clone(),
                            target: sub.target.to_string(),
                        }
                        .into());
                    }
                }
            }
        }
        Ok(())
    }

    // ---- update ----

    fn update(
        &mut self,
        namespace: &str,
        local_id: &str,
        update: Value,
        opts: &UpdateOptions,
    ) -> Result<Option<Entity>, DbError> {
        let id = EntityId::new(namespace, local_id)?;
        let update_map = update
            .as_object()
            .cloned()
            .ok_or_else(|| MutationError::InvalidUpdate("update must be an object".to_string()))?;

        self.ensure_projection()?;
        let current = self
            .projection
            .as_ref()
            .and_then(|p| p.get(&id, false))
            .cloned();

        let Some(current) = current else {
            if !opts.upsert {
                return Err(MutationError::NotFound(id.to_string()).into());
            }
            return self.upsert_create(namespace, &id, &update_map, opts);
        };

        if let Some(expected) = opts.expected_version {
            if expected != current.version {
                return Err(MutationError::VersionConflict {
                    expected,
                    actual: current.version,
                }
                .into());
            }
        }

        // Operators run over the user fields plus the mutable `name` header.
        let mut working = current.fields.clone();
        working.insert("name".to_string(), Value::String(current.name.clone()));
        let outcome = apply_operators(
            &working,
            &update_map,
            &ApplyOptions {
                timestamp: Utc::now(),
                is_insert: false,
            },
        )?;
        for field in &outcome.modified_fields {
            let head = field.split('.').next().unwrap_or(field);
            if SYSTEM_FIELDS.contains(&head) {
                return Err(SchemaError::Validation {
                    field: field.clone(),
                    message: "system fields cannot be updated".to_string(),
                }
                .into());
            }
        }

        let mut next = current.clone();
        next.fields = outcome.document;
        if let Some(name) = next.fields.remove("name") {
            if let Some(name) = name.as_str() {
                next.name = name.to_string();
            }
        }

        // Apply extracted relationship operations against declared edges.
        if !outcome.relationship_ops.is_empty() {
            self.apply_relationship_ops(&mut next, &outcome.relationship_ops)?;
        }

        if let Some(def) = self.schemas.get(&next.entity_type) {
            def.validate_input(&next.fields)?;
        }

        let actor = self.actor_for(&opts.actor);
        next.touch(Utc::now(), actor.clone());

        let pre_ctx = HookContext {
            namespace,
            op: EventOp::Update,
            entity: Some(&next),
            event: None,
            update: Some(&update),
        };
        self.hooks.run(HookPhase::PreMutation, &pre_ctx)?;
        self.hooks.run(HookPhase::PreUpdate, &pre_ctx)?;

        let event = self
            .next_event(EventOp::Update, id.target())
            .with_before(current.to_value())
            .with_after(next.to_value())
            .with_actor(actor)
            .with_metadata(json!({ "update": update.clone() }));

        if let Some(projection) = self.projection.as_mut() {
            projection.insert(next.clone());
        }
        self.emit(&event)?;

        let post_ctx = HookContext {
            namespace,
            op: EventOp::Update,
            entity: Some(&next),
            event: Some(&event),
            update: Some(&update),
        };
        self.hooks.run(HookPhase::PostUpdate, &post_ctx)?;
        self.hooks.run(HookPhase::PostMutation, &post_ctx)?;

        Ok(Some(match opts.return_document {
            ReturnDocument::Before => current,
            ReturnDocument::After => next,
        }))
    }

    fn upsert_create(
        &mut self,
        namespace: &str,
        id: &EntityId,
        update_map: &Map<String, Value>,
        opts: &UpdateOptions,
    ) -> Result<Option<Entity>, DbError> {
        let seeded = apply_operators(
            &Map::new(),
            update_map,
            &ApplyOptions {
                timestamp: Utc::now(),
                is_insert: true,
            },
        )?;

        let mut input = seeded.document;
        if !input.contains_key("$type") {
            input.insert(
                "$type".to_string(),
                Value::String(type_name_for_namespace(namespace)),
            );
        }
        // Pin the local id the caller addressed.
        input.insert(
            "$localId".to_string(),
            Value::String(id.local_id().to_string()),
        );

        let create_opts = CreateOptions {
            actor: opts.actor.clone(),
            auto_create: false,
        };
        let created = self.create(namespace, Value::Object(input), &create_opts, false)?;
        Ok(match opts.return_document {
            // The pre-image of an upsert-created document is null.
            ReturnDocument::Before => None,
            ReturnDocument::After => Some(created),
        })
    }

    fn apply_relationship_ops(
        &mut self,
        entity: &mut Entity,
        ops: &[crate::models::RelationshipOp],
    ) -> Result<(), DbError> {
        let Some(def) = self.schemas.get(&entity.entity_type).cloned() else {
            return Ok(());
        };
        for op in ops {
            let Some(field_def) = def.field(&op.predicate) else {
                return Err(MutationError::RelationshipResolution {
                    field: op.predicate.clone(),
                    target: "<undeclared relationship field>".to_string(),
                }
                .into());
            };
            let FieldKind::OutboundRel {
                target_type, many, ..
            } = &field_def.kind
            else {
                return Err(MutationError::RelationshipResolution {
                    field: op.predicate.clone(),
                    target: "<not an outbound relationship>".to_string(),
                }
                .into());
            };
            let target_ns = self.schemas.namespace_for_type(target_type);
            let target_def = self.schemas.get(target_type).cloned();

            match op.kind {
                RelOpKind::Link => {
                    let mut set = entity
                        .fields
                        .get(&op.predicate)
                        .and_then(RelSet::from_value)
                        .unwrap_or_default();
                    for raw in &op.targets {
                        for forward in normalize_forward_refs(
                            &Value::String(raw.clone()),
                            target_def.as_ref(),
                            &target_ns,
                        ) {
                            let live = self
                                .projection
                                .as_ref()
                                .and_then(|p| p.get(&forward.target, false))
                                .is_some();
                            if !live {
                                return Err(MutationError::RelationshipResolution {
                                    field: op.predicate.clone(),
                                    target: forward.target.to_string(),
                                }
                                .into());
                            }
                            set.insert(forward.display_name, forward.target);
                        }
                    }
                    let value = if *many {
                        set.to_value()
                    } else {
                        match set.entries().last() {
                            Some(entry) => {
                                RelLink::new(entry.display_name.clone(), entry.target.clone())
                                    .to_value()
                            }
                            None => Value::Object(Map::new()),
                        }
                    };
                    entity.fields.insert(op.predicate.clone(), value);
                }
                RelOpKind::Unlink => {
                    if op.targets.is_empty() {
                        // `$unlink: "$all"` removes every edge.
                        entity.fields.remove(&op.predicate);
                        continue;
                    }
                    let mut set = entity
                        .fields
                        .get(&op.predicate)
                        .and_then(RelSet::from_value)
                        .unwrap_or_default();
                    for raw in &op.targets {
                        for forward in normalize_forward_refs(
                            &Value::String(raw.clone()),
                            target_def.as_ref(),
                            &target_ns,
                        ) {
                            set.remove_target(&forward.target);
                        }
                    }
                    if set.is_empty() {
                        entity.fields.remove(&op.predicate);
                    } else {
                        entity.fields.insert(op.predicate.clone(), set.to_value());
                    }
                }
            }
        }
        Ok(())
    }

    // ---- delete / restore ----

    fn delete(
        &mut self,
        namespace: &str,
        local_id: &str,
        opts: &DeleteOptions,
    ) -> Result<DeleteOutcome, DbError> {
        let id = EntityId::new(namespace, local_id)?;
        self.ensure_projection()?;
        let current = self
            .projection
            .as_ref()
            .and_then(|p| p.get_any(&id))
            .cloned();

        let Some(current) = current else {
            return Ok(DeleteOutcome { deleted_count: 0 });
        };
        if current.is_deleted() && !opts.hard {
            // Deleting an already-soft-deleted entity is a no-op.
            return Ok(DeleteOutcome { deleted_count: 0 });
        }

        let actor = self.actor_for(&opts.actor);
        let pre_ctx = HookContext {
            namespace,
            op: EventOp::Delete,
            entity: Some(&current),
            event: None,
            update: None,
        };
        self.hooks.run(HookPhase::PreMutation, &pre_ctx)?;
        self.hooks.run(HookPhase::PreDelete, &pre_ctx)?;

        let mut event = self
            .next_event(EventOp::Delete, id.target())
            .with_before(current.to_value())
            .with_actor(actor.clone());

        if opts.hard {
            event = event.with_metadata(json!({"hard": true}));
            if let Some(projection) = self.projection.as_mut() {
                projection.remove(&id);
            }
        } else if let Some(projection) = self.projection.as_mut() {
            let mut tombstone = current.clone();
            tombstone.mark_deleted(Utc::now(), actor);
            projection.insert(tombstone);
        }
        self.emit(&event)?;

        let post_ctx = HookContext {
            namespace,
            op: EventOp::Delete,
            entity: Some(&current),
            event: Some(&event),
            update: None,
        };
        self.hooks.run(HookPhase::PostDelete, &post_ctx)?;
        self.hooks.run(HookPhase::PostMutation, &post_ctx)?;

        Ok(DeleteOutcome { deleted_count: 1 })
    }

    fn restore(
        &mut self,
        namespace: &str,
        local_id: &str,
    ) -> Result<Option<Entity>, DbError> {
        let id = EntityId::new(namespace, local_id)?;
        self.ensure_projection()?;
        let current = self
            .projection
            .as_ref()
            .and_then(|p| p.get_any(&id))
            .cloned();

        let Some(current) = current else {
            return Ok(None);
        };
        if !current.is_deleted() {
            // Already live: identity, no version bump, no event.
            return Ok(Some(current));
        }

        let mut restored = current.clone();
        restored.clear_deleted();

        let pre_ctx = HookContext {
            namespace,
            op: EventOp::Restore,
            entity: Some(&restored),
            event: None,
            update: None,
        };
        self.hooks.run(HookPhase::PreMutation, &pre_ctx)?;

        let event = self
            .next_event(EventOp::Restore, id.target())
            .with_before(current.to_value())
            .with_after(restored.to_value());

        if let Some(projection) = self.projection.as_mut() {
            projection.insert(restored.clone());
        }
        self.emit(&event)?;

        let post_ctx = HookContext {
            namespace,
            op: EventOp::Restore,
            entity: Some(&restored),
            event: Some(&event),
            update: None,
        };
        self.hooks.run(HookPhase::PostMutation, &post_ctx)?;

        Ok(Some(restored))
    }
}

/// Derive the local id from the `$id` directive, the `$localId` escape hatch,
/// or a generated ULID-style id.
fn derive_local_id(
    input: &Map<String, Value>,
    type_def: Option<&TypeDef>,
) -> Result<String, DbError> {
    if let Some(def) = type_def {
        if let Some(id_field) = &def.id_field {
            let value = input.get(id_field).and_then(|v| v.as_str()).unwrap_or("");
            if value.is_empty() {
                return Err(SchemaError::Validation {
                    field: id_field.clone(),
                    message: "$id field value must be a non-empty string".to_string(),
                }
                .into());
            }
            if value.contains('/') {
                return Err(SchemaError::Validation {
                    field: id_field.clone(),
                    message: "$id field value must not contain '/'".to_string(),
                }
                .into());
            }
            return Ok(value.to_string());
        }
    }
    if let Some(pinned) = input.get("$localId").and_then(|v| v.as_str()) {
        if pinned.is_empty() || pinned.contains('/') {
            return Err(SchemaError::Validation {
                field: "$localId".to_string(),
                message: "local id must be non-empty and must not contain '/'".to_string(),
            }
            .into());
        }
        return Ok(pinned.to_string());
    }
    Ok(generate_local_id())
}

fn derive_name(
    input: &Map<String, Value>,
    type_def: Option<&TypeDef>,
    entity_type: &str,
    local_id: &str,
) -> String {
    if let Some(def) = type_def {
        if let Some(name_field) = &def.name_field {
            if let Some(name) = input
                .get(name_field)
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
            {
                return name.to_string();
            }
            // Empty/null/undefined falls back to the local id.
            return local_id.to_string();
        }
    }
    if let Some(name) = input
        .get("name")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
    {
        return name.to_string();
    }
    format!("{} {}", entity_type, local_id)
}

/// Pick the narrowest column type that fits every value of a shredded
/// column. Mixed integer/float columns widen to doubles; any other mixture
/// degrades to strings.
fn infer_column_type(values: &[Value]) -> ColumnType {
    let (mut ints, mut doubles, mut bools, mut strings) = (false, false, false, false);
    for value in values {
        match value {
            Value::Null => {}
            Value::Bool(_) => bools = true,
            Value::Number(n) => {
                if n.is_i64() || n.is_u64() {
                    ints = true;
                } else {
                    doubles = true;
                }
            }
            _ => strings = true,
        }
    }
    match (ints, doubles, bools, strings) {
        (_, _, _, true) => ColumnType::String,
        (_, _, true, false) if !ints && !doubles => ColumnType::Boolean,
        (_, true, false, false) => ColumnType::Double,
        (true, false, false, false) => ColumnType::Int64,
        _ => ColumnType::String,
    }
}

/// Convert a shredded value into a cell, stringifying anything that does not
/// fit a string column rather than dropping it.
fn to_cell(value: &Value, column_type: ColumnType) -> ColumnValue {
    match (column_type, value) {
        (_, Value::Null) => ColumnValue::Null,
        (ColumnType::String, Value::String(s)) => ColumnValue::Str(s.clone()),
        (ColumnType::String, other) => ColumnValue::Str(other.to_string()),
        _ => ColumnValue::from_json(value, column_type),
    }
}

/// Fallback `$type` for upserts into a bare namespace: `posts` -> `Post`.
fn type_name_for_namespace(namespace: &str) -> String {
    let singular = namespace.strip_suffix('s').unwrap_or(namespace);
    let mut chars = singular.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => "Entity".to_string(),
    }
}
