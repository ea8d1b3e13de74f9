//! # Context Store
//!
//! Named groupings of entity references and relation ids with temporal
//! validity and a derived density metric.
//!
//! - Membership lists are ordered and distinct
//! - Every membership reference is validated against the entity/relation
//!   stores BEFORE any mutation; a failed check leaves the store unchanged
//! - Every structural mutation recomputes `metrics` and refreshes
//!   `updated_at`; a no-op mutation changes nothing and emits nothing
//! - A protected "System" context is created at store initialization and
//!   rejects every mutation, overridden or not

use crate::entity::{validate_properties, EntityStore};
use crate::events::{names, EventBus, EventTarget, Listener, StoreEvent};
use crate::index::{bucket_insert, bucket_remove};
use crate::primitives::{
    DEFAULT_QUERY_LIMIT, MAX_ID_LENGTH, MAX_NAME_LENGTH, MAX_TYPE_LENGTH, MIN_MERGE_CONTEXTS,
    PROTECTED_PROPERTY, SYSTEM_CONTEXT_ID, SYSTEM_CONTEXT_NAME,
};
use crate::query::{properties_match, text_matches, ContextQuery};
use crate::relation::RelationStore;
use crate::types::{
    Context, ContextMetrics, CorpusError, EntityRef, PropertyMap, PropertyValue,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{catch_unwind, AssertUnwindSafe};

// =============================================================================
// PARAMETERS
// =============================================================================

/// Creation parameters for a context.
#[derive(Debug, Clone)]
pub struct ContextParams {
    /// Explicit id; generated from the store counter when absent.
    pub id: Option<String>,
    pub name: String,
    pub context_type: String,
    pub description: Option<String>,
    /// Initial member entities; validated and deduplicated.
    pub entities: Vec<EntityRef>,
    /// Initial member relations; validated and deduplicated.
    pub relations: Vec<String>,
    pub properties: PropertyMap,
    pub scope: Option<String>,
    pub domain: Option<String>,
    pub valid: bool,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_to: Option<DateTime<Utc>>,
}

impl ContextParams {
    /// Minimal parameters: type and name, valid, no members.
    #[must_use]
    pub fn new(context_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            context_type: context_type.into(),
            description: None,
            entities: Vec::new(),
            relations: Vec::new(),
            properties: PropertyMap::new(),
            scope: None,
            domain: None,
            valid: true,
            valid_from: None,
            valid_to: None,
        }
    }

    /// Use an explicit id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Attach a description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Seed member entities.
    #[must_use]
    pub fn with_entities(mut self, entities: Vec<EntityRef>) -> Self {
        self.entities = entities;
        self
    }

    /// Seed member relations.
    #[must_use]
    pub fn with_relations(mut self, relations: Vec<String>) -> Self {
        self.relations = relations;
        self
    }

    /// Attach an indexed property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Qualify with a scope.
    #[must_use]
    pub fn in_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Qualify with a domain.
    #[must_use]
    pub fn in_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Bound the validity window.
    #[must_use]
    pub fn with_window(
        mut self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Self {
        self.valid_from = from;
        self.valid_to = to;
        self
    }
}

/// Update payload for a context. Only supplied fields change;
/// `properties` merges shallowly. Membership is mutated through the
/// dedicated add/remove operations, never through update.
#[derive(Debug, Clone, Default)]
pub struct ContextUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub properties: Option<PropertyMap>,
    pub scope: Option<String>,
    pub domain: Option<String>,
    pub valid: Option<bool>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_to: Option<DateTime<Utc>>,
    /// Explicit override for protected contexts. The System context
    /// ignores it.
    pub allow_protected: bool,
}

impl ContextUpdate {
    /// Empty update.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rename the context.
    #[must_use]
    pub fn rename(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Merge one property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties
            .get_or_insert_with(PropertyMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Carry the explicit protection override.
    #[must_use]
    pub fn override_protection(mut self) -> Self {
        self.allow_protected = true;
        self
    }
}

/// Result of a membership mutation.
///
/// `changed` lists what was actually added or removed; when it is empty
/// the call was a no-op: the returned context is the stored one unchanged,
/// no event fired, and `updated_at` did not move.
#[derive(Debug, Clone, PartialEq)]
pub struct MembershipChange<T> {
    /// Snapshot of the context after the call.
    pub context: Context,
    /// Members actually added or removed, in call order.
    pub changed: Vec<T>,
}

impl<T> MembershipChange<T> {
    /// Whether the call changed nothing.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.changed.is_empty()
    }
}

// =============================================================================
// CONTEXT STORE
// =============================================================================

/// The context store.
#[derive(Debug)]
pub struct ContextStore {
    /// Record storage: context id -> context.
    contexts: BTreeMap<String, Context>,
    /// Entity membership index: ref key -> [context ids].
    entity_index: BTreeMap<String, Vec<String>>,
    /// Relation membership index: relation id -> [context ids].
    relation_index: BTreeMap<String, Vec<String>>,
    /// Type index: context type -> [context ids].
    type_index: BTreeMap<String, Vec<String>>,
    /// Counter for generated ids.
    next_id: u64,
    /// Change notification.
    bus: EventBus,
}

impl Default for ContextStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextStore {
    /// Create a store holding only the protected System context.
    #[must_use]
    pub fn new() -> Self {
        let mut store = Self {
            contexts: BTreeMap::new(),
            entity_index: BTreeMap::new(),
            relation_index: BTreeMap::new(),
            type_index: BTreeMap::new(),
            next_id: 0,
            bus: EventBus::new(),
        };

        let now = Utc::now();
        let mut properties = PropertyMap::new();
        properties.insert(PROTECTED_PROPERTY.to_string(), PropertyValue::Bool(true));
        let system = Context {
            id: SYSTEM_CONTEXT_ID.to_string(),
            name: SYSTEM_CONTEXT_NAME.to_string(),
            context_type: "system".to_string(),
            description: Some("Root context owned by the store".to_string()),
            entities: Vec::new(),
            relations: Vec::new(),
            properties,
            scope: None,
            domain: None,
            valid: true,
            valid_from: None,
            valid_to: None,
            metrics: ContextMetrics::compute(0, 0),
            created_at: now,
            updated_at: now,
        };
        store.index_context(&system);
        store.contexts.insert(system.id.clone(), system);
        store
    }

    /// Subscribe a listener to this store's events.
    pub fn subscribe(&mut self, listener: Listener) {
        self.bus.subscribe(listener);
    }

    // =========================================================================
    // CRUD
    // =========================================================================

    /// Create a context.
    ///
    /// Every seed entity and relation must already exist in its store; a
    /// single missing reference fails the whole call with no mutation.
    /// Emits `context.created`.
    pub fn create(
        &mut self,
        params: ContextParams,
        entities: &EntityStore,
        relations: &RelationStore,
    ) -> Result<Context, CorpusError> {
        validate_context_shape(&params)?;
        validate_entity_refs(&params.entities, entities)?;
        validate_relation_ids(&params.relations, relations)?;

        let id = match params.id {
            Some(id) => {
                if self.contexts.contains_key(&id) {
                    return Err(CorpusError::AlreadyExists(id));
                }
                id
            }
            None => self.generate_id(),
        };

        let members = dedupe_refs(params.entities);
        let relation_members = dedupe_strings(params.relations);
        let now = Utc::now();
        let context = Context {
            id: id.clone(),
            name: params.name,
            context_type: params.context_type,
            description: params.description,
            metrics: ContextMetrics::compute(members.len(), relation_members.len()),
            entities: members,
            relations: relation_members,
            properties: params.properties,
            scope: params.scope,
            domain: params.domain,
            valid: params.valid,
            valid_from: params.valid_from,
            valid_to: params.valid_to,
            created_at: now,
            updated_at: now,
        };

        self.index_context(&context);
        self.contexts.insert(id.clone(), context.clone());
        tracing::debug!(id = %id, context_type = %context.context_type, "context created");

        self.bus.emit(&StoreEvent::new(
            names::CONTEXT_CREATED,
            EventTarget::Context(context.clone()),
            None,
        ));
        Ok(context)
    }

    /// Lookup by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Context> {
        self.contexts.get(id)
    }

    /// Update non-structural fields. Rejected for protected contexts
    /// unless the payload carries the override; the System context rejects
    /// the override too. Emits `context.updated`.
    pub fn update(&mut self, id: &str, updates: ContextUpdate) -> Result<Context, CorpusError> {
        let current = self.require(id)?;
        self.check_mutable(current, updates.allow_protected)?;
        if let Some(name) = &updates.name {
            if name.is_empty() || name.len() > MAX_NAME_LENGTH {
                return Err(CorpusError::Validation(format!(
                    "context name must be 1..={MAX_NAME_LENGTH} bytes"
                )));
            }
        }
        if let Some(properties) = &updates.properties {
            validate_properties(properties)?;
        }

        let mut updated = current.clone();
        if let Some(name) = updates.name {
            updated.name = name;
        }
        if let Some(description) = updates.description {
            updated.description = Some(description);
        }
        if let Some(properties) = updates.properties {
            updated.properties.extend(properties);
        }
        if let Some(scope) = updates.scope {
            updated.scope = Some(scope);
        }
        if let Some(domain) = updates.domain {
            updated.domain = Some(domain);
        }
        if let Some(valid) = updates.valid {
            updated.valid = valid;
        }
        if let Some(from) = updates.valid_from {
            updated.valid_from = Some(from);
        }
        if let Some(end) = updates.valid_to {
            updated.valid_to = Some(end);
        }
        updated.updated_at = Utc::now();

        self.contexts.insert(id.to_string(), updated.clone());
        tracing::debug!(id = %id, "context updated");

        self.bus.emit(&StoreEvent::new(
            names::CONTEXT_UPDATED,
            EventTarget::Context(updated.clone()),
            None,
        ));
        Ok(updated)
    }

    /// Delete a context. Rejected for protected contexts. Emits
    /// `context.deleted`.
    pub fn delete(&mut self, id: &str) -> Result<bool, CorpusError> {
        let context = self.require(id)?;
        self.check_mutable(context, false)?;

        let context = context.clone();
        self.deindex_context(&context);
        self.contexts.remove(id);
        tracing::debug!(id = %id, "context deleted");

        self.bus.emit(&StoreEvent::new(
            names::CONTEXT_DELETED,
            EventTarget::Context(context),
            None,
        ));
        Ok(true)
    }

    // =========================================================================
    // MEMBERSHIP
    // =========================================================================

    /// Add entities to a context.
    ///
    /// All refs must exist in the entity store; a single missing ref fails
    /// the whole call with no partial update. Refs already present are
    /// skipped; if nothing is new the call is a no-op.
    pub fn add_entities(
        &mut self,
        id: &str,
        refs: &[EntityRef],
        entities: &EntityStore,
    ) -> Result<MembershipChange<EntityRef>, CorpusError> {
        let context = self.require(id)?;
        self.check_mutable(context, false)?;
        validate_entity_refs(refs, entities)?;

        let mut added = Vec::new();
        for reference in refs {
            if !context.contains_entity(reference) && !added.contains(reference) {
                added.push(reference.clone());
            }
        }
        if added.is_empty() {
            return Ok(MembershipChange {
                context: context.clone(),
                changed: added,
            });
        }

        let mut updated = context.clone();
        updated.entities.extend(added.iter().cloned());
        for reference in &added {
            bucket_insert(&mut self.entity_index, reference.key(), id.to_string());
        }
        self.commit_membership(id, &mut updated);

        self.bus.emit(&StoreEvent::new(
            names::CONTEXT_ENTITIES_ADDED,
            EventTarget::Context(updated.clone()),
            Some(serde_json::json!({
                "added": added.iter().map(EntityRef::key).collect::<Vec<_>>(),
            })),
        ));
        Ok(MembershipChange {
            context: updated,
            changed: added,
        })
    }

    /// Remove entities from a context.
    ///
    /// Refs that are not members are ignored; if nothing is removed the
    /// call is a no-op.
    pub fn remove_entities(
        &mut self,
        id: &str,
        refs: &[EntityRef],
    ) -> Result<MembershipChange<EntityRef>, CorpusError> {
        let context = self.require(id)?;
        self.check_mutable(context, false)?;

        let mut removed = Vec::new();
        for reference in refs {
            if context.contains_entity(reference) && !removed.contains(reference) {
                removed.push(reference.clone());
            }
        }
        if removed.is_empty() {
            return Ok(MembershipChange {
                context: context.clone(),
                changed: removed,
            });
        }

        let mut updated = context.clone();
        updated.entities.retain(|member| !removed.contains(member));
        for reference in &removed {
            bucket_remove(&mut self.entity_index, &reference.key(), &id.to_string());
        }
        self.commit_membership(id, &mut updated);

        self.bus.emit(&StoreEvent::new(
            names::CONTEXT_ENTITIES_REMOVED,
            EventTarget::Context(updated.clone()),
            Some(serde_json::json!({
                "removed": removed.iter().map(EntityRef::key).collect::<Vec<_>>(),
            })),
        ));
        Ok(MembershipChange {
            context: updated,
            changed: removed,
        })
    }

    /// Add relations to a context; mirrors [`ContextStore::add_entities`].
    pub fn add_relations(
        &mut self,
        id: &str,
        relation_ids: &[String],
        relations: &RelationStore,
    ) -> Result<MembershipChange<String>, CorpusError> {
        let context = self.require(id)?;
        self.check_mutable(context, false)?;
        validate_relation_ids(relation_ids, relations)?;

        let mut added = Vec::new();
        for relation_id in relation_ids {
            if !context.contains_relation(relation_id) && !added.contains(relation_id) {
                added.push(relation_id.clone());
            }
        }
        if added.is_empty() {
            return Ok(MembershipChange {
                context: context.clone(),
                changed: added,
            });
        }

        let mut updated = context.clone();
        updated.relations.extend(added.iter().cloned());
        for relation_id in &added {
            bucket_insert(&mut self.relation_index, relation_id.clone(), id.to_string());
        }
        self.commit_membership(id, &mut updated);

        self.bus.emit(&StoreEvent::new(
            names::CONTEXT_RELATIONS_ADDED,
            EventTarget::Context(updated.clone()),
            Some(serde_json::json!({ "added": added })),
        ));
        Ok(MembershipChange {
            context: updated,
            changed: added,
        })
    }

    /// Remove relations from a context; mirrors
    /// [`ContextStore::remove_entities`].
    pub fn remove_relations(
        &mut self,
        id: &str,
        relation_ids: &[String],
    ) -> Result<MembershipChange<String>, CorpusError> {
        let context = self.require(id)?;
        self.check_mutable(context, false)?;

        let mut removed = Vec::new();
        for relation_id in relation_ids {
            if context.contains_relation(relation_id) && !removed.contains(relation_id) {
                removed.push(relation_id.clone());
            }
        }
        if removed.is_empty() {
            return Ok(MembershipChange {
                context: context.clone(),
                changed: removed,
            });
        }

        let mut updated = context.clone();
        updated.relations.retain(|member| !removed.contains(member));
        for relation_id in &removed {
            bucket_remove(&mut self.relation_index, relation_id, &id.to_string());
        }
        self.commit_membership(id, &mut updated);

        self.bus.emit(&StoreEvent::new(
            names::CONTEXT_RELATIONS_REMOVED,
            EventTarget::Context(updated.clone()),
            Some(serde_json::json!({ "removed": removed })),
        ));
        Ok(MembershipChange {
            context: updated,
            changed: removed,
        })
    }

    /// Union the membership of two or more contexts into a new one.
    ///
    /// Members of the source contexts were validated when they entered;
    /// merge does not re-validate them.
    pub fn merge(
        &mut self,
        source_ids: &[String],
        params: ContextParams,
    ) -> Result<Context, CorpusError> {
        if source_ids.len() < MIN_MERGE_CONTEXTS {
            return Err(CorpusError::InvalidArgument(format!(
                "merge needs at least {MIN_MERGE_CONTEXTS} contexts, got {}",
                source_ids.len()
            )));
        }
        validate_context_shape(&params)?;

        let mut merged_entities: Vec<EntityRef> = Vec::new();
        let mut merged_relations: Vec<String> = Vec::new();
        for source_id in source_ids {
            let Some(source) = self.contexts.get(source_id) else {
                return Err(CorpusError::ContextNotFound(source_id.clone()));
            };
            for reference in &source.entities {
                if !merged_entities.contains(reference) {
                    merged_entities.push(reference.clone());
                }
            }
            for relation_id in &source.relations {
                if !merged_relations.contains(relation_id) {
                    merged_relations.push(relation_id.clone());
                }
            }
        }

        let id = match params.id {
            Some(id) => {
                if self.contexts.contains_key(&id) {
                    return Err(CorpusError::AlreadyExists(id));
                }
                id
            }
            None => self.generate_id(),
        };

        let now = Utc::now();
        let context = Context {
            id: id.clone(),
            name: params.name,
            context_type: params.context_type,
            description: params.description,
            metrics: ContextMetrics::compute(merged_entities.len(), merged_relations.len()),
            entities: merged_entities,
            relations: merged_relations,
            properties: params.properties,
            scope: params.scope,
            domain: params.domain,
            valid: params.valid,
            valid_from: params.valid_from,
            valid_to: params.valid_to,
            created_at: now,
            updated_at: now,
        };

        self.index_context(&context);
        self.contexts.insert(id.clone(), context.clone());
        tracing::debug!(id = %id, sources = source_ids.len(), "contexts merged");

        self.bus.emit(&StoreEvent::new(
            names::CONTEXT_MERGED,
            EventTarget::Context(context.clone()),
            Some(serde_json::json!({ "sources": source_ids })),
        ));
        Ok(context)
    }

    /// Run `f` against a context, converting panics into
    /// `CorpusError::Execution`.
    pub fn execute_in_context<T>(
        &self,
        id: &str,
        f: impl FnOnce(&Context) -> Result<T, CorpusError>,
    ) -> Result<T, CorpusError> {
        let context = self.require(id)?;
        match catch_unwind(AssertUnwindSafe(|| f(context))) {
            Ok(result) => result,
            Err(payload) => Err(CorpusError::Execution(panic_message(&payload))),
        }
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Contexts containing the entity, in index order.
    #[must_use]
    pub fn find_by_entity(&self, reference: &EntityRef) -> Vec<Context> {
        self.entity_index
            .get(&reference.key())
            .into_iter()
            .flatten()
            .filter_map(|id| self.contexts.get(id).cloned())
            .collect()
    }

    /// Contexts containing the relation, in index order.
    #[must_use]
    pub fn find_by_relation(&self, relation_id: &str) -> Vec<Context> {
        self.relation_index
            .get(relation_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.contexts.get(id).cloned())
            .collect()
    }

    /// Contexts of one type, in index order.
    #[must_use]
    pub fn find_by_type(&self, context_type: &str) -> Vec<Context> {
        self.type_index
            .get(context_type)
            .into_iter()
            .flatten()
            .filter_map(|id| self.contexts.get(id).cloned())
            .collect()
    }

    /// Contexts active at `at`, defaulting to now.
    #[must_use]
    pub fn find_active(&self, at: Option<DateTime<Utc>>) -> Vec<Context> {
        let t = at.unwrap_or_else(Utc::now);
        self.contexts
            .values()
            .filter(|context| context.is_active_at(t))
            .cloned()
            .collect()
    }

    /// Filtered, paginated query.
    #[must_use]
    pub fn query(&self, query: &ContextQuery) -> Vec<Context> {
        let candidates: Vec<&Context> = match &query.context_type {
            Some(context_type) => self
                .type_index
                .get(context_type)
                .into_iter()
                .flatten()
                .filter_map(|id| self.contexts.get(id))
                .collect(),
            None => self.contexts.values().collect(),
        };

        candidates
            .into_iter()
            .filter(|context| {
                query.search.as_deref().is_none_or(|needle| {
                    text_matches(needle, &context.name, context.description.as_deref())
                })
            })
            .filter(|context| !query.valid_only || context.valid)
            .filter(|context| query.active_at.is_none_or(|t| context.is_active_at(t)))
            .filter(|context| {
                query
                    .scope
                    .as_deref()
                    .is_none_or(|scope| context.scope.as_deref() == Some(scope))
            })
            .filter(|context| {
                query
                    .domain
                    .as_deref()
                    .is_none_or(|domain| context.domain.as_deref() == Some(domain))
            })
            .filter(|context| properties_match(&query.properties, &context.properties))
            .skip(query.offset)
            .take(query.limit.unwrap_or(DEFAULT_QUERY_LIMIT))
            .cloned()
            .collect()
    }

    /// Total number of stored contexts, the System context included.
    #[must_use]
    pub fn count(&self) -> usize {
        self.contexts.len()
    }

    // =========================================================================
    // INTERNAL
    // =========================================================================

    fn require(&self, id: &str) -> Result<&Context, CorpusError> {
        self.contexts
            .get(id)
            .ok_or_else(|| CorpusError::ContextNotFound(id.to_string()))
    }

    /// Structural-mutation guard: the System context is immutable, and a
    /// protected context requires the explicit override.
    fn check_mutable(&self, context: &Context, allow_protected: bool) -> Result<(), CorpusError> {
        if context.id == SYSTEM_CONTEXT_ID {
            return Err(CorpusError::ProtectedContext(context.id.clone()));
        }
        if context.is_protected() && !allow_protected {
            return Err(CorpusError::ProtectedContext(context.id.clone()));
        }
        Ok(())
    }

    /// Recompute metrics, stamp `updated_at`, and store the context.
    fn commit_membership(&mut self, id: &str, context: &mut Context) {
        context.metrics =
            ContextMetrics::compute(context.entities.len(), context.relations.len());
        context.updated_at = Utc::now();
        self.contexts.insert(id.to_string(), context.clone());
    }

    fn generate_id(&mut self) -> String {
        loop {
            self.next_id = self.next_id.saturating_add(1);
            let id = format!("ctx-{}", self.next_id);
            if !self.contexts.contains_key(&id) {
                return id;
            }
        }
    }

    fn index_context(&mut self, context: &Context) {
        bucket_insert(
            &mut self.type_index,
            context.context_type.clone(),
            context.id.clone(),
        );
        for reference in &context.entities {
            bucket_insert(&mut self.entity_index, reference.key(), context.id.clone());
        }
        for relation_id in &context.relations {
            bucket_insert(
                &mut self.relation_index,
                relation_id.clone(),
                context.id.clone(),
            );
        }
    }

    fn deindex_context(&mut self, context: &Context) {
        bucket_remove(&mut self.type_index, &context.context_type, &context.id);
        for reference in &context.entities {
            bucket_remove(&mut self.entity_index, &reference.key(), &context.id);
        }
        for relation_id in &context.relations {
            bucket_remove(&mut self.relation_index, relation_id, &context.id);
        }
    }
}

// =============================================================================
// VALIDATION
// =============================================================================

fn validate_context_shape(params: &ContextParams) -> Result<(), CorpusError> {
    if params.name.is_empty() || params.name.len() > MAX_NAME_LENGTH {
        return Err(CorpusError::Validation(format!(
            "context name must be 1..={MAX_NAME_LENGTH} bytes"
        )));
    }
    if params.context_type.is_empty() || params.context_type.len() > MAX_TYPE_LENGTH {
        return Err(CorpusError::Validation(format!(
            "context type must be 1..={MAX_TYPE_LENGTH} bytes"
        )));
    }
    if let Some(id) = &params.id {
        if id.is_empty() || id.len() > MAX_ID_LENGTH {
            return Err(CorpusError::Validation(format!(
                "context id must be 1..={MAX_ID_LENGTH} bytes"
            )));
        }
    }
    if let (Some(from), Some(end)) = (params.valid_from, params.valid_to) {
        if end < from {
            return Err(CorpusError::Validation(
                "validity window ends before it starts".to_string(),
            ));
        }
    }
    validate_properties(&params.properties)
}

fn validate_entity_refs(refs: &[EntityRef], entities: &EntityStore) -> Result<(), CorpusError> {
    for reference in refs {
        if entities.get_by_ref(reference).is_none() {
            return Err(CorpusError::EntityNotFound(reference.clone()));
        }
    }
    Ok(())
}

fn validate_relation_ids(
    relation_ids: &[String],
    relations: &RelationStore,
) -> Result<(), CorpusError> {
    for relation_id in relation_ids {
        if !relations.exists(relation_id) {
            return Err(CorpusError::RelationNotFound(relation_id.clone()));
        }
    }
    Ok(())
}

fn dedupe_refs(refs: Vec<EntityRef>) -> Vec<EntityRef> {
    let mut seen = BTreeSet::new();
    refs.into_iter()
        .filter(|reference| seen.insert(reference.key()))
        .collect()
}

fn dedupe_strings(values: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    values.into_iter().filter(|value| seen.insert(value.clone())).collect()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "context callback panicked".to_string()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityParams;
    use crate::relation::RelationParams;
    use chrono::TimeDelta;
    use std::sync::{Arc, Mutex};

    fn r(entity_type: &str, id: &str) -> EntityRef {
        EntityRef::new(entity_type, id)
    }

    /// Entity store with `n` "node" entities named node-0..n, plus a
    /// relation store.
    fn seeded(n: usize) -> (ContextStore, EntityStore, RelationStore) {
        let mut entities = EntityStore::new();
        for i in 0..n {
            entities
                .create(EntityParams::new("node", format!("node-{i}"), format!("Node {i}")))
                .expect("create");
        }
        (ContextStore::new(), entities, RelationStore::new())
    }

    #[test]
    fn system_context_exists_and_is_immutable() {
        let (mut contexts, entities, _relations) = seeded(1);

        let system = contexts.get(SYSTEM_CONTEXT_ID).expect("system");
        assert_eq!(system.name, SYSTEM_CONTEXT_NAME);
        assert!(system.is_protected());

        // Not even an overridden update touches it.
        assert!(matches!(
            contexts.update(
                SYSTEM_CONTEXT_ID,
                ContextUpdate::new().rename("X").override_protection()
            ),
            Err(CorpusError::ProtectedContext(_))
        ));
        assert!(matches!(
            contexts.delete(SYSTEM_CONTEXT_ID),
            Err(CorpusError::ProtectedContext(_))
        ));
        assert!(matches!(
            contexts.add_entities(SYSTEM_CONTEXT_ID, &[r("node", "node-0")], &entities),
            Err(CorpusError::ProtectedContext(_))
        ));
    }

    #[test]
    fn create_validates_all_members_before_mutating() {
        let (mut contexts, entities, relations) = seeded(1);

        let err = contexts
            .create(
                ContextParams::new("project", "P")
                    .with_entities(vec![r("node", "node-0"), r("node", "missing")]),
                &entities,
                &relations,
            )
            .expect_err("missing member");
        assert_eq!(err, CorpusError::EntityNotFound(r("node", "missing")));

        // Nothing was stored besides the System context.
        assert_eq!(contexts.count(), 1);
        assert!(contexts.find_by_entity(&r("node", "node-0")).is_empty());
    }

    #[test]
    fn create_dedupes_seed_members_and_computes_metrics() {
        let (mut contexts, mut entities, mut relations) = seeded(3);
        let mut ids = Vec::new();
        for (a, b) in [(0, 1), (1, 2), (2, 0)] {
            ids.push(
                relations
                    .create(
                        RelationParams::new(
                            r("node", &format!("node-{a}")),
                            r("node", &format!("node-{b}")),
                            "linked_to",
                        ),
                        &mut entities,
                    )
                    .expect("create")
                    .id,
            );
        }

        let context = contexts
            .create(
                ContextParams::new("project", "Triangle")
                    .with_entities(vec![
                        r("node", "node-0"),
                        r("node", "node-1"),
                        r("node", "node-1"), // duplicate collapses
                        r("node", "node-2"),
                    ])
                    .with_relations(ids),
                &entities,
                &relations,
            )
            .expect("create");

        assert_eq!(context.entities.len(), 3);
        assert_eq!(context.metrics.entity_count, 3);
        assert_eq!(context.metrics.relation_count, 3);
        assert_eq!(context.metrics.density, 0.5);
    }

    #[test]
    fn single_entity_context_has_zero_density() {
        let (mut contexts, entities, relations) = seeded(1);
        let context = contexts
            .create(
                ContextParams::new("project", "Solo").with_entities(vec![r("node", "node-0")]),
                &entities,
                &relations,
            )
            .expect("create");
        assert_eq!(context.metrics.density, 0.0);
    }

    #[test]
    fn add_entities_is_idempotent_with_noop_signal() {
        let (mut contexts, entities, relations) = seeded(2);
        let context = contexts
            .create(ContextParams::new("project", "P"), &entities, &relations)
            .expect("create");

        let first = contexts
            .add_entities(&context.id, &[r("node", "node-0"), r("node", "node-1")], &entities)
            .expect("add");
        assert_eq!(first.changed.len(), 2);
        assert_eq!(first.context.metrics.entity_count, 2);

        let second = contexts
            .add_entities(&context.id, &[r("node", "node-0"), r("node", "node-1")], &entities)
            .expect("add again");
        assert!(second.is_noop());
        assert_eq!(second.context.entities.len(), 2);
        // No-op leaves updated_at untouched.
        assert_eq!(second.context.updated_at, first.context.updated_at);
    }

    #[test]
    fn noop_membership_calls_emit_no_event() {
        let (mut contexts, entities, relations) = seeded(1);
        let context = contexts
            .create(ContextParams::new("project", "P"), &entities, &relations)
            .expect("create");
        contexts
            .add_entities(&context.id, &[r("node", "node-0")], &entities)
            .expect("add");

        let events = Arc::new(Mutex::new(Vec::new()));
        {
            let events = Arc::clone(&events);
            contexts.subscribe(Box::new(move |event| {
                events.lock().expect("lock").push(event.name.clone());
            }));
        }

        contexts
            .add_entities(&context.id, &[r("node", "node-0")], &entities)
            .expect("noop add");
        contexts
            .remove_entities(&context.id, &[r("node", "other")])
            .expect("noop remove");

        assert!(events.lock().expect("lock").is_empty());
    }

    #[test]
    fn add_entities_rejects_any_missing_ref_atomically() {
        let (mut contexts, entities, relations) = seeded(1);
        let context = contexts
            .create(ContextParams::new("project", "P"), &entities, &relations)
            .expect("create");

        let err = contexts
            .add_entities(
                &context.id,
                &[r("node", "node-0"), r("node", "missing")],
                &entities,
            )
            .expect_err("missing");
        assert_eq!(err, CorpusError::EntityNotFound(r("node", "missing")));

        // The valid ref was not applied either.
        let stored = contexts.get(&context.id).expect("get");
        assert!(stored.entities.is_empty());
    }

    #[test]
    fn remove_entities_updates_index_and_metrics() {
        let (mut contexts, entities, relations) = seeded(3);
        let context = contexts
            .create(
                ContextParams::new("project", "P").with_entities(vec![
                    r("node", "node-0"),
                    r("node", "node-1"),
                    r("node", "node-2"),
                ]),
                &entities,
                &relations,
            )
            .expect("create");

        let change = contexts
            .remove_entities(&context.id, &[r("node", "node-1")])
            .expect("remove");
        assert_eq!(change.changed, vec![r("node", "node-1")]);
        assert_eq!(change.context.metrics.entity_count, 2);
        assert!(contexts.find_by_entity(&r("node", "node-1")).is_empty());
    }

    #[test]
    fn relation_membership_roundtrip() {
        let (mut contexts, mut entities, mut relations) = seeded(2);
        let relation = relations
            .create(
                RelationParams::new(r("node", "node-0"), r("node", "node-1"), "linked_to"),
                &mut entities,
            )
            .expect("create");
        let context = contexts
            .create(ContextParams::new("project", "P"), &entities, &relations)
            .expect("create");

        let change = contexts
            .add_relations(&context.id, &[relation.id.clone()], &relations)
            .expect("add");
        assert_eq!(change.changed, vec![relation.id.clone()]);
        assert_eq!(contexts.find_by_relation(&relation.id).len(), 1);

        let err = contexts
            .add_relations(&context.id, &[String::from("rel-404")], &relations)
            .expect_err("missing relation");
        assert_eq!(err, CorpusError::RelationNotFound("rel-404".into()));

        let removed = contexts
            .remove_relations(&context.id, &[relation.id.clone()])
            .expect("remove");
        assert_eq!(removed.changed.len(), 1);
        assert!(contexts.find_by_relation(&relation.id).is_empty());
    }

    #[test]
    fn protected_context_rejects_structural_mutation() {
        let (mut contexts, entities, relations) = seeded(1);
        let context = contexts
            .create(
                ContextParams::new("project", "Locked").with_property("protected", true),
                &entities,
                &relations,
            )
            .expect("create");

        assert!(matches!(
            contexts.add_entities(&context.id, &[r("node", "node-0")], &entities),
            Err(CorpusError::ProtectedContext(_))
        ));
        assert!(matches!(
            contexts.update(&context.id, ContextUpdate::new().rename("X")),
            Err(CorpusError::ProtectedContext(_))
        ));
        assert!(matches!(
            contexts.delete(&context.id),
            Err(CorpusError::ProtectedContext(_))
        ));

        // The override flag on the update payload unlocks non-System
        // contexts.
        let updated = contexts
            .update(
                &context.id,
                ContextUpdate::new().rename("Unlocked").override_protection(),
            )
            .expect("override");
        assert_eq!(updated.name, "Unlocked");
    }

    #[test]
    fn merge_unions_membership() {
        let (mut contexts, entities, relations) = seeded(3);
        let first = contexts
            .create(
                ContextParams::new("project", "A")
                    .with_entities(vec![r("node", "node-0"), r("node", "node-1")]),
                &entities,
                &relations,
            )
            .expect("create");
        let second = contexts
            .create(
                ContextParams::new("project", "B")
                    .with_entities(vec![r("node", "node-1"), r("node", "node-2")]),
                &entities,
                &relations,
            )
            .expect("create");

        let merged = contexts
            .merge(
                &[first.id.clone(), second.id.clone()],
                ContextParams::new("project", "A+B"),
            )
            .expect("merge");

        assert_eq!(
            merged.entities,
            vec![r("node", "node-0"), r("node", "node-1"), r("node", "node-2")]
        );
        // Sources survive the merge.
        assert!(contexts.get(&first.id).is_some());
        assert!(contexts.get(&second.id).is_some());
        // The merged context is indexed for membership lookups.
        assert_eq!(contexts.find_by_entity(&r("node", "node-1")).len(), 3);
    }

    #[test]
    fn merge_requires_two_contexts() {
        let (mut contexts, entities, relations) = seeded(1);
        let context = contexts
            .create(ContextParams::new("project", "A"), &entities, &relations)
            .expect("create");

        assert!(matches!(
            contexts.merge(&[context.id.clone()], ContextParams::new("project", "X")),
            Err(CorpusError::InvalidArgument(_))
        ));
        assert!(matches!(
            contexts.merge(
                &[context.id, "missing".to_string()],
                ContextParams::new("project", "X")
            ),
            Err(CorpusError::ContextNotFound(_))
        ));
    }

    #[test]
    fn execute_in_context_wraps_errors_and_panics() {
        let (contexts, _entities, _relations) = seeded(0);

        let name = contexts
            .execute_in_context(SYSTEM_CONTEXT_ID, |context| Ok(context.name.clone()))
            .expect("run");
        assert_eq!(name, SYSTEM_CONTEXT_NAME);

        assert!(matches!(
            contexts.execute_in_context("missing", |_| Ok(())),
            Err(CorpusError::ContextNotFound(_))
        ));

        let result: Result<(), CorpusError> = contexts.execute_in_context(SYSTEM_CONTEXT_ID, |_| {
            #[allow(clippy::panic)]
            {
                panic!("boom")
            }
        });
        assert_eq!(result, Err(CorpusError::Execution("boom".into())));
    }

    #[test]
    fn find_active_honors_window() {
        let (mut contexts, entities, relations) = seeded(0);
        let now = Utc::now();
        contexts
            .create(
                ContextParams::new("era", "Past").with_window(
                    Some(now - TimeDelta::days(10)),
                    Some(now - TimeDelta::days(5)),
                ),
                &entities,
                &relations,
            )
            .expect("create");
        contexts
            .create(
                ContextParams::new("era", "Current")
                    .with_window(Some(now - TimeDelta::days(1)), None),
                &entities,
                &relations,
            )
            .expect("create");

        let active_now: Vec<String> = contexts
            .find_active(None)
            .into_iter()
            .map(|context| context.name)
            .collect();
        assert!(active_now.contains(&"Current".to_string()));
        assert!(!active_now.contains(&"Past".to_string()));

        let active_then = contexts.find_active(Some(now - TimeDelta::days(7)));
        assert!(active_then.iter().any(|context| context.name == "Past"));
    }

    #[test]
    fn query_filters_compose() {
        let (mut contexts, entities, relations) = seeded(0);
        contexts
            .create(
                ContextParams::new("project", "Alpha")
                    .in_scope("team")
                    .in_domain("engineering"),
                &entities,
                &relations,
            )
            .expect("create");
        contexts
            .create(
                ContextParams::new("project", "Beta").in_scope("org"),
                &entities,
                &relations,
            )
            .expect("create");

        assert_eq!(contexts.query(&ContextQuery::of_type("project")).len(), 2);
        assert_eq!(
            contexts
                .query(&ContextQuery::of_type("project").in_scope("team"))
                .len(),
            1
        );
        assert_eq!(
            contexts
                .query(&ContextQuery::all().with_search("beta"))
                .len(),
            1
        );
        assert_eq!(
            contexts
                .query(&ContextQuery::all().in_domain("engineering"))
                .len(),
            1
        );
    }
}
