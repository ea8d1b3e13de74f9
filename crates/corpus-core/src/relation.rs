//! # Relation Store
//!
//! Typed, optionally time-bounded, optionally bidirectional edges between
//! entity references.
//!
//! Indices maintained under every mutation:
//! - source endpoint: ref key -> [relation ids]
//! - target endpoint: ref key -> [relation ids]
//! - relation type:   type    -> [relation ids]
//! - validity:        set of ids with `valid` set
//!
//! Bucket order is insertion order, and generated ids are monotonic, so
//! every fan-out observes relations in the order they were indexed.
//!
//! A bidirectional relation satisfies source lookups and target lookups
//! from either endpoint: source-side reads additionally scan the target
//! index for bidirectional matches, and vice versa.

use crate::entity::{validate_properties, EntityParams, EntityStore};
use crate::events::{names, EventBus, EventTarget, Listener, StoreEvent};
use crate::index::{bucket_insert, bucket_remove};
use crate::primitives::{
    DEFAULT_QUERY_LIMIT, MAX_ID_LENGTH, MAX_STRENGTH, MAX_TRAVERSAL_DEPTH, MAX_TYPE_LENGTH,
    MIN_STRENGTH,
};
use crate::query::{properties_match, RelationQuery};
use crate::types::{CorpusError, Direction, EntityRef, PropertyMap, PropertyValue, Relation};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// PARAMETERS
// =============================================================================

/// Creation parameters for a relation.
#[derive(Debug, Clone)]
pub struct RelationParams {
    /// Explicit id; generated from the store counter when absent.
    pub id: Option<String>,
    pub source: EntityRef,
    pub target: EntityRef,
    pub relation_type: String,
    pub direction: Direction,
    pub properties: PropertyMap,
    /// Start of the validity window; now when absent.
    pub valid_from: Option<DateTime<Utc>>,
    /// End of the validity window; open-ended when absent.
    pub valid_to: Option<DateTime<Utc>>,
    /// Edge strength, `1.0` by default.
    pub strength: f64,
}

impl RelationParams {
    /// Minimal parameters: a directed edge at full strength, valid from now.
    #[must_use]
    pub fn new(source: EntityRef, target: EntityRef, relation_type: impl Into<String>) -> Self {
        Self {
            id: None,
            source,
            target,
            relation_type: relation_type.into(),
            direction: Direction::default(),
            properties: PropertyMap::new(),
            valid_from: None,
            valid_to: None,
            strength: 1.0,
        }
    }

    /// Use an explicit id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Make the edge bidirectional.
    #[must_use]
    pub fn bidirectional(mut self) -> Self {
        self.direction = Direction::Bidirectional;
        self
    }

    /// Override the strength.
    #[must_use]
    pub fn with_strength(mut self, strength: f64) -> Self {
        self.strength = strength;
        self
    }

    /// Bound the validity window.
    #[must_use]
    pub fn with_window(mut self, from: DateTime<Utc>, to: Option<DateTime<Utc>>) -> Self {
        self.valid_from = Some(from);
        self.valid_to = to;
        self
    }

    /// Attach an indexed property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Update payload for a relation. Only supplied fields change;
/// `properties` merges shallowly. Endpoints and type are immutable.
#[derive(Debug, Clone, Default)]
pub struct RelationUpdate {
    pub properties: Option<PropertyMap>,
    pub strength: Option<f64>,
    pub direction: Option<Direction>,
    pub valid: Option<bool>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_to: Option<DateTime<Utc>>,
}

impl RelationUpdate {
    /// Empty update.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties
            .get_or_insert_with(PropertyMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Change the strength.
    #[must_use]
    pub fn with_strength(mut self, strength: f64) -> Self {
        self.strength = Some(strength);
        self
    }

    /// Close the validity window.
    #[must_use]
    pub fn until(mut self, end: DateTime<Utc>) -> Self {
        self.valid_to = Some(end);
        self
    }
}

// =============================================================================
// NEIGHBOR EXPANSION
// =============================================================================

/// Which edges to follow during neighbor expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraversalDirection {
    /// Follow edges out of the current entity.
    Outgoing,
    /// Follow edges into the current entity.
    Incoming,
    /// Follow both.
    #[default]
    Both,
}

/// Options for [`RelationStore::find_related`].
#[derive(Debug, Clone)]
pub struct RelatedOptions {
    /// Restrict to one relation type.
    pub relation_type: Option<String>,
    /// Edge orientation to follow.
    pub direction: TraversalDirection,
    /// Maximum number of hops; clamped to `MAX_TRAVERSAL_DEPTH`.
    pub depth: usize,
    /// Carry the traversed relation's properties on each result.
    pub include_properties: bool,
    /// Follow only relations active now.
    pub active_only: bool,
}

impl Default for RelatedOptions {
    fn default() -> Self {
        Self {
            relation_type: None,
            direction: TraversalDirection::default(),
            depth: 1,
            include_properties: false,
            active_only: true,
        }
    }
}

impl RelatedOptions {
    /// Direct neighbors over active relations of any type.
    #[must_use]
    pub fn neighbors() -> Self {
        Self::default()
    }

    /// Restrict to one relation type.
    #[must_use]
    pub fn of_type(mut self, relation_type: impl Into<String>) -> Self {
        self.relation_type = Some(relation_type.into());
        self
    }

    /// Expand up to `depth` hops.
    #[must_use]
    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    /// Follow only this orientation.
    #[must_use]
    pub fn with_direction(mut self, direction: TraversalDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Carry relation properties on each result.
    #[must_use]
    pub fn with_properties(mut self) -> Self {
        self.include_properties = true;
        self
    }
}

/// One entity reached by [`RelationStore::find_related`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelatedEntity {
    /// The reached entity.
    pub entity: EntityRef,
    /// Id of the relation traversed to reach it.
    pub relation_id: String,
    /// Type of the relation traversed to reach it.
    pub relation_type: String,
    /// Hop count from the start reference.
    pub depth: usize,
    /// The traversed relation's properties, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<PropertyMap>,
}

// =============================================================================
// RELATION STORE
// =============================================================================

/// The relation store.
#[derive(Debug, Default)]
pub struct RelationStore {
    /// Record storage: relation id -> relation.
    relations: BTreeMap<String, Relation>,
    /// Source endpoint index: ref key -> [relation ids].
    source_index: BTreeMap<String, Vec<String>>,
    /// Target endpoint index: ref key -> [relation ids].
    target_index: BTreeMap<String, Vec<String>>,
    /// Type index: relation type -> [relation ids].
    type_index: BTreeMap<String, Vec<String>>,
    /// Validity index: ids with `valid` set.
    valid_ids: BTreeSet<String>,
    /// Counter for generated ids.
    next_id: u64,
    /// Change notification.
    bus: EventBus,
}

impl RelationStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a listener to this store's events.
    pub fn subscribe(&mut self, listener: Listener) {
        self.bus.subscribe(listener);
    }

    // =========================================================================
    // CRUD
    // =========================================================================

    /// Create a relation.
    ///
    /// Either endpoint entity that does not already exist is materialized
    /// in `entities` with the ref's type and id as defaults. Emits
    /// `relation.created`.
    pub fn create(
        &mut self,
        params: RelationParams,
        entities: &mut EntityStore,
    ) -> Result<Relation, CorpusError> {
        validate_relation_shape(&params)?;

        let id = match params.id {
            Some(id) => {
                if self.relations.contains_key(&id) {
                    return Err(CorpusError::AlreadyExists(id));
                }
                id
            }
            None => self.generate_id(),
        };

        for endpoint in [&params.source, &params.target] {
            if !entities.exists(&endpoint.entity_type, &endpoint.id) {
                entities.create(EntityParams::from_ref(endpoint))?;
            }
        }

        let now = Utc::now();
        let relation = Relation {
            id: id.clone(),
            source: params.source,
            target: params.target,
            relation_type: params.relation_type,
            direction: params.direction,
            properties: params.properties,
            valid: true,
            valid_from: params.valid_from.unwrap_or(now),
            valid_to: params.valid_to,
            strength: params.strength,
            invalidation_reason: None,
            created_at: now,
            updated_at: now,
        };

        self.index_relation(&relation);
        self.relations.insert(id.clone(), relation.clone());
        tracing::debug!(id = %id, relation_type = %relation.relation_type, "relation created");

        self.bus.emit(&StoreEvent::new(
            names::RELATION_CREATED,
            EventTarget::Relation(relation.clone()),
            None,
        ));
        Ok(relation)
    }

    /// Lookup by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Relation> {
        self.relations.get(id)
    }

    /// Whether the id names a stored relation.
    #[must_use]
    pub fn exists(&self, id: &str) -> bool {
        self.relations.contains_key(id)
    }

    /// Update a relation in place. Emits `relation.updated`.
    pub fn update(&mut self, id: &str, updates: RelationUpdate) -> Result<Relation, CorpusError> {
        let Some(current) = self.relations.get(id) else {
            return Err(CorpusError::RelationNotFound(id.to_string()));
        };
        if let Some(strength) = updates.strength {
            validate_strength(strength)?;
        }
        if let Some(properties) = &updates.properties {
            validate_properties(properties)?;
        }

        let mut updated = current.clone();
        if let Some(properties) = updates.properties {
            updated.properties.extend(properties);
        }
        if let Some(strength) = updates.strength {
            updated.strength = strength;
        }
        if let Some(direction) = updates.direction {
            updated.direction = direction;
        }
        if let Some(valid) = updates.valid {
            updated.valid = valid;
        }
        if let Some(from) = updates.valid_from {
            updated.valid_from = from;
        }
        if let Some(end) = updates.valid_to {
            updated.valid_to = Some(end);
        }
        if let (Some(end), from) = (updated.valid_to, updated.valid_from) {
            if end < from {
                return Err(CorpusError::Validation(
                    "validity window ends before it starts".to_string(),
                ));
            }
        }
        updated.updated_at = Utc::now();

        if updated.valid {
            self.valid_ids.insert(id.to_string());
        } else {
            self.valid_ids.remove(id);
        }
        self.relations.insert(id.to_string(), updated.clone());
        tracing::debug!(id = %id, "relation updated");

        self.bus.emit(&StoreEvent::new(
            names::RELATION_UPDATED,
            EventTarget::Relation(updated.clone()),
            None,
        ));
        Ok(updated)
    }

    /// Soft-delete: clear `valid`, stamp the reason and time.
    ///
    /// The relation stays addressable by id but is excluded from every
    /// active read. Emits `relation.invalidated`.
    pub fn invalidate(&mut self, id: &str, reason: &str) -> Result<Relation, CorpusError> {
        let Some(current) = self.relations.get(id) else {
            return Err(CorpusError::RelationNotFound(id.to_string()));
        };

        let mut updated = current.clone();
        updated.valid = false;
        updated.invalidation_reason = Some(reason.to_string());
        updated.updated_at = Utc::now();

        self.valid_ids.remove(id);
        self.relations.insert(id.to_string(), updated.clone());
        tracing::debug!(id = %id, reason = %reason, "relation invalidated");

        self.bus.emit(&StoreEvent::new(
            names::RELATION_INVALIDATED,
            EventTarget::Relation(updated.clone()),
            Some(serde_json::json!({ "reason": reason })),
        ));
        Ok(updated)
    }

    /// Delete a relation. Emits `relation.deleted`.
    pub fn delete(&mut self, id: &str) -> Result<bool, CorpusError> {
        let Some(relation) = self.relations.get(id).cloned() else {
            return Err(CorpusError::RelationNotFound(id.to_string()));
        };

        self.deindex_relation(&relation);
        self.relations.remove(id);
        tracing::debug!(id = %id, "relation deleted");

        self.bus.emit(&StoreEvent::new(
            names::RELATION_DELETED,
            EventTarget::Relation(relation),
            None,
        ));
        Ok(true)
    }

    // =========================================================================
    // GRAPH-SHAPED READS
    // =========================================================================

    /// Relations whose source is `reference`, including bidirectional
    /// relations stored with `reference` as target.
    #[must_use]
    pub fn find_by_source(&self, reference: &EntityRef, active_only: bool) -> Vec<Relation> {
        self.endpoint_scan(reference, active_only, true)
    }

    /// Relations whose target is `reference`, including bidirectional
    /// relations stored with `reference` as source.
    #[must_use]
    pub fn find_by_target(&self, reference: &EntityRef, active_only: bool) -> Vec<Relation> {
        self.endpoint_scan(reference, active_only, false)
    }

    /// Relations of one type, in index order, optionally truncated.
    #[must_use]
    pub fn find_by_type(
        &self,
        relation_type: &str,
        active_only: bool,
        limit: Option<usize>,
    ) -> Vec<Relation> {
        let now = Utc::now();
        self.type_index
            .get(relation_type)
            .into_iter()
            .flatten()
            .filter_map(|id| self.relations.get(id))
            .filter(|relation| !active_only || relation.is_active_at(now))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Relations directly connecting `source` to `target`, honoring
    /// bidirectionality, optionally restricted to one type.
    #[must_use]
    pub fn find_direct(
        &self,
        source: &EntityRef,
        target: &EntityRef,
        relation_type: Option<&str>,
        active_only: bool,
    ) -> Vec<Relation> {
        let now = Utc::now();
        let mut seen = BTreeSet::new();
        let mut matches = Vec::new();

        let source_key = source.key();
        let buckets = [
            self.source_index.get(&source_key),
            self.target_index.get(&source_key),
        ];
        for id in buckets.into_iter().flatten().flatten() {
            if !seen.insert(id.clone()) {
                continue;
            }
            let Some(relation) = self.relations.get(id) else {
                continue;
            };
            if !relation.connects(source, target) {
                continue;
            }
            if relation_type.is_some_and(|t| relation.relation_type != t) {
                continue;
            }
            if active_only && !relation.is_active_at(now) {
                continue;
            }
            matches.push(relation.clone());
        }
        matches
    }

    /// Bounded multi-hop neighbor expansion from `start`.
    ///
    /// Depth-first over active relations in index order; a visited set
    /// seeded with the start prevents revisits, so each reachable entity
    /// is reported once, at the depth the traversal first reached it.
    #[must_use]
    pub fn find_related(&self, start: &EntityRef, options: &RelatedOptions) -> Vec<RelatedEntity> {
        let max_hops = options.depth.min(MAX_TRAVERSAL_DEPTH);
        let mut visited: BTreeSet<String> = BTreeSet::new();
        visited.insert(start.key());
        let mut found = Vec::new();
        if max_hops == 0 {
            return found;
        }

        // Explicit frame stack reproducing per-neighbor recursion order.
        let mut stack = vec![Frame {
            current: start.clone(),
            hops: 0,
            pending: self.step_relations(start, options).into_iter(),
        }];

        while let Some(frame) = stack.last_mut() {
            let Some(relation) = frame.pending.next() else {
                stack.pop();
                continue;
            };
            let current = frame.current.clone();
            let hops = frame.hops;

            let Some(other) = relation.other_endpoint(&current).cloned() else {
                continue;
            };
            if !visited.insert(other.key()) {
                continue;
            }
            found.push(RelatedEntity {
                entity: other.clone(),
                relation_id: relation.id.clone(),
                relation_type: relation.relation_type.clone(),
                depth: hops + 1,
                properties: options.include_properties.then(|| relation.properties.clone()),
            });
            if hops + 1 < max_hops {
                stack.push(Frame {
                    pending: self.step_relations(&other, options).into_iter(),
                    current: other,
                    hops: hops + 1,
                });
            }
        }
        found
    }

    /// Filtered, paginated query.
    #[must_use]
    pub fn query(&self, query: &RelationQuery) -> Vec<Relation> {
        let candidates: Vec<&Relation> = if let Some(source) = &query.source {
            self.endpoint_candidates(source, true)
        } else if let Some(target) = &query.target {
            self.endpoint_candidates(target, false)
        } else if !query.types.is_empty() {
            let mut seen = BTreeSet::new();
            query
                .types
                .iter()
                .filter_map(|t| self.type_index.get(t))
                .flatten()
                .filter(|id| seen.insert((*id).clone()))
                .filter_map(|id| self.relations.get(id))
                .collect()
        } else {
            self.relations.values().collect()
        };

        candidates
            .into_iter()
            .filter(|relation| {
                query.types.is_empty() || query.types.contains(&relation.relation_type)
            })
            .filter(|relation| {
                query
                    .source
                    .as_ref()
                    .is_none_or(|s| relation.source == *s
                        || (relation.direction == Direction::Bidirectional && relation.target == *s))
            })
            .filter(|relation| {
                query
                    .target
                    .as_ref()
                    .is_none_or(|t| relation.target == *t
                        || (relation.direction == Direction::Bidirectional && relation.source == *t))
            })
            .filter(|relation| !query.valid_only || relation.valid)
            .filter(|relation| query.active_at.is_none_or(|t| relation.is_active_at(t)))
            .filter(|relation| {
                query
                    .min_strength
                    .is_none_or(|minimum| relation.strength >= minimum)
            })
            .filter(|relation| properties_match(&query.properties, &relation.properties))
            .skip(query.offset)
            .take(query.limit.unwrap_or(DEFAULT_QUERY_LIMIT))
            .cloned()
            .collect()
    }

    /// Total number of stored relations.
    #[must_use]
    pub fn count(&self) -> usize {
        self.relations.len()
    }

    /// Number of relations with `valid` set.
    #[must_use]
    pub fn valid_count(&self) -> usize {
        self.valid_ids.len()
    }

    // =========================================================================
    // INTERNAL
    // =========================================================================

    fn generate_id(&mut self) -> String {
        loop {
            self.next_id = self.next_id.saturating_add(1);
            let id = format!("rel-{}", self.next_id);
            // Caller-supplied ids may have taken a counter slot.
            if !self.relations.contains_key(&id) {
                return id;
            }
        }
    }

    /// Scan one endpoint index plus the opposite index for bidirectional
    /// matches, preserving bucket order within each scan.
    fn endpoint_scan(&self, reference: &EntityRef, active_only: bool, as_source: bool) -> Vec<Relation> {
        let now = Utc::now();
        let mut seen = BTreeSet::new();
        let mut matches = Vec::new();
        for relation in self.endpoint_candidates(reference, as_source) {
            if !seen.insert(relation.id.clone()) {
                continue;
            }
            if active_only && !relation.is_active_at(now) {
                continue;
            }
            matches.push(relation.clone());
        }
        matches
    }

    fn endpoint_candidates(&self, reference: &EntityRef, as_source: bool) -> Vec<&Relation> {
        let key = reference.key();
        let (own, opposite) = if as_source {
            (&self.source_index, &self.target_index)
        } else {
            (&self.target_index, &self.source_index)
        };

        let direct = own.get(&key).into_iter().flatten();
        let reversed = opposite
            .get(&key)
            .into_iter()
            .flatten()
            .filter(|id| {
                self.relations
                    .get(*id)
                    .is_some_and(|r| r.direction == Direction::Bidirectional)
            });
        direct
            .chain(reversed)
            .filter_map(|id| self.relations.get(id))
            .collect()
    }

    /// Relations to follow from `current` during neighbor expansion, in
    /// index order, deduplicated by id.
    fn step_relations(&self, current: &EntityRef, options: &RelatedOptions) -> Vec<Relation> {
        let mut seen = BTreeSet::new();
        let mut step = Vec::new();
        if matches!(
            options.direction,
            TraversalDirection::Outgoing | TraversalDirection::Both
        ) {
            for relation in self.find_by_source(current, options.active_only) {
                if seen.insert(relation.id.clone()) {
                    step.push(relation);
                }
            }
        }
        if matches!(
            options.direction,
            TraversalDirection::Incoming | TraversalDirection::Both
        ) {
            for relation in self.find_by_target(current, options.active_only) {
                if seen.insert(relation.id.clone()) {
                    step.push(relation);
                }
            }
        }
        if let Some(relation_type) = &options.relation_type {
            step.retain(|relation| relation.relation_type == *relation_type);
        }
        step
    }

    fn index_relation(&mut self, relation: &Relation) {
        bucket_insert(
            &mut self.source_index,
            relation.source.key(),
            relation.id.clone(),
        );
        bucket_insert(
            &mut self.target_index,
            relation.target.key(),
            relation.id.clone(),
        );
        bucket_insert(
            &mut self.type_index,
            relation.relation_type.clone(),
            relation.id.clone(),
        );
        if relation.valid {
            self.valid_ids.insert(relation.id.clone());
        }
    }

    fn deindex_relation(&mut self, relation: &Relation) {
        bucket_remove(&mut self.source_index, &relation.source.key(), &relation.id);
        bucket_remove(&mut self.target_index, &relation.target.key(), &relation.id);
        bucket_remove(
            &mut self.type_index,
            &relation.relation_type,
            &relation.id,
        );
        self.valid_ids.remove(&relation.id);
    }
}

/// One level of the explicit DFS stack in [`RelationStore::find_related`].
struct Frame {
    current: EntityRef,
    hops: usize,
    pending: std::vec::IntoIter<Relation>,
}

// =============================================================================
// VALIDATION
// =============================================================================

fn validate_relation_shape(params: &RelationParams) -> Result<(), CorpusError> {
    if params.relation_type.is_empty() || params.relation_type.len() > MAX_TYPE_LENGTH {
        return Err(CorpusError::Validation(format!(
            "relation type must be 1..={MAX_TYPE_LENGTH} bytes"
        )));
    }
    if let Some(id) = &params.id {
        if id.is_empty() || id.len() > MAX_ID_LENGTH {
            return Err(CorpusError::Validation(format!(
                "relation id must be 1..={MAX_ID_LENGTH} bytes"
            )));
        }
    }
    for endpoint in [&params.source, &params.target] {
        if endpoint.entity_type.is_empty() || endpoint.id.is_empty() {
            return Err(CorpusError::Validation(
                "endpoint refs need a type and an id".to_string(),
            ));
        }
    }
    if let (Some(from), Some(end)) = (params.valid_from, params.valid_to) {
        if end < from {
            return Err(CorpusError::Validation(
                "validity window ends before it starts".to_string(),
            ));
        }
    }
    validate_strength(params.strength)?;
    validate_properties(&params.properties)
}

fn validate_strength(strength: f64) -> Result<(), CorpusError> {
    if strength.is_nan() || !(MIN_STRENGTH..=MAX_STRENGTH).contains(&strength) {
        return Err(CorpusError::Validation(format!(
            "strength must be within [{MIN_STRENGTH}, {MAX_STRENGTH}]"
        )));
    }
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
