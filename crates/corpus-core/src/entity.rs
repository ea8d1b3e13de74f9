//! # Entity Store
//!
//! Typed records keyed by `(type, id)`, with a per-type index and an
//! inverted property-value index.
//!
//! Index maintenance invariants:
//! - every insert adds the record key to the type index and, for every
//!   indexable scalar property, to the `(property, stringified value)`
//!   bucket of the inverted index
//! - every update removes the old entries before inserting the new ones
//! - an emptied bucket is removed; no empty buckets persist

use crate::events::{names, EventBus, EventTarget, Listener, StoreEvent};
use crate::index::{bucket_insert, bucket_remove};
use crate::primitives::{
    DEFAULT_QUERY_LIMIT, MAX_ID_LENGTH, MAX_NAME_LENGTH, MAX_PROPERTY_KEY_LENGTH, MAX_TYPE_LENGTH,
};
use crate::query::{properties_match, text_matches, EntityQuery};
use crate::types::{CorpusError, Entity, EntityRef, EntityStatus, PropertyMap, PropertyValue};
use chrono::Utc;
use std::collections::BTreeMap;

// =============================================================================
// PARAMETERS
// =============================================================================

/// Creation parameters for an entity.
#[derive(Debug, Clone)]
pub struct EntityParams {
    pub id: String,
    pub entity_type: String,
    pub name: String,
    pub description: Option<String>,
    pub properties: PropertyMap,
    pub payload: Option<serde_json::Value>,
    pub status: EntityStatus,
}

impl EntityParams {
    /// Minimal parameters: type, id, name.
    #[must_use]
    pub fn new(
        entity_type: impl Into<String>,
        id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            name: name.into(),
            description: None,
            properties: PropertyMap::new(),
            payload: None,
            status: EntityStatus::default(),
        }
    }

    /// Default parameters for an endpoint that only exists as a reference:
    /// the ref's id doubles as the name.
    #[must_use]
    pub fn from_ref(reference: &EntityRef) -> Self {
        Self::new(
            reference.entity_type.clone(),
            reference.id.clone(),
            reference.id.clone(),
        )
    }

    /// Attach a description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Attach an indexed property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Attach a non-indexed nested payload.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Override the initial status.
    #[must_use]
    pub fn with_status(mut self, status: EntityStatus) -> Self {
        self.status = status;
        self
    }
}

/// Update payload for an entity.
///
/// Only supplied fields change; `properties` is merged shallowly rather
/// than replaced. `allow_protected` is the explicit override required to
/// touch a protected entity.
#[derive(Debug, Clone, Default)]
pub struct EntityUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub properties: Option<PropertyMap>,
    pub payload: Option<serde_json::Value>,
    pub status: Option<EntityStatus>,
    pub allow_protected: bool,
}

impl EntityUpdate {
    /// Empty update.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rename the entity.
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

    /// Change the lifecycle status.
    #[must_use]
    pub fn with_status(mut self, status: EntityStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Carry the explicit protection override.
    #[must_use]
    pub fn override_protection(mut self) -> Self {
        self.allow_protected = true;
        self
    }
}

// =============================================================================
// ENTITY STORE
// =============================================================================

/// The entity store.
///
/// `BTreeMap`-backed for deterministic iteration; index buckets keep
/// insertion order.
#[derive(Debug, Default)]
pub struct EntityStore {
    /// Record storage: ref key -> entity.
    entities: BTreeMap<String, Entity>,
    /// Per-type index: type -> [ref keys].
    type_index: BTreeMap<String, Vec<String>>,
    /// Inverted property index: (property, stringified value) -> [ref keys].
    property_index: BTreeMap<(String, String), Vec<String>>,
    /// Change notification.
    bus: EventBus,
}

impl EntityStore {
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

    /// Create an entity.
    ///
    /// Fails with `AlreadyExists` when the `(type, id)` pair is taken and
    /// `Validation` on shape violations. Emits `entity.created`.
    pub fn create(&mut self, params: EntityParams) -> Result<Entity, CorpusError> {
        validate_identifier(&params.id, &params.entity_type, &params.name)?;
        validate_properties(&params.properties)?;

        let reference = EntityRef::new(params.entity_type.clone(), params.id.clone());
        let key = reference.key();
        if self.entities.contains_key(&key) {
            return Err(CorpusError::AlreadyExists(key));
        }

        let now = Utc::now();
        let entity = Entity {
            id: params.id,
            entity_type: params.entity_type,
            name: params.name,
            description: params.description,
            properties: params.properties,
            payload: params.payload,
            status: params.status,
            version: 1,
            created_at: now,
            updated_at: now,
        };

        self.index_entity(&key, &entity);
        self.entities.insert(key.clone(), entity.clone());
        tracing::debug!(key = %key, "entity created");

        self.bus.emit(&StoreEvent::new(
            names::ENTITY_CREATED,
            EventTarget::Entity(entity.clone()),
            None,
        ));
        Ok(entity)
    }

    /// Lookup by `(type, id)`.
    #[must_use]
    pub fn get(&self, entity_type: &str, id: &str) -> Option<&Entity> {
        self.get_by_ref(&EntityRef::new(entity_type, id))
    }

    /// Lookup by reference.
    #[must_use]
    pub fn get_by_ref(&self, reference: &EntityRef) -> Option<&Entity> {
        self.entities.get(&reference.key())
    }

    /// Whether `(type, id)` names a stored entity.
    #[must_use]
    pub fn exists(&self, entity_type: &str, id: &str) -> bool {
        self.get(entity_type, id).is_some()
    }

    /// Update an entity in place.
    ///
    /// Only supplied fields change; `properties` merges shallowly;
    /// `updated_at` always refreshes and `version` increments. A status
    /// change emits `entity.status_changed` instead of `entity.updated`.
    pub fn update(
        &mut self,
        entity_type: &str,
        id: &str,
        updates: EntityUpdate,
    ) -> Result<Entity, CorpusError> {
        let reference = EntityRef::new(entity_type, id);
        let key = reference.key();

        let Some(current) = self.entities.get(&key) else {
            return Err(CorpusError::EntityNotFound(reference));
        };
        if current.is_protected() && !updates.allow_protected {
            return Err(CorpusError::ProtectedEntity(reference));
        }
        if let Some(name) = &updates.name {
            if name.is_empty() || name.len() > MAX_NAME_LENGTH {
                return Err(CorpusError::Validation(format!(
                    "entity name must be 1..={MAX_NAME_LENGTH} bytes"
                )));
            }
        }
        if let Some(properties) = &updates.properties {
            validate_properties(properties)?;
        }

        let mut updated = current.clone();
        // `updated` still carries the pre-update type and properties here,
        // so it doubles as the deindex snapshot.
        self.deindex_entity(&key, &updated);

        if let Some(name) = updates.name {
            updated.name = name;
        }
        if let Some(description) = updates.description {
            updated.description = Some(description);
        }
        if let Some(properties) = updates.properties {
            updated.properties.extend(properties);
        }
        if let Some(payload) = updates.payload {
            updated.payload = Some(payload);
        }
        let previous_status = updated.status;
        if let Some(status) = updates.status {
            updated.status = status;
        }
        updated.version = updated.version.saturating_add(1);
        updated.updated_at = Utc::now();

        self.index_entity(&key, &updated);
        self.entities.insert(key.clone(), updated.clone());
        tracing::debug!(key = %key, version = updated.version, "entity updated");

        if updated.status != previous_status {
            self.bus.emit(&StoreEvent::new(
                names::ENTITY_STATUS_CHANGED,
                EventTarget::Entity(updated.clone()),
                Some(serde_json::json!({
                    "previous": previous_status,
                    "current": updated.status,
                })),
            ));
        } else {
            self.bus.emit(&StoreEvent::new(
                names::ENTITY_UPDATED,
                EventTarget::Entity(updated.clone()),
                None,
            ));
        }
        Ok(updated)
    }

    /// Delete an entity.
    ///
    /// System entities (reserved `system.` type prefix) can never be
    /// deleted; protected entities require clearing the flag first via an
    /// overridden update. No cascade: relations referencing the entity are
    /// left dangling for the caller to detect.
    pub fn delete(&mut self, entity_type: &str, id: &str) -> Result<bool, CorpusError> {
        let reference = EntityRef::new(entity_type, id);
        let key = reference.key();

        let Some(entity) = self.entities.get(&key) else {
            return Err(CorpusError::EntityNotFound(reference));
        };
        if entity.is_system() {
            return Err(CorpusError::SystemEntity(reference));
        }
        if entity.is_protected() {
            return Err(CorpusError::ProtectedEntity(reference));
        }

        let entity = entity.clone();
        self.deindex_entity(&key, &entity);
        self.entities.remove(&key);
        tracing::debug!(key = %key, "entity deleted");

        self.bus.emit(&StoreEvent::new(
            names::ENTITY_DELETED,
            EventTarget::Entity(entity),
            None,
        ));
        Ok(true)
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// All entities of one type, in index order.
    #[must_use]
    pub fn find_by_type(&self, entity_type: &str) -> Vec<Entity> {
        self.type_index
            .get(entity_type)
            .into_iter()
            .flatten()
            .filter_map(|key| self.entities.get(key).cloned())
            .collect()
    }

    /// Exactly the entities whose current `properties[key]` stringifies
    /// equal to `value`, via the inverted index.
    #[must_use]
    pub fn find_by_property(&self, key: &str, value: &PropertyValue) -> Vec<Entity> {
        self.property_index
            .get(&(key.to_string(), value.index_key()))
            .into_iter()
            .flatten()
            .filter_map(|entity_key| self.entities.get(entity_key).cloned())
            .collect()
    }

    /// Filtered, paginated query.
    #[must_use]
    pub fn query(&self, query: &EntityQuery) -> Vec<Entity> {
        let candidates: Vec<&Entity> = match &query.entity_type {
            Some(entity_type) => self
                .type_index
                .get(entity_type)
                .into_iter()
                .flatten()
                .filter_map(|key| self.entities.get(key))
                .collect(),
            None => self.entities.values().collect(),
        };

        candidates
            .into_iter()
            .filter(|entity| query.status.is_none_or(|status| entity.status == status))
            .filter(|entity| {
                query.search.as_deref().is_none_or(|needle| {
                    text_matches(needle, &entity.name, entity.description.as_deref())
                })
            })
            .filter(|entity| properties_match(&query.properties, &entity.properties))
            .skip(query.offset)
            .take(query.limit.unwrap_or(DEFAULT_QUERY_LIMIT))
            .cloned()
            .collect()
    }

    /// Total number of stored entities.
    #[must_use]
    pub fn count(&self) -> usize {
        self.entities.len()
    }

    // =========================================================================
    // INDEX MAINTENANCE
    // =========================================================================

    fn index_entity(&mut self, key: &str, entity: &Entity) {
        bucket_insert(
            &mut self.type_index,
            entity.entity_type.clone(),
            key.to_string(),
        );
        for (property, value) in &entity.properties {
            if value.is_indexable() {
                bucket_insert(
                    &mut self.property_index,
                    (property.clone(), value.index_key()),
                    key.to_string(),
                );
            }
        }
    }

    fn deindex_entity(&mut self, key: &str, entity: &Entity) {
        bucket_remove(
            &mut self.type_index,
            &entity.entity_type,
            &key.to_string(),
        );
        for (property, value) in &entity.properties {
            if value.is_indexable() {
                bucket_remove(
                    &mut self.property_index,
                    &(property.clone(), value.index_key()),
                    &key.to_string(),
                );
            }
        }
    }
}

// =============================================================================
// VALIDATION
// =============================================================================

fn validate_identifier(id: &str, entity_type: &str, name: &str) -> Result<(), CorpusError> {
    if id.is_empty() || id.len() > MAX_ID_LENGTH {
        return Err(CorpusError::Validation(format!(
            "id must be 1..={MAX_ID_LENGTH} bytes"
        )));
    }
    if entity_type.is_empty() || entity_type.len() > MAX_TYPE_LENGTH {
        return Err(CorpusError::Validation(format!(
            "type must be 1..={MAX_TYPE_LENGTH} bytes"
        )));
    }
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return Err(CorpusError::Validation(format!(
            "name must be 1..={MAX_NAME_LENGTH} bytes"
        )));
    }
    Ok(())
}

pub(crate) fn validate_properties(properties: &PropertyMap) -> Result<(), CorpusError> {
    for key in properties.keys() {
        if key.is_empty() || key.len() > MAX_PROPERTY_KEY_LENGTH {
            return Err(CorpusError::Validation(format!(
                "property key must be 1..={MAX_PROPERTY_KEY_LENGTH} bytes"
            )));
        }
    }
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
