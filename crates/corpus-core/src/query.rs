//! # Query Module
//!
//! Structured filter types for store queries.
//!
//! - Map caller questions onto deterministic index walks
//! - No free-form predicates; every filter is an explicit field
//! - Offset/limit pagination applied after filtering

use crate::types::{EntityRef, EntityStatus, PropertyMap, PropertyValue};
use chrono::{DateTime, Utc};

// =============================================================================
// ENTITY QUERY
// =============================================================================

/// Filter set for `EntityStore::query`.
///
/// All populated filters must match (conjunction). `search` is a
/// case-insensitive substring match over name and description.
#[derive(Debug, Clone, Default)]
pub struct EntityQuery {
    /// Restrict to one entity type.
    pub entity_type: Option<String>,
    /// Restrict to one lifecycle status.
    pub status: Option<EntityStatus>,
    /// Free-text search over name/description.
    pub search: Option<String>,
    /// Property-equality filters; every pair must match.
    pub properties: PropertyMap,
    /// Number of matches to skip.
    pub offset: usize,
    /// Page size; store default when absent.
    pub limit: Option<usize>,
}

impl EntityQuery {
    /// Match everything.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to one entity type.
    #[must_use]
    pub fn of_type(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: Some(entity_type.into()),
            ..Self::default()
        }
    }

    /// Add a status filter.
    #[must_use]
    pub fn with_status(mut self, status: EntityStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Add a free-text search filter.
    #[must_use]
    pub fn with_search(mut self, needle: impl Into<String>) -> Self {
        self.search = Some(needle.into());
        self
    }

    /// Add a property-equality filter.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Add pagination.
    #[must_use]
    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }
}

// =============================================================================
// RELATION QUERY
// =============================================================================

/// Filter set for `RelationStore::query`.
#[derive(Debug, Clone, Default)]
pub struct RelationQuery {
    /// Restrict to these relation types; empty means any.
    pub types: Vec<String>,
    /// Restrict to relations from this endpoint.
    pub source: Option<EntityRef>,
    /// Restrict to relations to this endpoint.
    pub target: Option<EntityRef>,
    /// Drop invalidated relations.
    pub valid_only: bool,
    /// Keep only relations active at this instant.
    pub active_at: Option<DateTime<Utc>>,
    /// Keep only relations with at least this strength.
    pub min_strength: Option<f64>,
    /// Property-equality filters.
    pub properties: PropertyMap,
    /// Number of matches to skip.
    pub offset: usize,
    /// Page size; store default when absent.
    pub limit: Option<usize>,
}

impl RelationQuery {
    /// Match everything.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to one relation type.
    #[must_use]
    pub fn of_type(relation_type: impl Into<String>) -> Self {
        Self {
            types: vec![relation_type.into()],
            ..Self::default()
        }
    }

    /// Restrict to relations from this endpoint.
    #[must_use]
    pub fn from(mut self, source: EntityRef) -> Self {
        self.source = Some(source);
        self
    }

    /// Restrict to relations to this endpoint.
    #[must_use]
    pub fn to(mut self, target: EntityRef) -> Self {
        self.target = Some(target);
        self
    }

    /// Keep only relations active at `t`.
    #[must_use]
    pub fn active_at(mut self, t: DateTime<Utc>) -> Self {
        self.active_at = Some(t);
        self
    }

    /// Keep only relations with at least this strength.
    #[must_use]
    pub fn min_strength(mut self, strength: f64) -> Self {
        self.min_strength = Some(strength);
        self
    }

    /// Add pagination.
    #[must_use]
    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }
}

// =============================================================================
// CONTEXT QUERY
// =============================================================================

/// Filter set for `ContextStore::query`.
#[derive(Debug, Clone, Default)]
pub struct ContextQuery {
    /// Restrict to one context type.
    pub context_type: Option<String>,
    /// Free-text search over name/description.
    pub search: Option<String>,
    /// Drop invalid contexts.
    pub valid_only: bool,
    /// Keep only contexts active at this instant.
    pub active_at: Option<DateTime<Utc>>,
    /// Restrict to one scope.
    pub scope: Option<String>,
    /// Restrict to one domain.
    pub domain: Option<String>,
    /// Property-equality filters.
    pub properties: PropertyMap,
    /// Number of matches to skip.
    pub offset: usize,
    /// Page size; store default when absent.
    pub limit: Option<usize>,
}

impl ContextQuery {
    /// Match everything.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to one context type.
    #[must_use]
    pub fn of_type(context_type: impl Into<String>) -> Self {
        Self {
            context_type: Some(context_type.into()),
            ..Self::default()
        }
    }

    /// Add a free-text search filter.
    #[must_use]
    pub fn with_search(mut self, needle: impl Into<String>) -> Self {
        self.search = Some(needle.into());
        self
    }

    /// Restrict to one scope.
    #[must_use]
    pub fn in_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Restrict to one domain.
    #[must_use]
    pub fn in_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Keep only contexts active at `t`.
    #[must_use]
    pub fn active_at(mut self, t: DateTime<Utc>) -> Self {
        self.active_at = Some(t);
        self
    }

    /// Add pagination.
    #[must_use]
    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }
}

// =============================================================================
// SHARED FILTER HELPERS
// =============================================================================

/// Case-insensitive substring match over a name and optional description.
#[must_use]
pub(crate) fn text_matches(needle: &str, name: &str, description: Option<&str>) -> bool {
    let needle = needle.to_lowercase();
    name.to_lowercase().contains(&needle)
        || description.is_some_and(|d| d.to_lowercase().contains(&needle))
}

/// Property-equality match: every filter pair must be present and equal.
///
/// Equality is on the stringified index form, mirroring what the inverted
/// index buckets on.
#[must_use]
pub(crate) fn properties_match(filters: &PropertyMap, properties: &PropertyMap) -> bool {
    filters.iter().all(|(key, want)| {
        properties
            .get(key)
            .is_some_and(|have| have.index_key() == want.index_key())
    })
}

// =============================================================================
// TESTS
// =============================================================================
