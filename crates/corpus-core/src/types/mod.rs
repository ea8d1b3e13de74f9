//! # Core Type Definitions
//!
//! This module contains all core types for the Corpus store:
//! - Entity references and records (`EntityRef`, `Entity`)
//! - Typed edges (`Relation`, `Direction`)
//! - Named groupings (`Context`, `ContextMetrics`)
//! - Indexed property values (`PropertyValue`, `PropertyMap`)
//! - Error types (`CorpusError`)
//!
//! ## Determinism Guarantees
//!
//! All record collections in the stores are keyed by these types through
//! `BTreeMap`/`BTreeSet`; everything that participates in index bucketing
//! has a stable textual form (`EntityRef::key`, `PropertyValue::index_key`).

use crate::primitives::{PROTECTED_PROPERTY, REF_KEY_SEPARATOR, SYSTEM_TYPE_PREFIX};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// =============================================================================
// ENTITY REFERENCE
// =============================================================================

/// A lightweight `(type, id)` pointer into the entity store.
///
/// Carries no ownership: a ref may dangle after the referenced entity is
/// deleted, and callers detect that via `EntityStore::exists`.
/// Equality is structural.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    /// The entity type half of the key.
    #[serde(rename = "type")]
    pub entity_type: String,
    /// The entity id half of the key.
    pub id: String,
}

impl EntityRef {
    /// Create a new reference.
    #[must_use]
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    /// Textual key form `"{type}:{id}"`.
    ///
    /// This is the format used for all index bucketing and cross-store
    /// lookups.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}{}{}", self.entity_type, REF_KEY_SEPARATOR, self.id)
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.entity_type, REF_KEY_SEPARATOR, self.id)
    }
}

impl FromStr for EntityRef {
    type Err = CorpusError;

    /// Parse the `"{type}:{id}"` textual form.
    ///
    /// The split is on the FIRST separator: ids may contain further colons,
    /// types may not.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(REF_KEY_SEPARATOR) {
            Some((t, id)) if !t.is_empty() && !id.is_empty() => Ok(Self::new(t, id)),
            _ => Err(CorpusError::Validation(format!(
                "malformed ref key: {s:?}"
            ))),
        }
    }
}

impl From<&Entity> for EntityRef {
    fn from(entity: &Entity) -> Self {
        Self::new(entity.entity_type.clone(), entity.id.clone())
    }
}

// =============================================================================
// PROPERTY VALUES
// =============================================================================

/// A scalar property value eligible for inverted-index bucketing.
///
/// Nested structures are deliberately excluded; entities carry them in a
/// separate non-indexed `payload` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating-point number.
    Float(f64),
    /// UTC timestamp.
    Timestamp(DateTime<Utc>),
    /// UTF-8 string.
    Str(String),
    /// Explicit null. Never indexed.
    Null,
}

impl PropertyValue {
    /// Truthiness in the source system's sense.
    ///
    /// `Null`, `false`, `0`, `0.0`, `NaN`, and the empty string are falsy;
    /// everything else (timestamps included) is truthy.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0 && !f.is_nan(),
            Self::Timestamp(_) => true,
            Self::Str(s) => !s.is_empty(),
            Self::Null => false,
        }
    }

    /// Whether the value participates in the inverted property index.
    ///
    /// Only `Null` is excluded; every other scalar is indexable.
    #[must_use]
    pub fn is_indexable(&self) -> bool {
        !matches!(self, Self::Null)
    }

    /// Stable stringification used as the inverted-index bucket key.
    #[must_use]
    pub fn index_key(&self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Timestamp(t) => t.to_rfc3339(),
            Self::Str(s) => s.clone(),
            Self::Null => "null".to_string(),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for PropertyValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for PropertyValue {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<DateTime<Utc>> for PropertyValue {
    fn from(t: DateTime<Utc>) -> Self {
        Self::Timestamp(t)
    }
}

/// Open string-keyed map of indexed scalar values.
///
/// `BTreeMap` keeps property iteration deterministic.
pub type PropertyMap = BTreeMap<String, PropertyValue>;

/// Check whether a property map flags its record as protected.
#[must_use]
pub fn is_protected_map(properties: &PropertyMap) -> bool {
    properties
        .get(PROTECTED_PROPERTY)
        .is_some_and(PropertyValue::is_truthy)
}

// =============================================================================
// ENTITY
// =============================================================================

/// Lifecycle status of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EntityStatus {
    /// Live record, the default.
    #[default]
    Active,
    /// Retained but no longer current.
    Archived,
    /// Marked deleted without removal.
    Deleted,
    /// Not yet published.
    Draft,
    /// Blueprint for other entities.
    Template,
}

/// A typed, identified record.
///
/// The pair `(type, id)` is unique across the store. An entity whose type
/// starts with the reserved `system.` prefix can never be deleted; an
/// entity whose `properties.protected` is truthy rejects mutation unless
/// the update carries an explicit override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Identifier, unique within the entity type.
    pub id: String,
    /// Entity type, the other half of the store key.
    #[serde(rename = "type")]
    pub entity_type: String,
    /// Human-readable name.
    pub name: String,
    /// Optional longer description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Indexed scalar properties.
    #[serde(default)]
    pub properties: PropertyMap,
    /// Unconstrained nested data. Never indexed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Lifecycle status.
    #[serde(default)]
    pub status: EntityStatus,
    /// Monotonic revision counter, starts at 1.
    pub version: u32,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// Reference pointing at this entity.
    #[must_use]
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::from(self)
    }

    /// Textual store key `"{type}:{id}"`.
    #[must_use]
    pub fn key(&self) -> String {
        self.entity_ref().key()
    }

    /// Whether `properties.protected` is truthy.
    #[must_use]
    pub fn is_protected(&self) -> bool {
        is_protected_map(&self.properties)
    }

    /// Whether the type sits in the reserved `system.` namespace.
    #[must_use]
    pub fn is_system(&self) -> bool {
        self.entity_type.starts_with(SYSTEM_TYPE_PREFIX)
    }
}

// =============================================================================
// RELATION
// =============================================================================

/// Direction of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Source-to-target only, the default.
    #[default]
    Directed,
    /// Satisfies source and target lookups from either endpoint.
    Bidirectional,
}

/// A typed, optionally time-bounded edge between two entity references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    /// Globally unique id.
    pub id: String,
    /// Originating endpoint.
    pub source: EntityRef,
    /// Destination endpoint.
    pub target: EntityRef,
    /// Relation type.
    #[serde(rename = "type")]
    pub relation_type: String,
    /// Directionality.
    #[serde(default)]
    pub direction: Direction,
    /// Indexed scalar properties.
    #[serde(default)]
    pub properties: PropertyMap,
    /// Soft-delete flag: invalidated relations stay addressable.
    pub valid: bool,
    /// Start of the validity window (inclusive).
    pub valid_from: DateTime<Utc>,
    /// End of the validity window (inclusive), open-ended when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<DateTime<Utc>>,
    /// Edge strength in `[0.0, 1.0]`.
    pub strength: f64,
    /// Reason recorded by `invalidate`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalidation_reason: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Relation {
    /// Whether the relation is active at time `t`.
    ///
    /// Active means: `valid` is set, `valid_from <= t`, and `valid_to` is
    /// absent or `>= t`. Both window boundaries are inclusive.
    #[must_use]
    pub fn is_active_at(&self, t: DateTime<Utc>) -> bool {
        self.valid && self.valid_from <= t && self.valid_to.is_none_or(|end| end >= t)
    }

    /// Whether the relation connects the two refs directly, honoring
    /// direction.
    #[must_use]
    pub fn connects(&self, source: &EntityRef, target: &EntityRef) -> bool {
        (self.source == *source && self.target == *target)
            || (self.direction == Direction::Bidirectional
                && self.source == *target
                && self.target == *source)
    }

    /// The endpoint opposite `reference`, if `reference` is an endpoint.
    #[must_use]
    pub fn other_endpoint(&self, reference: &EntityRef) -> Option<&EntityRef> {
        if self.source == *reference {
            Some(&self.target)
        } else if self.target == *reference {
            Some(&self.source)
        } else {
            None
        }
    }
}

// =============================================================================
// CONTEXT
// =============================================================================

/// Derived size metrics of a context.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ContextMetrics {
    /// Number of member entities.
    pub entity_count: usize,
    /// Number of member relations.
    pub relation_count: usize,
    /// `r / (n * (n - 1))` for `n > 1`, else `0.0`.
    pub density: f64,
}

impl ContextMetrics {
    /// Recompute metrics from membership counts.
    ///
    /// A context with zero or one entities has no possible directed pairs,
    /// so its density is defined as `0.0`.
    #[must_use]
    pub fn compute(entity_count: usize, relation_count: usize) -> Self {
        let density = if entity_count > 1 {
            relation_count as f64 / (entity_count as f64 * (entity_count as f64 - 1.0))
        } else {
            0.0
        };
        Self {
            entity_count,
            relation_count,
            density,
        }
    }
}

/// A named grouping of entity references and relation ids with temporal
/// validity.
///
/// Membership lists are ordered and distinct. A context whose
/// `properties.protected` is truthy rejects all structural mutation but
/// stays readable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    /// Unique context id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Context type.
    #[serde(rename = "type")]
    pub context_type: String,
    /// Optional longer description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Member entities, ordered, distinct.
    pub entities: Vec<EntityRef>,
    /// Member relation ids, ordered, distinct.
    pub relations: Vec<String>,
    /// Indexed scalar properties.
    #[serde(default)]
    pub properties: PropertyMap,
    /// Optional scope qualifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Optional domain qualifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Validity flag.
    pub valid: bool,
    /// Start of the validity window (inclusive), open when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    /// End of the validity window (inclusive), open when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<DateTime<Utc>>,
    /// Derived membership metrics.
    pub metrics: ContextMetrics,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Context {
    /// Whether `properties.protected` is truthy.
    #[must_use]
    pub fn is_protected(&self) -> bool {
        is_protected_map(&self.properties)
    }

    /// Whether the context is active at time `t` (inclusive window).
    #[must_use]
    pub fn is_active_at(&self, t: DateTime<Utc>) -> bool {
        self.valid
            && self.valid_from.is_none_or(|from| from <= t)
            && self.valid_to.is_none_or(|end| end >= t)
    }

    /// Whether the ref is already a member.
    #[must_use]
    pub fn contains_entity(&self, reference: &EntityRef) -> bool {
        self.entities.contains(reference)
    }

    /// Whether the relation id is already a member.
    #[must_use]
    pub fn contains_relation(&self, relation_id: &str) -> bool {
        self.relations.iter().any(|id| id == relation_id)
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors surfaced by the Corpus stores and traversal layer.
///
/// - No silent failures
/// - Use `Result<T, CorpusError>` for fallible operations
/// - The CORE never panics; all errors are recoverable
///
/// Every variant maps onto one of the boundary error kinds; see
/// [`CorpusError::kind`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CorpusError {
    /// The referenced entity is absent.
    #[error("entity not found: {0}")]
    EntityNotFound(EntityRef),

    /// The referenced relation is absent.
    #[error("relation not found: {0}")]
    RelationNotFound(String),

    /// The referenced context is absent.
    #[error("context not found: {0}")]
    ContextNotFound(String),

    /// A record with the same key already exists.
    #[error("record already exists: {0}")]
    AlreadyExists(String),

    /// Shape or constraint violation on a record.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Mutation blocked by the entity protection flag.
    #[error("entity is protected: {0}")]
    ProtectedEntity(EntityRef),

    /// Mutation blocked by the context protection flag.
    #[error("context is protected: {0}")]
    ProtectedContext(String),

    /// Deletion blocked by the reserved `system.` type prefix.
    #[error("system entity cannot be deleted: {0}")]
    SystemEntity(EntityRef),

    /// Malformed call, e.g. merging fewer than two contexts.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A caller-supplied callback failed inside the store boundary.
    #[error("execution failed: {0}")]
    Execution(String),

    /// An I/O error occurred, e.g. while loading configuration.
    #[error("I/O error: {0}")]
    Io(String),
}

impl CorpusError {
    /// Stable kind discriminant for boundary layers.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EntityNotFound(_) | Self::RelationNotFound(_) | Self::ContextNotFound(_) => {
                "not_found"
            }
            Self::AlreadyExists(_) => "already_exists",
            Self::Validation(_) => "validation_failed",
            Self::ProtectedEntity(_) => "protected_entity",
            Self::ProtectedContext(_) => "protected_context",
            Self::SystemEntity(_) => "system_entity",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Execution(_) => "execution_failed",
            Self::Io(_) => "io_error",
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
