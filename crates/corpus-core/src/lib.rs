//! # corpus-core
//!
//! The in-memory graph engine for Corpus - THE STORE.
//!
//! This crate implements an indexed store for typed records ("entities"),
//! typed edges between them ("relations"), and named groupings with
//! temporal validity ("contexts"), plus the `membra` traversal layer that
//! answers membership, causal-chain, and inheritance queries across them.
//!
//! ## Architectural Constraints
//!
//! - The stores are the ONLY place where state exists; `membra` is
//!   stateless and read-only
//! - Deterministic: `BTreeMap`-backed storage, index buckets in insertion
//!   order, monotonic generated ids
//! - Single-writer: mutations take `&mut`, run to completion (index
//!   updates and event emission included), and never suspend mid-mutation
//! - No async, no network dependencies (pure Rust)

// =============================================================================
// MODULES
// =============================================================================

pub mod config;
pub mod context;
pub mod corpus;
pub mod entity;
pub mod events;
pub mod export;
mod index;
pub mod membra;
pub mod outcome;
pub mod primitives;
pub mod query;
pub mod relation;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    Context, ContextMetrics, CorpusError, Direction, Entity, EntityRef, EntityStatus,
    PropertyMap, PropertyValue, Relation,
};

// =============================================================================
// RE-EXPORTS: Stores
// =============================================================================

pub use context::{ContextParams, ContextStore, ContextUpdate, MembershipChange};
pub use entity::{EntityParams, EntityStore, EntityUpdate};
pub use relation::{
    RelatedEntity, RelatedOptions, RelationParams, RelationStore, RelationUpdate,
    TraversalDirection,
};

// =============================================================================
// RE-EXPORTS: Traversal
// =============================================================================

pub use membra::{CausalTrace, Membra, CONSEQUENCE_TYPES, INHERENCE_TYPES, MEMBERSHIP_TYPES};

// =============================================================================
// RE-EXPORTS: Aggregate, Projection, Boundary
// =============================================================================

pub use config::CorpusConfig;
pub use corpus::{Corpus, CorpusStats};
pub use events::{EventBus, EventTarget, Listener, StoreEvent};
pub use export::{
    project_context, ProjectedEdge, ProjectedGraph, ProjectedNode, ProjectionOptions,
};
pub use outcome::{Outcome, OutcomeStatus};
pub use query::{ContextQuery, EntityQuery, RelationQuery};
