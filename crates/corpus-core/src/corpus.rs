//! # Corpus Aggregate
//!
//! The explicitly constructed root object owning the three stores.
//!
//! There are no module-level singletons: a `Corpus` is constructed once at
//! process start, passed by reference to every consumer, and dropped at
//! process end. Cross-store operations (endpoint materialization,
//! membership validation, graph projection) are coordinated here so the
//! stores themselves stay single-concern.

use crate::config::CorpusConfig;
use crate::context::{ContextParams, ContextStore, MembershipChange};
use crate::entity::{EntityParams, EntityStore};
use crate::export::{project_context, ProjectedGraph, ProjectionOptions};
use crate::membra::Membra;
use crate::relation::{RelatedEntity, RelatedOptions, RelationParams, RelationStore};
use crate::types::{Context, CorpusError, Entity, EntityRef, Relation};
use serde::Serialize;

/// Summary counts over the whole corpus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CorpusStats {
    pub entity_count: usize,
    pub relation_count: usize,
    pub valid_relation_count: usize,
    pub context_count: usize,
}

/// The aggregate store: entities, relations, contexts, and the traversal
/// layer over them.
///
/// Single-writer: every mutating operation takes `&mut self` and runs to
/// completion (index updates and event emission included) before
/// returning. A multi-threaded host serializes access behind its own
/// exclusive boundary.
#[derive(Debug, Default)]
pub struct Corpus {
    config: CorpusConfig,
    entities: EntityStore,
    relations: RelationStore,
    contexts: ContextStore,
}

impl Corpus {
    /// Construct with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct with explicit configuration (clamped to hard bounds).
    #[must_use]
    pub fn with_config(config: CorpusConfig) -> Self {
        Self {
            config: config.clamped(),
            ..Self::default()
        }
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &CorpusConfig {
        &self.config
    }

    // =========================================================================
    // STORE ACCESS
    // =========================================================================

    #[must_use]
    pub fn entities(&self) -> &EntityStore {
        &self.entities
    }

    #[must_use]
    pub fn entities_mut(&mut self) -> &mut EntityStore {
        &mut self.entities
    }

    #[must_use]
    pub fn relations(&self) -> &RelationStore {
        &self.relations
    }

    #[must_use]
    pub fn relations_mut(&mut self) -> &mut RelationStore {
        &mut self.relations
    }

    #[must_use]
    pub fn contexts(&self) -> &ContextStore {
        &self.contexts
    }

    #[must_use]
    pub fn contexts_mut(&mut self) -> &mut ContextStore {
        &mut self.contexts
    }

    /// Traversal view over the three stores.
    #[must_use]
    pub fn membra(&self) -> Membra<'_> {
        Membra::new(&self.entities, &self.relations, &self.contexts)
    }

    // =========================================================================
    // CROSS-STORE OPERATIONS
    // =========================================================================

    /// Create an entity.
    pub fn create_entity(&mut self, params: EntityParams) -> Result<Entity, CorpusError> {
        self.entities.create(params)
    }

    /// Create a relation, materializing missing endpoints when the
    /// configuration allows it.
    pub fn create_relation(&mut self, params: RelationParams) -> Result<Relation, CorpusError> {
        if !self.config.auto_create_endpoints {
            for endpoint in [&params.source, &params.target] {
                if !self.entities.exists(&endpoint.entity_type, &endpoint.id) {
                    return Err(CorpusError::EntityNotFound(endpoint.clone()));
                }
            }
        }
        self.relations.create(params, &mut self.entities)
    }

    /// Create a context, validating seed membership against the stores.
    pub fn create_context(&mut self, params: ContextParams) -> Result<Context, CorpusError> {
        self.contexts.create(params, &self.entities, &self.relations)
    }

    /// Add entities to a context.
    pub fn add_entities_to_context(
        &mut self,
        context_id: &str,
        refs: &[EntityRef],
    ) -> Result<MembershipChange<EntityRef>, CorpusError> {
        self.contexts.add_entities(context_id, refs, &self.entities)
    }

    /// Remove entities from a context.
    pub fn remove_entities_from_context(
        &mut self,
        context_id: &str,
        refs: &[EntityRef],
    ) -> Result<MembershipChange<EntityRef>, CorpusError> {
        self.contexts.remove_entities(context_id, refs)
    }

    /// Add relations to a context.
    pub fn add_relations_to_context(
        &mut self,
        context_id: &str,
        relation_ids: &[String],
    ) -> Result<MembershipChange<String>, CorpusError> {
        self.contexts
            .add_relations(context_id, relation_ids, &self.relations)
    }

    /// Remove relations from a context.
    pub fn remove_relations_from_context(
        &mut self,
        context_id: &str,
        relation_ids: &[String],
    ) -> Result<MembershipChange<String>, CorpusError> {
        self.contexts.remove_relations(context_id, relation_ids)
    }

    /// Project a context (or a focus entity's neighborhood) into a
    /// generic node/edge graph.
    pub fn export_context_graph(
        &self,
        context_id: &str,
        options: &ProjectionOptions,
    ) -> Result<ProjectedGraph, CorpusError> {
        let Some(context) = self.contexts.get(context_id) else {
            return Err(CorpusError::ContextNotFound(context_id.to_string()));
        };
        Ok(project_context(
            context,
            &self.entities,
            &self.relations,
            options,
        ))
    }

    /// Neighbor expansion from `reference` using the configured default
    /// depth.
    #[must_use]
    pub fn related(&self, reference: &EntityRef) -> Vec<RelatedEntity> {
        self.relations.find_related(
            reference,
            &RelatedOptions::neighbors().with_depth(self.config.default_traversal_depth),
        )
    }

    /// Summary counts.
    #[must_use]
    pub fn stats(&self) -> CorpusStats {
        CorpusStats {
            entity_count: self.entities.count(),
            relation_count: self.relations.count(),
            valid_relation_count: self.relations.valid_count(),
            context_count: self.contexts.count(),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
