//! # Graph Projection
//!
//! Projects a context's membership (or a single entity's bounded
//! neighborhood) into a generic node/edge structure for downstream
//! visualization and query-generation layers.
//!
//! - Node ids are ref keys; labels resolve to the entity's name through
//!   the entity store, falling back to the ref id for dangling members
//! - Edges resolve through the relation store; missing relation ids are
//!   skipped
//! - Duplicate nodes and edges are skipped

use crate::entity::EntityStore;
use crate::relation::{RelatedOptions, RelationStore, TraversalDirection};
use crate::types::{Context, EntityRef, Relation};
use serde::Serialize;
use std::collections::BTreeSet;

// =============================================================================
// PROJECTION SHAPES
// =============================================================================

/// One node of a projected graph.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectedNode {
    /// Ref key of the entity, `"{type}:{id}"`.
    pub id: String,
    /// Display label: the entity's name, or the ref id if it dangles.
    pub label: String,
    /// Entity type.
    #[serde(rename = "type")]
    pub entity_type: String,
}

/// One edge of a projected graph.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectedEdge {
    /// Relation id.
    pub id: String,
    /// Ref key of the source endpoint.
    pub source: String,
    /// Ref key of the target endpoint.
    pub target: String,
    /// Display label: the relation type.
    pub label: String,
    /// Edge strength.
    pub strength: f64,
}

/// A generic node/edge graph consumed by downstream layers.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct ProjectedGraph {
    pub nodes: Vec<ProjectedNode>,
    pub edges: Vec<ProjectedEdge>,
}

impl ProjectedGraph {
    /// Whether the projection holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }
}

/// Options for [`project_context`].
#[derive(Debug, Clone, Default)]
pub struct ProjectionOptions {
    /// When set, project this entity's bounded neighborhood instead of
    /// the context membership.
    pub focus: Option<EntityRef>,
    /// Hop bound for the focus neighborhood; `1` when unset.
    pub depth: Option<usize>,
}

impl ProjectionOptions {
    /// Project the whole context.
    #[must_use]
    pub fn whole() -> Self {
        Self::default()
    }

    /// Project one entity's neighborhood.
    #[must_use]
    pub fn around(reference: EntityRef, depth: usize) -> Self {
        Self {
            focus: Some(reference),
            depth: Some(depth),
        }
    }
}

// =============================================================================
// PROJECTION
// =============================================================================

/// Project a context into a generic node/edge graph.
///
/// Without a focus, every member entity becomes a node and every member
/// relation becomes an edge (endpoint nodes are added as needed). With a
/// focus, the projection covers the focus entity's neighborhood up to the
/// requested depth over the relation store.
#[must_use]
pub fn project_context(
    context: &Context,
    entities: &EntityStore,
    relations: &RelationStore,
    options: &ProjectionOptions,
) -> ProjectedGraph {
    match &options.focus {
        Some(focus) => project_neighborhood(focus, options.depth.unwrap_or(1), entities, relations),
        None => project_membership(context, entities, relations),
    }
}

fn project_membership(
    context: &Context,
    entities: &EntityStore,
    relations: &RelationStore,
) -> ProjectedGraph {
    let mut graph = ProjectedGraph::default();
    let mut node_ids = BTreeSet::new();
    let mut edge_ids = BTreeSet::new();

    for reference in &context.entities {
        push_node(&mut graph, &mut node_ids, reference, entities);
    }
    for relation_id in &context.relations {
        let Some(relation) = relations.get(relation_id) else {
            continue;
        };
        push_edge(&mut graph, &mut edge_ids, relation);
        // Endpoints outside the membership list still need nodes.
        push_node(&mut graph, &mut node_ids, &relation.source, entities);
        push_node(&mut graph, &mut node_ids, &relation.target, entities);
    }
    graph
}

fn project_neighborhood(
    focus: &EntityRef,
    depth: usize,
    entities: &EntityStore,
    relations: &RelationStore,
) -> ProjectedGraph {
    let mut graph = ProjectedGraph::default();
    let mut node_ids = BTreeSet::new();
    let mut edge_ids = BTreeSet::new();

    push_node(&mut graph, &mut node_ids, focus, entities);
    let related = relations.find_related(
        focus,
        &RelatedOptions::neighbors()
            .with_depth(depth)
            .with_direction(TraversalDirection::Both),
    );
    for reached in related {
        push_node(&mut graph, &mut node_ids, &reached.entity, entities);
        if let Some(relation) = relations.get(&reached.relation_id) {
            push_edge(&mut graph, &mut edge_ids, relation);
        }
    }
    graph
}

fn push_node(
    graph: &mut ProjectedGraph,
    node_ids: &mut BTreeSet<String>,
    reference: &EntityRef,
    entities: &EntityStore,
) {
    let key = reference.key();
    if !node_ids.insert(key.clone()) {
        return;
    }
    let label = entities
        .get_by_ref(reference)
        .map_or_else(|| reference.id.clone(), |entity| entity.name.clone());
    graph.nodes.push(ProjectedNode {
        id: key,
        label,
        entity_type: reference.entity_type.clone(),
    });
}

fn push_edge(graph: &mut ProjectedGraph, edge_ids: &mut BTreeSet<String>, relation: &Relation) {
    if !edge_ids.insert(relation.id.clone()) {
        return;
    }
    graph.edges.push(ProjectedEdge {
        id: relation.id.clone(),
        source: relation.source.key(),
        target: relation.target.key(),
        label: relation.relation_type.clone(),
        strength: relation.strength,
    });
}

// =============================================================================
// TESTS
// =============================================================================
