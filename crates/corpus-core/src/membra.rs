//! # Membra — Graph Traversal
//!
//! Read-only algorithms composed over the three stores, in three families
//! mirroring the three relation-type buckets:
//!
//! - **Membership**: which contexts an entity lives in, who shares them
//! - **Consequence**: forward/backward causal chains and causal loops
//! - **Inherence**: multi-parent property inheritance and siblings
//!
//! Every operation takes a relation-type filter (an empty slice selects
//! the built-in vocabulary for that family) and a `max_depth` recursion
//! bound (clamped to `MAX_TRAVERSAL_DEPTH`). Exceeding the bound silently
//! stops expansion. Nothing here mutates a store.

use crate::context::ContextStore;
use crate::entity::EntityStore;
use crate::primitives::MAX_TRAVERSAL_DEPTH;
use crate::relation::RelationStore;
use crate::types::{Context, Entity, EntityRef, PropertyMap, Relation};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// RELATION-TYPE VOCABULARIES
// =============================================================================

/// Default relation types of the Membership family.
pub const MEMBERSHIP_TYPES: &[&str] = &["member_of", "part_of", "belongs_to", "participates_in"];

/// Default relation types of the Consequence family.
pub const CONSEQUENCE_TYPES: &[&str] = &["causes", "leads_to", "results_in", "triggers"];

/// Default relation types of the Inherence family.
pub const INHERENCE_TYPES: &[&str] = &["instance_of", "subtype_of", "inherits_from"];

/// Caller filter, or the family default when the filter is empty.
fn pick<'t>(types: &'t [&'t str], fallback: &'static [&'static str]) -> &'t [&'t str] {
    if types.is_empty() { fallback } else { types }
}

// =============================================================================
// RESULTS
// =============================================================================

/// One entity reached by a causal trace.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CausalTrace {
    /// Snapshot of the reached entity; absent if it dangles.
    pub entity: Option<Entity>,
    /// Ordered relation chain from the start to this entity.
    pub path: Vec<Relation>,
}

// =============================================================================
// TRAVERSAL ENGINE
// =============================================================================

/// Borrowing view over the three stores.
///
/// Construct one per call site (it is two pointers and a reference); it
/// holds the stores immutably, so traversals can never run concurrently
/// with a mutation on the same store.
#[derive(Debug, Clone, Copy)]
pub struct Membra<'a> {
    entities: &'a EntityStore,
    relations: &'a RelationStore,
    contexts: &'a ContextStore,
}

impl<'a> Membra<'a> {
    /// Build a traversal view over the given stores.
    #[must_use]
    pub fn new(
        entities: &'a EntityStore,
        relations: &'a RelationStore,
        contexts: &'a ContextStore,
    ) -> Self {
        Self {
            entities,
            relations,
            contexts,
        }
    }

    // =========================================================================
    // MEMBERSHIP
    // =========================================================================

    /// Contexts containing the entity.
    #[must_use]
    pub fn contexts_of(&self, reference: &EntityRef) -> Vec<Context> {
        self.contexts.find_by_entity(reference)
    }

    /// All distinct entities sharing at least one context with
    /// `reference`, excluding the entity itself.
    #[must_use]
    pub fn co_members_of(&self, reference: &EntityRef) -> Vec<EntityRef> {
        let mut seen = BTreeSet::new();
        let mut members = Vec::new();
        for context in self.contexts.find_by_entity(reference) {
            for member in &context.entities {
                if member != reference && seen.insert(member.key()) {
                    members.push(member.clone());
                }
            }
        }
        members
    }

    /// Contexts containing both entities.
    #[must_use]
    pub fn overlap_of(&self, first: &EntityRef, second: &EntityRef) -> Vec<Context> {
        self.contexts
            .find_by_entity(first)
            .into_iter()
            .filter(|context| context.contains_entity(second))
            .collect()
    }

    // =========================================================================
    // CONSEQUENCE
    // =========================================================================

    /// Entities reachable from `start` over Consequence-type relations,
    /// following edges forward, keyed by ref key.
    ///
    /// Each reached entity appears once, with the relation chain the
    /// depth-first traversal first reached it through. The start itself is
    /// not in the map.
    #[must_use]
    pub fn trace_forward(
        &self,
        start: &EntityRef,
        types: &[&str],
        max_depth: usize,
    ) -> BTreeMap<String, CausalTrace> {
        self.trace(start, types, max_depth, true)
    }

    /// Like [`Membra::trace_forward`], following edges backward toward
    /// causes.
    #[must_use]
    pub fn trace_backward(
        &self,
        start: &EntityRef,
        types: &[&str],
        max_depth: usize,
    ) -> BTreeMap<String, CausalTrace> {
        self.trace(start, types, max_depth, false)
    }

    fn trace(
        &self,
        start: &EntityRef,
        types: &[&str],
        max_depth: usize,
        forward: bool,
    ) -> BTreeMap<String, CausalTrace> {
        let types = pick(types, CONSEQUENCE_TYPES);
        let depth = max_depth.min(MAX_TRAVERSAL_DEPTH);
        let mut traces = BTreeMap::new();
        if depth == 0 {
            return traces;
        }

        let mut visited: BTreeSet<String> = BTreeSet::new();
        visited.insert(start.key());

        // Explicit frame stack reproducing per-neighbor recursion order.
        let mut stack = vec![TraceFrame {
            current: start.clone(),
            path: Vec::new(),
            pending: self.typed_step(start, types, forward).into_iter(),
        }];

        while let Some(frame) = stack.last_mut() {
            let Some(relation) = frame.pending.next() else {
                stack.pop();
                continue;
            };
            let current = frame.current.clone();
            let parent_path = frame.path.clone();

            let Some(other) = relation.other_endpoint(&current).cloned() else {
                continue;
            };
            if !visited.insert(other.key()) {
                continue;
            }

            let mut path = parent_path;
            path.push(relation);
            traces.insert(
                other.key(),
                CausalTrace {
                    entity: self.entities.get_by_ref(&other).cloned(),
                    path: path.clone(),
                },
            );
            if path.len() < depth {
                stack.push(TraceFrame {
                    pending: self.typed_step(&other, types, forward).into_iter(),
                    current: other,
                    path,
                });
            }
        }
        traces
    }

    /// Every chain of Consequence-type relations that leaves `start` and
    /// returns to it.
    ///
    /// Entities other than the start may be revisited within a chain;
    /// relations may not. One loop is reported per distinct relation
    /// chain, so several loops can share most of their edges.
    #[must_use]
    pub fn find_causal_loops(
        &self,
        start: &EntityRef,
        types: &[&str],
        max_depth: usize,
    ) -> Vec<Vec<Relation>> {
        let types = pick(types, CONSEQUENCE_TYPES);
        let depth = max_depth.min(MAX_TRAVERSAL_DEPTH);
        let mut loops = Vec::new();
        if depth == 0 {
            return loops;
        }

        let mut chain: Vec<Relation> = Vec::new();
        let mut used: BTreeSet<String> = BTreeSet::new();
        let mut stack = vec![LoopFrame {
            current: start.clone(),
            pending: self.typed_step(start, types, true).into_iter(),
        }];

        while let Some(frame) = stack.last_mut() {
            let Some(relation) = frame.pending.next() else {
                // Backtrack: leaving this entity releases the relation
                // that led into it.
                stack.pop();
                if let Some(released) = chain.pop() {
                    used.remove(&released.id);
                }
                continue;
            };
            let current = frame.current.clone();

            if used.contains(&relation.id) {
                continue;
            }
            let Some(other) = relation.other_endpoint(&current).cloned() else {
                continue;
            };

            if other == *start {
                let mut closed = chain.clone();
                closed.push(relation);
                loops.push(closed);
                continue;
            }
            if chain.len() + 1 >= depth {
                continue;
            }
            used.insert(relation.id.clone());
            chain.push(relation);
            stack.push(LoopFrame {
                pending: self.typed_step(&other, types, true).into_iter(),
                current: other,
            });
        }
        loops
    }

    fn typed_step(&self, current: &EntityRef, types: &[&str], forward: bool) -> Vec<Relation> {
        let step = if forward {
            self.relations.find_by_source(current, true)
        } else {
            self.relations.find_by_target(current, true)
        };
        step.into_iter()
            .filter(|relation| types.contains(&relation.relation_type.as_str()))
            .collect()
    }

    // =========================================================================
    // INHERENCE
    // =========================================================================

    /// Resolve the entity's effective properties across its inheritance
    /// ancestry.
    ///
    /// Walks Inherence-type relations outward (the relation target is the
    /// parent), collects each ancestor's own properties exactly once, and
    /// merges with child-overrides-parent precedence: the entity's own
    /// properties always win over any ancestor's.
    #[must_use]
    pub fn resolve_inherited_properties(
        &self,
        start: &EntityRef,
        types: &[&str],
        max_depth: usize,
    ) -> PropertyMap {
        let types = pick(types, INHERENCE_TYPES);
        let depth = max_depth.min(MAX_TRAVERSAL_DEPTH);
        let mut visited: BTreeSet<String> = BTreeSet::new();
        visited.insert(start.key());
        self.resolve_ancestry(start, types, depth, &mut visited)
    }

    /// Recursive fold: ancestors first (most distant deepest in the
    /// recursion), own properties layered on top. The visited guard keeps
    /// every ancestor to one contribution and terminates inheritance
    /// cycles; recursion depth is bounded by the clamped `depth_left`.
    fn resolve_ancestry(
        &self,
        current: &EntityRef,
        types: &[&str],
        depth_left: usize,
        visited: &mut BTreeSet<String>,
    ) -> PropertyMap {
        let mut merged = PropertyMap::new();
        if depth_left > 0 {
            for relation in self.typed_step(current, types, true) {
                let Some(parent) = relation.other_endpoint(current).cloned() else {
                    continue;
                };
                if !visited.insert(parent.key()) {
                    continue;
                }
                merged.extend(self.resolve_ancestry(&parent, types, depth_left - 1, visited));
            }
        }
        if let Some(entity) = self.entities.get_by_ref(current) {
            merged.extend(entity.properties.clone());
        }
        merged
    }

    /// All distinct entities sharing at least one Inherence parent with
    /// `reference`, excluding the entity itself.
    #[must_use]
    pub fn find_siblings(&self, reference: &EntityRef, types: &[&str]) -> Vec<Entity> {
        let types = pick(types, INHERENCE_TYPES);
        let mut seen = BTreeSet::new();
        let mut siblings = Vec::new();

        for parent_edge in self.typed_step(reference, types, true) {
            let Some(parent) = parent_edge.other_endpoint(reference).cloned() else {
                continue;
            };
            for child_edge in self.typed_step(&parent, types, false) {
                let Some(child) = child_edge.other_endpoint(&parent).cloned() else {
                    continue;
                };
                if child == *reference || !seen.insert(child.key()) {
                    continue;
                }
                if let Some(entity) = self.entities.get_by_ref(&child) {
                    siblings.push(entity.clone());
                }
            }
        }
        siblings
    }
}

/// One level of the explicit DFS stack in [`Membra::trace`].
struct TraceFrame {
    current: EntityRef,
    path: Vec<Relation>,
    pending: std::vec::IntoIter<Relation>,
}

/// One level of the backtracking stack in [`Membra::find_causal_loops`].
struct LoopFrame {
    current: EntityRef,
    pending: std::vec::IntoIter<Relation>,
}

// =============================================================================
// TESTS
// =============================================================================
