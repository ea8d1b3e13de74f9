//! # Property-Based Tests
//!
//! Invariant checks with proptest over the three stores.
//!
//! These focus on the properties that must hold under arbitrary mutation
//! churn: index correctness, determinism, bounded traversal, and the
//! validity-window predicate.

use chrono::{TimeDelta, Utc};
use corpus_core::{
    ContextMetrics, EntityParams, EntityQuery, EntityStore, EntityUpdate, EntityRef,
    PropertyValue, RelatedOptions, RelationParams, RelationStore, TraversalDirection,
};
use proptest::collection::vec;
use proptest::prelude::*;
use std::collections::BTreeSet;

fn entity_ref(entity_type: &str, id: &str) -> EntityRef {
    EntityRef::new(entity_type, id)
}

proptest! {
    /// The inverted property index answers exactly like a brute-force
    /// scan over current property values, after any create/update churn.
    #[test]
    fn property_index_matches_brute_force(
        assignments in vec((0usize..20, 0usize..5), 1..40)
    ) {
        let mut store = EntityStore::new();
        for (item, value) in &assignments {
            let id = format!("item-{item}");
            let value = format!("value-{value}");
            if store.exists("item", &id) {
                store
                    .update("item", &id, EntityUpdate::new().with_property("role", value))
                    .expect("update");
            } else {
                store
                    .create(EntityParams::new("item", &id, &id).with_property("role", value))
                    .expect("create");
            }
        }

        for value in 0..5usize {
            let needle = PropertyValue::Str(format!("value-{value}"));
            let via_index: BTreeSet<String> = store
                .find_by_property("role", &needle)
                .into_iter()
                .map(|entity| entity.key())
                .collect();
            let brute_force: BTreeSet<String> = store
                .find_by_type("item")
                .into_iter()
                .filter(|entity| entity.properties.get("role") == Some(&needle))
                .map(|entity| entity.key())
                .collect();
            prop_assert_eq!(via_index, brute_force);
        }
    }

    /// Identical mutation sequences produce identical query results.
    #[test]
    fn determinism_identical_input_identical_output(
        ids in vec(0usize..50, 1..30)
    ) {
        let mut first = EntityStore::new();
        let mut second = EntityStore::new();

        for id in &ids {
            let params = EntityParams::new("node", format!("n{id}"), format!("Node {id}"));
            // Duplicates fail identically in both stores.
            let _ = first.create(params.clone());
            let _ = second.create(params);
        }

        let query = EntityQuery::of_type("node");
        let left: Vec<String> = first.query(&query).into_iter().map(|e| e.id).collect();
        let right: Vec<String> = second.query(&query).into_iter().map(|e| e.id).collect();
        prop_assert_eq!(left, right);
        prop_assert_eq!(first.count(), second.count());
    }

    /// Density is `r / (n * (n - 1))` above one entity and `0` otherwise.
    #[test]
    fn density_formula_holds(entities in 0usize..50, relations in 0usize..200) {
        let metrics = ContextMetrics::compute(entities, relations);
        if entities > 1 {
            let expected = relations as f64 / (entities as f64 * (entities as f64 - 1.0));
            prop_assert!((metrics.density - expected).abs() < f64::EPSILON);
        } else {
            prop_assert_eq!(metrics.density, 0.0);
        }
    }

    /// Validity-window boundaries are inclusive on both ends.
    #[test]
    fn active_window_boundaries_inclusive(
        start_offset in -1000i64..1000,
        window in 0i64..1000
    ) {
        let mut relations = RelationStore::new();
        let mut entities = EntityStore::new();

        let from = Utc::now() + TimeDelta::seconds(start_offset);
        let to = from + TimeDelta::seconds(window);
        let relation = relations
            .create(
                RelationParams::new(entity_ref("a", "1"), entity_ref("b", "2"), "t")
                    .with_window(from, Some(to)),
                &mut entities,
            )
            .expect("create");

        prop_assert!(relation.is_active_at(from));
        prop_assert!(relation.is_active_at(to));
        prop_assert!(!relation.is_active_at(from - TimeDelta::seconds(1)));
        prop_assert!(!relation.is_active_at(to + TimeDelta::seconds(1)));
    }

    /// Neighbor expansion never exceeds the requested depth, never
    /// reports the start, and reports each entity at most once.
    #[test]
    fn find_related_is_bounded_and_distinct(
        edges in vec((0usize..8, 0usize..8), 0..30),
        depth in 0usize..6
    ) {
        let mut relations = RelationStore::new();
        let mut entities = EntityStore::new();
        for (source, target) in &edges {
            relations
                .create(
                    RelationParams::new(
                        entity_ref("n", &format!("{source}")),
                        entity_ref("n", &format!("{target}")),
                        "t",
                    ),
                    &mut entities,
                )
                .expect("create");
        }

        let start = entity_ref("n", "0");
        let related = relations.find_related(
            &start,
            &RelatedOptions::neighbors()
                .with_depth(depth)
                .with_direction(TraversalDirection::Outgoing),
        );

        let mut seen = BTreeSet::new();
        for reached in &related {
            prop_assert!(reached.depth <= depth);
            prop_assert!(reached.entity != start);
            prop_assert!(seen.insert(reached.entity.key()));
        }
    }

    /// Deleting an entity leaves no trace in either index.
    #[test]
    fn delete_fully_unindexes(values in vec(0usize..4, 1..10)) {
        let mut store = EntityStore::new();
        for (i, value) in values.iter().enumerate() {
            store
                .create(
                    EntityParams::new("node", format!("n{i}"), format!("Node {i}"))
                        .with_property("bucket", format!("b{value}")),
                )
                .expect("create");
        }

        for i in 0..values.len() {
            store.delete("node", &format!("n{i}")).expect("delete");
        }

        prop_assert_eq!(store.count(), 0);
        prop_assert!(store.find_by_type("node").is_empty());
        for value in 0..4usize {
            let bucket = format!("b{}", value);
            prop_assert!(store
                .find_by_property("bucket", &PropertyValue::Str(bucket))
                .is_empty());
        }
    }
}
