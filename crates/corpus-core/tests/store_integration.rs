//! # Cross-Store Integration Tests
//!
//! End-to-end flows exercising the three stores and the traversal layer
//! through the `Corpus` aggregate.

use corpus_core::{
    ContextParams, Corpus, CorpusError, EntityParams, EntityRef, EntityUpdate, Outcome,
    ProjectionOptions, PropertyValue, RelationParams,
};
use std::sync::{Arc, Mutex};

fn r(entity_type: &str, id: &str) -> EntityRef {
    EntityRef::new(entity_type, id)
}

#[test]
fn document_lifecycle_end_to_end() {
    let mut corpus = Corpus::new();

    corpus
        .create_entity(EntityParams::new("user.Person", "123", "Alice"))
        .expect("create author");
    let authored = corpus
        .create_relation(RelationParams::new(
            r("user.Person", "123"),
            r("document.Article", "456"),
            "created_by",
        ))
        .expect("create relation");

    // The article was auto-materialized; exactly one relation each way.
    assert!(corpus.entities().exists("document.Article", "456"));
    assert_eq!(
        corpus
            .relations()
            .find_by_source(&r("user.Person", "123"), true),
        vec![authored.clone()]
    );
    assert_eq!(
        corpus
            .relations()
            .find_by_target(&r("document.Article", "456"), true),
        vec![authored.clone()]
    );

    // Group both into a context and look at it through membra.
    let context = corpus
        .create_context(
            ContextParams::new("workspace", "Publishing")
                .with_entities(vec![r("user.Person", "123"), r("document.Article", "456")])
                .with_relations(vec![authored.id.clone()]),
        )
        .expect("create context");

    let membra = corpus.membra();
    assert_eq!(membra.contexts_of(&r("user.Person", "123")).len(), 1);
    assert_eq!(
        membra.co_members_of(&r("user.Person", "123")),
        vec![r("document.Article", "456")]
    );
    assert_eq!(
        membra
            .overlap_of(&r("user.Person", "123"), &r("document.Article", "456"))
            .len(),
        1
    );

    // Project for downstream consumers: labels come from entity names.
    let graph = corpus
        .export_context_graph(&context.id, &ProjectionOptions::whole())
        .expect("export");
    assert_eq!(graph.nodes.len(), 2);
    assert_eq!(graph.nodes[0].label, "Alice");
    assert_eq!(graph.edges.len(), 1);

    // Deleting the author does not cascade; the relation dangles and the
    // caller detects that through the entity store.
    corpus
        .entities_mut()
        .delete("user.Person", "123")
        .expect("delete");
    assert!(corpus.relations().get(&authored.id).is_some());
    assert!(!corpus.entities().exists("user.Person", "123"));
}

#[test]
fn causal_chain_and_loops_through_membra() {
    let mut corpus = Corpus::new();
    for (source, target) in [("a", "b"), ("b", "c"), ("c", "a")] {
        corpus
            .create_relation(RelationParams::new(
                r("event", source),
                r("event", target),
                "causes",
            ))
            .expect("create");
    }

    let membra = corpus.membra();
    let forward = membra.trace_forward(&r("event", "a"), &[], 10);
    assert_eq!(forward.len(), 2);
    assert_eq!(forward.get("event:c").expect("trace").path.len(), 2);

    let backward = membra.trace_backward(&r("event", "a"), &[], 10);
    assert_eq!(backward.len(), 2);

    let loops = membra.find_causal_loops(&r("event", "a"), &[], 10);
    assert_eq!(loops.len(), 1);
    assert_eq!(loops[0].len(), 3);
    assert_eq!(loops[0][0].source, r("event", "a"));
    assert_eq!(loops[0][2].target, r("event", "a"));
}

#[test]
fn inheritance_resolution_through_membra() {
    let mut corpus = Corpus::new();
    corpus
        .create_entity(EntityParams::new("concept", "a", "A").with_property("x", 1i64))
        .expect("create");
    corpus
        .create_entity(
            EntityParams::new("concept", "b", "B")
                .with_property("x", 2i64)
                .with_property("y", 2i64),
        )
        .expect("create");
    corpus
        .create_entity(
            EntityParams::new("concept", "c", "C")
                .with_property("y", 3i64)
                .with_property("z", 3i64),
        )
        .expect("create");
    corpus
        .create_relation(RelationParams::new(
            r("concept", "a"),
            r("concept", "b"),
            "instance_of",
        ))
        .expect("create");
    corpus
        .create_relation(RelationParams::new(
            r("concept", "b"),
            r("concept", "c"),
            "instance_of",
        ))
        .expect("create");

    let membra = corpus.membra();
    let resolved = membra.resolve_inherited_properties(&r("concept", "a"), &[], 10);
    assert_eq!(resolved.get("x"), Some(&PropertyValue::Int(1)));
    assert_eq!(resolved.get("y"), Some(&PropertyValue::Int(2)));
    assert_eq!(resolved.get("z"), Some(&PropertyValue::Int(3)));
}

#[test]
fn protection_rules_hold_across_the_boundary() {
    let mut corpus = Corpus::new();
    corpus
        .create_entity(
            EntityParams::new("vault", "keys", "Keys").with_property("protected", true),
        )
        .expect("create");

    // Protected entity: update without the override flag fails, and the
    // failure converts into the boundary envelope.
    let result = corpus
        .entities_mut()
        .update("vault", "keys", EntityUpdate::new().rename("Exposed"));
    let outcome = Outcome::from(result);
    assert!(!outcome.is_success());
    assert_eq!(outcome.kind, Some("protected_entity"));

    // System entity: deletion always fails.
    corpus
        .create_entity(EntityParams::new("system.registry", "root", "Root"))
        .expect("create");
    assert!(matches!(
        corpus.entities_mut().delete("system.registry", "root"),
        Err(CorpusError::SystemEntity(_))
    ));

    // System context: immutable even with the override flag.
    assert!(matches!(
        corpus.contexts_mut().delete("system"),
        Err(CorpusError::ProtectedContext(_))
    ));
}

#[test]
fn events_fire_in_order_across_stores() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut corpus = Corpus::new();

    {
        let log = Arc::clone(&log);
        corpus.entities_mut().subscribe(Box::new(move |event| {
            log.lock().expect("lock").push(event.name.clone());
        }));
    }
    {
        let log = Arc::clone(&log);
        corpus.relations_mut().subscribe(Box::new(move |event| {
            log.lock().expect("lock").push(event.name.clone());
        }));
    }
    {
        let log = Arc::clone(&log);
        corpus.contexts_mut().subscribe(Box::new(move |event| {
            log.lock().expect("lock").push(event.name.clone());
        }));
    }

    corpus
        .create_relation(RelationParams::new(r("n", "a"), r("n", "b"), "linked_to"))
        .expect("create");
    let context = corpus
        .create_context(ContextParams::new("group", "G"))
        .expect("create");
    corpus
        .add_entities_to_context(&context.id, &[r("n", "a")])
        .expect("add");

    assert_eq!(
        log.lock().expect("lock").clone(),
        vec![
            "entity.created",   // endpoint a materialized
            "entity.created",   // endpoint b materialized
            "relation.created",
            "context.created",
            "context.entities_added",
        ]
    );
}

#[test]
fn invalidated_relations_leave_active_traversals() {
    let mut corpus = Corpus::new();
    let relation = corpus
        .create_relation(RelationParams::new(r("n", "a"), r("n", "b"), "causes"))
        .expect("create");

    let before = corpus.membra().trace_forward(&r("n", "a"), &[], 10);
    assert_eq!(before.len(), 1);

    corpus
        .relations_mut()
        .invalidate(&relation.id, "retracted")
        .expect("invalidate");

    let after = corpus.membra().trace_forward(&r("n", "a"), &[], 10);
    assert!(after.is_empty());
    assert_eq!(
        corpus
            .relations()
            .get(&relation.id)
            .and_then(|rel| rel.invalidation_reason.as_deref()),
        Some("retracted")
    );
}
