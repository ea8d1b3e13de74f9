//! # Store Events
//!
//! Synchronous change notification for the three stores.
//!
//! - Listeners fire in subscription order, after the mutation commits
//! - Delivery is in-process and best-effort
//! - A panicking listener is isolated: the panic is caught, logged, and
//!   delivery continues with the next listener

use crate::types::{Context, Entity, Relation};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

// =============================================================================
// EVENT NAMES
// =============================================================================

/// Canonical event names emitted by the stores.
pub mod names {
    pub const ENTITY_CREATED: &str = "entity.created";
    pub const ENTITY_UPDATED: &str = "entity.updated";
    pub const ENTITY_STATUS_CHANGED: &str = "entity.status_changed";
    pub const ENTITY_DELETED: &str = "entity.deleted";

    pub const RELATION_CREATED: &str = "relation.created";
    pub const RELATION_UPDATED: &str = "relation.updated";
    pub const RELATION_INVALIDATED: &str = "relation.invalidated";
    pub const RELATION_DELETED: &str = "relation.deleted";

    pub const CONTEXT_CREATED: &str = "context.created";
    pub const CONTEXT_UPDATED: &str = "context.updated";
    pub const CONTEXT_ENTITIES_ADDED: &str = "context.entities_added";
    pub const CONTEXT_ENTITIES_REMOVED: &str = "context.entities_removed";
    pub const CONTEXT_RELATIONS_ADDED: &str = "context.relations_added";
    pub const CONTEXT_RELATIONS_REMOVED: &str = "context.relations_removed";
    pub const CONTEXT_DELETED: &str = "context.deleted";
    pub const CONTEXT_MERGED: &str = "context.merged";
}

// =============================================================================
// EVENT PAYLOAD
// =============================================================================

/// Snapshot of the record a store event refers to.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventTarget {
    Entity(Entity),
    Relation(Relation),
    Context(Context),
}

impl EventTarget {
    /// Record kind discriminant, carried as the event `type` field.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Entity(_) => "entity",
            Self::Relation(_) => "relation",
            Self::Context(_) => "context",
        }
    }
}

/// An event emitted by a store after a committed mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreEvent {
    /// Event name, e.g. `entity.created`.
    pub name: String,
    /// Record kind: `entity`, `relation`, or `context`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Snapshot of the record after the mutation.
    pub target: EventTarget,
    /// Optional event-specific attachment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Emission timestamp.
    pub timestamp: DateTime<Utc>,
}

impl StoreEvent {
    /// Build an event around a record snapshot, stamped now.
    #[must_use]
    pub fn new(name: &str, target: EventTarget, data: Option<serde_json::Value>) -> Self {
        Self {
            name: name.to_string(),
            kind: target.kind().to_string(),
            target,
            data,
            timestamp: Utc::now(),
        }
    }
}

// =============================================================================
// EVENT BUS
// =============================================================================

/// A subscribed listener.
pub type Listener = Box<dyn Fn(&StoreEvent) + Send + Sync>;

/// Synchronous, in-order event delivery to subscribed listeners.
///
/// The bus holds no queue: `emit` runs every listener to completion before
/// returning, so callers observe events strictly after the mutation that
/// produced them.
#[derive(Default)]
pub struct EventBus {
    listeners: Vec<Listener>,
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a listener. Listeners fire in subscription order.
    pub fn subscribe(&mut self, listener: Listener) {
        self.listeners.push(listener);
    }

    /// Number of subscribed listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Deliver an event to every listener.
    ///
    /// Each invocation is isolated: a panicking listener cannot prevent
    /// delivery to the listeners after it.
    pub fn emit(&self, event: &StoreEvent) {
        for (index, listener) in self.listeners.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                tracing::warn!(
                    event = %event.name,
                    listener = index,
                    "event listener panicked; continuing delivery"
                );
            }
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityStatus, PropertyMap};
    use std::sync::{Arc, Mutex};

    fn make_entity() -> Entity {
        let now = Utc::now();
        Entity {
            id: "1".into(),
            entity_type: "thing".into(),
            name: "Thing".into(),
            description: None,
            properties: PropertyMap::new(),
            payload: None,
            status: EntityStatus::Active,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn listeners_fire_in_subscription_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();

        for tag in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            bus.subscribe(Box::new(move |_| {
                seen.lock().expect("lock").push(tag);
            }));
        }

        bus.emit(&StoreEvent::new(
            names::ENTITY_CREATED,
            EventTarget::Entity(make_entity()),
            None,
        ));

        assert_eq!(
            seen.lock().expect("lock").clone(),
            vec!["first", "second", "third"]
        );
    }

    #[test]
    fn panicking_listener_does_not_block_delivery() {
        let seen = Arc::new(Mutex::new(0usize));
        let mut bus = EventBus::new();

        bus.subscribe(Box::new(|_| {
            // Deliberate failure in the middle of the chain.
            #[allow(clippy::panic)]
            {
                panic!("listener failure");
            }
        }));
        {
            let seen = Arc::clone(&seen);
            bus.subscribe(Box::new(move |_| {
                *seen.lock().expect("lock") += 1;
            }));
        }

        bus.emit(&StoreEvent::new(
            names::ENTITY_UPDATED,
            EventTarget::Entity(make_entity()),
            None,
        ));

        assert_eq!(*seen.lock().expect("lock"), 1);
    }

    #[test]
    fn event_kind_matches_target() {
        let event = StoreEvent::new(
            names::ENTITY_CREATED,
            EventTarget::Entity(make_entity()),
            None,
        );
        assert_eq!(event.kind, "entity");
    }
}
