//! Process-wide event bus.
//!
//! The [`EventBus`] fans agent, tool, memory, and retriever transitions out
//! to subscribers. It is constructed explicitly by the host (typically once
//! per process, owned by the [`Runtime`](crate::runtime::Runtime)) and a
//! handle is passed into each agent; there is no global singleton.
//!
//! Delivery is synchronous from the publisher's task, in subscription
//! order; handlers must be non-blocking, since a handler that blocks blocks
//! the publisher. This is the documented contract and preserves causal
//! ordering of events for a given operation.
//!
//! # Hierarchical propagation
//!
//! When an `agent:*` or `tool:*` event carries parent-agent linkage, the bus
//! publishes a second copy re-addressed to the parent's ids with the
//! original agent preserved as `source_agent_id`. Propagation is one level
//! deep per publish; grandparents are reached when the parent's own
//! orchestrator re-publishes under its context.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::history::EventKind;

/// Topic name that receives every published event.
pub const WILDCARD_TOPIC: &str = "*";

/// An event published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    /// Dotted `component:operation` name, e.g. `operation:started`.
    pub name: String,
    /// Category of the event.
    pub kind: EventKind,
    /// Status at publish time, e.g. `running`, `completed`, `error`.
    pub status: String,
    /// Agent the event is addressed to.
    pub agent_id: String,
    /// History entry the event belongs to.
    pub history_entry_id: String,
    /// The agent that originally produced the event, when it was
    /// re-addressed to a parent by hierarchical propagation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_agent_id: Option<String>,
    /// Parent agent id, set on sub-agent events before propagation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_agent_id: Option<String>,
    /// Parent history entry id, set on sub-agent events before propagation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_history_entry_id: Option<String>,
    /// Publish time.
    pub timestamp: DateTime<Utc>,
    /// Free-form payload.
    pub data: Value,
}

impl BusEvent {
    /// Create an event addressed to `(agent_id, history_entry_id)`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        kind: EventKind,
        agent_id: impl Into<String>,
        history_entry_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            status: "running".to_owned(),
            agent_id: agent_id.into(),
            history_entry_id: history_entry_id.into(),
            source_agent_id: None,
            parent_agent_id: None,
            parent_history_entry_id: None,
            timestamp: Utc::now(),
            data: Value::Null,
        }
    }

    /// Set the status.
    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    /// Set the parent linkage used for hierarchical propagation.
    #[must_use]
    pub fn with_parent(
        mut self,
        parent_agent_id: Option<String>,
        parent_history_entry_id: Option<String>,
    ) -> Self {
        self.parent_agent_id = parent_agent_id;
        self.parent_history_entry_id = parent_history_entry_id;
        self
    }

    /// Set the payload.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    fn propagates_to_parent(&self) -> bool {
        (self.name.starts_with("agent:") || self.name.starts_with("tool:"))
            && self.parent_agent_id.is_some()
            && self.parent_history_entry_id.is_some()
    }
}

/// A subscriber callback. Must not block.
pub type EventHandler = Arc<dyn Fn(&BusEvent) + Send + Sync>;

/// Identifier returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Process-wide publish/subscribe fan-out for agent events.
pub struct EventBus {
    subscribers: RwLock<HashMap<String, Vec<(u64, EventHandler)>>>,
    counters: Mutex<HashMap<String, u64>>,
    next_id: AtomicU64,
    hierarchical_history: AtomicBool,
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            hierarchical_history: AtomicBool::new(false),
        }
    }

    /// Opt in to `subagent:created` notifications: when enabled, parents
    /// are notified when a sub-agent creates a history entry. Off by
    /// default.
    pub fn set_hierarchical_history(&self, enabled: bool) {
        self.hierarchical_history.store(enabled, Ordering::SeqCst);
    }

    /// Whether sub-agent entry-creation notifications are enabled.
    #[must_use]
    pub fn hierarchical_history_enabled(&self) -> bool {
        self.hierarchical_history.load(Ordering::SeqCst)
    }

    /// Subscribe to a topic name, or [`WILDCARD_TOPIC`] for everything.
    ///
    /// Topics are event names (`operation:started`, `tool:completed`, …).
    pub fn subscribe(&self, topic: impl Into<String>, handler: EventHandler) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .write()
            .expect("subscriber lock")
            .entry(topic.into())
            .or_default()
            .push((id, handler));
        SubscriptionId(id)
    }

    /// Remove a subscription. Unknown ids are ignored.
    pub fn unsubscribe(&self, subscription: SubscriptionId) {
        let mut map = self.subscribers.write().expect("subscriber lock");
        for handlers in map.values_mut() {
            handlers.retain(|(id, _)| *id != subscription.0);
        }
    }

    /// Publish an event to topic and wildcard subscribers.
    ///
    /// When the event is an `agent:*` or `tool:*` event with parent linkage,
    /// a second event re-addressed to the parent is published as well.
    pub fn publish(&self, event: &BusEvent) {
        trace!(name = %event.name, agent = %event.agent_id, "publishing event");
        self.bump_counter(&event.name);
        self.dispatch(event);

        if event.propagates_to_parent() {
            let parent_agent = event.parent_agent_id.clone().unwrap_or_default();
            let parent_entry = event.parent_history_entry_id.clone().unwrap_or_default();
            let mut propagated = event.clone();
            propagated.source_agent_id = Some(event.agent_id.clone());
            propagated.agent_id = parent_agent;
            propagated.history_entry_id = parent_entry;
            // Parent linkage is consumed by this hop; clearing it bounds
            // propagation to one level per publish.
            propagated.parent_agent_id = None;
            propagated.parent_history_entry_id = None;
            self.bump_counter(&propagated.name);
            self.dispatch(&propagated);
        }
    }

    fn dispatch(&self, event: &BusEvent) {
        let map = self.subscribers.read().expect("subscriber lock");
        if let Some(handlers) = map.get(&event.name) {
            for (_, handler) in handlers {
                handler(event);
            }
        }
        if let Some(handlers) = map.get(WILDCARD_TOPIC) {
            for (_, handler) in handlers {
                handler(event);
            }
        }
    }

    fn bump_counter(&self, name: &str) {
        let mut counters = self.counters.lock().expect("counter lock");
        *counters.entry(name.to_owned()).or_insert(0) += 1;
    }

    /// Number of times an event name has been published.
    #[must_use]
    pub fn emission_count(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .expect("counter lock")
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Snapshot of all emission counters.
    #[must_use]
    pub fn emission_counts(&self) -> HashMap<String, u64> {
        self.counters.lock().expect("counter lock").clone()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topics = self.subscribers.read().expect("subscriber lock").len();
        f.debug_struct("EventBus")
            .field("topics", &topics)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn collector() -> (EventHandler, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let handler: EventHandler = Arc::new(move |event: &BusEvent| {
            seen_clone.lock().unwrap().push(event.name.clone());
        });
        (handler, seen)
    }

    mod delivery {
        use super::*;

        #[test]
        fn topic_subscribers_receive_matching_events() {
            let bus = EventBus::new();
            let (handler, seen) = collector();
            bus.subscribe("tool:started", handler);

            bus.publish(&BusEvent::new("tool:started", EventKind::Tool, "a1", "e1"));
            bus.publish(&BusEvent::new("tool:completed", EventKind::Tool, "a1", "e1"));

            assert_eq!(*seen.lock().unwrap(), ["tool:started"]);
        }

        #[test]
        fn wildcard_receives_everything() {
            let bus = EventBus::new();
            let (handler, seen) = collector();
            bus.subscribe(WILDCARD_TOPIC, handler);

            bus.publish(&BusEvent::new("operation:started", EventKind::Agent, "a1", "e1"));
            bus.publish(&BusEvent::new("memory:persist_failed", EventKind::Memory, "a1", "e1"));

            assert_eq!(seen.lock().unwrap().len(), 2);
        }

        #[test]
        fn handlers_run_in_subscription_order() {
            let bus = EventBus::new();
            let order = Arc::new(Mutex::new(Vec::new()));
            for tag in ["first", "second", "third"] {
                let order = Arc::clone(&order);
                bus.subscribe(
                    "agent:started",
                    Arc::new(move |_| order.lock().unwrap().push(tag)),
                );
            }

            bus.publish(&BusEvent::new("agent:started", EventKind::Agent, "a1", "e1"));
            assert_eq!(*order.lock().unwrap(), ["first", "second", "third"]);
        }

        #[test]
        fn unsubscribe_stops_delivery() {
            let bus = EventBus::new();
            let count = Arc::new(AtomicUsize::new(0));
            let count_clone = Arc::clone(&count);
            let sub = bus.subscribe(
                "tool:started",
                Arc::new(move |_| {
                    count_clone.fetch_add(1, Ordering::SeqCst);
                }),
            );

            bus.publish(&BusEvent::new("tool:started", EventKind::Tool, "a1", "e1"));
            bus.unsubscribe(sub);
            bus.publish(&BusEvent::new("tool:started", EventKind::Tool, "a1", "e1"));

            assert_eq!(count.load(Ordering::SeqCst), 1);
        }
    }

    mod hierarchical {
        use super::*;

        #[test]
        fn sub_agent_events_propagate_one_level() {
            let bus = EventBus::new();
            let seen = Arc::new(Mutex::new(Vec::new()));
            let seen_clone = Arc::clone(&seen);
            bus.subscribe(
                WILDCARD_TOPIC,
                Arc::new(move |event: &BusEvent| {
                    seen_clone
                        .lock()
                        .unwrap()
                        .push((event.agent_id.clone(), event.source_agent_id.clone()));
                }),
            );

            let event = BusEvent::new("tool:completed", EventKind::Tool, "child", "child-entry")
                .with_parent(Some("parent".into()), Some("parent-entry".into()));
            bus.publish(&event);

            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 2);
            assert_eq!(seen[0], ("child".to_owned(), None));
            assert_eq!(seen[1], ("parent".to_owned(), Some("child".to_owned())));
        }

        #[test]
        fn non_hierarchical_kinds_do_not_propagate() {
            let bus = EventBus::new();
            let (handler, seen) = collector();
            bus.subscribe(WILDCARD_TOPIC, handler);

            let event = BusEvent::new("memory:persist_failed", EventKind::Memory, "child", "e1")
                .with_parent(Some("parent".into()), Some("pe".into()));
            bus.publish(&event);

            assert_eq!(seen.lock().unwrap().len(), 1);
        }

        #[test]
        fn missing_parent_entry_disables_propagation() {
            let bus = EventBus::new();
            let (handler, seen) = collector();
            bus.subscribe(WILDCARD_TOPIC, handler);

            let event = BusEvent::new("agent:started", EventKind::Agent, "child", "e1")
                .with_parent(Some("parent".into()), None);
            bus.publish(&event);

            assert_eq!(seen.lock().unwrap().len(), 1);
        }
    }

    mod counters {
        use super::*;

        #[test]
        fn counters_are_monotonic_per_name() {
            let bus = EventBus::new();
            for _ in 0..3 {
                bus.publish(&BusEvent::new("tool:started", EventKind::Tool, "a", "e"));
            }
            bus.publish(&BusEvent::new("tool:completed", EventKind::Tool, "a", "e"));

            assert_eq!(bus.emission_count("tool:started"), 3);
            assert_eq!(bus.emission_count("tool:completed"), 1);
            assert_eq!(bus.emission_count("tool:failed"), 0);
        }

        #[test]
        fn propagated_copies_are_counted() {
            let bus = EventBus::new();
            let event = BusEvent::new("agent:started", EventKind::Agent, "child", "e")
                .with_parent(Some("p".into()), Some("pe".into()));
            bus.publish(&event);
            assert_eq!(bus.emission_count("agent:started"), 2);
        }
    }
}
