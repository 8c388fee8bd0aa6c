//! Immutable, versioned handler snapshots and the cell that publishes them.
//!
//! A snapshot is built completely off to the side and then swapped in with a
//! single pointer store. Dispatch reads clone the current `Arc` and keep using
//! that snapshot for the whole fanout, so a concurrent reload never exposes a
//! half-updated subscription set.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;

use conductor_core::SnapshotId;

use crate::handler::EventHandler;
use crate::module::{Capabilities, Registration, TrustMode};

/// One handler bound to one event name.
#[derive(Clone)]
pub struct EventSubscription {
    pub event_name: String,
    pub module: String,
    pub priority: i32,
    pub timeout: Duration,
    pub registration_index: usize,
    pub handler: Arc<dyn EventHandler>,
}

impl EventSubscription {
    /// Dispatch ordering key: `(priority asc, module asc, registration index asc)`.
    pub fn order_key(&self) -> (i32, &str, usize) {
        (self.priority, self.module.as_str(), self.registration_index)
    }
}

impl core::fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventSubscription")
            .field("event_name", &self.event_name)
            .field("module", &self.module)
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .field("registration_index", &self.registration_index)
            .finish_non_exhaustive()
    }
}

/// Metadata of a module that made it into a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadedModule {
    pub name: String,
    pub version: String,
    pub origin: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    pub compatibility: String,
    pub capabilities: Capabilities,
    /// Subscriptions to events the manifest does not declare (allowed outside
    /// enforced mode).
    pub undeclared_events: Vec<String>,
}

/// A module ignored because a higher-precedence root provided the same name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShadowedModule {
    pub name: String,
    pub origin: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    pub shadowed_by: String,
}

/// Immutable set of loaded modules and their subscriptions.
#[derive(Debug)]
pub struct HandlerSnapshot {
    id: SnapshotId,
    version: u64,
    loaded_at: DateTime<Utc>,
    trust_mode: TrustMode,
    modules: Vec<LoadedModule>,
    shadowed: Vec<ShadowedModule>,
    by_event: BTreeMap<String, Vec<EventSubscription>>,
}

impl HandlerSnapshot {
    /// The snapshot active before the first successful load.
    pub fn empty(trust_mode: TrustMode) -> Self {
        Self {
            id: SnapshotId::new(),
            version: 0,
            loaded_at: Utc::now(),
            trust_mode,
            modules: Vec::new(),
            shadowed: Vec::new(),
            by_event: BTreeMap::new(),
        }
    }

    /// Assemble a snapshot, fixing the dispatch order of every event.
    pub fn build(
        version: u64,
        trust_mode: TrustMode,
        default_timeout: Duration,
        modules: Vec<(LoadedModule, Vec<Registration>)>,
        shadowed: Vec<ShadowedModule>,
    ) -> Self {
        let mut by_event: BTreeMap<String, Vec<EventSubscription>> = BTreeMap::new();
        let mut loaded = Vec::with_capacity(modules.len());

        for (module, registrations) in modules {
            for reg in registrations {
                by_event
                    .entry(reg.event.clone())
                    .or_default()
                    .push(EventSubscription {
                        event_name: reg.event,
                        module: module.name.clone(),
                        priority: reg.options.priority,
                        timeout: reg.options.timeout.unwrap_or(default_timeout),
                        registration_index: reg.index,
                        handler: reg.handler,
                    });
            }
            loaded.push(module);
        }

        for subs in by_event.values_mut() {
            subs.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        }
        loaded.sort_by(|a, b| a.name.cmp(&b.name));

        Self {
            id: SnapshotId::new(),
            version,
            loaded_at: Utc::now(),
            trust_mode,
            modules: loaded,
            shadowed,
            by_event,
        }
    }

    pub fn id(&self) -> SnapshotId {
        self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn trust_mode(&self) -> TrustMode {
        self.trust_mode
    }

    pub fn modules(&self) -> &[LoadedModule] {
        &self.modules
    }

    pub fn shadowed(&self) -> &[ShadowedModule] {
        &self.shadowed
    }

    pub fn module(&self, name: &str) -> Option<&LoadedModule> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// Subscriptions for `event_name` in dispatch order.
    pub fn subscriptions_for(&self, event_name: &str) -> &[EventSubscription] {
        self.by_event
            .get(event_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Event names a module is subscribed to in this snapshot.
    pub fn events_of(&self, module: &str) -> Vec<String> {
        self.by_event
            .iter()
            .filter(|(_, subs)| subs.iter().any(|s| s.module == module))
            .map(|(event, _)| event.clone())
            .collect()
    }
}

/// Holder of the active snapshot.
///
/// Writers replace the whole `Arc` with one atomic pointer store; readers take
/// no lock and never observe a partially-built snapshot.
#[derive(Debug)]
pub struct SnapshotCell {
    current: ArcSwap<HandlerSnapshot>,
}

impl SnapshotCell {
    pub fn new(initial: HandlerSnapshot) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
        }
    }

    /// The snapshot active right now.
    pub fn load(&self) -> Arc<HandlerSnapshot> {
        self.current.load_full()
    }

    /// Publish `next`, returning the snapshot it replaced.
    pub fn swap(&self, next: HandlerSnapshot) -> Arc<HandlerSnapshot> {
        self.current.swap(Arc::new(next))
    }
}
