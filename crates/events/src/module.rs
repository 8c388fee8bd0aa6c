//! Handler modules, their capability manifests and trust modes.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::handler::EventHandler;

/// Declared capability manifest of a module.
///
/// `events` lists the event names the module may subscribe to, `actions` the
/// action types it may request. A single `*` entry declares everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub events: BTreeSet<String>,
    #[serde(default)]
    pub actions: BTreeSet<String>,
}

impl Capabilities {
    pub fn new<E, A>(events: E, actions: A) -> Self
    where
        E: IntoIterator,
        E::Item: Into<String>,
        A: IntoIterator,
        A::Item: Into<String>,
    {
        Self {
            events: events.into_iter().map(Into::into).collect(),
            actions: actions.into_iter().map(Into::into).collect(),
        }
    }

    pub fn declares_event(&self, event: &str) -> bool {
        self.events.contains("*") || self.events.contains(event)
    }

    pub fn declares_action(&self, action_type: &str) -> bool {
        self.actions.contains("*") || self.actions.contains(action_type)
    }

    /// Names that are blank or padded are never valid declarations.
    pub fn malformed_entries(&self) -> Vec<String> {
        self.events
            .iter()
            .chain(self.actions.iter())
            .filter(|name| name.trim().is_empty() || name.trim() != name.as_str())
            .cloned()
            .collect()
    }
}

/// How undeclared capability use is treated.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustMode {
    /// Undeclared use is ignored.
    Disabled,
    /// Undeclared use is allowed and logged.
    #[default]
    Warn,
    /// Undeclared use is denied with a typed rejection.
    Enforced,
}

impl TrustMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TrustMode::Disabled => "disabled",
            TrustMode::Warn => "warn",
            TrustMode::Enforced => "enforced",
        }
    }
}

impl core::str::FromStr for TrustMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" | "off" => Ok(TrustMode::Disabled),
            "warn" => Ok(TrustMode::Warn),
            "enforced" | "enforce" => Ok(TrustMode::Enforced),
            other => Err(format!("unknown trust mode '{other}'")),
        }
    }
}

impl core::fmt::Display for TrustMode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-subscription options chosen by the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// Lower runs first.
    pub priority: i32,
    /// Overrides the dispatcher's default handler timeout.
    pub timeout: Option<Duration>,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            priority: 100,
            timeout: None,
        }
    }
}

impl SubscriptionOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A subscription recorded while a module registers itself.
#[derive(Clone)]
pub struct Registration {
    pub event: String,
    pub options: SubscriptionOptions,
    pub index: usize,
    pub handler: Arc<dyn EventHandler>,
}

impl core::fmt::Debug for Registration {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Registration")
            .field("event", &self.event)
            .field("options", &self.options)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

/// Collects a module's subscriptions in registration order.
#[derive(Debug, Default)]
pub struct Registrar {
    registrations: Vec<Registration>,
}

impl Registrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `handler` to `event`.
    pub fn on(
        &mut self,
        event: impl Into<String>,
        options: SubscriptionOptions,
        handler: Arc<dyn EventHandler>,
    ) -> &mut Self {
        let index = self.registrations.len();
        self.registrations.push(Registration {
            event: event.into(),
            options,
            index,
            handler,
        });
        self
    }

    pub fn into_registrations(self) -> Vec<Registration> {
        self.registrations
    }
}

/// A loadable unit of handlers.
///
/// Modules are instantiated fresh on every reload; `register` must be
/// deterministic so repeated loads produce identical subscription sets.
pub trait HandlerModule: Send + Sync {
    fn register(&self, registrar: &mut Registrar);
}
