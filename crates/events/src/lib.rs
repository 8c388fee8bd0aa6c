//! `conductor-events`: runtime signal routing.
//!
//! - **Handler modules** register subscriptions into immutable, versioned snapshots
//! - **The dispatcher** fans one runtime event out to every subscribed handler in a
//!   deterministic order, isolating failures and coercing outputs into typed envelopes
//! - **The lifecycle bus** distributes job transitions to downstream transports

pub mod action;
pub mod bus;
pub mod dispatcher;
pub mod envelope;
pub mod handler;
pub mod in_memory_bus;
pub mod lifecycle;
pub mod module;
pub mod snapshot;

pub use action::{ActionError, ActionExecutor, ActionOutcome, ActionRequest, ActionScope, NoopActionExecutor};
pub use bus::{BusError, EventBus, Subscription};
pub use dispatcher::{CapabilityKind, EventDispatcher, JobSubmitter, TrustAudit, TrustDecision};
pub use envelope::{ActionStatus, EmitResult, HandlerErrorKind};
pub use handler::{
    EventHandler, FnHandler, HandlerContext, HandlerError, HandlerOutput, RuntimeEvent, handler_fn,
};
pub use in_memory_bus::InMemoryEventBus;
pub use lifecycle::{JobLifecycleEvent, LifecycleKind};
pub use module::{Capabilities, HandlerModule, Registrar, Registration, SubscriptionOptions, TrustMode};
pub use snapshot::{EventSubscription, HandlerSnapshot, LoadedModule, ShadowedModule, SnapshotCell};
