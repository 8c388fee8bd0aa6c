//! Engine wiring for the HTTP layer.
//!
//! The queue publishes lifecycle messages on a synchronous bus; a background task
//! drains that subscription into a tokio broadcast channel so every SSE client
//! gets its own async receiver.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::{StreamExt, wrappers::BroadcastStream};

use conductor_core::OwnerId;
use conductor_events::{JobLifecycleEvent, Subscription};
use conductor_infra::Orchestrator;
use conductor_infra::jobs::{
    DefinitionError, JobContext, JobDefinition, JobDefinitionRegistry, JobError, JobRunner,
};

/// How often the lifecycle bridge drains the bus.
const LIFECYCLE_POLL: Duration = Duration::from_millis(25);
const LIFECYCLE_BUFFER: usize = 1024;

pub struct AppServices {
    orchestrator: Orchestrator,
    lifecycle_tx: broadcast::Sender<JobLifecycleEvent>,
    bridge: JoinHandle<()>,
}

impl AppServices {
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn lifecycle_tx(&self) -> &broadcast::Sender<JobLifecycleEvent> {
        &self.lifecycle_tx
    }
}

impl Drop for AppServices {
    fn drop(&mut self) {
        self.bridge.abort();
    }
}

/// Wire the HTTP services around an already built orchestrator.
///
/// Must be called inside a tokio runtime.
pub fn build_services(orchestrator: Orchestrator) -> AppServices {
    let (lifecycle_tx, _) = broadcast::channel(LIFECYCLE_BUFFER);
    let bridge = spawn_lifecycle_bridge(orchestrator.subscribe(), lifecycle_tx.clone());
    AppServices {
        orchestrator,
        lifecycle_tx,
        bridge,
    }
}

fn spawn_lifecycle_bridge(
    subscription: Subscription<JobLifecycleEvent>,
    tx: broadcast::Sender<JobLifecycleEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(LIFECYCLE_POLL);
        loop {
            tick.tick().await;
            for event in subscription.drain() {
                // No SSE clients connected is not an error.
                let _ = tx.send(event);
            }
        }
    })
}

/// SSE stream of lifecycle messages, optionally limited to one owner.
pub fn lifecycle_sse_stream(
    services: Arc<AppServices>,
    owner_id: Option<OwnerId>,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = services.lifecycle_tx().subscribe();
    let stream = BroadcastStream::new(rx).filter_map(move |msg| match msg {
        Ok(event) if owner_id.as_ref().is_none_or(|owner| *owner == event.owner_id) => {
            let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
            Some(Ok(SseEvent::default().event(event.kind.as_str()).data(data)))
        }
        _ => None,
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

/// Job type every deployment ships with: completes with its own payload.
pub const ECHO_JOB_TYPE: &str = "system.echo";

struct EchoRunner;

#[async_trait]
impl JobRunner for EchoRunner {
    async fn run(&self, ctx: JobContext) -> Result<JsonValue, JobError> {
        ctx.set_step("echo");
        Ok(ctx.payload().clone())
    }
}

/// Registry of the job types compiled into the server binary.
pub fn builtin_registry() -> Result<JobDefinitionRegistry, DefinitionError> {
    JobDefinitionRegistry::new().with(JobDefinition::new(ECHO_JOB_TYPE, Arc::new(EchoRunner)))
}
