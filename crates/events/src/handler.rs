//! Event handler contract.
//!
//! Handlers receive runtime signals and answer with at most one intent. They never
//! perform state-changing side effects themselves: enqueues and actions are handed
//! back to the dispatcher, which executes them under capability checks.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use conductor_core::{JobRequest, OwnerId};

use crate::action::ActionRequest;

/// A named runtime signal (protocol notification, user action, completion event).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeEvent {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<OwnerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default)]
    pub payload: JsonValue,
    pub emitted_at: DateTime<Utc>,
}

impl RuntimeEvent {
    pub fn new(name: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            name: name.into(),
            owner_id: None,
            source_id: None,
            payload,
            emitted_at: Utc::now(),
        }
    }

    pub fn with_owner(mut self, owner_id: OwnerId) -> Self {
        self.owner_id = Some(owner_id);
        self
    }

    pub fn with_source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }
}

/// Per-invocation context handed to a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerContext {
    /// Logical name of the module that registered the handler.
    pub module: String,
    /// Version of the snapshot the handler was loaded in.
    pub snapshot_version: u64,
    /// Position of this invocation in the fanout.
    pub position: usize,
}

/// What a handler asks the dispatcher to do.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutput {
    /// Submit a job to the queue.
    Enqueue(JobRequest),
    /// Execute a state-changing action under capability checks.
    Action(ActionRequest),
    /// A diagnostic value surfaced to the emitter.
    Value(JsonValue),
    Nothing,
}

/// A handler-reported failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),
    #[error("event payload rejected: {0}")]
    InvalidEvent(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Async event handler.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        event: &RuntimeEvent,
        ctx: &HandlerContext,
    ) -> Result<HandlerOutput, HandlerError>;
}

/// Adapter that turns a synchronous closure into an [`EventHandler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&RuntimeEvent, &HandlerContext) -> Result<HandlerOutput, HandlerError>
        + Send
        + Sync
        + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&RuntimeEvent, &HandlerContext) -> Result<HandlerOutput, HandlerError>
        + Send
        + Sync
        + 'static,
{
    async fn handle(
        &self,
        event: &RuntimeEvent,
        ctx: &HandlerContext,
    ) -> Result<HandlerOutput, HandlerError> {
        (self.f)(event, ctx)
    }
}

/// Box a synchronous closure as a shareable handler.
pub fn handler_fn<F>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(&RuntimeEvent, &HandlerContext) -> Result<HandlerOutput, HandlerError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnHandler::new(f))
}
