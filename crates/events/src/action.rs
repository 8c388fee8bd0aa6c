//! Action intents and the executor seam that performs them.
//!
//! An action is a state-changing side effect on some target (an approval, a pending
//! decision). Handlers only *request* actions; the dispatcher checks capabilities,
//! applies first-wins reconciliation and then calls the [`ActionExecutor`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use conductor_core::OwnerId;

/// A side-effect intent returned by a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    /// Capability name, e.g. `approval.decide`.
    pub action_type: String,
    /// Identity of the thing being acted on; first-wins is keyed by this.
    pub target: String,
    /// Owner the target belongs to, when the handler knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<OwnerId>,
    #[serde(default)]
    pub params: JsonValue,
}

impl ActionRequest {
    pub fn new(action_type: impl Into<String>, target: impl Into<String>, params: JsonValue) -> Self {
        Self {
            action_type: action_type.into(),
            target: target.into(),
            owner_id: None,
            params,
        }
    }

    pub fn for_owner(mut self, owner_id: OwnerId) -> Self {
        self.owner_id = Some(owner_id);
        self
    }
}

/// Who is acting, on behalf of which event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionScope {
    pub module: String,
    pub event_name: String,
    pub event_owner: Option<OwnerId>,
}

/// Outcome of an attempted action.
///
/// Everything except `Performed` is a reconciled, non-fatal outcome: the target
/// converged without this attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionOutcome {
    Performed {
        #[serde(default, skip_serializing_if = "JsonValue::is_null")]
        detail: JsonValue,
    },
    AlreadyResolved,
    NotEligible,
    Conflict,
}

impl ActionOutcome {
    pub fn performed(detail: JsonValue) -> Self {
        Self::Performed { detail }
    }

    pub fn is_performed(&self) -> bool {
        matches!(self, ActionOutcome::Performed { .. })
    }
}

/// A genuine failure while executing an action (not a reconciliation).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("unsupported action type '{0}'")]
    Unsupported(String),
    #[error("action failed: {0}")]
    Failed(String),
}

/// Performs actions on behalf of the dispatcher.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(
        &self,
        request: &ActionRequest,
        scope: &ActionScope,
    ) -> Result<ActionOutcome, ActionError>;
}

/// Executor for deployments without an action backend: every action is
/// reconciled as not eligible.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopActionExecutor;

#[async_trait]
impl ActionExecutor for NoopActionExecutor {
    async fn execute(
        &self,
        _request: &ActionRequest,
        _scope: &ActionScope,
    ) -> Result<ActionOutcome, ActionError> {
        Ok(ActionOutcome::NotEligible)
    }
}
