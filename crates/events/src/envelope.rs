//! Typed result envelopes of a dispatcher fanout.
//!
//! Whatever a handler returns (or however it fails) is coerced into exactly one of
//! these variants, so callers of `emit` never inspect untyped handler output.

use serde::Serialize;
use serde_json::Value as JsonValue;

use conductor_core::EnqueueReceipt;

/// Final status of a requested action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Performed,
    AlreadyResolved,
    NotEligible,
    Conflict,
    Failed,
}

impl ActionStatus {
    /// Reconciled outcomes are expected convergence, never failures.
    pub fn is_reconciled(self) -> bool {
        matches!(
            self,
            ActionStatus::AlreadyResolved | ActionStatus::NotEligible | ActionStatus::Conflict
        )
    }
}

/// Why a handler invocation produced no usable output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum HandlerErrorKind {
    /// The handler returned an error.
    Failed,
    /// The handler panicked; the panic was contained.
    Panicked,
    /// The handler exceeded its timeout budget.
    TimedOut { timeout_ms: u64 },
    /// Enforced trust mode rejected an undeclared capability.
    CapabilityDenied { capability: String },
}

/// One envelope per handler invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum EmitResult {
    EnqueueResult {
        module: String,
        job_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        receipt: Option<EnqueueReceipt>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ActionResult {
        module: String,
        action_type: String,
        target: String,
        status: ActionStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<JsonValue>,
    },
    HandlerResult {
        module: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<JsonValue>,
    },
    HandlerError {
        module: String,
        #[serde(flatten)]
        error: HandlerErrorKind,
        message: String,
    },
}

impl EmitResult {
    pub fn module(&self) -> &str {
        match self {
            EmitResult::EnqueueResult { module, .. }
            | EmitResult::ActionResult { module, .. }
            | EmitResult::HandlerResult { module, .. }
            | EmitResult::HandlerError { module, .. } => module,
        }
    }

    pub fn is_handler_error(&self) -> bool {
        matches!(self, EmitResult::HandlerError { .. })
    }

    pub fn action_status(&self) -> Option<ActionStatus> {
        match self {
            EmitResult::ActionResult { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_error_flattens_reason() {
        let env = EmitResult::HandlerError {
            module: "m".into(),
            error: HandlerErrorKind::TimedOut { timeout_ms: 50 },
            message: "timed out".into(),
        };
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["kind"], "handler_error");
        assert_eq!(json["reason"], "timed_out");
        assert_eq!(json["timeoutMs"], 50);
        assert_eq!(json["message"], "timed out");
    }

    #[test]
    fn variant_fields_are_camel_case() {
        let env = EmitResult::ActionResult {
            module: "m".into(),
            action_type: "approval.decide".into(),
            target: "approval:1".into(),
            status: ActionStatus::AlreadyResolved,
            detail: None,
        };
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["kind"], "action_result");
        assert_eq!(json["actionType"], "approval.decide");
        assert_eq!(json["status"], "already_resolved");
        assert!(json.get("action_type").is_none());

        let env = EmitResult::EnqueueResult {
            module: "m".into(),
            job_type: "digest".into(),
            receipt: None,
            error: Some("unknown job type".into()),
        };
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["jobType"], "digest");
        assert!(json.get("job_type").is_none());
    }

    #[test]
    fn reconciled_statuses_are_not_failures() {
        assert!(ActionStatus::AlreadyResolved.is_reconciled());
        assert!(ActionStatus::Conflict.is_reconciled());
        assert!(!ActionStatus::Failed.is_reconciled());
        assert!(!ActionStatus::Performed.is_reconciled());
    }
}
