//! Event dispatcher: deterministic fanout of runtime signals to handler modules.
//!
//! ## Dispatch pipeline
//!
//! ```text
//! emit(event)
//!   ↓
//! 1. Load the active snapshot (one Arc clone; reloads never tear a fanout)
//!   ↓
//! 2. For each subscription, in (priority, module, registration index) order:
//!      invoke the handler on its own task, bounded by its timeout
//!   ↓
//! 3. Coerce the outcome into one EmitResult envelope:
//!      Enqueue  → JobSubmitter     → enqueue_result
//!      Action   → trust + scope + first-wins → ActionExecutor → action_result
//!      Value    → handler_result
//!      Err / panic / timeout       → handler_error
//! ```
//!
//! A failing handler only ever produces its own `handler_error`; the rest of the
//! fanout still runs. The submitter and action executor calls a handler's output
//! triggers are bounded by that handler's timeout as well.
//!
//! ## First-wins
//!
//! Within one emit pass, the first *performed* action on a target wins. Later
//! attempts on the same target are reconciled to `already_resolved` without
//! reaching the executor, so a human decision and an automated handler racing for
//! the same approval converge instead of double-applying.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use conductor_core::{EnqueueReceipt, JobRequest};

use crate::action::{ActionExecutor, ActionOutcome, ActionRequest, ActionScope};
use crate::envelope::{ActionStatus, EmitResult, HandlerErrorKind};
use crate::handler::{HandlerContext, HandlerOutput, RuntimeEvent};
use crate::module::TrustMode;
use crate::snapshot::{EventSubscription, HandlerSnapshot, SnapshotCell};

/// Receives enqueue requests produced by handlers.
#[async_trait]
pub trait JobSubmitter: Send + Sync {
    async fn submit(&self, request: JobRequest) -> Result<EnqueueReceipt, String>;
}

/// Which kind of capability a trust decision concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Event,
    Action,
}

/// A trust-mode decision about undeclared capability use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustDecision {
    pub module: String,
    pub mode: TrustMode,
    pub capability_kind: CapabilityKind,
    pub capability: String,
    pub allowed: bool,
    pub at: DateTime<Utc>,
}

/// Sink for trust decisions (typically the audit log).
pub trait TrustAudit: Send + Sync {
    fn record(&self, decision: &TrustDecision);
}

/// Fans runtime events out to the active snapshot's handlers.
pub struct EventDispatcher {
    snapshots: Arc<SnapshotCell>,
    submitter: Arc<dyn JobSubmitter>,
    actions: Arc<dyn ActionExecutor>,
    trust_audit: Option<Arc<dyn TrustAudit>>,
}

impl EventDispatcher {
    pub fn new(
        snapshots: Arc<SnapshotCell>,
        submitter: Arc<dyn JobSubmitter>,
        actions: Arc<dyn ActionExecutor>,
    ) -> Self {
        Self {
            snapshots,
            submitter,
            actions,
            trust_audit: None,
        }
    }

    pub fn with_trust_audit(mut self, audit: Arc<dyn TrustAudit>) -> Self {
        self.trust_audit = Some(audit);
        self
    }

    pub fn snapshots(&self) -> &Arc<SnapshotCell> {
        &self.snapshots
    }

    /// Invoke every handler subscribed to `event.name` and collect one envelope each.
    pub async fn emit(&self, event: RuntimeEvent) -> Vec<EmitResult> {
        let snapshot = self.snapshots.load();
        let subscriptions = snapshot.subscriptions_for(&event.name);
        if subscriptions.is_empty() {
            debug!(event = %event.name, "no subscribers");
            return Vec::new();
        }

        let event = Arc::new(event);
        let mut resolved: HashMap<String, String> = HashMap::new();
        let mut results = Vec::with_capacity(subscriptions.len());

        for (position, sub) in subscriptions.iter().enumerate() {
            let ctx = HandlerContext {
                module: sub.module.clone(),
                snapshot_version: snapshot.version(),
                position,
            };

            let envelope = match invoke_isolated(sub, Arc::clone(&event), ctx).await {
                Ok(HandlerOutput::Enqueue(request)) => self.submit(sub, request).await,
                Ok(HandlerOutput::Action(request)) => {
                    self.perform(&snapshot, sub, &event, request, &mut resolved)
                        .await
                }
                Ok(HandlerOutput::Value(value)) => EmitResult::HandlerResult {
                    module: sub.module.clone(),
                    value: Some(value),
                },
                Ok(HandlerOutput::Nothing) => EmitResult::HandlerResult {
                    module: sub.module.clone(),
                    value: None,
                },
                Err(envelope) => envelope,
            };

            results.push(envelope);
        }

        debug!(
            event = %event.name,
            snapshot_version = snapshot.version(),
            handlers = results.len(),
            "event dispatched"
        );
        results
    }

    async fn submit(&self, sub: &EventSubscription, request: JobRequest) -> EmitResult {
        let job_type = request.job_type.clone();
        let submitted = tokio::time::timeout(sub.timeout, self.submitter.submit(request))
            .await
            .unwrap_or_else(|_| Err(format!("enqueue exceeded {}ms", duration_ms(sub.timeout))));
        match submitted {
            Ok(receipt) => EmitResult::EnqueueResult {
                module: sub.module.clone(),
                job_type,
                receipt: Some(receipt),
                error: None,
            },
            Err(error) => {
                warn!(module = %sub.module, job_type = %job_type, error = %error, "handler enqueue rejected");
                EmitResult::EnqueueResult {
                    module: sub.module.clone(),
                    job_type,
                    receipt: None,
                    error: Some(error),
                }
            }
        }
    }

    async fn perform(
        &self,
        snapshot: &HandlerSnapshot,
        sub: &EventSubscription,
        event: &RuntimeEvent,
        request: ActionRequest,
        resolved: &mut HashMap<String, String>,
    ) -> EmitResult {
        let declared = snapshot
            .module(&sub.module)
            .map(|m| m.capabilities.declares_action(&request.action_type))
            .unwrap_or(false);

        if !declared {
            let mode = snapshot.trust_mode();
            match mode {
                TrustMode::Disabled => {}
                TrustMode::Warn => {
                    warn!(
                        module = %sub.module,
                        action_type = %request.action_type,
                        "module used an undeclared action"
                    );
                    self.record_trust(&sub.module, mode, &request.action_type, true);
                }
                TrustMode::Enforced => {
                    self.record_trust(&sub.module, mode, &request.action_type, false);
                    return EmitResult::HandlerError {
                        module: sub.module.clone(),
                        error: HandlerErrorKind::CapabilityDenied {
                            capability: format!("action:{}", request.action_type),
                        },
                        message: format!(
                            "module '{}' did not declare action '{}'",
                            sub.module, request.action_type
                        ),
                    };
                }
            }
        }

        let action_result = |status: ActionStatus, detail: Option<serde_json::Value>| {
            EmitResult::ActionResult {
                module: sub.module.clone(),
                action_type: request.action_type.clone(),
                target: request.target.clone(),
                status,
                detail,
            }
        };

        if let (Some(target_owner), Some(event_owner)) = (&request.owner_id, &event.owner_id) {
            if target_owner != event_owner {
                return action_result(
                    ActionStatus::NotEligible,
                    Some(json!({ "reason": "owner_scope_mismatch" })),
                );
            }
        }

        if let Some(winner) = resolved.get(&request.target) {
            return action_result(
                ActionStatus::AlreadyResolved,
                Some(json!({ "resolvedBy": winner })),
            );
        }

        let scope = ActionScope {
            module: sub.module.clone(),
            event_name: event.name.clone(),
            event_owner: event.owner_id.clone(),
        };

        let executed =
            match tokio::time::timeout(sub.timeout, self.actions.execute(&request, &scope)).await {
                Ok(executed) => executed,
                Err(_) => {
                    warn!(
                        module = %sub.module,
                        action_type = %request.action_type,
                        timeout_ms = duration_ms(sub.timeout),
                        "action timed out"
                    );
                    return action_result(
                        ActionStatus::Failed,
                        Some(json!({ "error": "timed_out", "timeoutMs": duration_ms(sub.timeout) })),
                    );
                }
            };
        match executed {
            Ok(ActionOutcome::Performed { detail }) => {
                resolved.insert(request.target.clone(), sub.module.clone());
                let detail = (!detail.is_null()).then_some(detail);
                action_result(ActionStatus::Performed, detail)
            }
            Ok(ActionOutcome::AlreadyResolved) => action_result(ActionStatus::AlreadyResolved, None),
            Ok(ActionOutcome::NotEligible) => action_result(ActionStatus::NotEligible, None),
            Ok(ActionOutcome::Conflict) => action_result(ActionStatus::Conflict, None),
            Err(err) => {
                warn!(module = %sub.module, action_type = %request.action_type, error = %err, "action failed");
                action_result(ActionStatus::Failed, Some(json!({ "error": err.to_string() })))
            }
        }
    }

    fn record_trust(&self, module: &str, mode: TrustMode, action_type: &str, allowed: bool) {
        if let Some(audit) = &self.trust_audit {
            audit.record(&TrustDecision {
                module: module.to_string(),
                mode,
                capability_kind: CapabilityKind::Action,
                capability: action_type.to_string(),
                allowed,
                at: Utc::now(),
            });
        }
    }
}

/// Run one handler on its own task, bounded by the subscription's timeout.
///
/// Errors, panics and timeouts come back as a ready-made `handler_error` envelope.
async fn invoke_isolated(
    sub: &EventSubscription,
    event: Arc<RuntimeEvent>,
    ctx: HandlerContext,
) -> Result<HandlerOutput, EmitResult> {
    let handler = Arc::clone(&sub.handler);
    let task = tokio::spawn(async move { handler.handle(&event, &ctx).await });
    let abort = task.abort_handle();

    let handler_error = |error: HandlerErrorKind, message: String| EmitResult::HandlerError {
        module: sub.module.clone(),
        error,
        message,
    };

    match tokio::time::timeout(sub.timeout, task).await {
        Ok(Ok(Ok(output))) => Ok(output),
        Ok(Ok(Err(err))) => {
            warn!(module = %sub.module, event = %sub.event_name, error = %err, "handler failed");
            Err(handler_error(HandlerErrorKind::Failed, err.to_string()))
        }
        Ok(Err(join_err)) => {
            warn!(module = %sub.module, event = %sub.event_name, "handler panicked");
            Err(handler_error(HandlerErrorKind::Panicked, panic_message(join_err)))
        }
        Err(_) => {
            abort.abort();
            warn!(
                module = %sub.module,
                event = %sub.event_name,
                timeout_ms = duration_ms(sub.timeout),
                "handler timed out"
            );
            Err(handler_error(
                HandlerErrorKind::TimedOut {
                    timeout_ms: duration_ms(sub.timeout),
                },
                format!("handler exceeded {}ms", duration_ms(sub.timeout)),
            ))
        }
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return "handler task was cancelled".to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use conductor_core::{DedupeOutcome, JobId, OwnerId};
    use serde_json::Value as JsonValue;

    use super::*;
    use crate::action::ActionError;
    use crate::handler::{EventHandler, HandlerError, handler_fn};
    use crate::module::{Capabilities, Registrar, Registration, SubscriptionOptions};
    use crate::snapshot::LoadedModule;

    #[derive(Default)]
    struct RecordingSubmitter {
        requests: Mutex<Vec<JobRequest>>,
    }

    #[async_trait]
    impl JobSubmitter for RecordingSubmitter {
        async fn submit(&self, request: JobRequest) -> Result<EnqueueReceipt, String> {
            if request.job_type == "rejected" {
                return Err("unknown job type 'rejected'".to_string());
            }
            self.requests.lock().unwrap().push(request);
            Ok(EnqueueReceipt::new(JobId::new(), DedupeOutcome::Admitted))
        }
    }

    #[derive(Default)]
    struct CountingExecutor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ActionExecutor for CountingExecutor {
        async fn execute(
            &self,
            request: &ActionRequest,
            _scope: &ActionScope,
        ) -> Result<ActionOutcome, ActionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if request.action_type == "broken" {
                return Err(ActionError::Failed("backend down".into()));
            }
            Ok(ActionOutcome::performed(json!({ "target": request.target })))
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl EventHandler for SlowHandler {
        async fn handle(
            &self,
            _event: &RuntimeEvent,
            _ctx: &HandlerContext,
        ) -> Result<HandlerOutput, HandlerError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(HandlerOutput::Nothing)
        }
    }

    fn module(name: &str, actions: &[&str]) -> LoadedModule {
        LoadedModule {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            origin: "builtin".to_string(),
            source: None,
            compatibility: "*".to_string(),
            capabilities: Capabilities::new(["*"], actions.iter().copied()),
            undeclared_events: Vec::new(),
        }
    }

    fn one(event: &str, priority: i32, handler: Arc<dyn EventHandler>) -> Vec<Registration> {
        let mut r = Registrar::new();
        r.on(
            event,
            SubscriptionOptions::default()
                .with_priority(priority)
                .with_timeout(Duration::from_millis(100)),
            handler,
        );
        r.into_registrations()
    }

    fn dispatcher(
        trust_mode: TrustMode,
        modules: Vec<(LoadedModule, Vec<Registration>)>,
    ) -> (EventDispatcher, Arc<RecordingSubmitter>, Arc<CountingExecutor>) {
        let snapshot =
            HandlerSnapshot::build(1, trust_mode, Duration::from_secs(1), modules, Vec::new());
        let cell = Arc::new(SnapshotCell::new(snapshot));
        let submitter = Arc::new(RecordingSubmitter::default());
        let executor = Arc::new(CountingExecutor::default());
        let dispatcher = EventDispatcher::new(cell, submitter.clone(), executor.clone());
        (dispatcher, submitter, executor)
    }

    fn value(v: JsonValue) -> Arc<dyn EventHandler> {
        handler_fn(move |_, _| Ok(HandlerOutput::Value(v.clone())))
    }

    #[tokio::test]
    async fn no_subscribers_yields_no_envelopes() {
        let (d, _, _) = dispatcher(TrustMode::Warn, Vec::new());
        assert!(d.emit(RuntimeEvent::new("nothing", json!({}))).await.is_empty());
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_siblings() {
        let (d, _, _) = dispatcher(
            TrustMode::Warn,
            vec![
                (module("a", &[]), one("turn.completed", 1, value(json!(1)))),
                (
                    module("b", &[]),
                    one(
                        "turn.completed",
                        2,
                        handler_fn(|_, _| Err(HandlerError::failed("boom"))),
                    ),
                ),
                (module("c", &[]), one("turn.completed", 3, value(json!(3)))),
            ],
        );

        let results = d.emit(RuntimeEvent::new("turn.completed", json!({}))).await;

        assert_eq!(results.len(), 3);
        assert!(matches!(&results[0], EmitResult::HandlerResult { value: Some(v), .. } if v == &json!(1)));
        assert!(matches!(
            &results[1],
            EmitResult::HandlerError { error: HandlerErrorKind::Failed, message, .. } if message == "boom"
        ));
        assert!(matches!(&results[2], EmitResult::HandlerResult { value: Some(v), .. } if v == &json!(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_times_out_without_blocking_the_fanout() {
        let (d, _, _) = dispatcher(
            TrustMode::Warn,
            vec![
                (module("slow", &[]), one("e", 1, Arc::new(SlowHandler))),
                (module("fast", &[]), one("e", 2, value(json!("ok")))),
            ],
        );

        let results = d.emit(RuntimeEvent::new("e", json!({}))).await;

        assert!(matches!(
            &results[0],
            EmitResult::HandlerError { error: HandlerErrorKind::TimedOut { timeout_ms: 100 }, .. }
        ));
        assert_eq!(results[1].module(), "fast");
        assert!(!results[1].is_handler_error());
    }

    #[tokio::test]
    async fn panicking_handler_is_contained() {
        let (d, _, _) = dispatcher(
            TrustMode::Warn,
            vec![
                (
                    module("p", &[]),
                    one("e", 1, handler_fn(|_, _| panic!("handler exploded"))),
                ),
                (module("q", &[]), one("e", 2, value(json!(true)))),
            ],
        );

        let results = d.emit(RuntimeEvent::new("e", json!({}))).await;

        assert!(matches!(
            &results[0],
            EmitResult::HandlerError { error: HandlerErrorKind::Panicked, message, .. } if message.contains("exploded")
        ));
        assert!(!results[1].is_handler_error());
    }

    #[tokio::test]
    async fn enqueue_requests_reach_the_submitter() {
        let owner = OwnerId::parse("p1").unwrap();
        let request = JobRequest::new("suggest_reply", owner.clone(), json!({"threadId": "t"}));
        let emitted = request.clone();
        let (d, submitter, _) = dispatcher(
            TrustMode::Warn,
            vec![
                (
                    module("a", &[]),
                    one("e", 1, handler_fn(move |_, _| Ok(HandlerOutput::Enqueue(emitted.clone())))),
                ),
                (
                    module("b", &[]),
                    one(
                        "e",
                        2,
                        handler_fn(move |_, _| {
                            Ok(HandlerOutput::Enqueue(JobRequest::new(
                                "rejected",
                                OwnerId::parse("p1").unwrap(),
                                json!({}),
                            )))
                        }),
                    ),
                ),
            ],
        );

        let results = d.emit(RuntimeEvent::new("e", json!({}))).await;

        assert_eq!(submitter.requests.lock().unwrap().as_slice(), &[request]);
        assert!(matches!(&results[0], EmitResult::EnqueueResult { receipt: Some(_), error: None, .. }));
        assert!(matches!(&results[1], EmitResult::EnqueueResult { receipt: None, error: Some(_), .. }));
    }

    #[tokio::test]
    async fn first_successful_action_wins_and_later_attempts_reconcile() {
        let decide = |_: &RuntimeEvent, _: &HandlerContext| {
            Ok(HandlerOutput::Action(ActionRequest::new(
                "approval.decide",
                "approval-1",
                json!({"decision": "accept"}),
            )))
        };
        let (d, _, executor) = dispatcher(
            TrustMode::Enforced,
            vec![
                (module("human", &["approval.decide"]), one("e", 1, handler_fn(decide))),
                (module("auto", &["approval.decide"]), one("e", 2, handler_fn(decide))),
            ],
        );

        let results = d.emit(RuntimeEvent::new("e", json!({}))).await;

        assert_eq!(results[0].action_status(), Some(ActionStatus::Performed));
        assert_eq!(results[1].action_status(), Some(ActionStatus::AlreadyResolved));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_action_does_not_claim_the_target() {
        let broken = |_: &RuntimeEvent, _: &HandlerContext| {
            Ok(HandlerOutput::Action(ActionRequest::new("broken", "t-1", json!({}))))
        };
        let good = |_: &RuntimeEvent, _: &HandlerContext| {
            Ok(HandlerOutput::Action(ActionRequest::new("approval.decide", "t-1", json!({}))))
        };
        let (d, _, executor) = dispatcher(
            TrustMode::Disabled,
            vec![
                (module("a", &[]), one("e", 1, handler_fn(broken))),
                (module("b", &[]), one("e", 2, handler_fn(good))),
            ],
        );

        let results = d.emit(RuntimeEvent::new("e", json!({}))).await;

        assert_eq!(results[0].action_status(), Some(ActionStatus::Failed));
        assert_eq!(results[1].action_status(), Some(ActionStatus::Performed));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn enforced_mode_denies_undeclared_actions() {
        struct Recorder(Mutex<Vec<TrustDecision>>);
        impl TrustAudit for Recorder {
            fn record(&self, decision: &TrustDecision) {
                self.0.lock().unwrap().push(decision.clone());
            }
        }

        let act = |_: &RuntimeEvent, _: &HandlerContext| {
            Ok(HandlerOutput::Action(ActionRequest::new("approval.decide", "x", json!({}))))
        };
        let (d, _, executor) =
            dispatcher(TrustMode::Enforced, vec![(module("m", &[]), one("e", 1, handler_fn(act)))]);
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let d = d.with_trust_audit(recorder.clone());

        let results = d.emit(RuntimeEvent::new("e", json!({}))).await;

        assert!(matches!(
            &results[0],
            EmitResult::HandlerError { error: HandlerErrorKind::CapabilityDenied { capability }, .. }
                if capability == "action:approval.decide"
        ));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
        let decisions = recorder.0.lock().unwrap();
        assert_eq!(decisions.len(), 1);
        assert!(!decisions[0].allowed);
    }

    #[tokio::test]
    async fn warn_mode_allows_undeclared_actions() {
        let act = |_: &RuntimeEvent, _: &HandlerContext| {
            Ok(HandlerOutput::Action(ActionRequest::new("approval.decide", "x", json!({}))))
        };
        let (d, _, executor) =
            dispatcher(TrustMode::Warn, vec![(module("m", &[]), one("e", 1, handler_fn(act)))]);

        let results = d.emit(RuntimeEvent::new("e", json!({}))).await;

        assert_eq!(results[0].action_status(), Some(ActionStatus::Performed));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn actions_outside_the_event_owner_are_not_eligible() {
        let act = |_: &RuntimeEvent, _: &HandlerContext| {
            Ok(HandlerOutput::Action(
                ActionRequest::new("approval.decide", "x", json!({}))
                    .for_owner(OwnerId::parse("other").unwrap()),
            ))
        };
        let (d, _, executor) = dispatcher(
            TrustMode::Warn,
            vec![(module("m", &["approval.decide"]), one("e", 1, handler_fn(act)))],
        );

        let event = RuntimeEvent::new("e", json!({})).with_owner(OwnerId::parse("mine").unwrap());
        let results = d.emit(event).await;

        assert_eq!(results[0].action_status(), Some(ActionStatus::NotEligible));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    struct HangingSubmitter;

    #[async_trait]
    impl JobSubmitter for HangingSubmitter {
        async fn submit(&self, _request: JobRequest) -> Result<EnqueueReceipt, String> {
            std::future::pending().await
        }
    }

    struct HangingExecutor;

    #[async_trait]
    impl ActionExecutor for HangingExecutor {
        async fn execute(
            &self,
            _request: &ActionRequest,
            _scope: &ActionScope,
        ) -> Result<ActionOutcome, ActionError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_submitter_and_executor_are_bounded_by_the_handler_timeout() {
        let enqueue = |_: &RuntimeEvent, _: &HandlerContext| {
            Ok(HandlerOutput::Enqueue(JobRequest::new(
                "digest",
                OwnerId::parse("p1").unwrap(),
                json!({}),
            )))
        };
        let decide = |_: &RuntimeEvent, _: &HandlerContext| {
            Ok(HandlerOutput::Action(ActionRequest::new("approval.decide", "a-1", json!({}))))
        };
        let snapshot = HandlerSnapshot::build(
            1,
            TrustMode::Warn,
            Duration::from_secs(1),
            vec![
                (module("queue", &[]), one("e", 1, handler_fn(enqueue))),
                (module("act", &["approval.decide"]), one("e", 2, handler_fn(decide))),
                (module("after", &[]), one("e", 3, value(json!("still runs")))),
            ],
            Vec::new(),
        );
        let d = EventDispatcher::new(
            Arc::new(SnapshotCell::new(snapshot)),
            Arc::new(HangingSubmitter),
            Arc::new(HangingExecutor),
        );

        let results = d.emit(RuntimeEvent::new("e", json!({}))).await;

        assert!(matches!(
            &results[0],
            EmitResult::EnqueueResult { receipt: None, error: Some(e), .. } if e.contains("100ms")
        ));
        assert_eq!(results[1].action_status(), Some(ActionStatus::Failed));
        assert!(matches!(&results[2], EmitResult::HandlerResult { value: Some(v), .. } if v == &json!("still runs")));
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        fn runtime() -> tokio::runtime::Runtime {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap()
        }

        proptest! {
            #[test]
            fn dispatch_order_is_stable_across_emissions(
                specs in proptest::collection::vec((0i32..4, 0usize..5), 1..8)
            ) {
                let modules = specs
                    .iter()
                    .enumerate()
                    .map(|(i, (priority, name))| {
                        let tag = format!("m{name}-{i}");
                        (module(&format!("m{name}-{i}"), &[]), one("e", *priority, value(json!(tag))))
                    })
                    .collect();
                let (d, _, _) = dispatcher(TrustMode::Warn, modules);
                let rt = runtime();

                let first: Vec<String> = rt
                    .block_on(d.emit(RuntimeEvent::new("e", json!({}))))
                    .iter()
                    .map(|r| r.module().to_string())
                    .collect();
                let second: Vec<String> = rt
                    .block_on(d.emit(RuntimeEvent::new("e", json!({}))))
                    .iter()
                    .map(|r| r.module().to_string())
                    .collect();

                prop_assert_eq!(&first, &second);
                prop_assert_eq!(first.len(), specs.len());
            }

            #[test]
            fn one_failing_handler_leaves_the_rest_intact(n in 2usize..8, failing in 0usize..8) {
                let failing = failing % n;
                let modules = (0..n)
                    .map(|i| {
                        let handler = if i == failing {
                            handler_fn(|_, _| Err(HandlerError::failed("nope")))
                        } else {
                            value(json!(i))
                        };
                        (module(&format!("m{i}"), &[]), one("e", i as i32, handler))
                    })
                    .collect();
                let (d, _, _) = dispatcher(TrustMode::Warn, modules);

                let results = runtime().block_on(d.emit(RuntimeEvent::new("e", json!({}))));

                prop_assert_eq!(results.len(), n);
                prop_assert_eq!(results.iter().filter(|r| r.is_handler_error()).count(), 1);
                prop_assert!(results[failing].is_handler_error());
            }
        }
    }
}
