use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conductor_core::{JobRequest, OwnerId};
use conductor_events::{
    Capabilities, HandlerError, HandlerModule, HandlerOutput, Registrar, SubscriptionOptions,
    handler_fn,
};
use conductor_infra::extensions::{AuditLog, ExtensionManifest, ModuleCatalog};
use conductor_infra::jobs::{
    DedupePolicy, JobContext, JobDefinition, JobDefinitionRegistry, JobError, JobRunner,
};
use conductor_infra::{Orchestrator, OrchestratorConfig, QueueConfig};
use reqwest::StatusCode;
use serde_json::{Value as JsonValue, json};

struct TestServer {
    base_url: String,
    orchestrator: Orchestrator,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let orchestrator = Orchestrator::builder(
            OrchestratorConfig::default()
                .with_queue(QueueConfig::default().with_idle_poll(Duration::from_millis(10))),
        )
        .with_registry(registry())
        .with_catalog(catalog())
        .build()
        .expect("failed to build orchestrator");
        orchestrator.start().expect("failed to start orchestrator");

        // Build app (same router as prod), but bind to an ephemeral port.
        let app = conductor_api::app::build_app(orchestrator.clone()).await;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            orchestrator,
            handle,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct Echo;

#[async_trait]
impl JobRunner for Echo {
    async fn run(&self, ctx: JobContext) -> Result<JsonValue, JobError> {
        Ok(ctx.payload().clone())
    }
}

/// Runs until canceled.
struct Watch;

#[async_trait]
impl JobRunner for Watch {
    async fn run(&self, ctx: JobContext) -> Result<JsonValue, JobError> {
        ctx.cancelled().await;
        Err(JobError::Canceled)
    }
}

fn registry() -> JobDefinitionRegistry {
    JobDefinitionRegistry::new()
        .with(JobDefinition::new("echo", Arc::new(Echo)))
        .unwrap()
        .with(
            JobDefinition::new("watch", Arc::new(Watch))
                .with_dedupe(DedupePolicy::single_flight(DedupePolicy::field_key("threadId"))),
        )
        .unwrap()
}

/// Turns `turn.completed` into an `echo` job for the event's owner.
struct Relay;

impl HandlerModule for Relay {
    fn register(&self, registrar: &mut Registrar) {
        registrar.on(
            "turn.completed",
            SubscriptionOptions::default(),
            handler_fn(|event, _ctx| {
                let owner = event
                    .owner_id
                    .clone()
                    .ok_or_else(|| HandlerError::failed("owner required"))?;
                Ok(HandlerOutput::Enqueue(JobRequest::new("echo", owner, event.payload.clone())))
            }),
        );
    }
}

fn catalog() -> ModuleCatalog {
    ModuleCatalog::new().with_builtin(
        ExtensionManifest::new("relay", "relay")
            .with_capabilities(Capabilities::new(["turn.completed"], Vec::<String>::new())),
        || Arc::new(Relay) as Arc<dyn HandlerModule>,
    )
}

async fn job_state_eventually(
    client: &reqwest::Client,
    base_url: &str,
    id: &str,
    state: &str,
) -> JsonValue {
    for _ in 0..100 {
        let res = client
            .get(format!("{}/jobs/{}", base_url, id))
            .send()
            .await
            .unwrap();
        let job: JsonValue = res.json().await.unwrap();
        if job["state"] == state {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {id} did not reach {state} within timeout");
}

#[tokio::test]
async fn health_reports_queue_stats() {
    let srv = TestServer::spawn().await;

    let res = reqwest::get(format!("{}/health", srv.base_url)).await.unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let body: JsonValue = res.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["queue"]["queued"], 0);
}

#[tokio::test]
async fn submitted_job_runs_to_completion() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/jobs", srv.base_url))
        .json(&json!({ "type": "echo", "ownerId": "p1", "payload": { "hello": "world" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let created: JsonValue = res.json().await.unwrap();
    assert_eq!(created["status"], "queued");
    let id = created["jobId"].as_str().unwrap().to_string();

    let job = job_state_eventually(&client, &srv.base_url, &id, "completed").await;
    assert_eq!(job["result"], json!({ "hello": "world" }));
    assert_eq!(job["attempts"], 1);
}

#[tokio::test]
async fn duplicate_submission_returns_the_in_flight_job() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let body = json!({ "type": "watch", "ownerId": "p1", "payload": { "threadId": "t-1" } });

    let first: JsonValue = client
        .post(format!("{}/jobs", srv.base_url))
        .json(&body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let res = client
        .post(format!("{}/jobs", srv.base_url))
        .json(&body)
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let second: JsonValue = res.json().await.unwrap();
    assert_eq!(second["status"], "already_queued");
    assert_eq!(second["dedupeOutcome"], "single_flight");
    assert_eq!(second["jobId"], first["jobId"]);
}

#[tokio::test]
async fn rejected_submissions_map_to_client_errors() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/jobs", srv.base_url))
        .json(&json!({ "type": "nope", "ownerId": "p1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: JsonValue = res.json().await.unwrap();
    assert_eq!(body["error"], "unknown_job_type");

    let res = client
        .post(format!("{}/jobs", srv.base_url))
        .json(&json!({ "type": "echo", "ownerId": "  " }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_and_malformed_job_ids() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .get(format!("{}/jobs/{}", srv.base_url, conductor_core::JobId::new()))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client
        .get(format!("{}/jobs/not-a-uuid", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .post(format!("{}/jobs/{}/cancel", srv.base_url, conductor_core::JobId::new()))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancel_then_cancel_again_conflicts() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let created: JsonValue = client
        .post(format!("{}/jobs", srv.base_url))
        .json(&json!({ "type": "watch", "ownerId": "p1", "payload": { "threadId": "t-2" } }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = created["jobId"].as_str().unwrap().to_string();
    job_state_eventually(&client, &srv.base_url, &id, "running").await;

    let res = client
        .post(format!("{}/jobs/{}/cancel", srv.base_url, id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let canceled: JsonValue = res.json().await.unwrap();
    assert_eq!(canceled["state"], "canceled");
    assert_eq!(canceled["cancelReason"], "requested");

    let res = client
        .post(format!("{}/jobs/{}/cancel", srv.base_url, id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn list_filters_by_owner_and_state() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    for (owner, thread) in [("p1", "a"), ("p1", "b"), ("p2", "c")] {
        let res = client
            .post(format!("{}/jobs", srv.base_url))
            .json(&json!({ "type": "watch", "ownerId": owner, "payload": { "threadId": thread } }))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
    }

    let body: JsonValue = client
        .get(format!("{}/jobs?owner_id=p1", srv.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["jobs"].as_array().unwrap().len(), 2);

    let body: JsonValue = client
        .get(format!("{}/jobs?owner_id=p2&state=completed", srv.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(body["jobs"].as_array().unwrap().is_empty());

    let res = client
        .get(format!("{}/jobs?state=sleeping", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn signals_fan_out_into_jobs() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/signals/turn.completed", srv.base_url))
        .json(&json!({ "ownerId": "p1", "payload": { "turn": 7 } }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: JsonValue = res.json().await.unwrap();
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["kind"], "enqueue_result");
    assert_eq!(results[0]["module"], "relay");
    let id = results[0]["receipt"]["jobId"].as_str().unwrap().to_string();

    let job = job_state_eventually(&client, &srv.base_url, &id, "completed").await;
    assert_eq!(job["result"], json!({ "turn": 7 }));

    // No owner: the handler fails, and the failure is reported rather than raised.
    let body: JsonValue = client
        .post(format!("{}/signals/turn.completed", srv.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["results"][0]["kind"], "handler_error");

    let body: JsonValue = client
        .post(format!("{}/signals/nobody.listens", srv.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(body["results"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn extensions_inventory_and_reload() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let inventory: JsonValue = client
        .get(format!("{}/extensions", srv.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(inventory["version"], 1);
    assert_eq!(inventory["modules"][0]["name"], "relay");
    assert_eq!(inventory["modules"][0]["origin"], "builtin");

    let res = client
        .post(format!("{}/extensions/reload", srv.base_url))
        .json(&json!({ "actor": "operator" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let summary: JsonValue = res.json().await.unwrap();
    assert_eq!(summary["version"], 2);

    let records = srv.orchestrator.audit_log().records().unwrap();
    assert_eq!(records.last().unwrap().actor, "operator");
}

#[tokio::test]
async fn lifecycle_stream_delivers_transitions() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let mut stream = client
        .get(format!("{}/jobs/stream?owner_id=p9", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(stream.status(), StatusCode::OK);

    let owner = OwnerId::parse("p9").unwrap();
    srv.orchestrator
        .queue()
        .enqueue(JobRequest::new("echo", owner, json!({})))
        .unwrap();

    let mut seen = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !seen.contains("event: job_completed") {
        let chunk = tokio::time::timeout_at(deadline, stream.chunk())
            .await
            .expect("no lifecycle event within timeout")
            .unwrap()
            .expect("stream ended");
        seen.push_str(&String::from_utf8_lossy(&chunk));
    }

    assert!(seen.contains("event: job_queued"));
    assert!(seen.contains("\"ownerId\":\"p9\""));
}
