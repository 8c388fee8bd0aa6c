//! Engine wiring: one place that assembles the store, queue, dispatcher,
//! governor and provisioner from an [`OrchestratorConfig`].

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use conductor_events::{
    ActionExecutor, EmitResult, EventDispatcher, HandlerSnapshot, InMemoryEventBus,
    JobLifecycleEvent, NoopActionExecutor, RuntimeEvent, SnapshotCell, Subscription,
};

use crate::config::OrchestratorConfig;
use crate::extensions::{
    AuditError, AuditLog, ExtensionGovernor, FileAuditLog, InMemoryAuditLog, ModuleCatalog,
    ReloadError, ReloadSummary, TrustAuditTrail, Version, VersionError,
};
use crate::jobs::{
    DirectExecution, ExecutionHook, FileJobStore, InMemoryJobStore, JobDefinitionRegistry,
    JobStore, JobStoreError, QueueError, QueueManager, RecoveryReport, StopReport,
};
use crate::workers::{SessionBackend, SessionExecution, WorkerSessionProvisioner};

/// Actor recorded in the audit log for the reload performed by `start`.
pub const STARTUP_ACTOR: &str = "startup";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("job store: {0}")]
    Store(#[from] JobStoreError),
    #[error("audit log: {0}")]
    Audit(#[from] AuditError),
    #[error("core version: {0}")]
    Version(#[from] VersionError),
    #[error("queue: {0}")]
    Queue(#[from] QueueError),
}

/// What `start` did.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartReport {
    pub recovery: RecoveryReport,
    /// `None` when the startup reload failed and the empty snapshot stayed active.
    pub extensions: Option<ReloadSummary>,
}

pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    registry: JobDefinitionRegistry,
    catalog: ModuleCatalog,
    store: Option<Arc<dyn JobStore>>,
    audit: Option<Arc<dyn AuditLog>>,
    backend: Option<Arc<dyn SessionBackend>>,
    actions: Option<Arc<dyn ActionExecutor>>,
}

impl OrchestratorBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            registry: JobDefinitionRegistry::new(),
            catalog: ModuleCatalog::new(),
            store: None,
            audit: None,
            backend: None,
            actions: None,
        }
    }

    pub fn with_registry(mut self, registry: JobDefinitionRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_catalog(mut self, catalog: ModuleCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Use `store` instead of the one named by the configuration.
    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_audit_log(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Run job types with a worker binding inside sessions hosted by `backend`.
    pub fn with_session_backend(mut self, backend: Arc<dyn SessionBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_action_executor(mut self, actions: Arc<dyn ActionExecutor>) -> Self {
        self.actions = Some(actions);
        self
    }

    pub fn build(self) -> Result<Orchestrator, OrchestratorError> {
        let config = self.config;
        let core_version: Version = config.core_version.parse()?;

        let store: Arc<dyn JobStore> = match (self.store, &config.store_path) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(FileJobStore::open(path)?),
            (None, None) => InMemoryJobStore::arc(),
        };
        let audit: Arc<dyn AuditLog> = match (self.audit, &config.audit_path) {
            (Some(audit), _) => audit,
            (None, Some(path)) => Arc::new(FileAuditLog::open(path)?),
            (None, None) => Arc::new(InMemoryAuditLog::new()),
        };

        let snapshots = Arc::new(SnapshotCell::new(HandlerSnapshot::empty(config.trust_mode)));
        let governor = Arc::new(
            ExtensionGovernor::new(self.catalog, core_version, snapshots.clone(), audit.clone())
                .with_roots(config.extension_roots.clone())
                .with_trust_mode(config.trust_mode)
                .with_handler_timeout(config.dispatcher.handler_timeout),
        );

        let provisioner = self
            .backend
            .map(|backend| Arc::new(WorkerSessionProvisioner::new(backend)));
        let execution: Arc<dyn ExecutionHook> = match &provisioner {
            Some(provisioner) => Arc::new(SessionExecution::new(provisioner.clone())),
            None => Arc::new(DirectExecution),
        };

        let bus: Arc<InMemoryEventBus<JobLifecycleEvent>> = Arc::new(InMemoryEventBus::new());
        let queue = QueueManager::new(
            store,
            Arc::new(self.registry),
            bus.clone(),
            execution,
            config.queue.clone(),
        );

        let actions = self
            .actions
            .unwrap_or_else(|| Arc::new(NoopActionExecutor) as Arc<dyn ActionExecutor>);
        let dispatcher = Arc::new(
            EventDispatcher::new(snapshots, Arc::new(queue.clone()), actions)
                .with_trust_audit(Arc::new(TrustAuditTrail::new(audit.clone()))),
        );

        Ok(Orchestrator {
            config,
            queue,
            dispatcher,
            governor,
            provisioner,
            bus,
            audit,
        })
    }
}

/// A fully wired engine.
#[derive(Clone)]
pub struct Orchestrator {
    config: OrchestratorConfig,
    queue: QueueManager,
    dispatcher: Arc<EventDispatcher>,
    governor: Arc<ExtensionGovernor>,
    provisioner: Option<Arc<WorkerSessionProvisioner>>,
    bus: Arc<InMemoryEventBus<JobLifecycleEvent>>,
    audit: Arc<dyn AuditLog>,
}

impl Orchestrator {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    /// Load extensions, recover persisted jobs and start scheduling.
    ///
    /// A failed startup reload is logged and leaves the empty snapshot active;
    /// the queue still starts.
    pub fn start(&self) -> Result<StartReport, OrchestratorError> {
        let extensions = match self.governor.reload(STARTUP_ACTOR) {
            Ok(summary) => Some(summary),
            Err(ReloadError::Validation { failures, .. }) => {
                for failure in &failures {
                    error!(module = %failure.module, reason = %failure.reason, "extension not loaded at startup");
                }
                None
            }
            Err(ReloadError::InProgress) => None,
        };
        let recovery = self.queue.start()?;
        info!(
            extensions = extensions.as_ref().map_or(0, |s| s.modules.len()),
            queued = recovery.queued,
            "orchestrator started"
        );
        Ok(StartReport {
            recovery,
            extensions,
        })
    }

    /// Stop the queue with the configured drain budget.
    pub async fn shutdown(&self) -> StopReport {
        self.queue.stop(self.config.queue.drain_budget).await
    }

    pub async fn emit(&self, event: RuntimeEvent) -> Vec<EmitResult> {
        self.dispatcher.emit(event).await
    }

    pub fn subscribe(&self) -> Subscription<JobLifecycleEvent> {
        self.queue.subscribe()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn queue(&self) -> &QueueManager {
        &self.queue
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn governor(&self) -> &Arc<ExtensionGovernor> {
        &self.governor
    }

    pub fn provisioner(&self) -> Option<&Arc<WorkerSessionProvisioner>> {
        self.provisioner.as_ref()
    }

    pub fn event_bus(&self) -> &Arc<InMemoryEventBus<JobLifecycleEvent>> {
        &self.bus
    }

    pub fn audit_log(&self) -> &Arc<dyn AuditLog> {
        &self.audit
    }
}
