//! Execution hook that runs bound job types inside worker sessions.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::jobs::{DirectExecution, ExecutionHook, JobContext, JobDefinition, JobError};

use super::provisioner::{ProvisionError, WorkerSessionHandle, WorkerSessionProvisioner};

/// Resolves a worker session for definitions with a [`WorkerBinding`] and
/// runs the attempt against it.
///
/// A "target gone" failure (from provisioning or from the runner) clears the
/// mapping and triggers exactly one reprovision-and-retry; a second one is fatal.
/// Definitions without a binding run in-process.
///
/// [`WorkerBinding`]: crate::jobs::WorkerBinding
#[derive(Clone)]
pub struct SessionExecution {
    provisioner: Arc<WorkerSessionProvisioner>,
}

impl SessionExecution {
    pub fn new(provisioner: Arc<WorkerSessionProvisioner>) -> Self {
        Self { provisioner }
    }

    pub fn provisioner(&self) -> &Arc<WorkerSessionProvisioner> {
        &self.provisioner
    }

    async fn resolve(
        &self,
        definition: &JobDefinition,
        ctx: &JobContext,
    ) -> Result<WorkerSessionHandle, ProvisionError> {
        let Some(binding) = &definition.worker else {
            return Err(ProvisionError::Backend("job type has no worker binding".into()));
        };
        self.provisioner
            .resolve(&ctx.job().owner_id, &binding.handler_id, binding.bootstrap.as_ref())
            .await
    }

    async fn attempt(
        &self,
        definition: &JobDefinition,
        ctx: &JobContext,
    ) -> Result<Result<JsonValue, JobError>, (Option<WorkerSessionHandle>, String)> {
        let session = match self.resolve(definition, ctx).await {
            Ok(session) => session,
            Err(ProvisionError::TargetGone(message)) => return Err((None, message)),
            Err(err) => return Ok(Err(JobError::retryable(err.to_string()))),
        };
        ctx.set_execution(session.id.to_string());

        match definition.runner.run(ctx.clone().with_session(session.clone())).await {
            Err(JobError::TargetGone(message)) => Err((Some(session), message)),
            other => Ok(other),
        }
    }
}

#[async_trait]
impl ExecutionHook for SessionExecution {
    async fn execute(
        &self,
        definition: &JobDefinition,
        ctx: JobContext,
    ) -> Result<JsonValue, JobError> {
        if definition.worker.is_none() {
            return DirectExecution.execute(definition, ctx).await;
        }

        let (stale, message) = match self.attempt(definition, &ctx).await {
            Ok(outcome) => return outcome,
            Err(gone) => gone,
        };

        warn!(
            job_id = %ctx.job().id,
            error = %message,
            "worker session target gone; reprovisioning once"
        );
        if let Some(stale) = &stale {
            self.provisioner.invalidate(stale).await;
        }
        if ctx.is_cancelled() {
            return Err(JobError::Canceled);
        }

        match self.attempt(definition, &ctx).await {
            Ok(outcome) => outcome,
            Err((stale, message)) => {
                if let Some(stale) = &stale {
                    self.provisioner.invalidate(stale).await;
                }
                Err(JobError::fatal(format!(
                    "worker session unavailable after reprovision: {message}"
                )))
            }
        }
    }
}
