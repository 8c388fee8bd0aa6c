//! The seam between the scheduler and whatever actually runs a job attempt.

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use super::definition::{JobContext, JobDefinition};
use super::types::JobError;

/// Runs one attempt of a claimed job.
///
/// The queue owns timeouts and cancellation; hooks only decide *where* the
/// definition's runner executes.
#[async_trait]
pub trait ExecutionHook: Send + Sync {
    async fn execute(
        &self,
        definition: &JobDefinition,
        ctx: JobContext,
    ) -> Result<JsonValue, JobError>;
}

/// Runs the definition's runner in-process with no worker session.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectExecution;

#[async_trait]
impl ExecutionHook for DirectExecution {
    async fn execute(
        &self,
        definition: &JobDefinition,
        ctx: JobContext,
    ) -> Result<JsonValue, JobError> {
        definition.runner.run(ctx).await
    }
}
