//! Worker sessions: owner+handler-scoped execution contexts reused across jobs.

pub mod provisioner;
pub mod session_execution;

pub use provisioner::{
    BackendError, ProvisionError, SessionBackend, WorkerSessionHandle, WorkerSessionProvisioner,
};
pub use session_execution::SessionExecution;
