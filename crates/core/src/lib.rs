//! `conductor-core`: vocabulary shared by every engine layer.
//!
//! This crate contains **pure** primitives (no IO, no async): identifiers, the
//! job lifecycle vocabulary and the enqueue contract.

pub mod error;
pub mod id;
pub mod job;

pub use error::{CoreError, CoreResult};
pub use id::{HandlerId, JobId, OwnerId, SnapshotId, WorkerSessionId};
pub use job::{DedupeOutcome, EnqueueReceipt, EnqueueStatus, JobRequest, JobState, Priority};
