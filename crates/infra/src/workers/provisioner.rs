//! Worker Session Provisioner.
//!
//! A worker session is a long-lived execution context keyed by
//! `(owner_id, handler_id)`. It is created lazily on the first job for that key,
//! oriented exactly once, optionally bootstrapped once per bootstrap key, and
//! then reused by every later job. A context whose orientation failed stays
//! mapped and is oriented again on the next resolve instead of being recreated.
//!
//! ## Concurrency
//!
//! The mapping table is owned by the provisioner. Each key has its own async slot
//! lock, so two jobs resolving the same key never create two contexts while jobs
//! for different keys provision in parallel.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use conductor_core::{HandlerId, OwnerId, WorkerSessionId};

use crate::jobs::Bootstrap;

/// Failure reported by the system that hosts execution contexts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The backing context no longer exists (for example after a restart).
    #[error("execution target no longer exists: {0}")]
    TargetGone(String),
    #[error("{0}")]
    Failed(String),
}

/// The external runtime that owns execution contexts.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Create a fresh context and return its backend reference.
    async fn create_context(
        &self,
        owner_id: &OwnerId,
        handler_id: &HandlerId,
    ) -> Result<String, BackendError>;

    /// Mandatory one-time system orientation.
    async fn orient(
        &self,
        context_ref: &str,
        owner_id: &OwnerId,
        handler_id: &HandlerId,
    ) -> Result<(), BackendError>;

    /// Handler-supplied one-time bootstrap.
    async fn bootstrap(
        &self,
        context_ref: &str,
        key: &str,
        instructions: &JsonValue,
    ) -> Result<(), BackendError>;
}

/// Provisioning failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvisionError {
    #[error("worker session target gone: {0}")]
    TargetGone(String),
    #[error("failed to create worker session: {0}")]
    Backend(String),
    #[error("worker session orientation failed: {0}")]
    OrientationFailed(String),
    #[error("worker session bootstrap '{key}' failed: {message}")]
    BootstrapFailed { key: String, message: String },
}

impl ProvisionError {
    pub fn is_target_gone(&self) -> bool {
        matches!(self, ProvisionError::TargetGone(_))
    }
}

/// A resolved worker session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSessionHandle {
    pub id: WorkerSessionId,
    pub owner_id: OwnerId,
    pub handler_id: HandlerId,
    /// Backend reference of the execution context.
    pub context_ref: String,
    /// Worker sessions are excluded from default end-user listings.
    pub hidden: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
struct SessionRecord {
    handle: WorkerSessionHandle,
    oriented: bool,
    bootstraps: BTreeSet<String>,
}

type SessionKey = (OwnerId, HandlerId);
type Slot = Arc<AsyncMutex<Option<SessionRecord>>>;

/// Resolves and caches worker sessions.
pub struct WorkerSessionProvisioner {
    backend: Arc<dyn SessionBackend>,
    slots: Mutex<HashMap<SessionKey, Slot>>,
}

impl WorkerSessionProvisioner {
    pub fn new(backend: Arc<dyn SessionBackend>) -> Self {
        Self {
            backend,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<SessionKey, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, owner_id: &OwnerId, handler_id: &HandlerId) -> Slot {
        Arc::clone(
            self.slots()
                .entry((owner_id.clone(), handler_id.clone()))
                .or_default(),
        )
    }

    /// Resolve the session for `(owner_id, handler_id)`, creating and orienting it
    /// on first use and running `bootstrap` once per bootstrap key.
    pub async fn resolve(
        &self,
        owner_id: &OwnerId,
        handler_id: &HandlerId,
        bootstrap: Option<&Bootstrap>,
    ) -> Result<WorkerSessionHandle, ProvisionError> {
        let slot = self.slot(owner_id, handler_id);
        let mut record = slot.lock().await;

        if record.is_none() {
            *record = Some(self.create(owner_id, handler_id).await?);
        }
        let Some(current) = record.as_mut() else {
            return Err(ProvisionError::Backend("session slot empty after provisioning".into()));
        };

        if !current.oriented {
            match self.backend.orient(&current.handle.context_ref, owner_id, handler_id).await {
                Ok(()) => {
                    current.oriented = true;
                    info!(
                        session_id = %current.handle.id,
                        owner_id = %owner_id,
                        handler_id = %handler_id,
                        context_ref = %current.handle.context_ref,
                        "worker session provisioned"
                    );
                }
                Err(err) => {
                    warn!(
                        owner_id = %owner_id,
                        handler_id = %handler_id,
                        context_ref = %current.handle.context_ref,
                        error = %err,
                        "worker session orientation failed"
                    );
                    return Err(match err {
                        BackendError::TargetGone(m) => {
                            *record = None;
                            ProvisionError::TargetGone(m)
                        }
                        BackendError::Failed(m) => ProvisionError::OrientationFailed(m),
                    });
                }
            }
        }

        if let Some(bootstrap) = bootstrap {
            if !current.bootstraps.contains(&bootstrap.key) {
                match self
                    .backend
                    .bootstrap(&current.handle.context_ref, &bootstrap.key, &bootstrap.instructions)
                    .await
                {
                    Ok(()) => {
                        current.bootstraps.insert(bootstrap.key.clone());
                    }
                    Err(BackendError::TargetGone(message)) => {
                        *record = None;
                        return Err(ProvisionError::TargetGone(message));
                    }
                    Err(BackendError::Failed(message)) => {
                        return Err(ProvisionError::BootstrapFailed {
                            key: bootstrap.key.clone(),
                            message,
                        });
                    }
                }
            }
        }

        Ok(current.handle.clone())
    }

    async fn create(
        &self,
        owner_id: &OwnerId,
        handler_id: &HandlerId,
    ) -> Result<SessionRecord, ProvisionError> {
        let context_ref = self
            .backend
            .create_context(owner_id, handler_id)
            .await
            .map_err(|err| match err {
                BackendError::TargetGone(m) => ProvisionError::TargetGone(m),
                BackendError::Failed(m) => ProvisionError::Backend(m),
            })?;

        Ok(SessionRecord {
            handle: WorkerSessionHandle {
                id: WorkerSessionId::new(),
                owner_id: owner_id.clone(),
                handler_id: handler_id.clone(),
                context_ref,
                hidden: true,
                created_at: Utc::now(),
            },
            oriented: false,
            bootstraps: BTreeSet::new(),
        })
    }

    /// Drop the mapping for `session`, if it is still the active one for its key.
    ///
    /// Returns whether a mapping was cleared.
    pub async fn invalidate(&self, session: &WorkerSessionHandle) -> bool {
        let slot = self.slot(&session.owner_id, &session.handler_id);
        let mut record = slot.lock().await;
        match record.as_ref() {
            Some(current) if current.handle.id == session.id => {
                *record = None;
                warn!(
                    session_id = %session.id,
                    owner_id = %session.owner_id,
                    handler_id = %session.handler_id,
                    "worker session invalidated"
                );
                true
            }
            _ => false,
        }
    }

    /// Current oriented sessions, sorted by owner then handler.
    ///
    /// Hidden sessions are only included when `include_hidden` is set.
    pub async fn sessions(&self, include_hidden: bool) -> Vec<WorkerSessionHandle> {
        let slots: Vec<Slot> = self.slots().values().cloned().collect();
        let mut out = Vec::new();
        for slot in slots {
            if let Some(record) = slot.lock().await.as_ref().filter(|r| r.oriented) {
                if include_hidden || !record.handle.hidden {
                    out.push(record.handle.clone());
                }
            }
        }
        out.sort_by(|a, b| {
            (&a.owner_id, &a.handler_id).cmp(&(&b.owner_id, &b.handler_id))
        });
        out
    }
}
