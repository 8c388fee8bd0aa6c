//! Append-only audit log of extension lifecycle actions.
//!
//! Every reload attempt (applied, failed or rejected as in progress) and every
//! trust-mode decision about undeclared capability use is appended here.
//! Records are never rewritten or deleted by the running process.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

use conductor_core::SnapshotId;
use conductor_events::{CapabilityKind, TrustAudit, TrustDecision};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Reload,
    TrustDecision,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// Reload applied.
    Success,
    /// Reload failed validation; the prior snapshot stayed active.
    Failure,
    /// Reload refused because another one was in progress.
    Rejected,
    Allowed,
    Denied,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: Uuid,
    pub at: DateTime<Utc>,
    pub actor: String,
    pub action: AuditAction,
    pub outcome: AuditOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_snapshot: Option<SnapshotId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_snapshot: Option<SnapshotId>,
    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub detail: JsonValue,
}

impl AuditRecord {
    pub fn new(actor: impl Into<String>, action: AuditAction, outcome: AuditOutcome) -> Self {
        Self {
            id: Uuid::now_v7(),
            at: Utc::now(),
            actor: actor.into(),
            action,
            outcome,
            before_snapshot: None,
            after_snapshot: None,
            detail: JsonValue::Null,
        }
    }

    pub fn with_snapshots(mut self, before: Option<SnapshotId>, after: Option<SnapshotId>) -> Self {
        self.before_snapshot = before;
        self.after_snapshot = after;
        self
    }

    pub fn with_detail(mut self, detail: JsonValue) -> Self {
        self.detail = detail;
        self
    }

    /// Record for a trust decision made by `actor`.
    pub fn trust_decision(actor: impl Into<String>, decision: &TrustDecision) -> Self {
        let outcome = if decision.allowed {
            AuditOutcome::Allowed
        } else {
            AuditOutcome::Denied
        };
        let kind = match decision.capability_kind {
            CapabilityKind::Event => "event",
            CapabilityKind::Action => "action",
        };
        let mut record = Self::new(actor, AuditAction::TrustDecision, outcome).with_detail(
            serde_json::json!({
                "module": decision.module,
                "mode": decision.mode,
                "capabilityKind": kind,
                "capability": decision.capability,
            }),
        );
        record.at = decision.at;
        record
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuditError {
    #[error("audit log io error: {0}")]
    Io(String),
    #[error("corrupt audit record at line {line}: {message}")]
    Corrupt { line: usize, message: String },
}

pub trait AuditLog: Send + Sync {
    fn append(&self, record: &AuditRecord) -> Result<(), AuditError>;

    /// All records in append order.
    fn records(&self) -> Result<Vec<AuditRecord>, AuditError>;
}

impl<L: AuditLog + ?Sized> AuditLog for Arc<L> {
    fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        (**self).append(record)
    }

    fn records(&self) -> Result<Vec<AuditRecord>, AuditError> {
        (**self).records()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditLog for InMemoryAuditLog {
    fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }

    fn records(&self) -> Result<Vec<AuditRecord>, AuditError> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

/// JSON-lines audit file, opened in append mode for every record.
#[derive(Debug)]
pub struct FileAuditLog {
    path: PathBuf,
    write: Mutex<()>,
}

impl FileAuditLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| AuditError::Io(e.to_string()))?;
        }
        Ok(Self {
            path,
            write: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditLog for FileAuditLog {
    fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let mut line = serde_json::to_string(record).map_err(|e| AuditError::Io(e.to_string()))?;
        line.push('\n');

        let _guard = self.write.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| AuditError::Io(e.to_string()))?;
        file.write_all(line.as_bytes())
            .and_then(|()| file.sync_data())
            .map_err(|e| AuditError::Io(e.to_string()))
    }

    fn records(&self) -> Result<Vec<AuditRecord>, AuditError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AuditError::Io(e.to_string())),
        };
        raw.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str(line).map_err(|e| AuditError::Corrupt {
                    line: i + 1,
                    message: e.to_string(),
                })
            })
            .collect()
    }
}

/// Feeds dispatcher trust decisions into an [`AuditLog`].
#[derive(Clone)]
pub struct TrustAuditTrail {
    log: Arc<dyn AuditLog>,
}

impl TrustAuditTrail {
    pub const ACTOR: &'static str = "dispatcher";

    pub fn new(log: Arc<dyn AuditLog>) -> Self {
        Self { log }
    }
}

impl TrustAudit for TrustAuditTrail {
    fn record(&self, decision: &TrustDecision) {
        if let Err(err) = self.log.append(&AuditRecord::trust_decision(Self::ACTOR, decision)) {
            error!(module = %decision.module, error = %err, "failed to append trust decision");
        }
    }
}
