//! Extension Lifecycle & Trust Governor.
//!
//! ## Reload
//!
//! 1. Discover candidates across the source roots (see [`discover`])
//! 2. Validate every candidate: compatibility range against the core version,
//!    capability manifest shape, catalog entry, subscriptions vs. declared events
//! 3. Build a complete candidate snapshot off to the side
//! 4. Swap it into the shared [`SnapshotCell`] with one pointer store
//!
//! Any validation failure aborts before step 3; the active snapshot is never
//! touched and the caller gets every per-module reason at once. Reloads are
//! serialized: a second caller while one is running gets
//! [`ReloadError::InProgress`] instead of waiting. Every attempt is audited.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};

use conductor_core::SnapshotId;
use conductor_events::{
    Capabilities, CapabilityKind, HandlerSnapshot, LoadedModule, Registrar, Registration,
    ShadowedModule, SnapshotCell, TrustDecision, TrustMode,
};

use super::audit::{AuditAction, AuditLog, AuditOutcome, AuditRecord};
use super::catalog::ModuleCatalog;
use super::compat::{Version, VersionReq};
use super::discovery::{Candidate, FailureReason, ModuleFailure, SourceRoot, discover};

/// Why a reload did not apply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReloadError {
    #[error("a reload is already in progress")]
    InProgress,
    #[error("reload rejected: {} module(s) failed validation", failures.len())]
    Validation {
        /// Version of the snapshot that stays active.
        active_version: u64,
        failures: Vec<ModuleFailure>,
    },
}

/// A successfully applied reload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadSummary {
    pub snapshot_id: SnapshotId,
    pub version: u64,
    pub previous_snapshot_id: SnapshotId,
    pub modules: Vec<LoadedModule>,
    pub shadowed: Vec<ShadowedModule>,
}

/// How a loaded module fares under the active trust mode.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustEvaluation {
    /// Every subscription is declared.
    Declared,
    /// Undeclared subscriptions were allowed and logged.
    Warned,
    /// Undeclared subscriptions were ignored.
    Unchecked,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleInventory {
    pub name: String,
    pub version: String,
    pub origin: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    pub compatibility: String,
    pub compatible: bool,
    pub capabilities: Capabilities,
    /// Events the module is subscribed to in the active snapshot.
    pub subscriptions: Vec<String>,
    pub undeclared_events: Vec<String>,
    pub trust: TrustEvaluation,
}

/// What `GET extensions` reports.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionInventory {
    pub snapshot_id: SnapshotId,
    pub version: u64,
    pub loaded_at: DateTime<Utc>,
    pub trust_mode: TrustMode,
    pub core_version: String,
    pub modules: Vec<ModuleInventory>,
    pub shadowed: Vec<ShadowedModule>,
}

pub struct ExtensionGovernor {
    catalog: ModuleCatalog,
    roots: Vec<SourceRoot>,
    core_version: Version,
    trust_mode: TrustMode,
    handler_timeout: Duration,
    snapshots: Arc<SnapshotCell>,
    audit: Arc<dyn AuditLog>,
    reload_lock: Mutex<()>,
}

impl ExtensionGovernor {
    /// A governor publishing into `snapshots`. Defaults: no roots, `warn`
    /// trust, 5s handler timeout.
    pub fn new(
        catalog: ModuleCatalog,
        core_version: Version,
        snapshots: Arc<SnapshotCell>,
        audit: Arc<dyn AuditLog>,
    ) -> Self {
        Self {
            catalog,
            roots: Vec::new(),
            core_version,
            trust_mode: TrustMode::default(),
            handler_timeout: Duration::from_secs(5),
            snapshots,
            audit,
            reload_lock: Mutex::new(()),
        }
    }

    pub fn with_roots(mut self, roots: Vec<SourceRoot>) -> Self {
        self.roots = roots;
        self
    }

    pub fn with_trust_mode(mut self, mode: TrustMode) -> Self {
        self.trust_mode = mode;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn snapshots(&self) -> &Arc<SnapshotCell> {
        &self.snapshots
    }

    pub fn active(&self) -> Arc<HandlerSnapshot> {
        self.snapshots.load()
    }

    pub fn trust_mode(&self) -> TrustMode {
        self.trust_mode
    }

    pub fn core_version(&self) -> Version {
        self.core_version
    }

    /// Rebuild the handler snapshot from the roots and builtins and swap it in.
    pub fn reload(&self, actor: &str) -> Result<ReloadSummary, ReloadError> {
        let _guard = match self.reload_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                let active = self.snapshots.load();
                warn!(actor, "extension reload rejected: another reload is in progress");
                self.append(
                    AuditRecord::new(actor, AuditAction::Reload, AuditOutcome::Rejected)
                        .with_snapshots(Some(active.id()), None)
                        .with_detail(json!({ "reason": "in_progress" })),
                );
                return Err(ReloadError::InProgress);
            }
        };

        let before = self.snapshots.load();
        let discovery = discover(&self.roots, self.catalog.builtins());
        let mut failures = discovery.failures;
        let mut loaded = Vec::with_capacity(discovery.candidates.len());

        for candidate in discovery.candidates {
            match self.evaluate(&candidate, actor) {
                Ok(module) => loaded.push(module),
                Err(reason) => failures.push(ModuleFailure {
                    module: candidate.manifest.name,
                    origin: candidate.origin,
                    source: candidate.source,
                    reason,
                }),
            }
        }

        if !failures.is_empty() {
            for failure in &failures {
                warn!(
                    actor,
                    module = %failure.module,
                    origin = %failure.origin,
                    reason = %failure.reason,
                    "extension failed validation"
                );
            }
            self.append(
                AuditRecord::new(actor, AuditAction::Reload, AuditOutcome::Failure)
                    .with_snapshots(Some(before.id()), None)
                    .with_detail(json!({ "failures": failures })),
            );
            return Err(ReloadError::Validation {
                active_version: before.version(),
                failures,
            });
        }

        let next = HandlerSnapshot::build(
            before.version() + 1,
            self.trust_mode,
            self.handler_timeout,
            loaded,
            discovery.shadowed,
        );
        let summary = ReloadSummary {
            snapshot_id: next.id(),
            version: next.version(),
            previous_snapshot_id: before.id(),
            modules: next.modules().to_vec(),
            shadowed: next.shadowed().to_vec(),
        };
        self.snapshots.swap(next);

        info!(
            actor,
            version = summary.version,
            modules = summary.modules.len(),
            shadowed = summary.shadowed.len(),
            "extension snapshot swapped"
        );
        self.append(
            AuditRecord::new(actor, AuditAction::Reload, AuditOutcome::Success)
                .with_snapshots(Some(before.id()), Some(summary.snapshot_id))
                .with_detail(json!({
                    "version": summary.version,
                    "modules": summary.modules.iter().map(|m| &m.name).collect::<Vec<_>>(),
                })),
        );
        Ok(summary)
    }

    fn evaluate(
        &self,
        candidate: &Candidate,
        actor: &str,
    ) -> Result<(LoadedModule, Vec<Registration>), FailureReason> {
        let manifest = &candidate.manifest;

        let range: VersionReq =
            manifest
                .compatibility
                .parse()
                .map_err(|e: super::compat::VersionError| FailureReason::InvalidCompatibility {
                    range: manifest.compatibility.clone(),
                    message: e.reason,
                })?;
        if !range.matches(&self.core_version) {
            return Err(FailureReason::Incompatible {
                range: manifest.compatibility.clone(),
                core_version: self.core_version.to_string(),
            });
        }

        let malformed = manifest.capabilities.malformed_entries();
        if !malformed.is_empty() {
            return Err(FailureReason::MalformedCapabilities { entries: malformed });
        }

        let module = self
            .catalog
            .instantiate(&manifest.entry)
            .ok_or_else(|| FailureReason::UnknownEntry {
                entry: manifest.entry.clone(),
            })?;
        let mut registrar = Registrar::new();
        module.register(&mut registrar);
        let registrations = registrar.into_registrations();

        let undeclared: Vec<String> = registrations
            .iter()
            .filter(|r| !manifest.capabilities.declares_event(&r.event))
            .map(|r| r.event.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        if !undeclared.is_empty() {
            match self.trust_mode {
                TrustMode::Disabled => {}
                TrustMode::Warn => {
                    for event in &undeclared {
                        warn!(module = %manifest.name, event = %event, "module subscribes to an undeclared event");
                        self.record_decision(actor, &manifest.name, event, true);
                    }
                }
                TrustMode::Enforced => {
                    for event in &undeclared {
                        self.record_decision(actor, &manifest.name, event, false);
                    }
                    return Err(FailureReason::UndeclaredEvents { events: undeclared });
                }
            }
        }

        Ok((
            LoadedModule {
                name: manifest.name.clone(),
                version: manifest.version.clone(),
                origin: candidate.origin.clone(),
                source: candidate.source.clone(),
                compatibility: manifest.compatibility.clone(),
                capabilities: manifest.capabilities.clone(),
                undeclared_events: undeclared,
            },
            registrations,
        ))
    }

    fn record_decision(&self, actor: &str, module: &str, event: &str, allowed: bool) {
        let decision = TrustDecision {
            module: module.to_string(),
            mode: self.trust_mode,
            capability_kind: CapabilityKind::Event,
            capability: event.to_string(),
            allowed,
            at: Utc::now(),
        };
        self.append(AuditRecord::trust_decision(actor, &decision));
    }

    fn append(&self, record: AuditRecord) {
        if let Err(err) = self.audit.append(&record) {
            error!(action = ?record.action, outcome = ?record.outcome, error = %err, "failed to append audit record");
        }
    }

    /// Modules of the active snapshot with their evaluation.
    pub fn inventory(&self) -> ExtensionInventory {
        let snapshot = self.snapshots.load();
        let modules = snapshot
            .modules()
            .iter()
            .map(|m| ModuleInventory {
                name: m.name.clone(),
                version: m.version.clone(),
                origin: m.origin.clone(),
                source: m.source.clone(),
                compatibility: m.compatibility.clone(),
                compatible: m
                    .compatibility
                    .parse::<VersionReq>()
                    .is_ok_and(|r| r.matches(&self.core_version)),
                capabilities: m.capabilities.clone(),
                subscriptions: snapshot.events_of(&m.name),
                undeclared_events: m.undeclared_events.clone(),
                trust: match (m.undeclared_events.is_empty(), snapshot.trust_mode()) {
                    (true, _) => TrustEvaluation::Declared,
                    (false, TrustMode::Disabled) => TrustEvaluation::Unchecked,
                    (false, _) => TrustEvaluation::Warned,
                },
            })
            .collect();

        ExtensionInventory {
            snapshot_id: snapshot.id(),
            version: snapshot.version(),
            loaded_at: snapshot.loaded_at(),
            trust_mode: snapshot.trust_mode(),
            core_version: self.core_version.to_string(),
            modules,
            shadowed: snapshot.shadowed().to_vec(),
        }
    }
}
