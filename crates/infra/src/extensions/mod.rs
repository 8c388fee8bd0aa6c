//! Extension lifecycle: discovery, compatibility, trust and atomic reload.
//!
//! ## Components
//!
//! - `discover`: precedence-ordered roots, lexicographic within a root, shadowing
//! - `VersionReq`: compatibility ranges checked against the running core version
//! - `ModuleCatalog`: compiled-in factories named by manifest `entry`
//! - `ExtensionGovernor`: validate-then-swap reloads and the inventory view
//! - `AuditLog`: append-only record of reloads and trust decisions

pub mod audit;
pub mod catalog;
pub mod compat;
pub mod discovery;
pub mod governor;
pub mod manifest;

pub use audit::{
    AuditAction, AuditError, AuditLog, AuditOutcome, AuditRecord, FileAuditLog, InMemoryAuditLog,
    TrustAuditTrail,
};
pub use catalog::{ModuleCatalog, ModuleFactory};
pub use compat::{Version, VersionError, VersionReq};
pub use discovery::{
    BUILTIN_ORIGIN, Candidate, Discovery, FailureReason, ModuleFailure, SourceRoot, discover,
};
pub use governor::{
    ExtensionGovernor, ExtensionInventory, ModuleInventory, ReloadError, ReloadSummary,
    TrustEvaluation,
};
pub use manifest::{ExtensionManifest, MANIFEST_FILE, ManifestError};
