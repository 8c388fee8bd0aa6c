//! Deterministic extension discovery.
//!
//! Roots are scanned in precedence order (first = highest). Inside a root every
//! subdirectory holding an `extension.json` is a candidate, visited in
//! lexicographic order. The first candidate seen for a module name wins; later
//! ones are reported as shadowed. Builtins come last.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use conductor_events::ShadowedModule;

use super::manifest::{ExtensionManifest, MANIFEST_FILE};

pub const BUILTIN_ORIGIN: &str = "builtin";

/// One directory extensions are discovered from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRoot {
    /// Label reported as the module's origin (e.g. `project`, `user`).
    pub origin: String,
    pub path: PathBuf,
}

impl SourceRoot {
    pub fn new(origin: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            origin: origin.into(),
            path: path.into(),
        }
    }
}

/// A module that won discovery and will be validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub manifest: ExtensionManifest,
    pub origin: String,
    /// Directory the manifest came from; `None` for builtins.
    pub source: Option<PathBuf>,
}

/// Why a module was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum FailureReason {
    InvalidManifest { message: String },
    #[serde(rename_all = "camelCase")]
    InvalidCompatibility { range: String, message: String },
    #[serde(rename_all = "camelCase")]
    Incompatible { range: String, core_version: String },
    UnknownEntry { entry: String },
    MalformedCapabilities { entries: Vec<String> },
    UndeclaredEvents { events: Vec<String> },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::InvalidManifest { message } => write!(f, "invalid manifest: {message}"),
            FailureReason::InvalidCompatibility { range, message } => {
                write!(f, "invalid compatibility range '{range}': {message}")
            }
            FailureReason::Incompatible { range, core_version } => {
                write!(f, "requires core {range}, running {core_version}")
            }
            FailureReason::UnknownEntry { entry } => write!(f, "unknown entry '{entry}'"),
            FailureReason::MalformedCapabilities { entries } => {
                write!(f, "malformed capability entries: {entries:?}")
            }
            FailureReason::UndeclaredEvents { events } => {
                write!(f, "subscribes to undeclared events: {}", events.join(", "))
            }
        }
    }
}

/// Structured per-module reload failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleFailure {
    pub module: String,
    pub origin: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    pub reason: FailureReason,
}

impl fmt::Display for ModuleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.module, self.origin, self.reason)
    }
}

/// Result of scanning every root.
#[derive(Debug, Default)]
pub struct Discovery {
    pub candidates: Vec<Candidate>,
    pub shadowed: Vec<ShadowedModule>,
    pub failures: Vec<ModuleFailure>,
}

/// Scan `roots` (highest precedence first) and then `builtins`.
pub fn discover(roots: &[SourceRoot], builtins: &[ExtensionManifest]) -> Discovery {
    let mut out = Discovery::default();
    let mut winners: HashMap<String, String> = HashMap::new();

    for root in roots {
        for dir in candidate_dirs(root) {
            match ExtensionManifest::load(&dir) {
                Ok(manifest) => admit(&mut out, &mut winners, manifest, &root.origin, Some(dir)),
                Err(err) => out.failures.push(ModuleFailure {
                    module: dir_name(&dir),
                    origin: root.origin.clone(),
                    source: Some(dir),
                    reason: FailureReason::InvalidManifest {
                        message: err.to_string(),
                    },
                }),
            }
        }
    }

    for manifest in builtins {
        admit(&mut out, &mut winners, manifest.clone(), BUILTIN_ORIGIN, None);
    }

    debug!(
        candidates = out.candidates.len(),
        shadowed = out.shadowed.len(),
        failures = out.failures.len(),
        "extension discovery complete"
    );
    out
}

fn admit(
    out: &mut Discovery,
    winners: &mut HashMap<String, String>,
    manifest: ExtensionManifest,
    origin: &str,
    source: Option<PathBuf>,
) {
    if let Some(winner) = winners.get(&manifest.name) {
        debug!(module = %manifest.name, origin, shadowed_by = %winner, "extension shadowed");
        out.shadowed.push(ShadowedModule {
            name: manifest.name,
            origin: origin.to_string(),
            source,
            shadowed_by: winner.clone(),
        });
        return;
    }
    winners.insert(manifest.name.clone(), origin.to_string());
    out.candidates.push(Candidate {
        manifest,
        origin: origin.to_string(),
        source,
    });
}

/// Subdirectories of `root` that contain a manifest, sorted by name.
fn candidate_dirs(root: &SourceRoot) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(&root.path) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(origin = %root.origin, path = %root.path.display(), "extension root missing");
            return Vec::new();
        }
        Err(err) => {
            warn!(origin = %root.origin, path = %root.path.display(), error = %err, "cannot read extension root");
            return Vec::new();
        }
    };

    let mut dirs: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir() && path.join(MANIFEST_FILE).is_file())
        .collect();
    dirs.sort_by_key(|p| dir_name(p));
    dirs
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn write_manifest(root: &Path, dir: &str, body: &str) {
        let path = root.join(dir);
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join(MANIFEST_FILE), body).unwrap();
    }

    fn manifest(name: &str) -> String {
        format!(r#"{{"name":"{name}","entry":"{name}"}}"#)
    }

    #[test]
    fn lexicographic_within_a_root() {
        let tmp = tempfile::tempdir().unwrap();
        write_manifest(tmp.path(), "b-dir", &manifest("beta"));
        write_manifest(tmp.path(), "a-dir", &manifest("alpha"));
        fs::create_dir_all(tmp.path().join("no-manifest")).unwrap();

        let found = discover(&[SourceRoot::new("project", tmp.path())], &[]);

        let names: Vec<_> = found.candidates.iter().map(|c| c.manifest.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
        assert!(found.failures.is_empty());
    }

    #[test]
    fn higher_precedence_root_shadows_lower_and_builtins() {
        let project = tempfile::tempdir().unwrap();
        let user = tempfile::tempdir().unwrap();
        write_manifest(project.path(), "digest", &manifest("digest"));
        write_manifest(user.path(), "digest", &manifest("digest"));

        let found = discover(
            &[SourceRoot::new("project", project.path()), SourceRoot::new("user", user.path())],
            &[ExtensionManifest::new("digest", "digest")],
        );

        assert_eq!(found.candidates.len(), 1);
        assert_eq!(found.candidates[0].origin, "project");
        let shadowed: Vec<_> = found.shadowed.iter().map(|s| (s.origin.as_str(), s.shadowed_by.as_str())).collect();
        assert_eq!(shadowed, vec![("user", "project"), (BUILTIN_ORIGIN, "project")]);
    }

    #[test]
    fn broken_manifests_are_reported_and_missing_roots_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        write_manifest(tmp.path(), "broken", "{ not json");

        let found = discover(
            &[SourceRoot::new("project", tmp.path()), SourceRoot::new("gone", tmp.path().join("missing"))],
            &[],
        );

        assert!(found.candidates.is_empty());
        assert_eq!(found.failures.len(), 1);
        assert_eq!(found.failures[0].module, "broken");
        assert!(matches!(found.failures[0].reason, FailureReason::InvalidManifest { .. }));
    }
}
