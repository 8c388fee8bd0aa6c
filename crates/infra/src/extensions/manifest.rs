//! On-disk extension manifests (`extension.json`).

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use conductor_events::Capabilities;

pub const MANIFEST_FILE: &str = "extension.json";

/// Declared identity, compatibility and capabilities of one extension module.
///
/// ```json
/// {
///   "name": "reply-suggester",
///   "version": "1.2.0",
///   "compatibility": "^0.1",
///   "entry": "reply_suggester",
///   "capabilities": { "events": ["turn.completed"], "actions": [] }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionManifest {
    /// Logical module name; also the shadowing key across roots.
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    /// Range of core versions the module works with.
    #[serde(default = "any_version")]
    pub compatibility: String,
    /// Catalog factory that instantiates the module.
    pub entry: String,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_version() -> String {
    "0.0.0".to_string()
}

fn any_version() -> String {
    "*".to_string()
}

impl ExtensionManifest {
    pub fn new(name: impl Into<String>, entry: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            compatibility: any_version(),
            entry: entry.into(),
            capabilities: Capabilities::default(),
            description: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_compatibility(mut self, range: impl Into<String>) -> Self {
        self.compatibility = range.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Read and parse `<dir>/extension.json`.
    pub fn load(dir: &Path) -> Result<Self, ManifestError> {
        let path = dir.join(MANIFEST_FILE);
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| ManifestError::Io(format!("{}: {e}", path.display())))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ManifestError> {
        let manifest: Self =
            serde_json::from_str(raw).map_err(|e| ManifestError::Parse(e.to_string()))?;
        if manifest.name.trim().is_empty() {
            return Err(ManifestError::Parse("name must not be blank".into()));
        }
        if manifest.entry.trim().is_empty() {
            return Err(ManifestError::Parse("entry must not be blank".into()));
        }
        Ok(manifest)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    #[error("cannot read manifest: {0}")]
    Io(String),
    #[error("malformed manifest: {0}")]
    Parse(String),
}
