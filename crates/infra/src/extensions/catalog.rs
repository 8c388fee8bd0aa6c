//! Compiled-in module factories.
//!
//! Extensions on disk carry only a manifest; the code behind them is linked into
//! the binary and looked up here by the manifest's `entry`. Builtins are modules
//! that ship with the engine and need no manifest file.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use conductor_events::HandlerModule;

use super::manifest::ExtensionManifest;

/// Creates a fresh module instance for every reload.
pub type ModuleFactory = Arc<dyn Fn() -> Arc<dyn HandlerModule> + Send + Sync>;

#[derive(Clone, Default)]
pub struct ModuleCatalog {
    factories: BTreeMap<String, ModuleFactory>,
    builtins: Vec<ExtensionManifest>,
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the factory behind manifest entry `entry`.
    pub fn with_factory<F>(mut self, entry: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn HandlerModule> + Send + Sync + 'static,
    {
        self.factories.insert(entry.into(), Arc::new(factory));
        self
    }

    /// Register a builtin module: its factory plus the manifest it is loaded with.
    ///
    /// Builtins have the lowest precedence; any root providing the same name
    /// shadows them.
    pub fn with_builtin<F>(mut self, manifest: ExtensionManifest, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn HandlerModule> + Send + Sync + 'static,
    {
        self.factories.insert(manifest.entry.clone(), Arc::new(factory));
        self.builtins.retain(|m| m.name != manifest.name);
        self.builtins.push(manifest);
        self
    }

    pub fn instantiate(&self, entry: &str) -> Option<Arc<dyn HandlerModule>> {
        self.factories.get(entry).map(|factory| factory())
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.factories.contains_key(entry)
    }

    pub fn builtins(&self) -> &[ExtensionManifest] {
        &self.builtins
    }
}

impl fmt::Debug for ModuleCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleCatalog")
            .field("entries", &self.factories.keys().collect::<Vec<_>>())
            .field("builtins", &self.builtins.iter().map(|m| &m.name).collect::<Vec<_>>())
            .finish()
    }
}
