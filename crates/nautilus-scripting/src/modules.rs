//! Host-registered library modules

use crate::language::ScriptLanguage;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Library sources handlers can import by name, per language
///
/// Names are case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct ModuleCatalog {
    modules: Arc<DashMap<(ScriptLanguage, String), Arc<str>>>,
}

impl ModuleCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a module
    pub fn register(&self, language: ScriptLanguage, name: &str, source: impl Into<Arc<str>>) {
        debug!(%language, module = %name, "Library module registered");
        self.modules
            .insert((language, name.to_lowercase()), source.into());
    }

    /// Source of a module
    pub fn get(&self, language: ScriptLanguage, name: &str) -> Option<Arc<str>> {
        self.modules
            .get(&(language, name.to_lowercase()))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Remove a module; returns whether one existed
    pub fn remove(&self, language: ScriptLanguage, name: &str) -> bool {
        self.modules.remove(&(language, name.to_lowercase())).is_some()
    }

    /// Modules registered for a language, sorted by name
    pub fn modules_for(&self, language: ScriptLanguage) -> Vec<(String, Arc<str>)> {
        let mut modules: Vec<_> = self
            .modules
            .iter()
            .filter(|entry| entry.key().0 == language)
            .map(|entry| (entry.key().1.clone(), Arc::clone(entry.value())))
            .collect();
        modules.sort_by(|a, b| a.0.cmp(&b.0));
        modules
    }

    /// Number of modules across all languages
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Whether the catalog is empty
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_lookup_case_insensitive() {
        let catalog = ModuleCatalog::new();
        catalog.register(ScriptLanguage::Rhai, "Auth", "fn ok() { true }");
        catalog.register(ScriptLanguage::Shell, "auth", "function Test-Ok { $true }");

        assert!(catalog.get(ScriptLanguage::Rhai, "AUTH").is_some());
        assert_eq!(catalog.modules_for(ScriptLanguage::Shell).len(), 1);
        assert!(catalog.get(ScriptLanguage::Basic, "auth").is_none());

        assert!(catalog.remove(ScriptLanguage::Rhai, "auth"));
        assert_eq!(catalog.len(), 1);
    }
}
