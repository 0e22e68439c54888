//! Process-wide plugin table: name -> integer version. Persisted in
//! the before-keys aux phase; registration loads gate on it.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Default)]
pub struct PluginRegistry {
    plugins: RwLock<BTreeMap<String, u32>>,
}

impl PluginRegistry {
    pub fn new() -> PluginRegistry {
        PluginRegistry::default()
    }

    pub fn register(&self, name: &str, version: u32) {
        self.plugins.write().insert(name.to_string(), version);
    }

    pub fn version_of(&self, name: &str) -> Option<u32> {
        self.plugins.read().get(name).copied()
    }

    pub fn all(&self) -> Vec<(String, u32)> {
        self.plugins
            .read()
            .iter()
            .map(|(name, version)| (name.clone(), *version))
            .collect()
    }

    /// True when `name` is present at `required` or newer.
    pub fn satisfies(&self, name: &str, required: u32) -> bool {
        self.version_of(name).is_some_and(|v| v >= required)
    }
}

/// Resolve a plugin's shared-object path. The `modulesdatadir`
/// environment variable, when present, rewrites the lookup root.
pub fn resolve_plugin_path(config: &config::Config, name: &str) -> PathBuf {
    let root = match std::env::var("modulesdatadir") {
        Ok(dir) if !dir.is_empty() => dir,
        _ => config.plugin_home_dir(),
    };
    PathBuf::from(root).join(format!("{name}.so"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_gating() {
        let plugins = PluginRegistry::new();
        plugins.register("py", 3);
        assert!(plugins.satisfies("py", 2));
        assert!(plugins.satisfies("py", 3));
        assert!(!plugins.satisfies("py", 4));
        assert!(!plugins.satisfies("absent", 1));
        assert_eq!(plugins.all(), vec![("py".to_string(), 3)]);
    }
}
