//! Catalog of known plugins.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tokio::sync::RwLock;
use tracing::{debug, info};

use super::error::{PluginError, Result};

/// Registry entry. Metadata only; live handles belong to the loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub engines: Vec<String>,
    pub path: PathBuf,
    /// Artifact reference the binary was pulled from.
    pub origin: Option<String>,
    pub digest: Option<String>,
    pub platform: Option<String>,
}

impl PluginInfo {
    pub fn local(name: &str, version: &str, engines: &[&str], path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            engines: engines.iter().map(|e| e.to_string()).collect(),
            path: path.into(),
            origin: None,
            digest: None,
            platform: None,
        }
    }

    pub fn supports(&self, engine: &str) -> bool {
        self.engines.iter().any(|e| e == engine)
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(PluginError::Invalid("plugin name is empty".to_string()));
        }
        if self.version.is_empty() {
            return Err(PluginError::Invalid(format!(
                "plugin {} has an empty version",
                self.name
            )));
        }
        if self.engines.is_empty() {
            return Err(PluginError::Invalid(format!(
                "plugin {} supports no engines",
                self.name
            )));
        }
        Ok(())
    }
}

/// Concurrent map of plugin name to entry.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: RwLock<BTreeMap<String, PluginInfo>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an entry.
    pub async fn register(&self, info: PluginInfo) -> Result<()> {
        info.validate()?;
        info!(
            plugin = %info.name,
            version = %info.version,
            engines = ?info.engines,
            path = %info.path.display(),
            "Registering plugin"
        );
        self.plugins.write().await.insert(info.name.clone(), info);
        Ok(())
    }

    /// Add an entry unless the name is taken. Returns whether it was added.
    pub async fn register_if_absent(&self, info: PluginInfo) -> Result<bool> {
        info.validate()?;
        let mut plugins = self.plugins.write().await;
        if plugins.contains_key(&info.name) {
            debug!(plugin = %info.name, "Plugin already registered");
            return Ok(false);
        }
        plugins.insert(info.name.clone(), info);
        Ok(true)
    }

    /// Owned copy of an entry.
    pub async fn get(&self, name: &str) -> Option<PluginInfo> {
        self.plugins.read().await.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<PluginInfo> {
        self.plugins.read().await.values().cloned().collect()
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        self.plugins
            .write()
            .await
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| PluginError::NotRegistered(name.to_string()))
    }

    /// First entry, by name, that lists `engine`.
    pub async fn find_for_engine(&self, engine: &str) -> Option<PluginInfo> {
        self.plugins
            .read()
            .await
            .values()
            .find(|p| p.supports(engine))
            .cloned()
    }
}
