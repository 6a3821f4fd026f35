//! Plugin processes, keyed by the name each plugin reports.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{info, warn};

use super::client::{PluginClient, DEFAULT_CALL_TIMEOUT};
use super::error::{PluginError, Result};
use super::launcher::{LaunchedPlugin, Launcher, PluginProcess};
use super::registry::PluginInfo;

/// Identity a plugin reported when it was loaded.
#[derive(Clone)]
pub struct LoadedPlugin {
    pub name: String,
    pub version: String,
    pub engines: Vec<String>,
    pub path: PathBuf,
    pub client: Arc<PluginClient>,
}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("engines", &self.engines)
            .field("path", &self.path)
            .finish()
    }
}

impl LoadedPlugin {
    pub fn supports(&self, engine: &str) -> bool {
        self.engines.iter().any(|e| e == engine)
    }

    /// Registry entry describing this plugin.
    pub fn info(&self) -> PluginInfo {
        PluginInfo {
            name: self.name.clone(),
            version: self.version.clone(),
            engines: self.engines.clone(),
            path: self.path.clone(),
            origin: None,
            digest: None,
            platform: None,
        }
    }
}

struct Entry {
    plugin: LoadedPlugin,
    process: Option<PluginProcess>,
}

pub struct PluginLoader {
    launcher: Arc<dyn Launcher>,
    call_timeout: Duration,
    loaded: RwLock<HashMap<String, Entry>>,
}

impl PluginLoader {
    pub fn new(launcher: Arc<dyn Launcher>) -> Self {
        Self {
            launcher,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            loaded: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Launch, handshake, initialize and validate the plugin at `path`.
    ///
    /// A plugin that fails validation is stopped and not cached. Loading a
    /// name that is already cached replaces the old process.
    pub async fn load(&self, path: &Path) -> Result<LoadedPlugin> {
        let LaunchedPlugin { stream, process } = self.launcher.launch(path).await?;
        let client = PluginClient::with_call_timeout(path.display().to_string(), stream, self.call_timeout);

        let plugin = match describe(&client, path).await {
            Ok(plugin) => plugin,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Rejecting plugin");
                if let Some(mut process) = process {
                    process.stop().await;
                }
                return Err(e);
            }
        };

        info!(
            plugin = %plugin.name,
            version = %plugin.version,
            engines = ?plugin.engines,
            path = %path.display(),
            "Plugin loaded"
        );
        let previous = self.loaded.write().await.insert(
            plugin.name.clone(),
            Entry {
                plugin: plugin.clone(),
                process,
            },
        );
        if let Some(previous) = previous {
            warn!(plugin = %plugin.name, "Replacing an already loaded plugin");
            stop(previous).await;
        }
        Ok(plugin)
    }

    /// A loaded plugin whose stream is still open.
    pub async fn get(&self, name: &str) -> Option<LoadedPlugin> {
        self.loaded
            .read()
            .await
            .get(name)
            .filter(|e| !e.plugin.client.is_closed())
            .map(|e| e.plugin.clone())
    }

    pub async fn loaded_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.loaded.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Shut the plugin down and stop its process.
    pub async fn unload(&self, name: &str) -> Result<()> {
        let entry = self
            .loaded
            .write()
            .await
            .remove(name)
            .ok_or_else(|| PluginError::NotRegistered(name.to_string()))?;
        stop(entry).await;
        Ok(())
    }

    /// Unload everything.
    pub async fn cleanup(&self) {
        let entries: Vec<_> = self.loaded.write().await.drain().collect();
        for (_, entry) in entries {
            stop(entry).await;
        }
    }
}

async fn describe(client: &Arc<PluginClient>, path: &Path) -> Result<LoadedPlugin> {
    client.initialize().await?;
    let name = client.name().await?;
    let version = client.version().await?;
    let engines = client.supported_engines().await?;

    if name.trim().is_empty() {
        return Err(PluginError::Invalid(format!(
            "plugin at {} reported an empty name",
            path.display()
        )));
    }
    if version.trim().is_empty() {
        return Err(PluginError::Invalid(format!(
            "plugin {} reported an empty version",
            name
        )));
    }
    if engines.is_empty() {
        return Err(PluginError::Invalid(format!(
            "plugin {} supports no engines",
            name
        )));
    }
    if engines.iter().any(|e| e.trim().is_empty()) {
        return Err(PluginError::Invalid(format!(
            "plugin {} reported an empty engine name",
            name
        )));
    }

    Ok(LoadedPlugin {
        name,
        version,
        engines,
        path: path.to_path_buf(),
        client: client.clone(),
    })
}

async fn stop(entry: Entry) {
    let Entry { plugin, process } = entry;
    if !plugin.client.is_closed() {
        if let Err(e) = plugin.client.shutdown().await {
            warn!(plugin = %plugin.name, error = %e, "Plugin shutdown failed");
        }
    }
    if let Some(mut process) = process {
        process.stop().await;
    }
    info!(plugin = %plugin.name, "Plugin unloaded");
}
