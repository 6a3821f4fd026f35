//! Engine name to live database connection.
//!
//! The manager finds a plugin for an engine in the registry, loads it if it
//! is not running, falls back to downloading it, and opens a connection.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::client::PluginConnection;
use super::discovery;
use super::downloader::{PluginDownloader, DEFAULT_MAJOR_VERSION};
use super::error::{PluginError, Result};
use super::launcher::{Launcher, ProcessLauncher};
use super::loader::{LoadedPlugin, PluginLoader};
use super::oci::OciRegistry;
use super::registry::{PluginInfo, PluginRegistry};
use super::traits::ConnectOptions;
use crate::api::Engine;
use crate::config::PluginsConfig;

pub struct PluginManager {
    registry: Arc<PluginRegistry>,
    loader: PluginLoader,
    downloader: Option<Arc<PluginDownloader>>,
    major_version: String,
    search_paths: Vec<PathBuf>,
    load_lock: Mutex<()>,
}

impl PluginManager {
    pub fn new(registry: Arc<PluginRegistry>, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            registry,
            loader: PluginLoader::new(launcher),
            downloader: None,
            major_version: DEFAULT_MAJOR_VERSION.to_string(),
            search_paths: discovery::default_search_paths(),
            load_lock: Mutex::new(()),
        }
    }

    /// Process launcher, OCI downloads and search paths from configuration.
    pub fn from_config(config: &PluginsConfig) -> Result<Self> {
        let launcher = ProcessLauncher::new(Duration::from_secs(config.handshake_timeout_secs));
        let downloader = PluginDownloader::new(
            &config.cache_dir,
            &config.repository,
            Arc::new(OciRegistry::new()?),
        );
        let mut search_paths = discovery::default_search_paths();
        search_paths.extend(config.search_paths.iter().cloned());

        Ok(
            Self::new(Arc::new(PluginRegistry::new()), Arc::new(launcher))
                .with_downloader(Arc::new(downloader))
                .with_major_version(&config.major_version)
                .with_search_paths(search_paths)
                .with_call_timeout(Duration::from_secs(config.call_timeout_secs)),
        )
    }

    pub fn with_downloader(mut self, downloader: Arc<PluginDownloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    pub fn with_major_version(mut self, major: impl Into<String>) -> Self {
        self.major_version = major.into();
        self
    }

    /// Bound on each plugin call made through loaded plugins.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.loader = self.loader.with_call_timeout(timeout);
        self
    }

    pub fn with_search_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.search_paths = paths;
        self
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn loader(&self) -> &PluginLoader {
        &self.loader
    }

    /// Open a connection to `uri` through the plugin serving `engine`.
    ///
    /// `options`, when given, are validated by the plugin before connecting.
    pub async fn get_connection(
        &self,
        engine: &str,
        uri: &str,
        options: Option<&ConnectOptions>,
    ) -> Result<PluginConnection> {
        let engine = engine.trim().to_lowercase();
        if engine.is_empty() {
            return Err(PluginError::EmptyEngine);
        }
        let uses_uri = engine
            .parse::<Engine>()
            .map(|e| e.uses_uri())
            .unwrap_or(true);
        if uri.is_empty() && uses_uri {
            return Err(PluginError::EmptyUri(engine));
        }

        let plugin = self.default_plugin(&engine).await?;
        let empty = ConnectOptions::new();
        if let Some(options) = options {
            plugin.client.validate(options).await?;
        }
        let conn = plugin
            .client
            .connect(uri, options.unwrap_or(&empty))
            .await?;
        debug!(engine = %engine, plugin = %plugin.name, connection_id = %conn.id(), "Opened plugin connection");
        Ok(conn)
    }

    /// The running plugin for `engine`, loading or downloading it as needed.
    pub async fn default_plugin(&self, engine: &str) -> Result<LoadedPlugin> {
        {
            let _guard = self.load_lock.lock().await;
            if let Some(info) = self.registry.find_for_engine(engine).await {
                return self.ensure_loaded(info).await;
            }
        }

        let downloader = self
            .downloader
            .as_ref()
            .ok_or_else(|| PluginError::NoPlugin(engine.to_string()))?;
        // Outside the load lock so concurrent callers share one download.
        let downloaded = downloader.download(engine, &self.major_version).await?;

        let _guard = self.load_lock.lock().await;
        if let Some(info) = self.registry.find_for_engine(engine).await {
            return self.ensure_loaded(info).await;
        }
        let plugin = self.loader.load(&downloaded.path).await?;
        if !plugin.supports(engine) {
            warn!(
                engine,
                plugin = %plugin.name,
                engines = ?plugin.engines,
                "Downloaded plugin does not list the requested engine"
            );
        }
        let info = PluginInfo {
            origin: Some(downloaded.reference),
            digest: downloaded.digest,
            platform: Some(downloaded.platform),
            ..plugin.info()
        };
        self.registry.register(info).await?;
        Ok(plugin)
    }

    /// Start the plugin behind a registry entry unless it is running. The
    /// entry is refreshed with what the plugin reports about itself.
    async fn ensure_loaded(&self, info: PluginInfo) -> Result<LoadedPlugin> {
        if let Some(plugin) = self.loader.get(&info.name).await {
            return Ok(plugin);
        }
        let plugin = self.loader.load(&info.path).await?;
        if plugin.name != info.name {
            let _ = self.registry.remove(&info.name).await;
        }
        self.registry
            .register(PluginInfo {
                origin: info.origin,
                digest: info.digest,
                platform: info.platform,
                ..plugin.info()
            })
            .await?;
        Ok(plugin)
    }

    /// Register every plugin binary on the search path and in
    /// `SCHEMAHERO_PLUGIN_PATH`. Existing entries are kept. Returns how
    /// many were added.
    pub async fn discover_plugins(&self) -> Result<usize> {
        let mut dirs = self.search_paths.clone();
        dirs.extend(discovery::env_search_paths());

        let mut added = 0;
        for dir in &dirs {
            for info in discovery::scan_dir(dir) {
                if self.registry.find_for_engine(&info.name).await.is_some() {
                    continue;
                }
                if self.registry.register_if_absent(info).await? {
                    added += 1;
                }
            }
        }
        info!(added, searched = dirs.len(), "Plugin discovery finished");
        Ok(added)
    }

    /// Shut down every loaded plugin.
    pub async fn cleanup(&self) {
        self.loader.cleanup().await;
    }
}
