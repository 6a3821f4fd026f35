//! Starting plugins and connecting to them.
//!
//! [`ProcessLauncher`] runs a plugin binary as a child process and connects
//! to the socket it announces. [`InProcessLauncher`] serves an
//! [`EnginePlugin`] over a socket pair inside this process, so everything
//! above the launcher runs unchanged without a binary.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::error::{PluginError, Result};
use super::protocol::{Handshake, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE};
use super::server::PluginServer;
use super::traits::EnginePlugin;

/// Default wait for a child's handshake line.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const STOP_GRACE: Duration = Duration::from_secs(2);

/// A plugin child process. Killed on drop if still running.
pub struct PluginProcess {
    child: Child,
    path: PathBuf,
}

impl PluginProcess {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// SIGTERM, then SIGKILL if the process outlives the grace period.
    pub async fn stop(&mut self) {
        let Some(pid) = self.child.id() else {
            return;
        };
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!(pid, error = %e, "Failed to send SIGTERM to plugin");
            }
        }
        match tokio::time::timeout(STOP_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(pid, status = ?status, path = %self.path.display(), "Plugin exited")
            }
            Ok(Err(e)) => warn!(pid, error = %e, "Failed to wait for plugin"),
            Err(_) => {
                warn!(pid, path = %self.path.display(), "Plugin ignored SIGTERM, killing");
                let _ = self.child.kill().await;
            }
        }
    }
}

impl Drop for PluginProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.start_kill();
        }
    }
}

/// A connected plugin, with its process when there is one.
pub struct LaunchedPlugin {
    pub stream: UnixStream,
    pub process: Option<PluginProcess>,
}

#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, path: &Path) -> Result<LaunchedPlugin>;
}

/// Refuse anything but an existing, executable regular file.
pub fn check_binary(path: &Path) -> Result<()> {
    let unusable = |reason: String| PluginError::Binary {
        path: path.to_path_buf(),
        reason,
    };
    let meta = std::fs::metadata(path).map_err(|e| unusable(e.to_string()))?;
    if !meta.is_file() {
        return Err(unusable("not a regular file".to_string()));
    }
    if meta.permissions().mode() & 0o111 == 0 {
        return Err(unusable("not executable".to_string()));
    }
    Ok(())
}

pub struct ProcessLauncher {
    handshake_timeout: Duration,
}

impl ProcessLauncher {
    pub fn new(handshake_timeout: Duration) -> Self {
        Self { handshake_timeout }
    }
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self::new(DEFAULT_HANDSHAKE_TIMEOUT)
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, path: &Path) -> Result<LaunchedPlugin> {
        check_binary(path)?;

        info!(path = %path.display(), "Starting plugin");
        let mut child = Command::new(path)
            .env(MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PluginError::Handshake("plugin stdout unavailable".to_string()))?;
        // Dropped on any early return below, which kills the child.
        let process = PluginProcess {
            child,
            path: path.to_path_buf(),
        };

        let mut lines = BufReader::new(stdout).lines();
        let line = tokio::time::timeout(self.handshake_timeout, lines.next_line())
            .await
            .map_err(|_| {
                PluginError::Handshake(format!(
                    "{} did not announce an address within {:?}",
                    path.display(),
                    self.handshake_timeout
                ))
            })??
            .ok_or_else(|| {
                PluginError::Handshake(format!("{} exited before the handshake", path.display()))
            })?;
        let handshake = Handshake::parse(&line)?;
        let stream = UnixStream::connect(&handshake.address).await?;
        debug!(pid = ?process.pid(), address = %handshake.address, "Plugin handshake complete");

        // Keep the pipe drained so a chatty plugin never blocks on stdout.
        let label = path.display().to_string();
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(plugin = %label, "{}", line);
            }
        });

        Ok(LaunchedPlugin {
            stream,
            process: Some(process),
        })
    }
}

/// Serves registered plugins from this process. Paths select the plugin;
/// the fallback, if set, answers any other path.
#[derive(Default)]
pub struct InProcessLauncher {
    plugins: HashMap<PathBuf, Arc<dyn EnginePlugin>>,
    fallback: Option<Arc<dyn EnginePlugin>>,
}

impl InProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plugin(mut self, path: impl Into<PathBuf>, plugin: Arc<dyn EnginePlugin>) -> Self {
        self.plugins.insert(path.into(), plugin);
        self
    }

    pub fn with_fallback(mut self, plugin: Arc<dyn EnginePlugin>) -> Self {
        self.fallback = Some(plugin);
        self
    }
}

#[async_trait]
impl Launcher for InProcessLauncher {
    async fn launch(&self, path: &Path) -> Result<LaunchedPlugin> {
        let plugin = self
            .plugins
            .get(path)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| PluginError::Binary {
                path: path.to_path_buf(),
                reason: "no in-process plugin for this path".to_string(),
            })?;

        let (host, plugin_side) = UnixStream::pair()?;
        let server = Arc::new(PluginServer::new(plugin));
        tokio::spawn(async move {
            if let Err(e) = server.serve_stream(plugin_side).await {
                warn!(error = %e, "In-process plugin stream failed");
            }
        });
        Ok(LaunchedPlugin {
            stream: host,
            process: None,
        })
    }
}
