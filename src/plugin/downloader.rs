//! Plugin binaries pulled from an artifact registry.
//!
//! `(engine, major)` maps to `{repository}/plugin-{engine}:{major}`; the
//! binary for the host platform is cached at
//! `{cache_dir}/{major}/schemahero-{engine}`. Concurrent requests for the same
//! key share one fetch.

use std::collections::HashMap;
use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Default plugin cache root.
pub const DEFAULT_CACHE_DIR: &str = "/tmp/plugins";
/// Default repository prefix.
pub const DEFAULT_REPOSITORY: &str = "docker.io/schemahero";
/// Major version during 0.x releases.
pub const DEFAULT_MAJOR_VERSION: &str = "0";

#[derive(Debug, Clone, thiserror::Error)]
pub enum DownloadError {
    #[error("failed to fetch {reference}: {message}")]
    Fetch { reference: String, message: String },

    #[error("{reference} has no artifact for {platform}")]
    NoPlatform { reference: String, platform: String },

    #[error("digest mismatch for {reference}: expected {expected}, got {actual}")]
    Digest {
        reference: String,
        expected: String,
        actual: String,
    },

    #[error("failed to install plugin from {reference}: {message}")]
    Install { reference: String, message: String },

    #[error("failed to build registry client: {0}")]
    Client(String),
}

pub type Result<T> = std::result::Result<T, DownloadError>;

/// `os/arch` in OCI platform terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn host() -> Self {
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            other => other,
        };
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            other => other,
        };
        Self {
            os: os.to_string(),
            arch: arch.to_string(),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}

/// A fetched plugin binary.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub bytes: Vec<u8>,
    /// `sha256:<hex>` as published; empty when the source has none.
    pub digest: String,
}

/// Where plugin artifacts come from.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Fetch the file named `file_name` for `platform` from `reference`.
    async fn fetch(&self, reference: &str, platform: &Platform, file_name: &str) -> Result<Artifact>;
}

/// Result of a download or cache hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedPlugin {
    pub engine: String,
    pub path: PathBuf,
    pub reference: String,
    pub digest: Option<String>,
    pub platform: String,
}

/// `postgresql` and `mariadb` are aliases; everything is lower-cased.
pub fn normalize_engine(engine: &str) -> String {
    match engine.to_lowercase().as_str() {
        "postgresql" => "postgres".to_string(),
        "mariadb" => "mysql".to_string(),
        other => other.to_string(),
    }
}

/// Binary file name for an engine's plugin.
pub fn binary_name(engine: &str) -> String {
    format!("schemahero-{}", engine)
}

/// Regular file with the owner-execute bit set.
pub fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o100 != 0)
        .unwrap_or(false)
}

type Flight = Shared<BoxFuture<'static, Result<DownloadedPlugin>>>;

pub struct PluginDownloader {
    cache_dir: PathBuf,
    repository: String,
    platform: Platform,
    source: Arc<dyn ArtifactSource>,
    inflight: Mutex<HashMap<(String, String), Flight>>,
}

impl PluginDownloader {
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        repository: impl Into<String>,
        source: Arc<dyn ArtifactSource>,
    ) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            repository: repository.into().trim_end_matches('/').to_string(),
            platform: Platform::host(),
            source,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn artifact_reference(&self, engine: &str, major: &str) -> String {
        format!(
            "{}/plugin-{}:{}",
            self.repository,
            normalize_engine(engine),
            major
        )
    }

    pub fn cached_path(&self, engine: &str, major: &str) -> PathBuf {
        self.cache_dir
            .join(major)
            .join(binary_name(&normalize_engine(engine)))
    }

    pub fn is_cached(&self, engine: &str, major: &str) -> bool {
        is_executable(&self.cached_path(engine, major))
    }

    /// Path to the engine's plugin, fetching it if not cached.
    pub async fn download(&self, engine: &str, major: &str) -> Result<DownloadedPlugin> {
        let engine = normalize_engine(engine);
        let path = self.cached_path(&engine, major);
        let reference = self.artifact_reference(&engine, major);
        if is_executable(&path) {
            return Ok(self.cache_hit(engine, path, reference));
        }

        let key = (engine.clone(), major.to_string());
        let flight = {
            let mut inflight = self.inflight.lock().await;
            if let Some(flight) = inflight.get(&key) {
                flight.clone()
            } else if is_executable(&path) {
                // Installed by a flight that finished since the first check.
                return Ok(self.cache_hit(engine, path, reference));
            } else {
                let flight = fetch_and_install(
                    self.source.clone(),
                    engine,
                    reference,
                    self.platform.clone(),
                    path,
                )
                .boxed()
                .shared();
                inflight.insert(key.clone(), flight.clone());
                flight
            }
        };

        let result = flight.clone().await;
        // Later callers hit the cache on success and retry on failure. A
        // newer flight for the same key is left alone.
        let mut inflight = self.inflight.lock().await;
        if inflight.get(&key).is_some_and(|f| f.ptr_eq(&flight)) {
            inflight.remove(&key);
        }
        result
    }

    fn cache_hit(&self, engine: String, path: PathBuf, reference: String) -> DownloadedPlugin {
        debug!(engine = %engine, path = %path.display(), "Plugin cache hit");
        DownloadedPlugin {
            engine,
            path,
            reference,
            digest: None,
            platform: self.platform.to_string(),
        }
    }
}

async fn fetch_and_install(
    source: Arc<dyn ArtifactSource>,
    engine: String,
    reference: String,
    platform: Platform,
    dest: PathBuf,
) -> Result<DownloadedPlugin> {
    info!(reference = %reference, platform = %platform, "Downloading plugin");
    let file_name = binary_name(&engine);
    let artifact = source.fetch(&reference, &platform, &file_name).await?;

    let actual = format!("sha256:{}", hex::encode(Sha256::digest(&artifact.bytes)));
    if !artifact.digest.is_empty() && artifact.digest != actual {
        return Err(DownloadError::Digest {
            reference,
            expected: artifact.digest,
            actual,
        });
    }

    let install_err = |e: std::io::Error| DownloadError::Install {
        reference: reference.clone(),
        message: e.to_string(),
    };
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(install_err)?;
    }
    let staging = dest.with_file_name(format!("{}.{}.partial", file_name, uuid::Uuid::new_v4()));
    tokio::fs::write(&staging, &artifact.bytes)
        .await
        .map_err(install_err)?;
    tokio::fs::set_permissions(&staging, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(install_err)?;
    if let Err(e) = tokio::fs::rename(&staging, &dest).await {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(install_err(e));
    }

    info!(reference = %reference, path = %dest.display(), digest = %actual, "Plugin installed");
    Ok(DownloadedPlugin {
        engine,
        path: dest,
        reference,
        digest: Some(actual),
        platform: platform.to_string(),
    })
}
