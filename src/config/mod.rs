//! Application configuration.
//!
//! One [`Config`] for both binaries, loaded from YAML files and
//! `SCHEMAHERO__`-prefixed environment variables.

use std::path::PathBuf;

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "schemahero.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "SCHEMAHERO_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "SCHEMAHERO";
/// Environment variable read for the default Vault address.
pub const VAULT_ADDR_ENV_VAR: &str = "VAULT_ADDR";

/// Wildcard entry in `managed_databases`.
pub const ALL_DATABASES: &str = "*";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub manager: ManagerConfig,
    pub plugins: PluginsConfig,
    pub apply: ApplyConfig,
    pub vault: VaultConfig,
}

/// Controller manager settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Databases this manager reconciles. `*` matches every database.
    pub managed_databases: Vec<String>,
    /// Reconcile workers per controller.
    pub workers: usize,
    /// Watch one namespace instead of the whole cluster.
    pub namespace: Option<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            managed_databases: vec![ALL_DATABASES.to_string()],
            workers: 4,
            namespace: None,
        }
    }
}

impl ManagerConfig {
    /// Whether `database` is in this manager's shard.
    pub fn manages(&self, database: &str) -> bool {
        manages(&self.managed_databases, database)
    }
}

/// True if `database` is listed or the list holds the wildcard.
pub fn manages(managed: &[String], database: &str) -> bool {
    managed
        .iter()
        .any(|m| m == ALL_DATABASES || m == database)
}

/// Plugin discovery, download and launch settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Root of the downloaded plugin cache.
    pub cache_dir: PathBuf,
    /// Artifact repository prefix, e.g. `docker.io/schemahero`.
    pub repository: String,
    /// Plugin major version tag.
    pub major_version: String,
    /// Extra directories searched for plugin binaries.
    pub search_paths: Vec<PathBuf>,
    pub handshake_timeout_secs: u64,
    /// Longest a plugin call may run before it fails with a timeout.
    pub call_timeout_secs: u64,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("/tmp/plugins"),
            repository: "docker.io/schemahero".to_string(),
            major_version: "0".to_string(),
            search_paths: Vec::new(),
            handshake_timeout_secs: 10,
            call_timeout_secs: 300,
        }
    }
}

/// Apply pod settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApplyConfig {
    /// Image run by apply pods unless the database overrides it.
    pub image: String,
    pub service_account: Option<String>,
    /// Where the Vault agent writes the connection URI inside apply pods.
    pub vault_secret_path: String,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            image: "schemahero/schemahero:alpha".to_string(),
            service_account: None,
            vault_secret_path: "/vault/secrets/schemaherouri".to_string(),
        }
    }
}

/// Vault access for planning-time URI reads.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub address: Option<String>,
    /// Service account token presented to the Kubernetes auth method.
    pub token_path: PathBuf,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            address: std::env::var(VAULT_ADDR_ENV_VAR).ok(),
            token_path: PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/token"),
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `schemahero.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `SCHEMAHERO_CONFIG` environment variable (if set)
    /// 4. Environment variables with `SCHEMAHERO__` prefix
    pub fn load(path: Option<&str>) -> Result<Self> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("manager.managed_databases")
                    .with_list_parse_key("plugins.search_paths")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.manager.workers == 0 {
            return Err(ConfigError::Invalid(
                "manager.workers must be at least 1".to_string(),
            ));
        }
        if self.manager.managed_databases.is_empty() {
            return Err(ConfigError::Invalid(
                "manager.managed_databases must not be empty".to_string(),
            ));
        }
        if self.plugins.repository.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "plugins.repository must not be empty".to_string(),
            ));
        }
        if self.plugins.call_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "plugins.call_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests;
