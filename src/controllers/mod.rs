//! Reconcilers that turn declared schema resources into applied DDL.
//!
//! ```text
//! Table / View ──plan──> Migration ──approve──> ConfigMap + apply Pod ──> Executed
//! DataMigration ─compile─┘                                    │
//!                                         ApplyPodReconciler ─┘ (mirror status, delete pod)
//! Function / DatabaseExtension ──plan + deploy directly──> ApplyStatus
//! ```
//!
//! Each reconciler implements [`Reconciler`] and is driven by a
//! [`Controller`] work queue.

pub mod apply_pod;
pub mod compile;
pub mod data_migration;
pub mod direct;
pub mod extension;
pub mod finalizer;
pub mod function;
pub mod lookup;
pub mod migration;
pub mod runtime;
pub mod schema;

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::api::{Database, Engine, PhaseRegression};
use crate::config::{self, ApplyConfig, Config};
use crate::plugin::{EngineConnection, PluginConnection, PluginError, PluginManager};
use crate::secrets::{SecretError, SecretResolver};
use crate::store::{Cluster, StoreError};

pub use apply_pod::ApplyPodReconciler;
pub use compile::CompileError;
pub use data_migration::DataMigrationReconciler;
pub use direct::DirectReconciler;
pub use migration::MigrationReconciler;
pub use runtime::{reconcile, Controller, Outcome, Reconciler, WorkQueue};
pub use schema::SchemaReconciler;

/// Requeue delay while a referenced `Database` does not exist yet.
pub const MISSING_DATABASE_REQUEUE: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("schema is declared for {schema} but the database is {database}")]
    EngineMismatch { schema: Engine, database: Engine },

    #[error("data migrations are not supported for {0}")]
    UnsupportedEngine(Engine),

    #[error("invalid data migration operation: {0}")]
    InvalidOperation(#[from] CompileError),

    #[error("invalid resource: {0}")]
    Invalid(String),

    #[error(transparent)]
    Phase(#[from] PhaseRegression),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ReconcileError {
    /// Configuration errors that another attempt cannot fix.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ReconcileError::EngineMismatch { .. }
                | ReconcileError::UnsupportedEngine(_)
                | ReconcileError::InvalidOperation(_)
                | ReconcileError::Invalid(_)
                | ReconcileError::Phase(_)
                | ReconcileError::Serialization(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

/// Controller settings taken from configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub managed_databases: Vec<String>,
    pub apply: ApplyConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            managed_databases: vec![config::ALL_DATABASES.to_string()],
            apply: ApplyConfig::default(),
        }
    }
}

impl Settings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            managed_databases: config.manager.managed_databases.clone(),
            apply: config.apply.clone(),
        }
    }

    /// Whether `database` belongs to this manager's shard.
    pub fn manages(&self, database: &str) -> bool {
        config::manages(&self.managed_databases, database)
    }
}

/// Everything a reconciler reaches outside its own object.
pub struct Context {
    pub cluster: Cluster,
    pub plugins: Arc<PluginManager>,
    pub secrets: SecretResolver,
    pub settings: Settings,
}

impl Context {
    pub fn new(cluster: Cluster, plugins: Arc<PluginManager>) -> Self {
        let secrets = SecretResolver::new(cluster.secrets.clone());
        Self {
            cluster,
            plugins,
            secrets,
            settings: Settings::default(),
        }
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_secrets(mut self, secrets: SecretResolver) -> Self {
        self.secrets = secrets;
        self
    }

    /// Open a plugin connection to `database`.
    pub async fn connect(&self, database: &Database) -> Result<PluginConnection> {
        let resolved = self.secrets.resolve(database).await?;
        let conn = self
            .plugins
            .get_connection(
                database.engine().as_str(),
                &resolved.uri,
                resolved.options.as_ref(),
            )
            .await?;
        Ok(conn)
    }
}

/// Close a connection whose work is done; a failed close only loses a
/// plugin-side handle.
pub(crate) async fn close_quietly(conn: &PluginConnection) {
    if let Err(e) = conn.close().await {
        debug!(connection_id = %conn.id(), error = %e, "Closing plugin connection failed");
    }
}

#[cfg(test)]
mod tests;
