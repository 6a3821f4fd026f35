//! Apply job runner.
//!
//! The apply pod runs `schemahero apply`, which reads the mounted DDL,
//! resolves the connection (literal URI, env, Vault agent file, or Cassandra
//! hosts) and deploys the statements in order through the engine plugin.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use backon::{BackoffBuilder, ExponentialBuilder, Retryable};
use tracing::{debug, info, warn};

use crate::api::{Engine, UnknownEngine};
use crate::plugin::{
    ConnectOptions, EngineConnection, PluginConnection, PluginError, PluginManager,
};
use crate::secrets::option_keys;
use crate::utils::retry::{connect_backoff, file_wait_backoff};

/// Separator the planners join statements with.
pub const STATEMENT_SEPARATOR: &str = ";\n";

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error(transparent)]
    Engine(#[from] UnknownEngine),

    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no connection given for {0}; pass --uri or --vault-uri-ref")]
    MissingConnection(Engine),

    #[error("cassandra needs at least one --host and a --keyspace")]
    MissingCassandraTarget,

    #[error("{0} did not appear in time")]
    VaultFileTimeout(PathBuf),

    #[error(transparent)]
    Plugin(#[from] PluginError),
}

pub type Result<T> = std::result::Result<T, ApplyError>;

/// Arguments of the `apply` subcommand.
#[derive(Debug, Clone, clap::Args)]
pub struct ApplyArgs {
    /// Database engine, e.g. `postgres` or `mysql`.
    #[arg(long)]
    pub driver: String,

    /// File holding the DDL to apply.
    #[arg(long)]
    pub ddl: PathBuf,

    /// Connection URI.
    #[arg(long, env = "SCHEMAHERO_URI", hide_env_values = true)]
    pub uri: Option<String>,

    /// File the Vault agent writes the connection URI to.
    #[arg(long)]
    pub vault_uri_ref: Option<PathBuf>,

    /// Cassandra contact point; repeat for several.
    #[arg(long = "host")]
    pub hosts: Vec<String>,

    #[arg(long)]
    pub keyspace: Option<String>,

    #[arg(long, env = "SCHEMAHERO_USERNAME", hide_env_values = true)]
    pub username: Option<String>,

    #[arg(long, env = "SCHEMAHERO_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
}

/// Split a DDL payload into statements, dropping blanks and trailing `;`.
pub fn split_statements(ddl: &str) -> Vec<String> {
    ddl.split(STATEMENT_SEPARATOR)
        .map(|s| s.trim().trim_end_matches(';').trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Wait for the Vault agent to write a non-empty URI to `path`.
pub async fn read_uri_file(path: &Path, backoff: ExponentialBuilder) -> Result<String> {
    let mut delays = backoff.build();
    loop {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) if !contents.trim().is_empty() => {
                return Ok(contents.trim().to_string())
            }
            Ok(_) => debug!(path = %path.display(), "URI file is still empty"),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "Waiting for URI file")
            }
            Err(source) => {
                return Err(ApplyError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
        match delays.next() {
            Some(delay) => tokio::time::sleep(delay).await,
            None => return Err(ApplyError::VaultFileTimeout(path.to_path_buf())),
        }
    }
}

/// Connection target resolved from the arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub engine: Engine,
    pub uri: String,
    pub options: Option<ConnectOptions>,
}

impl ApplyArgs {
    /// Resolve where to connect. Waits for the Vault file when one is given.
    pub async fn target(&self, file_backoff: ExponentialBuilder) -> Result<Target> {
        let engine: Engine = self.driver.parse()?;
        if !engine.uses_uri() {
            let keyspace = self.keyspace.as_deref().unwrap_or_default();
            if self.hosts.is_empty() || keyspace.is_empty() {
                return Err(ApplyError::MissingCassandraTarget);
            }
            let mut options = ConnectOptions::new();
            options.insert(option_keys::HOSTS.to_string(), self.hosts.join(","));
            options.insert(option_keys::KEYSPACE.to_string(), keyspace.to_string());
            if let Some(username) = &self.username {
                options.insert(option_keys::USERNAME.to_string(), username.clone());
            }
            if let Some(password) = &self.password {
                options.insert(option_keys::PASSWORD.to_string(), password.clone());
            }
            return Ok(Target {
                engine,
                uri: String::new(),
                options: Some(options),
            });
        }

        let uri = match (&self.vault_uri_ref, &self.uri) {
            (Some(path), _) => read_uri_file(path, file_backoff).await?,
            (None, Some(uri)) if !uri.trim().is_empty() => uri.trim().to_string(),
            _ => return Err(ApplyError::MissingConnection(engine)),
        };
        Ok(Target {
            engine,
            uri,
            options: None,
        })
    }
}

async fn connect(plugins: &PluginManager, target: &Target) -> Result<PluginConnection> {
    let conn = (|| async {
        plugins
            .get_connection(target.engine.as_str(), &target.uri, target.options.as_ref())
            .await
    })
    .retry(connect_backoff())
    .when(|e| matches!(e, PluginError::Remote(_) | PluginError::Timeout { .. }))
    .notify(|e, delay| {
        warn!(engine = %target.engine, error = %e, delay = ?delay, "Connect failed, retrying");
    })
    .await?;
    Ok(conn)
}

/// Apply the DDL in `args`. Returns how many statements ran.
pub async fn run(args: &ApplyArgs, plugins: &PluginManager) -> Result<usize> {
    let ddl = tokio::fs::read_to_string(&args.ddl)
        .await
        .map_err(|source| ApplyError::Read {
            path: args.ddl.clone(),
            source,
        })?;
    let statements = split_statements(&ddl);
    let target = args.target(file_wait_backoff()).await?;
    if statements.is_empty() {
        info!(engine = %target.engine, "Nothing to apply");
        return Ok(0);
    }

    let conn = connect(plugins, &target).await?;
    let result = conn.deploy_statements(&statements).await;
    if let Err(e) = conn.close().await {
        debug!(connection_id = %conn.id(), error = %e, "Closing plugin connection failed");
    }
    result?;

    info!(
        engine = %target.engine,
        statements = statements.len(),
        "Applied DDL"
    );
    Ok(statements.len())
}

#[cfg(test)]
mod tests;
