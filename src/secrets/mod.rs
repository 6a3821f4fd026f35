//! Connection values behind indirection.
//!
//! A database connection value is either inline, a key in a Kubernetes
//! `Secret`, or a Vault secret. [`SecretResolver`] turns a [`Database`] into
//! the URI and options a plugin connects with.

mod vault;

use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use tracing::debug;

use crate::api::{Database, DatabaseConnection, ValueOrValueFrom};
use crate::plugin::ConnectOptions;
use crate::store::{ResourceStore, StoreError};

pub use vault::{extract_uri, render_template, VaultClient, VaultReader};

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("{0} has no value")]
    Missing(String),

    #[error("Secret {namespace}/{name} not found")]
    SecretNotFound { namespace: String, name: String },

    #[error("Secret {namespace}/{name} has no key {key}")]
    KeyNotFound {
        namespace: String,
        name: String,
        key: String,
    },

    #[error("Secret value is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("Vault is not configured")]
    VaultUnavailable,

    #[error("Vault error: {0}")]
    Vault(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SecretError>;

/// Option keys used for engines that do not connect by URI.
pub mod option_keys {
    pub const HOSTS: &str = "hosts";
    pub const KEYSPACE: &str = "keyspace";
    pub const USERNAME: &str = "username";
    pub const PASSWORD: &str = "password";
}

/// What a plugin needs to open a connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedConnection {
    pub uri: String,
    pub options: Option<ConnectOptions>,
}

#[derive(Clone)]
pub struct SecretResolver {
    secrets: Arc<dyn ResourceStore<Secret>>,
    vault: Option<Arc<dyn VaultReader>>,
}

impl SecretResolver {
    pub fn new(secrets: Arc<dyn ResourceStore<Secret>>) -> Self {
        Self {
            secrets,
            vault: None,
        }
    }

    pub fn with_vault(mut self, vault: Arc<dyn VaultReader>) -> Self {
        self.vault = Some(vault);
        self
    }

    pub async fn resolve(&self, database: &Database) -> Result<ResolvedConnection> {
        let namespace = database.metadata.namespace.as_deref().unwrap_or("default");
        match &database.spec.connection {
            DatabaseConnection::Cassandra(c) => {
                let mut options = ConnectOptions::new();
                options.insert(option_keys::HOSTS.to_string(), c.hosts.join(","));
                options.insert(option_keys::KEYSPACE.to_string(), c.keyspace.clone());
                if let Some(username) = &c.username {
                    options.insert(
                        option_keys::USERNAME.to_string(),
                        self.value(namespace, username, "username").await?,
                    );
                }
                if let Some(password) = &c.password {
                    options.insert(
                        option_keys::PASSWORD.to_string(),
                        self.value(namespace, password, "password").await?,
                    );
                }
                Ok(ResolvedConnection {
                    uri: String::new(),
                    options: Some(options),
                })
            }
            other => {
                let value = other
                    .uri()
                    .ok_or_else(|| SecretError::Missing("connection uri".to_string()))?;
                Ok(ResolvedConnection {
                    uri: self.value(namespace, value, "connection uri").await?,
                    options: None,
                })
            }
        }
    }

    /// Resolve one value. `what` names the value in errors.
    pub async fn value(
        &self,
        namespace: &str,
        value: &ValueOrValueFrom,
        what: &str,
    ) -> Result<String> {
        if let Some(literal) = value.value.as_deref().filter(|v| !v.is_empty()) {
            return Ok(literal.to_string());
        }
        if let Some(key_ref) = value.secret_key_ref() {
            debug!(namespace, secret = %key_ref.name, key = %key_ref.key, "Reading connection value from secret");
            return self.secret_value(namespace, &key_ref.name, &key_ref.key).await;
        }
        if let Some(source) = value.vault() {
            let vault = self.vault.as_ref().ok_or(SecretError::VaultUnavailable)?;
            debug!(namespace, path = %source.secret, "Reading connection value from Vault");
            return vault.read(source).await;
        }
        Err(SecretError::Missing(what.to_string()))
    }

    async fn secret_value(&self, namespace: &str, name: &str, key: &str) -> Result<String> {
        let secret = self
            .secrets
            .get(namespace, name)
            .await?
            .ok_or_else(|| SecretError::SecretNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?;

        if let Some(bytes) = secret.data.as_ref().and_then(|d| d.get(key)) {
            return Ok(String::from_utf8(bytes.0.clone())?);
        }
        if let Some(value) = secret.string_data.as_ref().and_then(|d| d.get(key)) {
            return Ok(value.clone());
        }
        Err(SecretError::KeyNotFound {
            namespace: namespace.to_string(),
            name: name.to_string(),
            key: key.to_string(),
        })
    }
}

#[cfg(test)]
mod tests;
