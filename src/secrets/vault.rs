//! Vault reads through the Kubernetes auth method.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::{Result, SecretError};
use crate::api::VaultSource;
use crate::config::VaultConfig;

const DEFAULT_AUTH_MOUNT: &str = "auth/kubernetes";

/// Reads a connection value held in Vault.
#[async_trait]
pub trait VaultReader: Send + Sync {
    async fn read(&self, source: &VaultSource) -> Result<String>;
}

pub struct VaultClient {
    http: reqwest::Client,
    address: Option<String>,
    token_path: PathBuf,
}

impl VaultClient {
    pub fn new(config: &VaultConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            address: config.address.clone(),
            token_path: config.token_path.clone(),
        }
    }

    async fn login(&self, address: &str, source: &VaultSource) -> Result<String> {
        let jwt = tokio::fs::read_to_string(&self.token_path).await?;
        let mount = auth_mount(source.kubernetes_auth_endpoint.as_deref());
        let url = format!("{}/v1/{}/login", address, mount);
        debug!(url = %url, role = %source.role, "Vault login");

        let response = self
            .http
            .post(&url)
            .json(&json!({ "role": source.role, "jwt": jwt.trim() }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SecretError::Vault(format!(
                "login at {} failed with {}",
                url,
                response.status()
            )));
        }
        let body: Value = response.json().await?;
        body.pointer("/auth/client_token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SecretError::Vault("login reply has no client token".to_string()))
    }
}

#[async_trait]
impl VaultReader for VaultClient {
    async fn read(&self, source: &VaultSource) -> Result<String> {
        let address = source
            .endpoint
            .clone()
            .or_else(|| self.address.clone())
            .ok_or(SecretError::VaultUnavailable)?;
        let address = address.trim_end_matches('/');
        let token = self.login(address, source).await?;

        let url = format!("{}/v1/{}", address, source.secret.trim_start_matches('/'));
        let response = self
            .http
            .get(&url)
            .header("X-Vault-Token", token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SecretError::Vault(format!(
                "read of {} failed with {}",
                source.secret,
                response.status()
            )));
        }
        let body: Value = response.json().await?;
        let data = body.get("data").cloned().unwrap_or(Value::Null);
        match source.connection_template.as_deref() {
            Some(template) => Ok(render_template(template, &data)),
            None => extract_uri(&data)
                .ok_or_else(|| SecretError::Vault(format!("{} holds no uri", source.secret))),
        }
    }
}

/// `auth/kubernetes`, or the configured mount with any `/v1/` prefix removed.
fn auth_mount(endpoint: Option<&str>) -> String {
    match endpoint.map(|e| e.trim_matches('/')).filter(|e| !e.is_empty()) {
        Some(e) => e.strip_prefix("v1/").unwrap_or(e).to_string(),
        None => DEFAULT_AUTH_MOUNT.to_string(),
    }
}

/// The `uri` field of a KV v2 (`data.data.uri`) or v1 (`data.uri`) secret.
pub fn extract_uri(data: &Value) -> Option<String> {
    data.pointer("/data/uri")
        .or_else(|| data.get("uri"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Render a connection template against a secret's `data`.
///
/// `{{ .Data.key }}` and `{{ .Data.data.key }}` are replaced with the
/// matching value; other actions such as `{{ with secret ... }}` and
/// `{{ end }}` render as nothing.
pub fn render_template(template: &str, data: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let action = after[..end].trim().trim_matches('-').trim();
        if let Some(value) = lookup(action, data) {
            out.push_str(&value);
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

fn lookup(action: &str, data: &Value) -> Option<String> {
    let path = action.strip_prefix(".Data.")?;
    let value = match path.strip_prefix("data.") {
        Some(key) => data.pointer(&format!("/data/{}", key)),
        None => data.get(path).or_else(|| data.pointer(&format!("/data/{}", path))),
    }?;
    Some(match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}
