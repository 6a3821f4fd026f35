//! Minimal OCI distribution client for plugin artifacts.
//!
//! Resolves `registry/repository:tag` to an image index, picks the manifest
//! for the host platform and downloads the layer holding the plugin binary.
//! Anonymous bearer tokens are requested when the registry challenges.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

use super::downloader::{Artifact, ArtifactSource, DownloadError, Platform, Result};

const INDEX_MEDIA_TYPES: &str = "application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json";
const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
const TITLE_ANNOTATION: &str = "org.opencontainers.image.title";

/// Parsed `registry/repository:tag`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub registry: String,
    pub repository: String,
    pub tag: String,
}

impl Reference {
    pub fn parse(reference: &str) -> Option<Self> {
        let (name, tag) = reference.rsplit_once(':')?;
        if tag.contains('/') {
            return None;
        }
        let (registry, repository) = name.split_once('/')?;
        if repository.is_empty() || tag.is_empty() {
            return None;
        }
        Some(Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            tag: tag.to_string(),
        })
    }

    /// Registry API host; Docker Hub serves the API on a separate host.
    pub fn api_host(&self) -> &str {
        match self.registry.as_str() {
            "docker.io" | "index.docker.io" => "registry-1.docker.io",
            other => other,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Descriptor {
    #[serde(default)]
    media_type: String,
    digest: String,
    #[serde(default)]
    platform: Option<DescriptorPlatform>,
    #[serde(default)]
    annotations: std::collections::HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct DescriptorPlatform {
    os: String,
    architecture: String,
}

/// Image index or image manifest; which fields are set tells them apart.
#[derive(Debug, Deserialize)]
struct ManifestDocument {
    #[serde(default)]
    manifests: Vec<Descriptor>,
    #[serde(default)]
    layers: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// [`ArtifactSource`] speaking the OCI distribution API over HTTPS.
pub struct OciRegistry {
    http: reqwest::Client,
    scheme: String,
    token: RwLock<Option<String>>,
}

impl OciRegistry {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| DownloadError::Client(e.to_string()))?;
        Ok(Self {
            http,
            scheme: "https".to_string(),
            token: RwLock::new(None),
        })
    }

    /// Plain HTTP, for local registries.
    pub fn insecure(mut self) -> Self {
        self.scheme = "http".to_string();
        self
    }

    fn fetch_error(reference: &str, message: impl Into<String>) -> DownloadError {
        DownloadError::Fetch {
            reference: reference.to_string(),
            message: message.into(),
        }
    }

    /// GET with the cached token, authenticating once on a 401 challenge.
    async fn get(&self, reference: &str, url: &str, accept: &str) -> Result<Response> {
        let send = |token: Option<String>| {
            let mut request = self.http.get(url).header(ACCEPT, accept);
            if let Some(token) = token {
                request = request.bearer_auth(token);
            }
            request.send()
        };

        let token = self.token.read().await.clone();
        let response = send(token)
            .await
            .map_err(|e| Self::fetch_error(reference, e.to_string()))?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Self::check(reference, response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let token = self.authenticate(reference, &challenge).await?;
        *self.token.write().await = Some(token.clone());
        let response = send(Some(token))
            .await
            .map_err(|e| Self::fetch_error(reference, e.to_string()))?;
        Self::check(reference, response)
    }

    fn check(reference: &str, response: Response) -> Result<Response> {
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(Self::fetch_error(
                reference,
                format!("{} returned {}", response.url(), response.status()),
            ))
        }
    }

    /// Anonymous token from a `Bearer realm=..,service=..,scope=..` challenge.
    async fn authenticate(&self, reference: &str, challenge: &str) -> Result<String> {
        let params = parse_challenge(challenge);
        let realm = params
            .iter()
            .find(|(k, _)| k == "realm")
            .map(|(_, v)| v.clone())
            .ok_or_else(|| Self::fetch_error(reference, "registry did not offer a token realm"))?;
        let query: Vec<(String, String)> = params.into_iter().filter(|(k, _)| k != "realm").collect();

        debug!(realm = %realm, "Requesting registry token");
        let response = self
            .http
            .get(&realm)
            .query(&query)
            .send()
            .await
            .map_err(|e| Self::fetch_error(reference, e.to_string()))?;
        let body: TokenResponse = Self::check(reference, response)?
            .json()
            .await
            .map_err(|e| Self::fetch_error(reference, e.to_string()))?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| Self::fetch_error(reference, "token response had no token"))
    }

    async fn manifest(&self, reference: &str, url: &str, accept: &str) -> Result<ManifestDocument> {
        self.get(reference, url, accept)
            .await?
            .json()
            .await
            .map_err(|e| Self::fetch_error(reference, format!("invalid manifest: {}", e)))
    }
}

/// Split `Bearer k="v",k2="v2"` into pairs.
fn parse_challenge(header: &str) -> Vec<(String, String)> {
    let params = header
        .trim()
        .strip_prefix("Bearer ")
        .or_else(|| header.trim().strip_prefix("bearer "))
        .unwrap_or_default();
    params
        .split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            Some((k.trim().to_string(), v.trim().trim_matches('"').to_string()))
        })
        .collect()
}

#[async_trait]
impl ArtifactSource for OciRegistry {
    async fn fetch(&self, reference: &str, platform: &Platform, file_name: &str) -> Result<Artifact> {
        let parsed = Reference::parse(reference)
            .ok_or_else(|| Self::fetch_error(reference, "malformed artifact reference"))?;
        let base = format!(
            "{}://{}/v2/{}",
            self.scheme,
            parsed.api_host(),
            parsed.repository
        );

        let top = self
            .manifest(
                reference,
                &format!("{}/manifests/{}", base, parsed.tag),
                INDEX_MEDIA_TYPES,
            )
            .await?;

        let manifest = if top.manifests.is_empty() {
            top
        } else {
            let entry = top
                .manifests
                .iter()
                .find(|m| {
                    m.platform
                        .as_ref()
                        .is_some_and(|p| p.os == platform.os && p.architecture == platform.arch)
                })
                .ok_or_else(|| DownloadError::NoPlatform {
                    reference: reference.to_string(),
                    platform: platform.to_string(),
                })?;
            debug!(digest = %entry.digest, media_type = %entry.media_type, "Selected platform manifest");
            self.manifest(
                reference,
                &format!("{}/manifests/{}", base, entry.digest),
                MANIFEST_MEDIA_TYPE,
            )
            .await?
        };

        let layer = manifest
            .layers
            .iter()
            .find(|l| l.annotations.get(TITLE_ANNOTATION).map(String::as_str) == Some(file_name))
            .or_else(|| manifest.layers.first())
            .ok_or_else(|| Self::fetch_error(reference, "manifest has no layers"))?;

        let bytes = self
            .get(
                reference,
                &format!("{}/blobs/{}", base, layer.digest),
                "application/octet-stream",
            )
            .await?
            .bytes()
            .await
            .map_err(|e| Self::fetch_error(reference, e.to_string()))?;

        Ok(Artifact {
            bytes: bytes.to_vec(),
            digest: layer.digest.clone(),
        })
    }
}
