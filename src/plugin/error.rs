use std::path::PathBuf;

/// Errors from the plugin host and the plugin runtime.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// A non-empty `error` field in a reply.
    #[error("{0}")]
    Remote(String),

    #[error("connection not found")]
    ConnectionNotFound,

    #[error("plugin protocol error: {0}")]
    Protocol(String),

    #[error("plugin handshake failed: {0}")]
    Handshake(String),

    #[error("invalid plugin: {0}")]
    Invalid(String),

    #[error("plugin binary {path} is not usable: {reason}")]
    Binary { path: PathBuf, reason: String },

    #[error("no plugin supports engine {0}")]
    NoPlugin(String),

    #[error("plugin {0} not registered")]
    NotRegistered(String),

    #[error("engine must not be empty")]
    EmptyEngine,

    #[error("connection uri must not be empty for engine {0}")]
    EmptyUri(String),

    #[error("unregistered payload type {0}")]
    UnregisteredType(String),

    #[error("payload type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("plugin {plugin} timed out during {method}")]
    Timeout { plugin: String, method: String },

    #[error("plugin download failed: {0}")]
    Download(#[from] super::downloader::DownloadError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("payload encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame decoding error: {0}")]
    Decode(#[from] prost::DecodeError),
}

impl PluginError {
    /// Whether the failure leaves the plugin process unusable.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            PluginError::Protocol(_) | PluginError::Io(_) | PluginError::Decode(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PluginError>;
