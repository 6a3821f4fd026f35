//! Database engine plugins.
//!
//! Engine support lives in separate plugin processes. The host talks to a
//! plugin over a Unix socket with length-prefixed protobuf envelopes, one
//! request and one reply per call, multiplexed by sequence number.
//!
//! ```text
//! PluginManager ── registry ── PluginRegistry (metadata)
//!       │       └─ loader ──── PluginLoader ── Launcher ── plugin process
//!       │       └─ downloader ─ PluginDownloader ── OciRegistry
//!       └─ get_connection() ─> PluginConnection ─> PluginClient ─> PluginServer ─> EngineConnection
//! ```
//!
//! A plugin binary implements [`EnginePlugin`] and calls [`serve`] from
//! `main`.

pub mod client;
pub mod codec;
pub mod discovery;
pub mod downloader;
mod error;
pub mod global;
pub mod launcher;
pub mod loader;
pub mod manager;
pub mod oci;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod traits;

pub use client::{PluginClient, PluginConnection};
pub use downloader::{DownloadError, PluginDownloader};
pub use error::{PluginError, Result};
pub use launcher::{InProcessLauncher, Launcher, ProcessLauncher};
pub use loader::{LoadedPlugin, PluginLoader};
pub use manager::PluginManager;
pub use registry::{PluginInfo, PluginRegistry};
pub use server::{serve, PluginServer};
pub use traits::{ColumnInfo, ConnectOptions, EngineConnection, EnginePlugin};
