//! Local plugin binaries.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::downloader::is_executable;
use super::registry::PluginInfo;

/// Colon-separated extra plugin directories.
pub const PLUGIN_PATH_ENV: &str = "SCHEMAHERO_PLUGIN_PATH";

const BINARY_PREFIX: &str = "schemahero-";

/// Version recorded for a binary that has not been started yet.
pub const UNKNOWN_VERSION: &str = "unknown";

/// Built-in search directories, in precedence order.
pub fn default_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("."), PathBuf::from("./plugins/bin")];
    if let Some(home) = std::env::var_os("HOME") {
        paths.push(PathBuf::from(home).join(".schemahero").join("plugins"));
    }
    paths.push(PathBuf::from("/usr/local/lib/schemahero/plugins"));
    paths.push(PathBuf::from("/var/lib/schemahero/plugins"));
    paths
}

/// Directories from [`PLUGIN_PATH_ENV`].
pub fn env_search_paths() -> Vec<PathBuf> {
    std::env::var(PLUGIN_PATH_ENV)
        .map(|value| {
            value
                .split(':')
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Engines a driver binary is assumed to serve before it is asked.
pub fn engines_for_driver(driver: &str) -> Vec<String> {
    let engines: &[&str] = match driver {
        "postgres" => &["postgres", "postgresql"],
        "mysql" => &["mysql", "mariadb"],
        "cockroachdb" => &["cockroachdb"],
        "timescaledb" => &["timescaledb"],
        other => return vec![other.to_string()],
    };
    engines.iter().map(|e| e.to_string()).collect()
}

/// Metadata-only entries for every `schemahero-{driver}` executable in `dir`.
pub fn scan_dir(dir: &Path) -> Vec<PluginInfo> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut found: Vec<PluginInfo> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let path = entry.path();
            let file_name = path.file_name()?.to_str()?.to_string();
            let driver = file_name.strip_prefix(BINARY_PREFIX)?;
            if driver.is_empty() || driver.contains('.') || !is_executable(&path) {
                return None;
            }
            debug!(path = %path.display(), driver, "Found plugin binary");
            Some(PluginInfo {
                name: driver.to_string(),
                version: UNKNOWN_VERSION.to_string(),
                engines: engines_for_driver(driver),
                path,
                origin: None,
                digest: None,
                platform: None,
            })
        })
        .collect();
    found.sort_by(|a, b| a.name.cmp(&b.name));
    found
}
