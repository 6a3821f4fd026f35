//! Process-wide plugin manager.
//!
//! Code that is handed a manager should use that handle; this accessor is
//! for entry points that are not.

use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use super::manager::PluginManager;

static MANAGER: OnceLock<RwLock<Option<Arc<PluginManager>>>> = OnceLock::new();

fn slot() -> &'static RwLock<Option<Arc<PluginManager>>> {
    MANAGER.get_or_init(|| RwLock::new(None))
}

/// Install `manager` as the process-wide manager and return the handle.
pub fn init(manager: PluginManager) -> Arc<PluginManager> {
    let manager = Arc::new(manager);
    install(manager.clone());
    manager
}

/// Replace the process-wide manager, returning the previous one.
pub fn install(manager: Arc<PluginManager>) -> Option<Arc<PluginManager>> {
    slot()
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .replace(manager)
}

pub fn get() -> Option<Arc<PluginManager>> {
    slot()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Remove the process-wide manager. For tests.
pub fn reset() -> Option<Arc<PluginManager>> {
    slot().write().unwrap_or_else(PoisonError::into_inner).take()
}
