//! Teardown-before-delete for kinds with `removeOnDeletion`.
//!
//! The state of a resource is read off its deletion timestamp and
//! finalizer list:
//!
//! ```text
//! live, teardown wanted, no finalizer ──guard──> live, finalizer held
//! deleting, finalizer held ──teardown ok──> finalizer removed (store deletes)
//!                          └─teardown err─> finalizer kept, retried
//! deleting, no finalizer ──> nothing to do
//! ```

use std::future::Future;

use kube::Resource;
use tracing::{info, warn};

use super::{Outcome, Result};
use crate::api::FINALIZER;
use crate::store::{
    ensure_finalizer, has_finalizer, is_deleting, remove_finalizer, ResourceStore, StoreObject,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizerState {
    /// Live and either holding the finalizer or not needing one.
    Active,
    /// Live, wants teardown on deletion, finalizer not installed yet.
    Unguarded,
    /// Deleting while holding the finalizer.
    Finalizing { teardown: bool },
    /// Deleting without the finalizer; the store removes it.
    Released,
}

pub fn state<K: Resource>(obj: &K, remove_on_deletion: bool) -> FinalizerState {
    let held = has_finalizer(obj, FINALIZER);
    match (is_deleting(obj), held) {
        (false, false) if remove_on_deletion => FinalizerState::Unguarded,
        (false, _) => FinalizerState::Active,
        (true, true) => FinalizerState::Finalizing {
            teardown: remove_on_deletion,
        },
        (true, false) => FinalizerState::Released,
    }
}

/// Install the finalizer if the resource wants teardown. Returns whether a
/// write happened; the write triggers another reconcile.
pub async fn guard<K: StoreObject>(
    store: &dyn ResourceStore<K>,
    obj: &K,
    remove_on_deletion: bool,
) -> Result<bool> {
    if state(obj, remove_on_deletion) != FinalizerState::Unguarded {
        return Ok(false);
    }
    Ok(ensure_finalizer(store, obj, FINALIZER).await?)
}

/// Run `teardown` and then release the finalizer. A failed teardown keeps
/// the finalizer so deletion stays pending and is retried.
pub async fn finalize<K, F, Fut>(
    store: &dyn ResourceStore<K>,
    obj: &K,
    remove_on_deletion: bool,
    teardown: F,
) -> Result<Outcome>
where
    K: StoreObject,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let name = obj.meta().name.as_deref().unwrap_or_default();
    match state(obj, remove_on_deletion) {
        FinalizerState::Finalizing { teardown: true } => {
            if let Err(e) = teardown().await {
                warn!(name, error = %e, "Teardown failed, keeping finalizer");
                return Err(e);
            }
            remove_finalizer(store, obj, FINALIZER).await?;
            info!(name, "Teardown complete, finalizer removed");
        }
        FinalizerState::Finalizing { teardown: false } => {
            remove_finalizer(store, obj, FINALIZER).await?;
        }
        FinalizerState::Active | FinalizerState::Unguarded | FinalizerState::Released => {}
    }
    Ok(Outcome::Done)
}
