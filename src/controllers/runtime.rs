//! Work queue and controller loop shared by every reconciler.
//!
//! Watch events become keys on a [`WorkQueue`]; a bounded set of workers
//! pops keys and runs [`reconcile`]. A key is never processed by two
//! workers at once, and events for a key that is queued or in flight
//! coalesce into one more pass.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use kube::Resource;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::Result;
use crate::store::{is_deleting, ObjectKey, ResourceStore, StoreObject};
use crate::utils::retry::{nth_delay, reconcile_backoff};

/// Longest delay between retries of a failing key.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

/// What the runtime should do with a key after a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    RequeueAfter(Duration),
}

/// Drives one kind toward its declared state.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    type Object: StoreObject;

    /// Short name used in logs.
    const NAME: &'static str;

    fn store(&self) -> Arc<dyn ResourceStore<Self::Object>>;

    /// Normal path: the object exists and is not being deleted.
    async fn apply(&self, obj: Self::Object) -> Result<Outcome>;

    /// Deletion path: the object has a deletion timestamp.
    async fn cleanup(&self, obj: Self::Object) -> Result<Outcome> {
        let _ = obj;
        Ok(Outcome::Done)
    }
}

/// One pass for `key`: fetch, then route on the deletion timestamp.
/// A missing object is done.
pub async fn reconcile<R: Reconciler>(reconciler: &R, key: &ObjectKey) -> Result<Outcome> {
    let Some(obj) = reconciler.store().get(&key.namespace, &key.name).await? else {
        debug!(controller = R::NAME, key = %key, "Object is gone");
        return Ok(Outcome::Done);
    };
    if is_deleting(&obj) {
        reconciler.cleanup(obj).await
    } else {
        reconciler.apply(obj).await
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<ObjectKey>,
    queued: HashSet<ObjectKey>,
    active: HashSet<ObjectKey>,
    /// Keys that were added while active; requeued when released.
    dirty: HashSet<ObjectKey>,
    shutdown: bool,
}

/// Deduplicating FIFO of object keys.
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    ready: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, key: ObjectKey) {
        let mut state = self.state.lock().await;
        if state.shutdown || state.queued.contains(&key) {
            return;
        }
        if state.active.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        state.queued.insert(key.clone());
        state.pending.push_back(key);
        drop(state);
        self.ready.notify_one();
    }

    /// Add `key` once `delay` has elapsed.
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key).await;
        });
    }

    /// Next key to process, or `None` after shutdown. The key stays active
    /// until [`WorkQueue::done`].
    pub async fn next(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.ready.notified();
            {
                let mut state = self.state.lock().await;
                if state.shutdown {
                    return None;
                }
                if let Some(key) = state.pending.pop_front() {
                    state.queued.remove(&key);
                    state.active.insert(key.clone());
                    if !state.pending.is_empty() {
                        self.ready.notify_one();
                    }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Release `key`; it is queued again if it changed while active.
    pub async fn done(&self, key: &ObjectKey) {
        let mut state = self.state.lock().await;
        state.active.remove(key);
        if state.dirty.remove(key) && !state.shutdown && state.queued.insert(key.clone()) {
            state.pending.push_back(key.clone());
            drop(state);
            self.ready.notify_one();
        }
    }

    pub async fn shutdown(&self) {
        self.state.lock().await.shutdown = true;
        self.ready.notify_waiters();
    }

    /// Keys waiting to be processed.
    pub async fn len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Key of the controlling owner of `obj`, if that owner is of kind `kind`.
pub fn owner_key<K: Resource>(obj: &K, kind: &str) -> Option<ObjectKey> {
    let namespace = obj.meta().namespace.clone()?;
    obj.meta()
        .owner_references
        .as_ref()?
        .iter()
        .find(|r| r.kind == kind && r.controller == Some(true))
        .map(|r| ObjectKey::new(namespace, r.name.clone()))
}

/// Runs a [`Reconciler`] against its own watch plus any extra triggers.
pub struct Controller<R: Reconciler> {
    reconciler: Arc<R>,
    workers: usize,
    triggers: Vec<BoxStream<'static, ObjectKey>>,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(reconciler: Arc<R>) -> Self {
        Self {
            reconciler,
            workers: 1,
            triggers: Vec::new(),
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Reconcile the keys `mapper` derives from another kind's events.
    pub fn watches<K, F>(mut self, events: BoxStream<'static, K>, mapper: F) -> Self
    where
        K: Send + 'static,
        F: Fn(&K) -> Option<ObjectKey> + Send + 'static,
    {
        self.triggers.push(
            events
                .filter_map(move |obj| futures::future::ready(mapper(&obj)))
                .boxed(),
        );
        self
    }

    /// Reconcile the owner whenever an object it controls changes.
    pub fn owns<K: StoreObject>(self, events: BoxStream<'static, K>) -> Self {
        let kind = R::Object::kind(&()).to_string();
        self.watches(events, move |obj: &K| owner_key(obj, &kind))
    }

    /// Process events until `shutdown` resolves. In-flight reconciles are
    /// cancelled on shutdown.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let Controller {
            reconciler,
            workers,
            mut triggers,
        } = self;
        let queue = Arc::new(WorkQueue::new());
        let store = reconciler.store();

        // Subscribe before listing so nothing created in between is missed.
        triggers.push(store.watch().map(|obj| ObjectKey::of(&obj)).boxed());
        let feeder = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut events = stream::select_all(triggers);
                while let Some(key) = events.next().await {
                    queue.add(key).await;
                }
            })
        };
        match store.list(None).await {
            Ok(objects) => {
                for obj in &objects {
                    queue.add(ObjectKey::of(obj)).await;
                }
            }
            Err(e) => warn!(controller = R::NAME, error = %e, "Initial list failed"),
        }

        info!(controller = R::NAME, workers, "Controller started");
        let failures = Arc::new(Mutex::new(HashMap::new()));
        let mut pool = JoinSet::new();
        for _ in 0..workers {
            pool.spawn(work(reconciler.clone(), queue.clone(), failures.clone()));
        }

        shutdown.await;
        info!(controller = R::NAME, "Stopping controller");
        queue.shutdown().await;
        feeder.abort();
        pool.abort_all();
        while pool.join_next().await.is_some() {}
    }
}

async fn work<R: Reconciler>(
    reconciler: Arc<R>,
    queue: Arc<WorkQueue>,
    failures: Arc<Mutex<HashMap<ObjectKey, usize>>>,
) {
    while let Some(key) = queue.next().await {
        let result = reconcile(reconciler.as_ref(), &key).await;
        let retry = match result {
            Ok(Outcome::Done) => {
                failures.lock().await.remove(&key);
                None
            }
            Ok(Outcome::RequeueAfter(delay)) => {
                failures.lock().await.remove(&key);
                debug!(controller = R::NAME, key = %key, ?delay, "Requeue requested");
                Some(delay)
            }
            Err(e) if e.is_permanent() => {
                failures.lock().await.remove(&key);
                error!(controller = R::NAME, key = %key, error = %e, "Reconcile failed permanently");
                None
            }
            Err(e) => {
                let attempt = {
                    let mut failures = failures.lock().await;
                    let count = failures.entry(key.clone()).or_insert(0);
                    *count += 1;
                    *count - 1
                };
                let delay = nth_delay(reconcile_backoff(), attempt, MAX_RETRY_DELAY);
                warn!(controller = R::NAME, key = %key, error = %e, attempt, ?delay, "Reconcile failed, retrying");
                Some(delay)
            }
        };
        queue.done(&key).await;
        if let Some(delay) = retry {
            queue.add_after(key, delay);
        }
    }
}
