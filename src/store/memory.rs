//! In-process state store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use super::{Cluster, ObjectKey, ResourceStore, Result, StoreError, StoreObject};
use crate::api::{
    DataMigration, Database, DatabaseExtension, Function, Migration, Table, View,
};

const WATCH_CAPACITY: usize = 256;

/// Store that keeps objects in memory.
///
/// Mirrors the API server behaviour reconcilers observe: uid and
/// `resourceVersion` assignment, conditional writes, a separate status
/// write path, deletion blocked by finalizers.
pub struct MemoryStore<K> {
    objects: RwLock<BTreeMap<ObjectKey, K>>,
    version: AtomicU64,
    events: broadcast::Sender<K>,
    fail_on_write: RwLock<bool>,
}

impl<K: StoreObject> Default for MemoryStore<K> {
    fn default() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            objects: RwLock::new(BTreeMap::new()),
            version: AtomicU64::new(0),
            events,
            fail_on_write: RwLock::new(false),
        }
    }
}

impl<K: StoreObject> MemoryStore<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with a conflict.
    pub async fn set_fail_on_write(&self, fail: bool) {
        *self.fail_on_write.write().await = fail;
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    fn kind() -> String {
        K::kind(&()).to_string()
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn key_of(obj: &K) -> Result<ObjectKey> {
        if obj.meta().name.as_deref().unwrap_or_default().is_empty() {
            return Err(StoreError::MissingName(Self::kind()));
        }
        Ok(ObjectKey::of(obj))
    }

    async fn check_writable(&self, key: &ObjectKey) -> Result<()> {
        if *self.fail_on_write.read().await {
            return Err(StoreError::Conflict {
                kind: Self::kind(),
                key: key.clone(),
            });
        }
        Ok(())
    }

    fn check_version(existing: &K, incoming: &K, key: &ObjectKey) -> Result<()> {
        match incoming.meta().resource_version.as_deref() {
            Some(v) if Some(v) != existing.meta().resource_version.as_deref() => {
                Err(StoreError::Conflict {
                    kind: Self::kind(),
                    key: key.clone(),
                })
            }
            _ => Ok(()),
        }
    }

    fn not_found(key: &ObjectKey) -> StoreError {
        StoreError::NotFound {
            kind: Self::kind(),
            key: key.clone(),
        }
    }

    fn publish(&self, obj: &K) {
        // No receivers is fine.
        let _ = self.events.send(obj.clone());
    }

    /// Copy the `status` field of `from` onto `onto`, through JSON so any kind
    /// works. Kinds without status end up without one.
    fn with_status_of(onto: &K, from: &K) -> Result<K> {
        let mut target = serde_json::to_value(onto)?;
        let source = serde_json::to_value(from)?;
        if let Some(map) = target.as_object_mut() {
            match source.get("status") {
                Some(status) => {
                    map.insert("status".to_string(), status.clone());
                }
                None => {
                    map.remove("status");
                }
            }
        }
        Ok(serde_json::from_value(target)?)
    }

    /// Store `obj` under `key`, or drop it when deletion is complete.
    fn commit(&self, objects: &mut BTreeMap<ObjectKey, K>, key: ObjectKey, mut obj: K) -> K {
        obj.meta_mut().resource_version = Some(self.next_version());
        let released = obj.meta().deletion_timestamp.is_some()
            && obj.meta().finalizers.as_ref().map_or(true, |f| f.is_empty());
        if released {
            objects.remove(&key);
        } else {
            objects.insert(key, obj.clone());
        }
        self.publish(&obj);
        obj
    }
}

#[async_trait]
impl<K: StoreObject> ResourceStore<K> for MemoryStore<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let key = ObjectKey::new(namespace, name);
        Ok(self.objects.read().await.get(&key).cloned())
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>> {
        let objects = self.objects.read().await;
        Ok(objects
            .iter()
            .filter(|(key, _)| namespace.map_or(true, |ns| key.namespace == ns))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let key = Self::key_of(obj)?;
        self.check_writable(&key).await?;
        let mut objects = self.objects.write().await;
        if objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: Self::kind(),
                key,
            });
        }
        let mut created = obj.clone();
        let meta = created.meta_mut();
        meta.namespace = Some(key.namespace.clone());
        meta.uid = Some(Uuid::new_v4().to_string());
        meta.creation_timestamp = Some(Time(Utc::now()));
        meta.deletion_timestamp = None;
        Ok(self.commit(&mut objects, key, created))
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        let key = Self::key_of(obj)?;
        self.check_writable(&key).await?;
        let mut objects = self.objects.write().await;
        let existing = objects.get(&key).ok_or_else(|| Self::not_found(&key))?;
        Self::check_version(existing, obj, &key)?;

        let mut updated = Self::with_status_of(obj, existing)?;
        let meta = updated.meta_mut();
        meta.namespace = Some(key.namespace.clone());
        meta.uid = existing.meta().uid.clone();
        meta.creation_timestamp = existing.meta().creation_timestamp.clone();
        meta.deletion_timestamp = existing.meta().deletion_timestamp.clone();
        Ok(self.commit(&mut objects, key, updated))
    }

    async fn replace_status(&self, obj: &K) -> Result<K> {
        let key = Self::key_of(obj)?;
        self.check_writable(&key).await?;
        let mut objects = self.objects.write().await;
        let existing = objects.get(&key).ok_or_else(|| Self::not_found(&key))?;
        Self::check_version(existing, obj, &key)?;

        let updated = Self::with_status_of(existing, obj)?;
        Ok(self.commit(&mut objects, key, updated))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let key = ObjectKey::new(namespace, name);
        self.check_writable(&key).await?;
        let mut objects = self.objects.write().await;
        let Some(existing) = objects.get(&key) else {
            return Ok(());
        };
        if existing.meta().deletion_timestamp.is_some() {
            return Ok(());
        }
        let mut marked = existing.clone();
        marked.meta_mut().deletion_timestamp = Some(Time(Utc::now()));
        self.commit(&mut objects, key, marked);
        Ok(())
    }

    fn watch(&self) -> BoxStream<'static, K> {
        BroadcastStream::new(self.events.subscribe())
            .filter_map(|event| async move { event.ok() })
            .boxed()
    }
}

/// Memory-backed stores with typed handles, for tests and local runs.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    pub databases: Arc<MemoryStore<Database>>,
    pub tables: Arc<MemoryStore<Table>>,
    pub views: Arc<MemoryStore<View>>,
    pub functions: Arc<MemoryStore<Function>>,
    pub extensions: Arc<MemoryStore<DatabaseExtension>>,
    pub data_migrations: Arc<MemoryStore<DataMigration>>,
    pub migrations: Arc<MemoryStore<Migration>>,
    pub config_maps: Arc<MemoryStore<ConfigMap>>,
    pub pods: Arc<MemoryStore<Pod>>,
    pub secrets: Arc<MemoryStore<Secret>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cluster(&self) -> Cluster {
        Cluster {
            databases: self.databases.clone(),
            tables: self.tables.clone(),
            views: self.views.clone(),
            functions: self.functions.clone(),
            extensions: self.extensions.clone(),
            data_migrations: self.data_migrations.clone(),
            migrations: self.migrations.clone(),
            config_maps: self.config_maps.clone(),
            pods: self.pods.clone(),
            secrets: self.secrets.clone(),
        }
    }
}
