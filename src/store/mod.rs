//! Declarative state store.
//!
//! Reconcilers talk to the state store through [`ResourceStore`], one typed
//! handle per kind. [`KubeStore`] is backed by the Kubernetes API server;
//! [`MemoryStore`] keeps objects in process and emulates the API server
//! semantics the controllers depend on (optimistic concurrency, finalizers,
//! status subresource, watch).

mod kubernetes;
mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret};
use k8s_openapi::NamespaceResourceScope;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::api::{
    DataMigration, Database, DatabaseExtension, Function, Migration, Table, View,
};

pub use kubernetes::KubeStore;
pub use memory::{MemoryCluster, MemoryStore};

/// Namespaced object identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a stored object. Objects without a namespace map to `default`.
    pub fn of<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.meta().namespace.clone().unwrap_or_else(|| "default".to_string()),
            name: obj.meta().name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: ObjectKey },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: String, key: ObjectKey },

    #[error("{kind} {key} was modified, re-read and retry")]
    Conflict { kind: String, key: ObjectKey },

    #[error("{0} object has no name")]
    MissingName(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Bounds shared by every kind held in a store.
pub trait StoreObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> StoreObject for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Typed access to one kind.
///
/// `replace` writes metadata and spec and leaves status untouched;
/// `replace_status` writes only status. A `resourceVersion` on the written
/// object makes the write conditional.
#[async_trait]
pub trait ResourceStore<K: StoreObject>: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// All objects, or those in one namespace.
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>>;

    async fn create(&self, obj: &K) -> Result<K>;

    async fn replace(&self, obj: &K) -> Result<K>;

    async fn replace_status(&self, obj: &K) -> Result<K>;

    /// Request deletion. Objects holding finalizers are only marked.
    /// Deleting an absent object succeeds.
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;

    /// Every object as it is created, changed, or marked for deletion.
    fn watch(&self) -> BoxStream<'static, K>;
}

/// Typed stores for every kind the controllers touch.
#[derive(Clone)]
pub struct Cluster {
    pub databases: Arc<dyn ResourceStore<Database>>,
    pub tables: Arc<dyn ResourceStore<Table>>,
    pub views: Arc<dyn ResourceStore<View>>,
    pub functions: Arc<dyn ResourceStore<Function>>,
    pub extensions: Arc<dyn ResourceStore<DatabaseExtension>>,
    pub data_migrations: Arc<dyn ResourceStore<DataMigration>>,
    pub migrations: Arc<dyn ResourceStore<Migration>>,
    pub config_maps: Arc<dyn ResourceStore<ConfigMap>>,
    pub pods: Arc<dyn ResourceStore<Pod>>,
    pub secrets: Arc<dyn ResourceStore<Secret>>,
}

impl Cluster {
    /// Stores backed by the API server. `namespace` scopes watches.
    pub fn kube(client: Client, namespace: Option<&str>) -> Self {
        let ns = namespace.map(str::to_string);
        Self {
            databases: Arc::new(KubeStore::new(client.clone(), ns.clone())),
            tables: Arc::new(KubeStore::new(client.clone(), ns.clone())),
            views: Arc::new(KubeStore::new(client.clone(), ns.clone())),
            functions: Arc::new(KubeStore::new(client.clone(), ns.clone())),
            extensions: Arc::new(KubeStore::new(client.clone(), ns.clone())),
            data_migrations: Arc::new(KubeStore::new(client.clone(), ns.clone())),
            migrations: Arc::new(KubeStore::new(client.clone(), ns.clone())),
            config_maps: Arc::new(KubeStore::new(client.clone(), ns.clone())),
            pods: Arc::new(
                KubeStore::new(client.clone(), ns.clone()).with_label_selector("schemahero-role=apply"),
            ),
            secrets: Arc::new(KubeStore::new(client, ns)),
        }
    }
}

/// Add `finalizer` unless present. Returns whether a write happened.
pub async fn ensure_finalizer<K: StoreObject>(
    store: &dyn ResourceStore<K>,
    obj: &K,
    finalizer: &str,
) -> Result<bool> {
    if has_finalizer(obj, finalizer) {
        return Ok(false);
    }
    let mut updated = obj.clone();
    updated
        .meta_mut()
        .finalizers
        .get_or_insert_with(Vec::new)
        .push(finalizer.to_string());
    store.replace(&updated).await?;
    Ok(true)
}

/// Drop `finalizer` if present. Returns whether a write happened.
pub async fn remove_finalizer<K: StoreObject>(
    store: &dyn ResourceStore<K>,
    obj: &K,
    finalizer: &str,
) -> Result<bool> {
    if !has_finalizer(obj, finalizer) {
        return Ok(false);
    }
    let mut updated = obj.clone();
    if let Some(finalizers) = updated.meta_mut().finalizers.as_mut() {
        finalizers.retain(|f| f != finalizer);
    }
    store.replace(&updated).await?;
    Ok(true)
}

pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == finalizer))
}

pub fn is_deleting<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

#[cfg(test)]
mod tests;
