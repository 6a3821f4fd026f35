use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use tracing::warn;

use super::{ObjectKey, ResourceStore, Result, StoreError, StoreObject};

/// [`ResourceStore`] over the Kubernetes API.
pub struct KubeStore<K> {
    client: Client,
    namespace: Option<String>,
    label_selector: Option<String>,
    _kind: std::marker::PhantomData<fn() -> K>,
}

impl<K: StoreObject> KubeStore<K> {
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self {
            client,
            namespace,
            label_selector: None,
            _kind: std::marker::PhantomData,
        }
    }

    /// Restrict `list` and `watch` to matching objects.
    pub fn with_label_selector(mut self, selector: &str) -> Self {
        self.label_selector = Some(selector.to_string());
        self
    }

    fn namespaced(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn scoped(&self, namespace: Option<&str>) -> Api<K> {
        match namespace.or(self.namespace.as_deref()) {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn name_of(obj: &K) -> Result<String> {
        obj.meta()
            .name
            .clone()
            .ok_or_else(|| StoreError::MissingName(K::kind(&()).to_string()))
    }

    fn map_err(err: kube::Error, key: ObjectKey) -> StoreError {
        let kind = K::kind(&()).to_string();
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound { kind, key },
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                StoreError::AlreadyExists { kind, key }
            }
            kube::Error::Api(resp) if resp.code == 409 => StoreError::Conflict { kind, key },
            _ => StoreError::Kube(err),
        }
    }
}

#[async_trait]
impl<K: StoreObject> ResourceStore<K> for KubeStore<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.namespaced(namespace).get_opt(name).await?)
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>> {
        let mut params = ListParams::default();
        if let Some(selector) = &self.label_selector {
            params = params.labels(selector);
        }
        let list = self.scoped(namespace).list(&params).await?;
        Ok(list.items)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj);
        self.namespaced(&key.namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| Self::map_err(e, key))
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        let name = Self::name_of(obj)?;
        let key = ObjectKey::of(obj);
        self.namespaced(&key.namespace)
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| Self::map_err(e, key))
    }

    async fn replace_status(&self, obj: &K) -> Result<K> {
        let name = Self::name_of(obj)?;
        let key = ObjectKey::of(obj);
        let body = serde_json::to_vec(obj)?;
        self.namespaced(&key.namespace)
            .replace_status(&name, &PostParams::default(), body)
            .await
            .map_err(|e| Self::map_err(e, key))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .namespaced(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(Self::map_err(e, ObjectKey::new(namespace, name))),
        }
    }

    fn watch(&self) -> BoxStream<'static, K> {
        let api = self.scoped(None);
        let mut config = watcher::Config::default();
        if let Some(selector) = &self.label_selector {
            config = config.labels(selector);
        }
        let kind = K::kind(&()).to_string();
        watcher(api, config)
            .default_backoff()
            .applied_objects()
            .filter_map(move |event| {
                let kind = kind.clone();
                async move {
                    match event {
                        Ok(obj) => Some(obj),
                        Err(e) => {
                            warn!(kind = %kind, error = %e, "Watch error");
                            None
                        }
                    }
                }
            })
            .boxed()
    }
}
