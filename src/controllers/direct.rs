//! Kinds applied synchronously instead of through a `Migration`.
//!
//! Functions and extensions are planned and deployed in one pass. Both are
//! PostgreSQL-only; anything else is a no-op. With `removeOnDeletion` a
//! finalizer holds deletion until the teardown DDL has run.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::finalizer::{self, FinalizerState};
use super::lookup;
use super::{
    close_quietly, Context, Outcome, ReconcileError, Reconciler, Result, MISSING_DATABASE_REQUEUE,
};
use crate::api::{ApplyPhase, ApplyStatus, Database, Engine};
use crate::plugin::{self, EngineConnection, PluginConnection};
use crate::store::{Cluster, ObjectKey, ResourceStore, StoreObject};
use crate::utils::names::unix_now;

/// A kind deployed directly against its database.
#[async_trait]
pub trait DirectApply: StoreObject {
    /// Controller name used in logs.
    const CONTROLLER: &'static str;

    fn store(cluster: &Cluster) -> Arc<dyn ResourceStore<Self>>;

    fn database_name(&self) -> &str;

    fn remove_on_deletion(&self) -> bool;

    fn spec_sha(&self) -> String;

    fn apply_status(&self) -> Option<&ApplyStatus>;

    fn apply_status_mut(&mut self) -> &mut Option<ApplyStatus>;

    /// Whether this resource applies to `engine` at all.
    fn applies_to(&self, engine: Engine) -> bool;

    /// Statements creating the object, or dropping it when `teardown`.
    async fn statements(
        &self,
        conn: &PluginConnection,
        teardown: bool,
    ) -> plugin::Result<Vec<String>>;
}

pub struct DirectReconciler<K> {
    ctx: Arc<Context>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: DirectApply> DirectReconciler<K> {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            _kind: PhantomData,
        }
    }

    async fn database(&self, obj: &K) -> Result<Option<Database>> {
        let key = ObjectKey::of(obj);
        Ok(lookup::database(&self.ctx.cluster, &key.namespace, obj.database_name()).await?)
    }

    async fn deploy(&self, obj: &K, database: &Database, teardown: bool) -> Result<usize> {
        let conn = self.ctx.connect(database).await?;
        let result = async {
            let statements = obj.statements(&conn, teardown).await?;
            if !statements.is_empty() {
                conn.deploy_statements(&statements).await?;
            }
            Ok::<_, plugin::PluginError>(statements.len())
        }
        .await;
        close_quietly(&conn).await;
        Ok(result?)
    }

    /// Write `status` unless it is already stored.
    async fn write_status(&self, mut obj: K, status: ApplyStatus) -> Result<()> {
        if obj.apply_status() == Some(&status) {
            return Ok(());
        }
        *obj.apply_status_mut() = Some(status);
        K::store(&self.ctx.cluster).replace_status(&obj).await?;
        Ok(())
    }
}

#[async_trait]
impl<K: DirectApply> Reconciler for DirectReconciler<K> {
    type Object = K;

    const NAME: &'static str = K::CONTROLLER;

    fn store(&self) -> Arc<dyn ResourceStore<K>> {
        K::store(&self.ctx.cluster)
    }

    async fn apply(&self, obj: K) -> Result<Outcome> {
        let key = ObjectKey::of(&obj);
        if !self.ctx.settings.manages(obj.database_name()) {
            debug!(key = %key, database = %obj.database_name(), "Database not managed here");
            return Ok(Outcome::Done);
        }
        let Some(database) = self.database(&obj).await? else {
            info!(
                key = %key,
                database = %obj.database_name(),
                "Database not found, requeueing"
            );
            return Ok(Outcome::RequeueAfter(MISSING_DATABASE_REQUEUE));
        };
        if !obj.applies_to(database.engine()) {
            debug!(
                key = %key,
                engine = %database.engine(),
                "Not a PostgreSQL resource, skipping"
            );
            return Ok(Outcome::Done);
        }

        let store = K::store(&self.ctx.cluster);
        if finalizer::guard(store.as_ref(), &obj, obj.remove_on_deletion()).await? {
            debug!(key = %key, "Finalizer added");
            return Ok(Outcome::Done);
        }

        let sha = obj.spec_sha();
        let current = obj.apply_status();
        if current.and_then(|s| s.phase) == Some(ApplyPhase::Applied)
            && current.and_then(|s| s.last_applied_spec_sha.as_deref()) == Some(sha.as_str())
        {
            return Ok(Outcome::Done);
        }

        match self.deploy(&obj, &database, false).await {
            Ok(count) => {
                info!(key = %key, statements = count, "Applied");
                let status = ApplyStatus {
                    last_applied_spec_sha: Some(sha),
                    phase: Some(ApplyPhase::Applied),
                    applied_at: unix_now(),
                    message: None,
                };
                self.write_status(obj, status).await?;
                Ok(Outcome::Done)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Apply failed");
                let status = ApplyStatus {
                    last_applied_spec_sha: current.and_then(|s| s.last_applied_spec_sha.clone()),
                    phase: Some(ApplyPhase::Failed),
                    applied_at: current.map(|s| s.applied_at).unwrap_or_default(),
                    message: Some(e.to_string()),
                };
                self.write_status(obj, status).await?;
                Err(e)
            }
        }
    }

    async fn cleanup(&self, obj: K) -> Result<Outcome> {
        let key = ObjectKey::of(&obj);
        // Another manager owns the teardown.
        if !self.ctx.settings.manages(obj.database_name()) {
            return Ok(Outcome::Done);
        }
        let store = K::store(&self.ctx.cluster);
        let database = self.database(&obj).await?;
        let teardown_pending = finalizer::state(&obj, obj.remove_on_deletion())
            == FinalizerState::Finalizing { teardown: true };
        if database.is_none() && teardown_pending {
            info!(key = %key, database = %obj.database_name(), "Database not found, holding finalizer");
            return Ok(Outcome::RequeueAfter(MISSING_DATABASE_REQUEUE));
        }
        finalizer::finalize(store.as_ref(), &obj, obj.remove_on_deletion(), || async {
            if let Some(database) = database.as_ref().filter(|d| obj.applies_to(d.engine())) {
                let count = self.deploy(&obj, database, true).await?;
                info!(key = %key, statements = count, "Dropped");
            }
            Ok::<(), ReconcileError>(())
        })
        .await
    }
}
