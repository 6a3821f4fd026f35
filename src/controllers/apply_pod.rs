//! Collects finished apply pods.
//!
//! A succeeded pod marks its `Migration` executed, mirrors `Applied` onto
//! the resource the migration was planned from, and is deleted. A failed
//! pod marks the `Migration` failed and is left for inspection.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::Resource;
use tracing::{debug, info, warn};

use super::lookup::{self, MigrationSource};
use super::migration::{LABEL_ROLE, ROLE_APPLY};
use super::runtime::owner_key;
use super::{Context, Outcome, Reconciler, Result};
use crate::api::{Migration, MigrationPhase, MigrationStatus, PhaseRegression, ResourcePhase};
use crate::store::{ObjectKey, ResourceStore};
use crate::utils::names::unix_now;

const POD_SUCCEEDED: &str = "Succeeded";
const POD_FAILED: &str = "Failed";

pub struct ApplyPodReconciler {
    ctx: Arc<Context>,
}

/// Move to `next`, passing through `Approved` when approval was recorded
/// by timestamp only.
fn record_outcome(
    status: &mut MigrationStatus,
    next: MigrationPhase,
    now: i64,
) -> std::result::Result<(), PhaseRegression> {
    if status.phase == Some(MigrationPhase::Planned) && status.approved_at > 0 {
        status.advance(MigrationPhase::Approved, now)?;
    }
    status.advance(next, now)
}

impl ApplyPodReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn owning_migration(&self, pod: &Pod) -> Result<Option<Migration>> {
        let Some(key) = owner_key(pod, &Migration::kind(&())) else {
            return Ok(None);
        };
        Ok(self
            .ctx
            .cluster
            .migrations
            .get(&key.namespace, &key.name)
            .await?)
    }

    /// Advance the migration; returns it if the phase changed.
    async fn advance(
        &self,
        mut migration: Migration,
        next: MigrationPhase,
        message: Option<String>,
    ) -> Result<Option<Migration>> {
        let now = unix_now();
        let status = migration.status.get_or_insert_with(MigrationStatus::default);
        if status.phase == Some(next) {
            return Ok(None);
        }
        record_outcome(status, next, now)?;
        status.message = message;
        Ok(Some(
            self.ctx.cluster.migrations.replace_status(&migration).await?,
        ))
    }

    async fn mirror_applied(&self, migration: &Migration) -> Result<()> {
        let cluster = &self.ctx.cluster;
        let status = migration.status.clone().unwrap_or_default();
        let Some(source) = lookup::migration_source(cluster, migration).await? else {
            debug!(migration = %ObjectKey::of(migration), "Migration source is gone");
            return Ok(());
        };
        match source {
            MigrationSource::Table(mut table) => {
                let s = table.status.get_or_insert_with(Default::default);
                if s.phase == Some(ResourcePhase::Applied) {
                    return Ok(());
                }
                s.phase = Some(ResourcePhase::Applied);
                s.approved_at = status.approved_at;
                s.applied_at = status.executed_at;
                s.message = None;
                cluster.tables.replace_status(&table).await?;
            }
            MigrationSource::View(mut view) => {
                let s = view.status.get_or_insert_with(Default::default);
                if s.phase == Some(ResourcePhase::Applied) {
                    return Ok(());
                }
                s.phase = Some(ResourcePhase::Applied);
                s.approved_at = status.approved_at;
                s.applied_at = status.executed_at;
                s.message = None;
                cluster.views.replace_status(&view).await?;
            }
            MigrationSource::DataMigration(mut data) => {
                let s = data.status.get_or_insert_with(Default::default);
                if s.phase == Some(ResourcePhase::Applied) {
                    return Ok(());
                }
                s.phase = Some(ResourcePhase::Applied);
                s.approved_at = status.approved_at;
                s.applied_at = status.executed_at;
                s.message = None;
                cluster.data_migrations.replace_status(&data).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for ApplyPodReconciler {
    type Object = Pod;

    const NAME: &'static str = "apply-pod";

    fn store(&self) -> Arc<dyn ResourceStore<Pod>> {
        self.ctx.cluster.pods.clone()
    }

    async fn apply(&self, pod: Pod) -> Result<Outcome> {
        let is_apply = pod
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(LABEL_ROLE))
            .is_some_and(|role| role == ROLE_APPLY);
        if !is_apply {
            return Ok(Outcome::Done);
        }
        let key = ObjectKey::of(&pod);
        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.clone())
            .unwrap_or_default();

        match phase.as_str() {
            POD_SUCCEEDED => {
                if let Some(migration) = self.owning_migration(&pod).await? {
                    let migration = match self
                        .advance(migration.clone(), MigrationPhase::Executed, None)
                        .await?
                    {
                        Some(executed) => {
                            info!(pod = %key, migration = %ObjectKey::of(&executed), "Migration executed");
                            executed
                        }
                        None => migration,
                    };
                    // Runs on every pass until the pod is gone, so a failed
                    // mirror is retried after the migration is already executed.
                    self.mirror_applied(&migration).await?;
                }
                self.ctx
                    .cluster
                    .pods
                    .delete(&key.namespace, &key.name)
                    .await?;
                debug!(pod = %key, "Deleted finished apply pod");
            }
            POD_FAILED => {
                let message = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.message.clone())
                    .unwrap_or_else(|| format!("apply pod {} failed", key.name));
                if let Some(migration) = self.owning_migration(&pod).await? {
                    if self
                        .advance(migration, MigrationPhase::Failed, Some(message))
                        .await?
                        .is_some()
                    {
                        warn!(pod = %key, "Apply pod failed, leaving it for inspection");
                    }
                }
            }
            _ => {}
        }
        Ok(Outcome::Done)
    }
}
