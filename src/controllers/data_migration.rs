//! Data migrations.
//!
//! Operations compile to SQL once; the result is emitted as a single
//! `Migration` whose name is derived from the resource's identity, and the
//! resource records that name so later passes do nothing.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::ObjectMeta;
use kube::Resource;
use tracing::{debug, info};

use super::compile::compile;
use super::lookup;
use super::schema::upsert_migration;
use super::{Context, Outcome, ReconcileError, Reconciler, Result, MISSING_DATABASE_REQUEUE};
use crate::api::{
    DataMigration, DataMigrationStatus, Migration, MigrationSpec, MigrationStatus, ResourcePhase,
    SourceKind,
};
use crate::store::{ObjectKey, ResourceStore};
use crate::utils::names::{data_migration_name, unix_now};

pub struct DataMigrationReconciler {
    ctx: Arc<Context>,
}

impl DataMigrationReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Record a configuration error in status, once.
    async fn fail(&self, mut obj: DataMigration, err: ReconcileError) -> Result<Outcome> {
        let message = err.to_string();
        let status = obj.status.get_or_insert_with(DataMigrationStatus::default);
        if status.phase != Some(ResourcePhase::Failed) || status.message.as_deref() != Some(message.as_str())
        {
            status.phase = Some(ResourcePhase::Failed);
            status.message = Some(message);
            self.ctx.cluster.data_migrations.replace_status(&obj).await?;
        }
        Err(err)
    }
}

#[async_trait]
impl Reconciler for DataMigrationReconciler {
    type Object = DataMigration;

    const NAME: &'static str = "data-migration";

    fn store(&self) -> Arc<dyn ResourceStore<DataMigration>> {
        self.ctx.cluster.data_migrations.clone()
    }

    async fn apply(&self, obj: DataMigration) -> Result<Outcome> {
        if obj
            .status
            .as_ref()
            .is_some_and(|s| s.migration_name.is_some())
        {
            return Ok(Outcome::Done);
        }
        let key = ObjectKey::of(&obj);
        if !self.ctx.settings.manages(&obj.spec.database) {
            debug!(key = %key, database = %obj.spec.database, "Database not managed here");
            return Ok(Outcome::Done);
        }

        let database =
            lookup::database(&self.ctx.cluster, &key.namespace, &obj.spec.database).await?;
        let Some(database) = database else {
            info!(key = %key, database = %obj.spec.database, "Database not found, requeueing");
            return Ok(Outcome::RequeueAfter(MISSING_DATABASE_REQUEUE));
        };

        let engine = database.engine();
        let Some(family) = engine.family() else {
            return self.fail(obj, ReconcileError::UnsupportedEngine(engine)).await;
        };
        let statements = match compile(&obj.spec.operations, family) {
            Ok(statements) => statements,
            Err(e) => return self.fail(obj, e.into()).await,
        };
        if statements.is_empty() {
            debug!(key = %key, "No operations");
            return Ok(Outcome::Done);
        }

        let name = data_migration_name(&key.namespace, &key.name);
        let status = MigrationStatus::planned(unix_now(), database.spec.immediate_deploy);
        let migration = Migration {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(key.namespace.clone()),
                owner_references: obj.controller_owner_ref(&()).map(|r| vec![r]),
                ..Default::default()
            },
            spec: MigrationSpec {
                table_name: key.name.clone(),
                table_namespace: key.namespace.clone(),
                database_name: obj.spec.database.clone(),
                generated_ddl: statements.join(";\n"),
                edited_ddl: None,
                source_kind: SourceKind::DataMigration,
            },
            status: Some(status.clone()),
        };

        let existing = self.ctx.cluster.migrations.get(&key.namespace, &name).await?;
        let status = match existing {
            Some(existing) => existing.status.unwrap_or(status),
            None => {
                let created = upsert_migration(&self.ctx.cluster, migration).await?;
                info!(
                    key = %key,
                    migration = %name,
                    statements = statements.len(),
                    "Planned data migration"
                );
                created.status.unwrap_or(status)
            }
        };

        let mut updated = obj;
        let recorded = updated.status.get_or_insert_with(DataMigrationStatus::default);
        recorded.migration_name = Some(name);
        recorded.phase = Some(ResourcePhase::Planned);
        recorded.planned_at = status.planned_at;
        recorded.approved_at = status.approved_at;
        recorded.message = None;
        self.ctx.cluster.data_migrations.replace_status(&updated).await?;
        Ok(Outcome::Done)
    }
}
