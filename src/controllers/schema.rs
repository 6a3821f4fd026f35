//! Planning for tables and views.
//!
//! A spec is planned once per fingerprint. Planning connects to the live
//! database through the engine plugin and records the resulting DDL in a
//! `Migration` named after the fingerprint.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::ObjectMeta;
use tracing::{debug, info};

use super::lookup;
use super::{
    close_quietly, Context, Outcome, ReconcileError, Reconciler, Result, MISSING_DATABASE_REQUEUE,
};
use crate::api::{
    Database, Engine, Migration, MigrationSpec, MigrationStatus, ResourcePhase, SourceKind, Table,
    TableStatus, View,
};
use crate::plugin::{self, EngineConnection, PluginConnection};
use crate::store::{Cluster, ObjectKey, ResourceStore, StoreObject};
use crate::utils::names::{migration_id, unix_now};

/// A kind whose spec is planned into a `Migration`.
#[async_trait]
pub trait Plannable: StoreObject {
    const SOURCE_KIND: SourceKind;

    /// Controller name used in logs.
    const CONTROLLER: &'static str;

    fn store(cluster: &Cluster) -> Arc<dyn ResourceStore<Self>>;

    fn database_name(&self) -> &str;

    fn spec_sha(&self) -> String;

    /// Engine the declared schema is written for.
    fn schema_engine(&self) -> Engine;

    fn plan_status(&self) -> Option<&TableStatus>;

    fn plan_status_mut(&mut self) -> &mut TableStatus;

    async fn plan(
        &self,
        conn: &PluginConnection,
        database: &Database,
    ) -> plugin::Result<Vec<String>>;
}

#[async_trait]
impl Plannable for Table {
    const SOURCE_KIND: SourceKind = SourceKind::Table;
    const CONTROLLER: &'static str = "table";

    fn store(cluster: &Cluster) -> Arc<dyn ResourceStore<Self>> {
        cluster.tables.clone()
    }

    fn database_name(&self) -> &str {
        &self.spec.database
    }

    fn spec_sha(&self) -> String {
        Table::spec_sha(self)
    }

    fn schema_engine(&self) -> Engine {
        self.spec.schema.engine()
    }

    fn plan_status(&self) -> Option<&TableStatus> {
        self.status.as_ref()
    }

    fn plan_status_mut(&mut self) -> &mut TableStatus {
        self.status.get_or_insert_with(TableStatus::default)
    }

    async fn plan(
        &self,
        conn: &PluginConnection,
        database: &Database,
    ) -> plugin::Result<Vec<String>> {
        let seed_data = if database.spec.deploy_seed_data {
            self.spec.seed_data.as_ref()
        } else {
            None
        };
        conn.plan_table_schema(&self.spec.name, &self.spec.schema, seed_data)
            .await
    }
}

#[async_trait]
impl Plannable for View {
    const SOURCE_KIND: SourceKind = SourceKind::View;
    const CONTROLLER: &'static str = "view";

    fn store(cluster: &Cluster) -> Arc<dyn ResourceStore<Self>> {
        cluster.views.clone()
    }

    fn database_name(&self) -> &str {
        &self.spec.database
    }

    fn spec_sha(&self) -> String {
        View::spec_sha(self)
    }

    fn schema_engine(&self) -> Engine {
        self.spec.schema.engine()
    }

    fn plan_status(&self) -> Option<&TableStatus> {
        self.status.as_ref()
    }

    fn plan_status_mut(&mut self) -> &mut TableStatus {
        self.status.get_or_insert_with(TableStatus::default)
    }

    async fn plan(
        &self,
        conn: &PluginConnection,
        _database: &Database,
    ) -> plugin::Result<Vec<String>> {
        conn.plan_view_schema(&self.spec.name, &self.spec.schema).await
    }
}

/// Plans Tables or Views into Migrations.
pub struct SchemaReconciler<S> {
    ctx: Arc<Context>,
    _kind: PhantomData<fn() -> S>,
}

impl<S: Plannable> SchemaReconciler<S> {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            _kind: PhantomData,
        }
    }

    async fn mark_planned(
        &self,
        mut obj: S,
        sha: String,
        status: &MigrationStatus,
    ) -> Result<()> {
        let planned = obj.plan_status_mut();
        planned.last_planned_spec_sha = Some(sha);
        planned.phase = Some(ResourcePhase::Planned);
        planned.planned_at = status.planned_at;
        planned.approved_at = status.approved_at;
        planned.message = None;
        S::store(&self.ctx.cluster).replace_status(&obj).await?;
        Ok(())
    }

    async fn mark_failed(&self, mut obj: S, sha: String, err: &ReconcileError) -> Result<()> {
        let status = obj.plan_status_mut();
        status.last_planned_spec_sha = Some(sha);
        status.phase = Some(ResourcePhase::Failed);
        status.message = Some(err.to_string());
        S::store(&self.ctx.cluster).replace_status(&obj).await?;
        Ok(())
    }
}

#[async_trait]
impl<S: Plannable> Reconciler for SchemaReconciler<S> {
    type Object = S;

    const NAME: &'static str = S::CONTROLLER;

    fn store(&self) -> Arc<dyn ResourceStore<S>> {
        S::store(&self.ctx.cluster)
    }

    async fn apply(&self, obj: S) -> Result<Outcome> {
        let key = ObjectKey::of(&obj);
        let database_name = obj.database_name().to_string();
        if !self.ctx.settings.manages(&database_name) {
            debug!(key = %key, database = %database_name, "Database not managed here");
            return Ok(Outcome::Done);
        }

        let sha = obj.spec_sha();
        if obj
            .plan_status()
            .and_then(|s| s.last_planned_spec_sha.as_deref())
            == Some(sha.as_str())
        {
            return Ok(Outcome::Done);
        }

        let database = lookup::database(&self.ctx.cluster, &key.namespace, &database_name).await?;
        let Some(database) = database else {
            info!(key = %key, database = %database_name, "Database not found, requeueing");
            return Ok(Outcome::RequeueAfter(MISSING_DATABASE_REQUEUE));
        };

        let engine = database.engine();
        if obj.schema_engine() != engine {
            let err = ReconcileError::EngineMismatch {
                schema: obj.schema_engine(),
                database: engine,
            };
            self.mark_failed(obj, sha, &err).await?;
            return Err(err);
        }

        let name = migration_id(&sha);
        let migrations = &self.ctx.cluster.migrations;
        if let Some(existing) = migrations.get(&key.namespace, &name).await? {
            debug!(key = %key, migration = %name, "Migration already exists");
            let status = existing.status.unwrap_or_default();
            self.mark_planned(obj, sha, &status).await?;
            return Ok(Outcome::Done);
        }

        let conn = self.ctx.connect(&database).await?;
        let planned = obj.plan(&conn, &database).await;
        close_quietly(&conn).await;
        let statements = planned?;
        if statements.is_empty() {
            debug!(key = %key, "Live schema already matches");
            return Ok(Outcome::Done);
        }

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
                database_name,
                generated_ddl: statements.join(";\n"),
                edited_ddl: None,
                source_kind: S::SOURCE_KIND,
            },
            status: Some(status.clone()),
        };
        upsert_migration(&self.ctx.cluster, migration).await?;
        info!(
            key = %key,
            migration = %name,
            statements = statements.len(),
            approved = status.approved_at > 0,
            "Planned migration"
        );

        self.mark_planned(obj, sha, &status).await?;
        Ok(Outcome::Done)
    }
}

/// Create `migration`, or bring an existing one of the same name in line
/// with it. Status is written through the status path either way.
pub async fn upsert_migration(cluster: &Cluster, migration: Migration) -> Result<Migration> {
    let key = ObjectKey::of(&migration);
    let status = migration.status.clone();
    let stored = match cluster.migrations.create(&migration).await {
        Ok(created) => created,
        Err(e) if e.is_already_exists() => {
            let Some(mut existing) = cluster.migrations.get(&key.namespace, &key.name).await?
            else {
                return Err(e.into());
            };
            debug!(migration = %key, "Migration exists, updating in place");
            existing.spec = migration.spec;
            existing.metadata.owner_references = migration.metadata.owner_references;
            cluster.migrations.replace(&existing).await?
        }
        Err(e) => return Err(e.into()),
    };
    if stored.status == status {
        return Ok(stored);
    }
    let mut with_status = stored;
    with_status.status = status;
    Ok(cluster.migrations.replace_status(&with_status).await?)
}
