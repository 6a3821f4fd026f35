//! Resolving the objects a resource refers to.

use crate::api::{DataMigration, Database, Migration, SourceKind, Table, View};
use crate::store::{Cluster, ObjectKey, Result};

pub async fn database(
    cluster: &Cluster,
    namespace: &str,
    name: &str,
) -> Result<Option<Database>> {
    cluster.databases.get(namespace, name).await
}

/// The resource a `Migration` was planned from.
#[derive(Debug, Clone)]
pub enum MigrationSource {
    Table(Table),
    View(View),
    DataMigration(DataMigration),
}

impl MigrationSource {
    pub fn database_name(&self) -> &str {
        match self {
            MigrationSource::Table(t) => &t.spec.database,
            MigrationSource::View(v) => &v.spec.database,
            MigrationSource::DataMigration(d) => &d.spec.database,
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            MigrationSource::Table(_) => SourceKind::Table,
            MigrationSource::View(_) => SourceKind::View,
            MigrationSource::DataMigration(_) => SourceKind::DataMigration,
        }
    }
}

fn source_key(migration: &Migration) -> ObjectKey {
    let namespace = if migration.spec.table_namespace.is_empty() {
        ObjectKey::of(migration).namespace
    } else {
        migration.spec.table_namespace.clone()
    };
    ObjectKey::new(namespace, migration.spec.table_name.clone())
}

pub async fn migration_source(
    cluster: &Cluster,
    migration: &Migration,
) -> Result<Option<MigrationSource>> {
    let key = source_key(migration);
    Ok(match migration.spec.source_kind {
        SourceKind::Table => cluster
            .tables
            .get(&key.namespace, &key.name)
            .await?
            .map(MigrationSource::Table),
        SourceKind::View => cluster
            .views
            .get(&key.namespace, &key.name)
            .await?
            .map(MigrationSource::View),
        SourceKind::DataMigration => cluster
            .data_migrations
            .get(&key.namespace, &key.name)
            .await?
            .map(MigrationSource::DataMigration),
    })
}

/// The database a `Migration` targets.
pub async fn migration_database(
    cluster: &Cluster,
    migration: &Migration,
) -> Result<Option<Database>> {
    let key = source_key(migration);
    database(cluster, &key.namespace, &migration.spec.database_name).await
}
