//! Test utilities and fixtures.
//!
//! [`StubPlugin`] is an in-memory engine plugin that plans PostgreSQL/MySQL
//! style DDL from the declared schema and records every call, so plugin,
//! manager and controller tests run the real wire protocol without a
//! database.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::ObjectMeta;
use tokio::sync::RwLock;

use crate::api::schema::{
    ColumnConstraints, ForeignKey, Index, PostgresqlFunctionSchema, PostgresqlTableColumn,
    PostgresqlTableSchema, TableSchema, ViewSchema,
};
use crate::api::{
    Database, DatabaseConnection, DatabaseSpec, MysqlConnection, PostgresConnection,
    PostgresDatabaseExtension, SeedData, Table, TableSpec, ValueOrValueFrom,
};
use crate::plugin::codec;
use crate::plugin::{
    ColumnInfo, ConnectOptions, EngineConnection, EnginePlugin, InProcessLauncher, PluginError,
    PluginInfo, PluginManager, PluginRegistry, Result,
};

/// Shared by a [`StubPlugin`] and every connection it hands out.
#[derive(Default)]
pub struct StubState {
    connects: AtomicUsize,
    existing_tables: RwLock<BTreeSet<String>>,
    planned_tables: RwLock<Vec<(String, TableSchema)>>,
    deployed: RwLock<Vec<String>>,
    validated: RwLock<Vec<ConnectOptions>>,
    fail_on_connect: RwLock<bool>,
    fail_on_validate: RwLock<bool>,
    fail_on_deploy: RwLock<bool>,
    hang_on_deploy: RwLock<bool>,
}

impl StubState {
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub async fn planned_tables(&self) -> Vec<(String, TableSchema)> {
        self.planned_tables.read().await.clone()
    }

    pub async fn deployed(&self) -> Vec<String> {
        self.deployed.read().await.clone()
    }

    pub async fn validated(&self) -> Vec<ConnectOptions> {
        self.validated.read().await.clone()
    }

    pub async fn set_fail_on_connect(&self, fail: bool) {
        *self.fail_on_connect.write().await = fail;
    }

    pub async fn set_fail_on_validate(&self, fail: bool) {
        *self.fail_on_validate.write().await = fail;
    }

    pub async fn set_fail_on_deploy(&self, fail: bool) {
        *self.fail_on_deploy.write().await = fail;
    }

    /// Make deploys accept the call and never answer.
    pub async fn set_hang_on_deploy(&self, hang: bool) {
        *self.hang_on_deploy.write().await = hang;
    }

    /// Pretend `table` already exists, so planning it yields nothing.
    pub async fn add_existing_table(&self, table: &str) {
        self.existing_tables.write().await.insert(table.to_string());
    }
}

#[derive(Clone)]
pub struct StubPlugin {
    name: String,
    version: String,
    engines: Vec<String>,
    state: Arc<StubState>,
}

impl StubPlugin {
    pub fn new(name: &str, version: &str, engines: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            engines: engines.iter().map(|e| e.to_string()).collect(),
            state: Arc::new(StubState::default()),
        }
    }

    /// Serves the PostgreSQL family.
    pub fn postgres() -> Self {
        Self::new(
            "postgres",
            "0.1.0",
            &["postgres", "postgresql", "cockroachdb", "timescaledb"],
        )
    }

    pub fn mysql() -> Self {
        Self::new("mysql", "0.1.0", &["mysql", "mariadb"])
    }

    pub fn state(&self) -> Arc<StubState> {
        self.state.clone()
    }

    pub fn info(&self, path: impl Into<PathBuf>) -> PluginInfo {
        PluginInfo {
            name: self.name.clone(),
            version: self.version.clone(),
            engines: self.engines.clone(),
            path: path.into(),
            origin: None,
            digest: None,
            platform: None,
        }
    }
}

#[async_trait]
impl EnginePlugin for StubPlugin {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn version(&self) -> String {
        self.version.clone()
    }

    fn supported_engines(&self) -> Vec<String> {
        self.engines.clone()
    }

    async fn validate(&self, options: &ConnectOptions) -> Result<()> {
        self.state.validated.write().await.push(options.clone());
        if *self.state.fail_on_validate.read().await {
            return Err(PluginError::Remote("invalid options".to_string()));
        }
        Ok(())
    }

    async fn connect(
        &self,
        uri: &str,
        _options: &ConnectOptions,
    ) -> Result<Box<dyn EngineConnection>> {
        if *self.state.fail_on_connect.read().await {
            return Err(PluginError::Remote(format!("cannot reach {}", uri)));
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubConnection {
            uri: uri.to_string(),
            state: self.state.clone(),
        }))
    }
}

struct StubConnection {
    uri: String,
    state: Arc<StubState>,
}

fn render_column(name: &str, ty: &str, constraints: Option<&ColumnConstraints>, default: Option<&str>) -> String {
    let mut column = format!("{} {}", name, ty);
    if constraints.and_then(|c| c.not_null) == Some(true) {
        column.push_str(" NOT NULL");
    }
    if let Some(default) = default {
        column.push_str(&format!(" DEFAULT '{}'", default));
    }
    column
}

fn create_table(table: &str, schema: &TableSchema) -> Result<String> {
    let (mut parts, primary_key): (Vec<String>, &[String]) = match schema {
        TableSchema::Postgres(s) | TableSchema::Cockroachdb(s) => (
            s.columns
                .iter()
                .map(|c| render_column(&c.name, &c.column_type, c.constraints.as_ref(), c.default.as_deref()))
                .collect(),
            &s.primary_key,
        ),
        TableSchema::Timescaledb(s) => (
            s.table
                .columns
                .iter()
                .map(|c| render_column(&c.name, &c.column_type, c.constraints.as_ref(), c.default.as_deref()))
                .collect(),
            &s.table.primary_key,
        ),
        TableSchema::Mysql(s) => (
            s.columns
                .iter()
                .map(|c| render_column(&c.name, &c.column_type, c.constraints.as_ref(), c.default.as_deref()))
                .collect(),
            &s.primary_key,
        ),
        other => {
            return Err(PluginError::Invalid(format!(
                "stub plugin cannot plan {} tables",
                other.engine()
            )))
        }
    };
    if !primary_key.is_empty() {
        parts.push(format!("PRIMARY KEY ({})", primary_key.join(", ")));
    }
    Ok(format!("CREATE TABLE {} ({})", table, parts.join(", ")))
}

fn is_deleted(schema: &TableSchema) -> bool {
    match schema {
        TableSchema::Postgres(s) | TableSchema::Cockroachdb(s) => s.is_deleted,
        TableSchema::Timescaledb(s) => s.table.is_deleted,
        TableSchema::Mysql(s) => s.is_deleted,
        _ => false,
    }
}

fn seed_inserts(table: &str, seed_data: Option<&SeedData>) -> Vec<String> {
    let Some(seed) = seed_data else {
        return Vec::new();
    };
    seed.rows
        .iter()
        .map(|row| {
            let columns: Vec<&str> = row.columns.iter().map(|c| c.column.as_str()).collect();
            let values: Vec<String> = row
                .columns
                .iter()
                .map(|c| match (&c.value.int, &c.value.str) {
                    (Some(i), _) => i.to_string(),
                    (None, Some(s)) => format!("'{}'", s),
                    (None, None) => "NULL".to_string(),
                })
                .collect();
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table,
                columns.join(", "),
                values.join(", ")
            )
        })
        .collect()
}

#[async_trait]
impl EngineConnection for StubConnection {
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn database_name(&self) -> Result<String> {
        Ok(self
            .uri
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .split('?')
            .next()
            .unwrap_or_default()
            .to_string())
    }

    async fn engine_version(&self) -> Result<String> {
        Ok("stub-1".to_string())
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        Ok(self.state.existing_tables.read().await.iter().cloned().collect())
    }

    async fn list_table_foreign_keys(&self, _table: &str) -> Result<Vec<ForeignKey>> {
        Ok(Vec::new())
    }

    async fn list_table_indexes(&self, _table: &str) -> Result<Vec<Index>> {
        Ok(Vec::new())
    }

    async fn get_table_primary_key(&self, _table: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn get_table_schema(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        if !self.state.existing_tables.read().await.contains(table) {
            return Ok(Vec::new());
        }
        Ok(vec![ColumnInfo {
            name: "id".to_string(),
            data_type: "integer".to_string(),
            column_default: None,
            not_null: true,
        }])
    }

    async fn plan_table_schema(
        &self,
        table: &str,
        schema: &TableSchema,
        seed_data: Option<&SeedData>,
    ) -> Result<Vec<String>> {
        self.state
            .planned_tables
            .write()
            .await
            .push((table.to_string(), schema.clone()));
        let exists = self.state.existing_tables.read().await.contains(table);
        if is_deleted(schema) {
            return Ok(if exists {
                vec![format!("DROP TABLE {}", table)]
            } else {
                Vec::new()
            });
        }
        if exists {
            return Ok(Vec::new());
        }
        let mut statements = vec![create_table(table, schema)?];
        statements.extend(seed_inserts(table, seed_data));
        Ok(statements)
    }

    async fn plan_view_schema(&self, view: &str, schema: &ViewSchema) -> Result<Vec<String>> {
        let (query, deleted) = match schema {
            ViewSchema::Postgres(s) => (&s.query, s.is_deleted),
            ViewSchema::Timescaledb(s) => (&s.query, s.is_deleted),
        };
        if deleted {
            return Ok(vec![format!("DROP VIEW IF EXISTS {}", view)]);
        }
        Ok(vec![format!("CREATE OR REPLACE VIEW {} AS {}", view, query)])
    }

    async fn plan_function_schema(
        &self,
        function: &str,
        schema: &PostgresqlFunctionSchema,
    ) -> Result<Vec<String>> {
        if schema.is_deleted {
            return Ok(vec![format!("DROP FUNCTION IF EXISTS {}", function)]);
        }
        let params: Vec<String> = schema
            .params
            .iter()
            .map(|p| format!("{} {}", p.name, p.param_type))
            .collect();
        Ok(vec![format!(
            "CREATE OR REPLACE FUNCTION {}({}) RETURNS {} LANGUAGE {} AS $$ {} $$",
            function,
            params.join(", "),
            schema.return_type,
            schema.lang,
            schema.body
        )])
    }

    async fn plan_extension_schema(
        &self,
        extension: &PostgresDatabaseExtension,
    ) -> Result<Vec<String>> {
        let mut statement = format!("CREATE EXTENSION IF NOT EXISTS \"{}\"", extension.name);
        if let Some(schema) = &extension.schema {
            statement.push_str(&format!(" WITH SCHEMA {}", schema));
        }
        if let Some(version) = &extension.version {
            statement.push_str(&format!(" VERSION '{}'", version));
        }
        Ok(vec![statement])
    }

    async fn deploy_statements(&self, statements: &[String]) -> Result<()> {
        if *self.state.hang_on_deploy.read().await {
            std::future::pending::<()>().await;
        }
        if *self.state.fail_on_deploy.read().await {
            return Err(PluginError::Remote("deploy failed".to_string()));
        }
        for statement in statements {
            if let Some(rest) = statement.strip_prefix("CREATE TABLE ") {
                if let Some(name) = rest.split_whitespace().next() {
                    self.state.existing_tables.write().await.insert(name.to_string());
                }
            }
            self.state.deployed.write().await.push(statement.clone());
        }
        Ok(())
    }

    async fn generate_fixtures(
        &self,
        table: &str,
        schema: &TableSchema,
        seed_data: Option<&SeedData>,
    ) -> Result<Vec<String>> {
        let mut statements = vec![create_table(table, schema)?];
        statements.extend(seed_inserts(table, seed_data));
        Ok(statements)
    }
}

/// A manager whose registry knows `plugin`, served in-process.
pub async fn stub_manager(plugin: StubPlugin) -> Result<Arc<PluginManager>> {
    codec::register_payload_types();
    let path = PathBuf::from(format!("/stub/schemahero-{}", plugin.name));
    let info = plugin.info(&path);
    let launcher = InProcessLauncher::new().with_plugin(path, Arc::new(plugin));
    let registry = Arc::new(PluginRegistry::new());
    registry.register(info).await?;
    Ok(Arc::new(
        PluginManager::new(registry, Arc::new(launcher)).with_search_paths(Vec::new()),
    ))
}

// ---------------------------------------------------------------------------
// Resource fixtures
// ---------------------------------------------------------------------------

pub fn meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

pub fn postgres_database(namespace: &str, name: &str, uri: &str) -> Database {
    Database {
        metadata: meta(namespace, name),
        spec: DatabaseSpec {
            connection: DatabaseConnection::Postgres(PostgresConnection {
                uri: ValueOrValueFrom::literal(uri),
            }),
            schemahero: None,
            immediate_deploy: false,
            deploy_seed_data: false,
        },
    }
}

pub fn mysql_database(namespace: &str, name: &str, uri: &str) -> Database {
    Database {
        metadata: meta(namespace, name),
        spec: DatabaseSpec {
            connection: DatabaseConnection::Mysql(MysqlConnection {
                uri: ValueOrValueFrom::literal(uri),
            }),
            schemahero: None,
            immediate_deploy: false,
            deploy_seed_data: false,
        },
    }
}

pub fn column(name: &str, ty: &str, not_null: bool) -> PostgresqlTableColumn {
    PostgresqlTableColumn {
        name: name.to_string(),
        column_type: ty.to_string(),
        constraints: not_null.then(|| ColumnConstraints {
            not_null: Some(true),
        }),
        attributes: None,
        default: None,
    }
}

pub fn postgres_table(
    namespace: &str,
    name: &str,
    database: &str,
    primary_key: &[&str],
    columns: Vec<PostgresqlTableColumn>,
) -> Table {
    Table {
        metadata: meta(namespace, name),
        spec: TableSpec {
            database: database.to_string(),
            name: name.to_string(),
            schema: TableSchema::Postgres(PostgresqlTableSchema {
                primary_key: primary_key.iter().map(|c| c.to_string()).collect(),
                columns,
                ..Default::default()
            }),
            seed_data: None,
        },
        status: None,
    }
}

/// `users (id int NOT NULL, email text NOT NULL, PRIMARY KEY (id))`.
pub fn users_table(namespace: &str, database: &str) -> Table {
    postgres_table(
        namespace,
        "users",
        database,
        &["id"],
        vec![column("id", "int", true), column("email", "text", true)],
    )
}
