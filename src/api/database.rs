use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::gen::SchemaGenerator;
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::schema::SchemaError;
use super::Engine;

/// A database that schema resources are applied to.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[kube(
    group = "databases.schemahero.io",
    version = "v1alpha4",
    kind = "Database",
    plural = "databases",
    namespaced,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSpec {
    pub connection: DatabaseConnection,

    /// Overrides for the apply pods scheduled against this database.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schemahero: Option<SchemaHeroOptions>,

    /// Approve planned migrations as soon as they are created.
    #[serde(default)]
    pub immediate_deploy: bool,

    /// Include declared seed data when planning tables.
    #[serde(default)]
    pub deploy_seed_data: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SchemaHeroOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
}

/// An inline value or a reference to where the value is stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValueOrValueFrom {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<ValueFrom>,
}

impl ValueOrValueFrom {
    pub fn literal(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            value_from: None,
        }
    }

    pub fn vault(&self) -> Option<&VaultSource> {
        self.value_from.as_ref().and_then(|v| v.vault.as_ref())
    }

    pub fn secret_key_ref(&self) -> Option<&SecretKeyRef> {
        self.value_from.as_ref().and_then(|v| v.secret_key_ref.as_ref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValueFrom {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<SecretKeyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault: Option<VaultSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

/// Connection URI held in Vault.
///
/// Apply pods get the value from the Vault agent sidecar; planning reads it
/// directly through the Kubernetes auth method.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VaultSource {
    /// Path of the secret, e.g. `database/creds/app`.
    pub secret: String,
    pub role: String,
    #[serde(default = "default_agent_inject")]
    pub agent_inject: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_auth_endpoint: Option<String>,
    /// Template rendered by the agent; `{{ .Data.username }}` style.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

fn default_agent_inject() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PostgresConnection {
    pub uri: ValueOrValueFrom,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MysqlConnection {
    pub uri: ValueOrValueFrom,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SqliteConnection {
    pub dsn: ValueOrValueFrom,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RqliteConnection {
    pub uri: ValueOrValueFrom,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CassandraConnection {
    pub hosts: Vec<String>,
    pub keyspace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<ValueOrValueFrom>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<ValueOrValueFrom>,
}

/// Connection descriptor for exactly one engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDatabaseConnection", into = "RawDatabaseConnection")]
pub enum DatabaseConnection {
    Postgres(PostgresConnection),
    Mysql(MysqlConnection),
    Cockroachdb(PostgresConnection),
    Timescaledb(PostgresConnection),
    Sqlite(SqliteConnection),
    Rqlite(RqliteConnection),
    Cassandra(CassandraConnection),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RawDatabaseConnection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgres: Option<PostgresConnection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mysql: Option<MysqlConnection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cockroachdb: Option<PostgresConnection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timescaledb: Option<PostgresConnection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sqlite: Option<SqliteConnection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rqlite: Option<RqliteConnection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cassandra: Option<CassandraConnection>,
}

impl TryFrom<RawDatabaseConnection> for DatabaseConnection {
    type Error = SchemaError;

    fn try_from(raw: RawDatabaseConnection) -> Result<Self, Self::Error> {
        let populated: Vec<String> = [
            ("postgres", raw.postgres.is_some()),
            ("mysql", raw.mysql.is_some()),
            ("cockroachdb", raw.cockroachdb.is_some()),
            ("timescaledb", raw.timescaledb.is_some()),
            ("sqlite", raw.sqlite.is_some()),
            ("rqlite", raw.rqlite.is_some()),
            ("cassandra", raw.cassandra.is_some()),
        ]
        .into_iter()
        .filter(|(_, present)| *present)
        .map(|(name, _)| name.to_string())
        .collect();
        if populated.len() > 1 {
            return Err(SchemaError::MultipleEngines(populated));
        }

        let RawDatabaseConnection {
            postgres,
            mysql,
            cockroachdb,
            timescaledb,
            sqlite,
            rqlite,
            cassandra,
        } = raw;
        postgres
            .map(Self::Postgres)
            .or_else(|| mysql.map(Self::Mysql))
            .or_else(|| cockroachdb.map(Self::Cockroachdb))
            .or_else(|| timescaledb.map(Self::Timescaledb))
            .or_else(|| sqlite.map(Self::Sqlite))
            .or_else(|| rqlite.map(Self::Rqlite))
            .or_else(|| cassandra.map(Self::Cassandra))
            .ok_or(SchemaError::NoEngine)
    }
}

impl From<DatabaseConnection> for RawDatabaseConnection {
    fn from(conn: DatabaseConnection) -> Self {
        let mut raw = RawDatabaseConnection::default();
        match conn {
            DatabaseConnection::Postgres(c) => raw.postgres = Some(c),
            DatabaseConnection::Mysql(c) => raw.mysql = Some(c),
            DatabaseConnection::Cockroachdb(c) => raw.cockroachdb = Some(c),
            DatabaseConnection::Timescaledb(c) => raw.timescaledb = Some(c),
            DatabaseConnection::Sqlite(c) => raw.sqlite = Some(c),
            DatabaseConnection::Rqlite(c) => raw.rqlite = Some(c),
            DatabaseConnection::Cassandra(c) => raw.cassandra = Some(c),
        }
        raw
    }
}

impl JsonSchema for DatabaseConnection {
    fn schema_name() -> String {
        RawDatabaseConnection::schema_name()
    }

    fn json_schema(gen: &mut SchemaGenerator) -> Schema {
        RawDatabaseConnection::json_schema(gen)
    }
}

impl DatabaseConnection {
    pub fn engine(&self) -> Engine {
        match self {
            Self::Postgres(_) => Engine::Postgres,
            Self::Mysql(_) => Engine::Mysql,
            Self::Cockroachdb(_) => Engine::Cockroachdb,
            Self::Timescaledb(_) => Engine::Timescaledb,
            Self::Sqlite(_) => Engine::Sqlite,
            Self::Rqlite(_) => Engine::Rqlite,
            Self::Cassandra(_) => Engine::Cassandra,
        }
    }

    /// The URI-shaped value, if this engine is addressed by URI.
    pub fn uri(&self) -> Option<&ValueOrValueFrom> {
        match self {
            Self::Postgres(c) | Self::Cockroachdb(c) | Self::Timescaledb(c) => Some(&c.uri),
            Self::Mysql(c) => Some(&c.uri),
            Self::Sqlite(c) => Some(&c.dsn),
            Self::Rqlite(c) => Some(&c.uri),
            Self::Cassandra(_) => None,
        }
    }

    pub fn vault(&self) -> Option<&VaultSource> {
        self.uri().and_then(ValueOrValueFrom::vault)
    }
}

impl Database {
    pub fn engine(&self) -> Engine {
        self.spec.connection.engine()
    }

    pub fn image_override(&self) -> Option<&str> {
        self.spec
            .schemahero
            .as_ref()
            .and_then(|s| s.image.as_deref())
    }

    pub fn node_selector(&self) -> BTreeMap<String, String> {
        self.spec
            .schemahero
            .as_ref()
            .map(|s| s.node_selector.clone())
            .unwrap_or_default()
    }
}
