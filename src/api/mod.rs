//! Declarative resource types.
//!
//! `Database` and `DatabaseExtension` live in `databases.schemahero.io`; the
//! schema kinds and `Migration` live in `schemas.schemahero.io`. All kinds are
//! namespaced and served at `v1alpha4`.

mod data_migration;
mod database;
mod extension;
mod function;
mod migration;
pub mod schema;
mod seed;
mod table;
mod view;

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use data_migration::{
    DataMigration, DataMigrationSpec, DataMigrationStatus, DataOperation, DataOperationKind,
};
pub use database::{
    CassandraConnection, Database, DatabaseConnection, DatabaseSpec, MysqlConnection,
    PostgresConnection, RawDatabaseConnection, RqliteConnection, SchemaHeroOptions,
    SecretKeyRef, SqliteConnection, ValueFrom, ValueOrValueFrom, VaultSource,
};
pub use extension::{DatabaseExtension, DatabaseExtensionSpec, PostgresDatabaseExtension};
pub use function::{Function, FunctionSpec};
pub use migration::{
    Migration, MigrationPhase, MigrationSpec, MigrationStatus, PhaseRegression, SourceKind,
};
pub use seed::{SeedData, SeedDataColumn, SeedDataRow, SeedDataValue};
pub use table::{Table, TableSpec, TableStatus};
pub use view::{View, ViewSpec, ViewStatus};

/// API group for connection-level kinds.
pub const DATABASES_GROUP: &str = "databases.schemahero.io";
/// API group for schema kinds and migrations.
pub const SCHEMAS_GROUP: &str = "schemas.schemahero.io";
/// Served version for every kind.
pub const API_VERSION: &str = "v1alpha4";

/// Finalizer installed on resources with `removeOnDeletion`.
pub const FINALIZER: &str = "schemas.schemahero.io/finalizer";

/// Supported database engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Postgres,
    Mysql,
    Cockroachdb,
    Timescaledb,
    Sqlite,
    Rqlite,
    Cassandra,
}

impl Engine {
    pub const ALL: [Engine; 7] = [
        Engine::Postgres,
        Engine::Mysql,
        Engine::Cockroachdb,
        Engine::Timescaledb,
        Engine::Sqlite,
        Engine::Rqlite,
        Engine::Cassandra,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Postgres => "postgres",
            Engine::Mysql => "mysql",
            Engine::Cockroachdb => "cockroachdb",
            Engine::Timescaledb => "timescaledb",
            Engine::Sqlite => "sqlite",
            Engine::Rqlite => "rqlite",
            Engine::Cassandra => "cassandra",
        }
    }

    /// Engines that take hosts/keyspace through options instead of a URI.
    pub fn uses_uri(&self) -> bool {
        !matches!(self, Engine::Cassandra)
    }

    /// Dialect family used when compiling data migrations.
    pub fn family(&self) -> Option<EngineFamily> {
        match self {
            Engine::Postgres | Engine::Cockroachdb | Engine::Timescaledb => {
                Some(EngineFamily::Postgres)
            }
            Engine::Mysql => Some(EngineFamily::Mysql),
            _ => None,
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown database engine: {0}")]
pub struct UnknownEngine(pub String);

impl FromStr for Engine {
    type Err = UnknownEngine;

    /// Accepts the aliases `postgresql` and `mariadb`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Engine::Postgres),
            "mysql" | "mariadb" => Ok(Engine::Mysql),
            "cockroachdb" => Ok(Engine::Cockroachdb),
            "timescaledb" => Ok(Engine::Timescaledb),
            "sqlite" => Ok(Engine::Sqlite),
            "rqlite" => Ok(Engine::Rqlite),
            "cassandra" => Ok(Engine::Cassandra),
            _ => Err(UnknownEngine(s.to_string())),
        }
    }
}

/// Engines grouped by the SQL dialect they share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineFamily {
    Postgres,
    Mysql,
}

/// Lifecycle phase mirrored onto schema resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ResourcePhase {
    Planned,
    Applied,
    Failed,
}

/// Outcome of a synchronous apply (functions and extensions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ApplyPhase {
    Applied,
    Failed,
}

/// Status shared by kinds that are applied directly rather than through a
/// `Migration`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplyStatus {
    /// Fingerprint of the spec that was last applied successfully.
    #[serde(
        rename = "lastAppliedSpecSHA",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_applied_spec_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ApplyPhase>,
    #[serde(default)]
    pub applied_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Content-addressed fingerprint of a desired spec (lowercase hex SHA-256 of
/// its JSON form).
///
/// Only the spec is hashed, so status writes never change the fingerprint.
pub fn spec_fingerprint<T: Serialize>(spec: &T) -> String {
    // Serializing plain data structs into a Vec cannot fail.
    let bytes = serde_json::to_vec(spec).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}
