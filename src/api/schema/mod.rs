//! Engine-tagged schema payloads.
//!
//! A declared table or view carries exactly one engine variant. On the wire
//! (and in the resource YAML) the variant is an object keyed by engine name:
//!
//! ```yaml
//! schema:
//!   postgres:
//!     primaryKey: [id]
//!     columns:
//!       - name: id
//!         type: int
//! ```
//!
//! The Rust side models this as a sum type. The "exactly one" rule is
//! enforced when the payload is parsed, so downstream code never has to
//! handle an empty or ambiguous schema.

mod cassandra;
mod mysql;
mod postgres;
mod sqlite;
mod timescale;

use schemars::gen::SchemaGenerator;
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use cassandra::{
    CassandraClusteringOrder, CassandraColumn, CassandraTableProperties, CassandraTableSchema,
};
pub use mysql::{MysqlTableColumn, MysqlTableSchema};
pub use postgres::{
    FunctionParam, PostgresViewSchema, PostgresqlFunctionSchema, PostgresqlTableColumn,
    PostgresqlTableSchema,
};
pub use sqlite::{SqliteTableColumn, SqliteTableSchema};
pub use timescale::{
    TimescaleCompression, TimescaleHypertable, TimescaleRetention, TimescaleTableSchema,
    TimescaleViewSchema,
};

use super::Engine;

/// CockroachDB speaks the PostgreSQL dialect for DDL.
pub type CockroachdbTableSchema = PostgresqlTableSchema;
/// RQLite is SQLite behind an HTTP API.
pub type RqliteTableSchema = SqliteTableSchema;

/// Errors raised while parsing an engine-tagged payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("schema must declare exactly one engine, none given")]
    NoEngine,

    #[error("schema must declare exactly one engine, got: {}", .0.join(", "))]
    MultipleEngines(Vec<String>),
}

// ---------------------------------------------------------------------------
// Shared column/constraint shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ColumnConstraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_null: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ColumnAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_increment: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKeyReference {
    pub table: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKey {
    pub columns: Vec<String>,
    pub references: ForeignKeyReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_delete: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub is_unique: bool,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub index_type: Option<String>,
}

// ---------------------------------------------------------------------------
// Table schema
// ---------------------------------------------------------------------------

/// Desired table shape for exactly one engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTableSchema", into = "RawTableSchema")]
pub enum TableSchema {
    Postgres(PostgresqlTableSchema),
    Mysql(MysqlTableSchema),
    Cockroachdb(CockroachdbTableSchema),
    Timescaledb(TimescaleTableSchema),
    Sqlite(SqliteTableSchema),
    Rqlite(RqliteTableSchema),
    Cassandra(CassandraTableSchema),
}

/// Serialized form of [`TableSchema`]: one optional field per engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RawTableSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgres: Option<PostgresqlTableSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mysql: Option<MysqlTableSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cockroachdb: Option<CockroachdbTableSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timescaledb: Option<TimescaleTableSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sqlite: Option<SqliteTableSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rqlite: Option<RqliteTableSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cassandra: Option<CassandraTableSchema>,
}

impl TryFrom<RawTableSchema> for TableSchema {
    type Error = SchemaError;

    fn try_from(raw: RawTableSchema) -> Result<Self, Self::Error> {
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

        let RawTableSchema {
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

impl From<TableSchema> for RawTableSchema {
    fn from(schema: TableSchema) -> Self {
        let mut raw = RawTableSchema::default();
        match schema {
            TableSchema::Postgres(s) => raw.postgres = Some(s),
            TableSchema::Mysql(s) => raw.mysql = Some(s),
            TableSchema::Cockroachdb(s) => raw.cockroachdb = Some(s),
            TableSchema::Timescaledb(s) => raw.timescaledb = Some(s),
            TableSchema::Sqlite(s) => raw.sqlite = Some(s),
            TableSchema::Rqlite(s) => raw.rqlite = Some(s),
            TableSchema::Cassandra(s) => raw.cassandra = Some(s),
        }
        raw
    }
}

impl JsonSchema for TableSchema {
    fn schema_name() -> String {
        RawTableSchema::schema_name()
    }

    fn json_schema(gen: &mut SchemaGenerator) -> Schema {
        RawTableSchema::json_schema(gen)
    }
}

impl TableSchema {
    /// Engine this schema is written for.
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

    /// Mutable access to every per-column default in the schema.
    ///
    /// Cassandra columns carry no defaults and contribute nothing.
    pub fn column_defaults_mut(&mut self) -> Vec<&mut Option<String>> {
        match self {
            Self::Postgres(s) | Self::Cockroachdb(s) => {
                s.columns.iter_mut().map(|c| &mut c.default).collect()
            }
            Self::Timescaledb(s) => s.table.columns.iter_mut().map(|c| &mut c.default).collect(),
            Self::Mysql(s) => s.columns.iter_mut().map(|c| &mut c.default).collect(),
            Self::Sqlite(s) | Self::Rqlite(s) => {
                s.columns.iter_mut().map(|c| &mut c.default).collect()
            }
            Self::Cassandra(_) => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// View schema
// ---------------------------------------------------------------------------

/// Desired view definition for exactly one engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawViewSchema", into = "RawViewSchema")]
pub enum ViewSchema {
    Postgres(PostgresViewSchema),
    Timescaledb(TimescaleViewSchema),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RawViewSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgres: Option<PostgresViewSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timescaledb: Option<TimescaleViewSchema>,
}

impl TryFrom<RawViewSchema> for ViewSchema {
    type Error = SchemaError;

    fn try_from(raw: RawViewSchema) -> Result<Self, Self::Error> {
        match (raw.postgres, raw.timescaledb) {
            (Some(p), None) => Ok(Self::Postgres(p)),
            (None, Some(t)) => Ok(Self::Timescaledb(t)),
            (None, None) => Err(SchemaError::NoEngine),
            (Some(_), Some(_)) => Err(SchemaError::MultipleEngines(vec![
                "postgres".to_string(),
                "timescaledb".to_string(),
            ])),
        }
    }
}

impl From<ViewSchema> for RawViewSchema {
    fn from(schema: ViewSchema) -> Self {
        match schema {
            ViewSchema::Postgres(p) => Self {
                postgres: Some(p),
                timescaledb: None,
            },
            ViewSchema::Timescaledb(t) => Self {
                postgres: None,
                timescaledb: Some(t),
            },
        }
    }
}

impl JsonSchema for ViewSchema {
    fn schema_name() -> String {
        RawViewSchema::schema_name()
    }

    fn json_schema(gen: &mut SchemaGenerator) -> Schema {
        RawViewSchema::json_schema(gen)
    }
}

impl ViewSchema {
    pub fn engine(&self) -> Engine {
        match self {
            Self::Postgres(_) => Engine::Postgres,
            Self::Timescaledb(_) => Engine::Timescaledb,
        }
    }
}

// ---------------------------------------------------------------------------
// Function schema
// ---------------------------------------------------------------------------

/// Function payload. Only PostgreSQL functions are managed; any other
/// engine leaves `postgres` unset and the resource is a no-op.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgres: Option<PostgresqlFunctionSchema>,
}

#[cfg(test)]
mod tests;
