//! Structured payload encoding.
//!
//! Schema payloads cross the wire as `prost_types::Any`. The type URL names
//! the concrete engine variant, so a `TableSchema` decodes back into the same
//! variant it was sent as; the value is the JSON form of that variant.
//!
//! Type URLs must be registered once per process ([`register_payload_types`])
//! before the first call; encoding or decoding an unregistered type fails.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use prost_types::Any;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::error::{PluginError, Result};
use super::traits::ColumnInfo;
use crate::api::schema::{ForeignKey, Index, PostgresqlFunctionSchema, TableSchema, ViewSchema};
use crate::api::{PostgresDatabaseExtension, SeedData};

const TYPE_URL_PREFIX: &str = "type.schemahero.io/";

/// Literal standing in for an empty-string column default on the wire.
pub const EMPTY_DEFAULT_SENTINEL: &str = "__SCHEMAHERO_EMPTY_STRING_DEFAULT__";

const TABLE_POSTGRES: &str = "schemahero.postgres.TableSchema";
const TABLE_MYSQL: &str = "schemahero.mysql.TableSchema";
const TABLE_COCKROACHDB: &str = "schemahero.cockroachdb.TableSchema";
const TABLE_TIMESCALEDB: &str = "schemahero.timescaledb.TableSchema";
const TABLE_SQLITE: &str = "schemahero.sqlite.TableSchema";
const TABLE_RQLITE: &str = "schemahero.rqlite.TableSchema";
const TABLE_CASSANDRA: &str = "schemahero.cassandra.TableSchema";
const VIEW_POSTGRES: &str = "schemahero.postgres.ViewSchema";
const VIEW_TIMESCALEDB: &str = "schemahero.timescaledb.ViewSchema";
const FUNCTION_POSTGRES: &str = "schemahero.postgres.FunctionSchema";
const EXTENSION_POSTGRES: &str = "schemahero.postgres.DatabaseExtension";
const SEED_DATA: &str = "schemahero.SeedData";
const FOREIGN_KEYS: &str = "schemahero.ForeignKeyList";
const INDEXES: &str = "schemahero.IndexList";
const COLUMNS: &str = "schemahero.ColumnList";

const ALL_TYPES: &[&str] = &[
    TABLE_POSTGRES,
    TABLE_MYSQL,
    TABLE_COCKROACHDB,
    TABLE_TIMESCALEDB,
    TABLE_SQLITE,
    TABLE_RQLITE,
    TABLE_CASSANDRA,
    VIEW_POSTGRES,
    VIEW_TIMESCALEDB,
    FUNCTION_POSTGRES,
    EXTENSION_POSTGRES,
    SEED_DATA,
    FOREIGN_KEYS,
    INDEXES,
    COLUMNS,
];

static REGISTERED: OnceLock<BTreeSet<&'static str>> = OnceLock::new();

/// Register every payload type. Idempotent.
pub fn register_payload_types() {
    REGISTERED.get_or_init(|| ALL_TYPES.iter().copied().collect());
}

pub fn is_registered(type_name: &str) -> bool {
    REGISTERED
        .get()
        .is_some_and(|types| types.contains(type_name))
}

fn pack<T: Serialize>(type_name: &'static str, value: &T) -> Result<Any> {
    if !is_registered(type_name) {
        return Err(PluginError::UnregisteredType(type_name.to_string()));
    }
    Ok(Any {
        type_url: format!("{}{}", TYPE_URL_PREFIX, type_name),
        value: serde_json::to_vec(value)?,
    })
}

fn type_name_of(any: &Any) -> Result<&str> {
    let name = any
        .type_url
        .strip_prefix(TYPE_URL_PREFIX)
        .unwrap_or(&any.type_url);
    if !is_registered(name) {
        return Err(PluginError::UnregisteredType(any.type_url.clone()));
    }
    Ok(name)
}

fn unpack<T: DeserializeOwned>(any: &Any) -> Result<T> {
    Ok(serde_json::from_slice(&any.value)?)
}

/// A value that travels as `Any`.
pub trait AnyPayload: Sized {
    fn to_any(&self) -> Result<Any>;
    fn from_any(any: &Any) -> Result<Self>;
}

impl AnyPayload for TableSchema {
    fn to_any(&self) -> Result<Any> {
        match self {
            TableSchema::Postgres(s) => pack(TABLE_POSTGRES, s),
            TableSchema::Mysql(s) => pack(TABLE_MYSQL, s),
            TableSchema::Cockroachdb(s) => pack(TABLE_COCKROACHDB, s),
            TableSchema::Timescaledb(s) => pack(TABLE_TIMESCALEDB, s),
            TableSchema::Sqlite(s) => pack(TABLE_SQLITE, s),
            TableSchema::Rqlite(s) => pack(TABLE_RQLITE, s),
            TableSchema::Cassandra(s) => pack(TABLE_CASSANDRA, s),
        }
    }

    fn from_any(any: &Any) -> Result<Self> {
        Ok(match type_name_of(any)? {
            TABLE_POSTGRES => TableSchema::Postgres(unpack(any)?),
            TABLE_MYSQL => TableSchema::Mysql(unpack(any)?),
            TABLE_COCKROACHDB => TableSchema::Cockroachdb(unpack(any)?),
            TABLE_TIMESCALEDB => TableSchema::Timescaledb(unpack(any)?),
            TABLE_SQLITE => TableSchema::Sqlite(unpack(any)?),
            TABLE_RQLITE => TableSchema::Rqlite(unpack(any)?),
            TABLE_CASSANDRA => TableSchema::Cassandra(unpack(any)?),
            other => return Err(mismatch("TableSchema", other)),
        })
    }
}

impl AnyPayload for ViewSchema {
    fn to_any(&self) -> Result<Any> {
        match self {
            ViewSchema::Postgres(s) => pack(VIEW_POSTGRES, s),
            ViewSchema::Timescaledb(s) => pack(VIEW_TIMESCALEDB, s),
        }
    }

    fn from_any(any: &Any) -> Result<Self> {
        Ok(match type_name_of(any)? {
            VIEW_POSTGRES => ViewSchema::Postgres(unpack(any)?),
            VIEW_TIMESCALEDB => ViewSchema::Timescaledb(unpack(any)?),
            other => return Err(mismatch("ViewSchema", other)),
        })
    }
}

fn mismatch(expected: &str, actual: &str) -> PluginError {
    PluginError::TypeMismatch {
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
}

macro_rules! json_payload {
    ($ty:ty, $name:ident) => {
        impl AnyPayload for $ty {
            fn to_any(&self) -> Result<Any> {
                pack($name, self)
            }

            fn from_any(any: &Any) -> Result<Self> {
                match type_name_of(any)? {
                    $name => unpack(any),
                    other => Err(mismatch($name, other)),
                }
            }
        }
    };
}

json_payload!(PostgresqlFunctionSchema, FUNCTION_POSTGRES);
json_payload!(PostgresDatabaseExtension, EXTENSION_POSTGRES);
json_payload!(SeedData, SEED_DATA);
json_payload!(Vec<ForeignKey>, FOREIGN_KEYS);
json_payload!(Vec<Index>, INDEXES);
json_payload!(Vec<ColumnInfo>, COLUMNS);

/// Decode an optional `Any` field that the method requires.
pub fn require<T: AnyPayload>(field: Option<&Any>, what: &str) -> Result<T> {
    match field {
        Some(any) => T::from_any(any),
        None => Err(PluginError::Protocol(format!("missing {}", what))),
    }
}

pub fn optional<T: AnyPayload>(field: Option<&Any>) -> Result<Option<T>> {
    field.map(T::from_any).transpose()
}

/// Replace every `Some("")` column default with the sentinel.
pub fn mask_empty_defaults(schema: &mut TableSchema) {
    for default in schema.column_defaults_mut() {
        if default.as_deref() == Some("") {
            *default = Some(EMPTY_DEFAULT_SENTINEL.to_string());
        }
    }
}

/// Inverse of [`mask_empty_defaults`].
pub fn unmask_empty_defaults(schema: &mut TableSchema) {
    for default in schema.column_defaults_mut() {
        if default.as_deref() == Some(EMPTY_DEFAULT_SENTINEL) {
            *default = Some(String::new());
        }
    }
}
