use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ResourcePhase;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[kube(
    group = "schemas.schemahero.io",
    version = "v1alpha4",
    kind = "DataMigration",
    plural = "datamigrations",
    namespaced,
    status = "DataMigrationStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct DataMigrationSpec {
    pub database: String,
    /// Compiled in declared order.
    #[serde(default)]
    pub operations: Vec<DataOperation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DataOperationKind {
    Update,
    Calculate,
    Convert,
}

impl DataOperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Calculate => "calculate",
            Self::Convert => "convert",
        }
    }
}

/// One data mutation. Which fields are required depends on `kind`:
/// `update` needs `value`, `calculate` needs `expression`, `convert` needs
/// `from` and `to`. All kinds need `table` and `column`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataOperation {
    #[serde(rename = "type")]
    pub kind: DataOperationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub where_clause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

impl DataOperation {
    pub fn new(kind: DataOperationKind, table: &str, column: &str) -> Self {
        Self {
            kind,
            table: Some(table.to_string()),
            column: Some(column.to_string()),
            value: None,
            expression: None,
            where_clause: None,
            from: None,
            to: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataMigrationStatus {
    /// Set once a `Migration` has been emitted; the resource is quiescent after.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ResourcePhase>,
    #[serde(default)]
    pub planned_at: i64,
    #[serde(default)]
    pub approved_at: i64,
    #[serde(default)]
    pub applied_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
