use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::schema::TableSchema;
use super::{spec_fingerprint, ResourcePhase, SeedData};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[kube(
    group = "schemas.schemahero.io",
    version = "v1alpha4",
    kind = "Table",
    plural = "tables",
    namespaced,
    status = "TableStatus",
    printcolumn = r#"{"name":"Table","type":"string","jsonPath":".spec.name"}"#,
    printcolumn = r#"{"name":"Database","type":"string","jsonPath":".spec.database"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TableSpec {
    /// Database resource name, same namespace.
    pub database: String,
    /// Table name in the database.
    pub name: String,
    pub schema: TableSchema,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_data: Option<SeedData>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TableStatus {
    /// Fingerprint of the last spec a plan was produced for.
    #[serde(
        rename = "lastPlannedTableSpecSHA",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_planned_spec_sha: Option<String>,
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

impl Table {
    pub fn spec_sha(&self) -> String {
        spec_fingerprint(&self.spec)
    }
}
