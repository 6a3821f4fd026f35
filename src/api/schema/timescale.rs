use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::PostgresqlTableSchema;

/// PostgreSQL table plus optional hypertable settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TimescaleTableSchema {
    #[serde(flatten)]
    pub table: PostgresqlTableSchema,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hypertable: Option<TimescaleHypertable>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TimescaleHypertable {
    pub time_column_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_time_interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<TimescaleCompression>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<TimescaleRetention>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TimescaleCompression {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub segment_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TimescaleRetention {
    pub interval: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TimescaleViewSchema {
    pub query: String,
    #[serde(default)]
    pub is_continuous_aggregate: bool,
    #[serde(default)]
    pub with_no_data: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_deleted: bool,
}
