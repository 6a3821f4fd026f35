use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Rows inserted after a table is created, when the database opts in with
/// `deploySeedData`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SeedData {
    #[serde(default)]
    pub rows: Vec<SeedDataRow>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SeedDataRow {
    #[serde(default)]
    pub columns: Vec<SeedDataColumn>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SeedDataColumn {
    pub column: String,
    pub value: SeedDataValue,
}

/// A seed value; at most one of `int` / `str` is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SeedDataValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub int: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub str: Option<String>,
}
