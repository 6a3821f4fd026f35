use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{spec_fingerprint, ApplyStatus};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[kube(
    group = "databases.schemahero.io",
    version = "v1alpha4",
    kind = "DatabaseExtension",
    plural = "databaseextensions",
    namespaced,
    status = "ApplyStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseExtensionSpec {
    pub database_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgres: Option<PostgresDatabaseExtension>,
    #[serde(default)]
    pub remove_on_deletion: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PostgresDatabaseExtension {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
}

impl DatabaseExtension {
    pub fn spec_sha(&self) -> String {
        spec_fingerprint(&self.spec)
    }
}
