use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::schema::FunctionSchema;
use super::{spec_fingerprint, ApplyStatus};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[kube(
    group = "schemas.schemahero.io",
    version = "v1alpha4",
    kind = "Function",
    plural = "functions",
    namespaced,
    status = "ApplyStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSpec {
    pub database: String,
    pub name: String,
    pub schema: FunctionSchema,
    /// Drop the function when the resource is deleted.
    #[serde(default)]
    pub remove_on_deletion: bool,
}

impl Function {
    pub fn spec_sha(&self) -> String {
        spec_fingerprint(&self.spec)
    }
}
