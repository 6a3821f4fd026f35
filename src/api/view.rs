use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::schema::ViewSchema;
use super::{spec_fingerprint, TableStatus};

/// Views share the table status shape.
pub type ViewStatus = TableStatus;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[kube(
    group = "schemas.schemahero.io",
    version = "v1alpha4",
    kind = "View",
    plural = "views",
    namespaced,
    status = "ViewStatus",
    printcolumn = r#"{"name":"View","type":"string","jsonPath":".spec.name"}"#,
    printcolumn = r#"{"name":"Database","type":"string","jsonPath":".spec.database"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ViewSpec {
    pub database: String,
    pub name: String,
    pub schema: ViewSchema,
}

impl View {
    pub fn spec_sha(&self) -> String {
        spec_fingerprint(&self.spec)
    }
}
