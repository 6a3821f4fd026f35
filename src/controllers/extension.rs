//! PostgreSQL extensions.

use std::sync::Arc;

use async_trait::async_trait;

use super::direct::{DirectApply, DirectReconciler};
use crate::api::{ApplyStatus, DatabaseExtension, Engine, PostgresDatabaseExtension};
use crate::plugin::{self, EngineConnection, PluginConnection};
use crate::store::{Cluster, ResourceStore};

pub type ExtensionReconciler = DirectReconciler<DatabaseExtension>;

/// `DROP EXTENSION IF EXISTS "{name}"`.
pub fn drop_extension_statements(extension: &PostgresDatabaseExtension) -> Vec<String> {
    vec![format!("DROP EXTENSION IF EXISTS \"{}\"", extension.name)]
}

#[async_trait]
impl DirectApply for DatabaseExtension {
    const CONTROLLER: &'static str = "extension";

    fn store(cluster: &Cluster) -> Arc<dyn ResourceStore<Self>> {
        cluster.extensions.clone()
    }

    fn database_name(&self) -> &str {
        &self.spec.database_name
    }

    fn remove_on_deletion(&self) -> bool {
        self.spec.remove_on_deletion
    }

    fn spec_sha(&self) -> String {
        DatabaseExtension::spec_sha(self)
    }

    fn apply_status(&self) -> Option<&ApplyStatus> {
        self.status.as_ref()
    }

    fn apply_status_mut(&mut self) -> &mut Option<ApplyStatus> {
        &mut self.status
    }

    fn applies_to(&self, engine: Engine) -> bool {
        engine == Engine::Postgres && self.spec.postgres.is_some()
    }

    async fn statements(
        &self,
        conn: &PluginConnection,
        teardown: bool,
    ) -> plugin::Result<Vec<String>> {
        let Some(extension) = &self.spec.postgres else {
            return Ok(Vec::new());
        };
        if teardown {
            return Ok(drop_extension_statements(extension));
        }
        conn.plan_extension_schema(extension).await
    }
}
