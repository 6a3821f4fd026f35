//! PostgreSQL functions.

use std::sync::Arc;

use async_trait::async_trait;

use super::direct::{DirectApply, DirectReconciler};
use crate::api::{ApplyStatus, Engine, Function};
use crate::plugin::{self, EngineConnection, PluginConnection};
use crate::store::{Cluster, ResourceStore};

pub type FunctionReconciler = DirectReconciler<Function>;

#[async_trait]
impl DirectApply for Function {
    const CONTROLLER: &'static str = "function";

    fn store(cluster: &Cluster) -> Arc<dyn ResourceStore<Self>> {
        cluster.functions.clone()
    }

    fn database_name(&self) -> &str {
        &self.spec.database
    }

    fn remove_on_deletion(&self) -> bool {
        self.spec.remove_on_deletion
    }

    fn spec_sha(&self) -> String {
        Function::spec_sha(self)
    }

    fn apply_status(&self) -> Option<&ApplyStatus> {
        self.status.as_ref()
    }

    fn apply_status_mut(&mut self) -> &mut Option<ApplyStatus> {
        &mut self.status
    }

    fn applies_to(&self, engine: Engine) -> bool {
        engine == Engine::Postgres && self.spec.schema.postgres.is_some()
    }

    /// Teardown plans the same schema flagged as deleted, which yields
    /// `DROP FUNCTION`.
    async fn statements(
        &self,
        conn: &PluginConnection,
        teardown: bool,
    ) -> plugin::Result<Vec<String>> {
        let Some(schema) = &self.spec.schema.postgres else {
            return Ok(Vec::new());
        };
        let mut schema = schema.clone();
        schema.is_deleted = teardown;
        conn.plan_function_schema(&self.spec.name, &schema).await
    }
}
