//! Interfaces an engine plugin implements.
//!
//! A plugin binary wraps its [`EnginePlugin`] in [`super::serve`]; the host
//! reaches the same methods through [`super::PluginClient`].

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::Result;
use crate::api::schema::{ForeignKey, Index, PostgresqlFunctionSchema, TableSchema, ViewSchema};
use crate::api::{PostgresDatabaseExtension, SeedData};

/// Engine-specific connection options, e.g. Cassandra hosts and keyspace.
pub type ConnectOptions = HashMap<String, String>;

/// A column as introspected from a live database.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_default: Option<String>,
    #[serde(default)]
    pub not_null: bool,
}

#[async_trait]
pub trait EnginePlugin: Send + Sync {
    fn name(&self) -> String;

    fn version(&self) -> String;

    fn supported_engines(&self) -> Vec<String>;

    /// Check options without connecting.
    async fn validate(&self, options: &ConnectOptions) -> Result<()>;

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    async fn connect(
        &self,
        uri: &str,
        options: &ConnectOptions,
    ) -> Result<Box<dyn EngineConnection>>;
}

/// One live database connection inside a plugin.
#[async_trait]
pub trait EngineConnection: Send + Sync {
    async fn close(&self) -> Result<()>;

    async fn database_name(&self) -> Result<String>;

    async fn engine_version(&self) -> Result<String>;

    async fn list_tables(&self) -> Result<Vec<String>>;

    async fn list_table_foreign_keys(&self, table: &str) -> Result<Vec<ForeignKey>>;

    async fn list_table_indexes(&self, table: &str) -> Result<Vec<Index>>;

    async fn get_table_primary_key(&self, table: &str) -> Result<Vec<String>>;

    async fn get_table_schema(&self, table: &str) -> Result<Vec<ColumnInfo>>;

    /// Ordered statements that move the live table to `schema`.
    async fn plan_table_schema(
        &self,
        table: &str,
        schema: &TableSchema,
        seed_data: Option<&SeedData>,
    ) -> Result<Vec<String>>;

    async fn plan_view_schema(&self, view: &str, schema: &ViewSchema) -> Result<Vec<String>>;

    async fn plan_function_schema(
        &self,
        function: &str,
        schema: &PostgresqlFunctionSchema,
    ) -> Result<Vec<String>>;

    async fn plan_extension_schema(
        &self,
        extension: &PostgresDatabaseExtension,
    ) -> Result<Vec<String>>;

    /// Execute in order, stopping at the first failure.
    async fn deploy_statements(&self, statements: &[String]) -> Result<()>;

    /// Statements for declared fixtures, without touching the database.
    async fn generate_fixtures(
        &self,
        table: &str,
        schema: &TableSchema,
        seed_data: Option<&SeedData>,
    ) -> Result<Vec<String>>;
}
