//! Host-side plugin client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prost::Message;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::codec::{self, AnyPayload};
use super::error::{PluginError, Result};
use super::protocol::{
    methods, read_frame, write_frame, ConnectArgs, ConnectReply, ConnectionArgs, DeployArgs,
    Empty, Envelope, ErrorReply, GenerateFixturesArgs, PayloadReply, PlanExtensionArgs,
    PlanFunctionArgs, PlanTableArgs, PlanViewArgs, StringListReply, StringReply, TableArgs,
    ValidateArgs,
};
use super::traits::{ColumnInfo, ConnectOptions, EngineConnection};
use crate::api::schema::{
    ForeignKey, Index, PostgresqlFunctionSchema, TableSchema, ViewSchema,
};
use crate::api::{PostgresDatabaseExtension, SeedData};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Envelope>>>>;

/// Longest a single call may wait for its reply.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Map a reply's `error` field to a typed error.
fn check(error: String) -> Result<()> {
    if error.is_empty() {
        Ok(())
    } else if error == PluginError::ConnectionNotFound.to_string() {
        Err(PluginError::ConnectionNotFound)
    } else {
        Err(PluginError::Remote(error))
    }
}

/// Multiplexed request/reply client over one plugin stream.
pub struct PluginClient {
    label: String,
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Pending,
    next_seq: AtomicU64,
    closed: Arc<AtomicBool>,
    call_timeout: Duration,
    reader_task: JoinHandle<()>,
}

impl PluginClient {
    /// Start a client on a connected stream. `label` tags log lines.
    pub fn new<S>(label: impl Into<String>, stream: S) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_call_timeout(label, stream, DEFAULT_CALL_TIMEOUT)
    }

    /// Like [`PluginClient::new`], failing calls that outlive `call_timeout`.
    pub fn with_call_timeout<S>(
        label: impl Into<String>,
        stream: S,
        call_timeout: Duration,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let label = label.into();
        let (mut reader, writer) = tokio::io::split(stream);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader_task = {
            let pending = pending.clone();
            let closed = closed.clone();
            let label = label.clone();
            tokio::spawn(async move {
                loop {
                    match read_frame(&mut reader).await {
                        Ok(Some(reply)) => {
                            if let Some(tx) = pending.lock().await.remove(&reply.seq) {
                                let _ = tx.send(reply);
                            }
                        }
                        Ok(None) => {
                            debug!(plugin = %label, "Plugin stream closed");
                            break;
                        }
                        Err(e) => {
                            warn!(plugin = %label, error = %e, "Plugin stream failed");
                            break;
                        }
                    }
                }
                closed.store(true, Ordering::SeqCst);
                // Dropping the senders fails every waiting call.
                pending.lock().await.clear();
            })
        };

        Arc::new(Self {
            label,
            writer: Mutex::new(Box::new(writer)),
            pending,
            next_seq: AtomicU64::new(0),
            closed,
            call_timeout,
            reader_task,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send one call and wait for its reply.
    pub async fn call<A, R>(&self, method: &'static str, args: &A) -> Result<R>
    where
        A: Message,
        R: Message + Default,
    {
        if self.is_closed() {
            return Err(PluginError::Protocol(format!(
                "plugin {} is not running",
                self.label
            )));
        }
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(seq, tx);
        // The reader may have drained `pending` before the insert.
        if self.is_closed() {
            self.pending.lock().await.remove(&seq);
            return Err(PluginError::Protocol(format!(
                "plugin {} is not running",
                self.label
            )));
        }

        let request = Envelope {
            seq,
            method: method.to_string(),
            body: args.encode_to_vec(),
            error: String::new(),
        };
        let written = {
            let mut writer = self.writer.lock().await;
            write_frame(&mut *writer, &request).await
        };
        if let Err(e) = written {
            self.pending.lock().await.remove(&seq);
            return Err(e);
        }

        let reply = match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                return Err(PluginError::Protocol(format!(
                    "plugin {} closed the stream during {}",
                    self.label, method
                )))
            }
            Err(_) => {
                self.pending.lock().await.remove(&seq);
                warn!(plugin = %self.label, method, "Plugin call timed out");
                return Err(PluginError::Timeout {
                    plugin: self.label.clone(),
                    method: method.to_string(),
                });
            }
        };
        if !reply.error.is_empty() {
            return Err(PluginError::Protocol(reply.error));
        }
        Ok(R::decode(&reply.body[..])?)
    }

    pub async fn name(&self) -> Result<String> {
        let reply: StringReply = self.call(methods::NAME, &Empty {}).await?;
        check(reply.error)?;
        Ok(reply.value)
    }

    pub async fn version(&self) -> Result<String> {
        let reply: StringReply = self.call(methods::VERSION, &Empty {}).await?;
        check(reply.error)?;
        Ok(reply.value)
    }

    pub async fn supported_engines(&self) -> Result<Vec<String>> {
        let reply: StringListReply = self.call(methods::SUPPORTED_ENGINES, &Empty {}).await?;
        check(reply.error)?;
        Ok(reply.values)
    }

    pub async fn validate(&self, options: &ConnectOptions) -> Result<()> {
        let args = ValidateArgs {
            options: options.clone(),
        };
        let reply: ErrorReply = self.call(methods::VALIDATE, &args).await?;
        check(reply.error)
    }

    pub async fn initialize(&self) -> Result<()> {
        let reply: ErrorReply = self.call(methods::INITIALIZE, &Empty {}).await?;
        check(reply.error)
    }

    pub async fn shutdown(&self) -> Result<()> {
        let reply: ErrorReply = self.call(methods::SHUTDOWN, &Empty {}).await?;
        check(reply.error)
    }

    /// Open a database connection inside the plugin.
    pub async fn connect(
        self: &Arc<Self>,
        uri: &str,
        options: &ConnectOptions,
    ) -> Result<PluginConnection> {
        let args = ConnectArgs {
            uri: uri.to_string(),
            options: options.clone(),
        };
        let reply: ConnectReply = self.call(methods::CONNECT, &args).await?;
        check(reply.error)?;
        debug!(plugin = %self.label, connection_id = %reply.connection_id, "Connected");
        Ok(PluginConnection {
            client: self.clone(),
            id: reply.connection_id,
        })
    }
}

impl Drop for PluginClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// Host handle to a connection held by a plugin process.
#[derive(Clone)]
pub struct PluginConnection {
    client: Arc<PluginClient>,
    id: String,
}

impl std::fmt::Debug for PluginConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginConnection")
            .field("plugin", &self.client.label)
            .field("id", &self.id)
            .finish()
    }
}

impl PluginConnection {
    pub fn id(&self) -> &str {
        &self.id
    }

    fn args(&self) -> ConnectionArgs {
        ConnectionArgs {
            connection_id: self.id.clone(),
        }
    }

    fn table_args(&self, table: &str) -> TableArgs {
        TableArgs {
            connection_id: self.id.clone(),
            table_name: table.to_string(),
        }
    }

    async fn payload<T: AnyPayload>(&self, method: &'static str, table: &str) -> Result<T> {
        let reply: PayloadReply = self.client.call(method, &self.table_args(table)).await?;
        check(reply.error)?;
        codec::require(reply.payload.as_ref(), "reply payload")
    }

    async fn statements<A: Message>(&self, method: &'static str, args: &A) -> Result<Vec<String>> {
        let reply: StringListReply = self.client.call(method, args).await?;
        check(reply.error)?;
        Ok(reply.values)
    }

    fn masked(schema: &TableSchema) -> Result<prost_types::Any> {
        let mut schema = schema.clone();
        codec::mask_empty_defaults(&mut schema);
        schema.to_any()
    }
}

#[async_trait]
impl EngineConnection for PluginConnection {
    async fn close(&self) -> Result<()> {
        let reply: ErrorReply = self.client.call(methods::CLOSE, &self.args()).await?;
        check(reply.error)
    }

    async fn database_name(&self) -> Result<String> {
        let reply: StringReply = self.client.call(methods::DATABASE_NAME, &self.args()).await?;
        check(reply.error)?;
        Ok(reply.value)
    }

    async fn engine_version(&self) -> Result<String> {
        let reply: StringReply = self.client.call(methods::ENGINE_VERSION, &self.args()).await?;
        check(reply.error)?;
        Ok(reply.value)
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        self.statements(methods::LIST_TABLES, &self.args()).await
    }

    async fn list_table_foreign_keys(&self, table: &str) -> Result<Vec<ForeignKey>> {
        self.payload(methods::LIST_TABLE_FOREIGN_KEYS, table).await
    }

    async fn list_table_indexes(&self, table: &str) -> Result<Vec<Index>> {
        self.payload(methods::LIST_TABLE_INDEXES, table).await
    }

    async fn get_table_primary_key(&self, table: &str) -> Result<Vec<String>> {
        self.statements(methods::GET_TABLE_PRIMARY_KEY, &self.table_args(table))
            .await
    }

    async fn get_table_schema(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        self.payload(methods::GET_TABLE_SCHEMA, table).await
    }

    async fn plan_table_schema(
        &self,
        table: &str,
        schema: &TableSchema,
        seed_data: Option<&SeedData>,
    ) -> Result<Vec<String>> {
        let args = PlanTableArgs {
            connection_id: self.id.clone(),
            table_name: table.to_string(),
            schema: Some(Self::masked(schema)?),
            seed_data: seed_data.map(|s| s.to_any()).transpose()?,
        };
        self.statements(methods::PLAN_TABLE_SCHEMA, &args).await
    }

    async fn plan_view_schema(&self, view: &str, schema: &ViewSchema) -> Result<Vec<String>> {
        let args = PlanViewArgs {
            connection_id: self.id.clone(),
            view_name: view.to_string(),
            schema: Some(schema.to_any()?),
        };
        self.statements(methods::PLAN_VIEW_SCHEMA, &args).await
    }

    async fn plan_function_schema(
        &self,
        function: &str,
        schema: &PostgresqlFunctionSchema,
    ) -> Result<Vec<String>> {
        let args = PlanFunctionArgs {
            connection_id: self.id.clone(),
            function_name: function.to_string(),
            schema: Some(schema.to_any()?),
        };
        self.statements(methods::PLAN_FUNCTION_SCHEMA, &args).await
    }

    async fn plan_extension_schema(
        &self,
        extension: &PostgresDatabaseExtension,
    ) -> Result<Vec<String>> {
        let args = PlanExtensionArgs {
            connection_id: self.id.clone(),
            extension: Some(extension.to_any()?),
        };
        self.statements(methods::PLAN_EXTENSION_SCHEMA, &args).await
    }

    async fn deploy_statements(&self, statements: &[String]) -> Result<()> {
        let args = DeployArgs {
            connection_id: self.id.clone(),
            statements: statements.to_vec(),
        };
        let reply: ErrorReply = self.client.call(methods::DEPLOY_STATEMENTS, &args).await?;
        check(reply.error)
    }

    async fn generate_fixtures(
        &self,
        table: &str,
        schema: &TableSchema,
        seed_data: Option<&SeedData>,
    ) -> Result<Vec<String>> {
        let args = GenerateFixturesArgs {
            connection_id: self.id.clone(),
            table_name: table.to_string(),
            schema: Some(Self::masked(schema)?),
            seed_data: seed_data.map(|s| s.to_any()).transpose()?,
        };
        self.statements(methods::GENERATE_FIXTURES, &args).await
    }
}
