//! Plugin-side runtime.
//!
//! [`serve`] is the `main` of a plugin binary: it checks the magic cookie,
//! listens on a private Unix socket, announces it on stdout and dispatches
//! calls into an [`EnginePlugin`] until the host hangs up or sends SIGTERM.

use std::collections::HashMap;
use std::sync::Arc;

use prost::Message;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use super::codec::{self, AnyPayload};
use super::error::{PluginError, Result};
use super::protocol::{
    methods, read_frame, write_frame, ConnectArgs, ConnectReply, ConnectionArgs, DeployArgs,
    Envelope, ErrorReply, GenerateFixturesArgs, Handshake, PayloadReply, PlanExtensionArgs,
    PlanFunctionArgs, PlanTableArgs, PlanViewArgs, StringListReply, StringReply, TableArgs,
    ValidateArgs, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE,
};
use super::traits::{EngineConnection, EnginePlugin};
use crate::api::schema::{PostgresqlFunctionSchema, TableSchema, ViewSchema};
use crate::api::{PostgresDatabaseExtension, SeedData};

#[derive(Default)]
struct ConnectionTable {
    connections: HashMap<String, Arc<dyn EngineConnection>>,
    counter: u64,
}

/// Dispatches wire calls into a plugin and owns its live connections.
pub struct PluginServer {
    plugin: Arc<dyn EnginePlugin>,
    table: RwLock<ConnectionTable>,
}

fn error_text<T>(result: &Result<T>) -> String {
    match result {
        Ok(_) => String::new(),
        Err(e) => e.to_string(),
    }
}

fn string_list(result: Result<Vec<String>>) -> StringListReply {
    match result {
        Ok(values) => StringListReply {
            values,
            error: String::new(),
        },
        Err(e) => StringListReply {
            values: Vec::new(),
            error: e.to_string(),
        },
    }
}

fn string_value(result: Result<String>) -> StringReply {
    match result {
        Ok(value) => StringReply {
            value,
            error: String::new(),
        },
        Err(e) => StringReply {
            value: String::new(),
            error: e.to_string(),
        },
    }
}

fn payload<T: AnyPayload>(result: Result<T>) -> PayloadReply {
    match result.and_then(|v| v.to_any()) {
        Ok(any) => PayloadReply {
            payload: Some(any),
            error: String::new(),
        },
        Err(e) => PayloadReply {
            payload: None,
            error: e.to_string(),
        },
    }
}

impl PluginServer {
    pub fn new(plugin: Arc<dyn EnginePlugin>) -> Self {
        Self {
            plugin,
            table: RwLock::new(ConnectionTable::default()),
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.table.read().await.connections.len()
    }

    async fn insert(&self, conn: Box<dyn EngineConnection>) -> String {
        let mut table = self.table.write().await;
        table.counter += 1;
        let id = format!("conn-{}", table.counter);
        table.connections.insert(id.clone(), Arc::from(conn));
        id
    }

    async fn connection(&self, id: &str) -> Result<Arc<dyn EngineConnection>> {
        self.table
            .read()
            .await
            .connections
            .get(id)
            .cloned()
            .ok_or(PluginError::ConnectionNotFound)
    }

    async fn close(&self, id: &str) -> Result<()> {
        let conn = self
            .table
            .write()
            .await
            .connections
            .remove(id)
            .ok_or(PluginError::ConnectionNotFound)?;
        conn.close().await
    }

    /// Close every live connection.
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.table.write().await.connections.drain().collect();
        for (id, conn) in drained {
            if let Err(e) = conn.close().await {
                warn!(connection_id = %id, error = %e, "Failed to close connection");
            }
        }
    }

    async fn plan_table(&self, args: &PlanTableArgs) -> Result<Vec<String>> {
        let conn = self.connection(&args.connection_id).await?;
        let mut schema: TableSchema = codec::require(args.schema.as_ref(), "schema")?;
        codec::unmask_empty_defaults(&mut schema);
        let seed: Option<SeedData> = codec::optional(args.seed_data.as_ref())?;
        conn.plan_table_schema(&args.table_name, &schema, seed.as_ref())
            .await
    }

    async fn plan_view(&self, args: &PlanViewArgs) -> Result<Vec<String>> {
        let conn = self.connection(&args.connection_id).await?;
        let schema: ViewSchema = codec::require(args.schema.as_ref(), "schema")?;
        conn.plan_view_schema(&args.view_name, &schema).await
    }

    async fn plan_function(&self, args: &PlanFunctionArgs) -> Result<Vec<String>> {
        let conn = self.connection(&args.connection_id).await?;
        let schema: PostgresqlFunctionSchema = codec::require(args.schema.as_ref(), "schema")?;
        conn.plan_function_schema(&args.function_name, &schema)
            .await
    }

    async fn plan_extension(&self, args: &PlanExtensionArgs) -> Result<Vec<String>> {
        let conn = self.connection(&args.connection_id).await?;
        let extension: PostgresDatabaseExtension =
            codec::require(args.extension.as_ref(), "extension")?;
        conn.plan_extension_schema(&extension).await
    }

    async fn generate_fixtures(&self, args: &GenerateFixturesArgs) -> Result<Vec<String>> {
        let conn = self.connection(&args.connection_id).await?;
        let mut schema: TableSchema = codec::require(args.schema.as_ref(), "schema")?;
        codec::unmask_empty_defaults(&mut schema);
        let seed: Option<SeedData> = codec::optional(args.seed_data.as_ref())?;
        conn.generate_fixtures(&args.table_name, &schema, seed.as_ref())
            .await
    }

    /// Handle one call. `Err` is a transport failure (undecodable body,
    /// unknown method); plugin failures travel in the reply's `error` field.
    pub async fn dispatch(&self, method: &str, body: &[u8]) -> Result<Vec<u8>> {
        let reply = match method {
            methods::NAME => StringReply {
                value: self.plugin.name(),
                error: String::new(),
            }
            .encode_to_vec(),
            methods::VERSION => StringReply {
                value: self.plugin.version(),
                error: String::new(),
            }
            .encode_to_vec(),
            methods::SUPPORTED_ENGINES => StringListReply {
                values: self.plugin.supported_engines(),
                error: String::new(),
            }
            .encode_to_vec(),
            methods::VALIDATE => {
                let args = ValidateArgs::decode(body)?;
                let result = self.plugin.validate(&args.options).await;
                ErrorReply {
                    error: error_text(&result),
                }
                .encode_to_vec()
            }
            methods::INITIALIZE => ErrorReply {
                error: error_text(&self.plugin.initialize().await),
            }
            .encode_to_vec(),
            methods::SHUTDOWN => {
                self.close_all().await;
                ErrorReply {
                    error: error_text(&self.plugin.shutdown().await),
                }
                .encode_to_vec()
            }
            methods::CONNECT => {
                let args = ConnectArgs::decode(body)?;
                let reply = match self.plugin.connect(&args.uri, &args.options).await {
                    Ok(conn) => {
                        let connection_id = self.insert(conn).await;
                        debug!(connection_id = %connection_id, "Connection opened");
                        ConnectReply {
                            connection_id,
                            error: String::new(),
                        }
                    }
                    Err(e) => ConnectReply {
                        connection_id: String::new(),
                        error: e.to_string(),
                    },
                };
                reply.encode_to_vec()
            }
            methods::CLOSE => {
                let args = ConnectionArgs::decode(body)?;
                ErrorReply {
                    error: error_text(&self.close(&args.connection_id).await),
                }
                .encode_to_vec()
            }
            methods::DATABASE_NAME => {
                let args = ConnectionArgs::decode(body)?;
                let result = match self.connection(&args.connection_id).await {
                    Ok(conn) => conn.database_name().await,
                    Err(e) => Err(e),
                };
                string_value(result).encode_to_vec()
            }
            methods::ENGINE_VERSION => {
                let args = ConnectionArgs::decode(body)?;
                let result = match self.connection(&args.connection_id).await {
                    Ok(conn) => conn.engine_version().await,
                    Err(e) => Err(e),
                };
                string_value(result).encode_to_vec()
            }
            methods::LIST_TABLES => {
                let args = ConnectionArgs::decode(body)?;
                let result = match self.connection(&args.connection_id).await {
                    Ok(conn) => conn.list_tables().await,
                    Err(e) => Err(e),
                };
                string_list(result).encode_to_vec()
            }
            methods::LIST_TABLE_FOREIGN_KEYS => {
                let args = TableArgs::decode(body)?;
                let result = match self.connection(&args.connection_id).await {
                    Ok(conn) => conn.list_table_foreign_keys(&args.table_name).await,
                    Err(e) => Err(e),
                };
                payload(result).encode_to_vec()
            }
            methods::LIST_TABLE_INDEXES => {
                let args = TableArgs::decode(body)?;
                let result = match self.connection(&args.connection_id).await {
                    Ok(conn) => conn.list_table_indexes(&args.table_name).await,
                    Err(e) => Err(e),
                };
                payload(result).encode_to_vec()
            }
            methods::GET_TABLE_PRIMARY_KEY => {
                let args = TableArgs::decode(body)?;
                let result = match self.connection(&args.connection_id).await {
                    Ok(conn) => conn.get_table_primary_key(&args.table_name).await,
                    Err(e) => Err(e),
                };
                string_list(result).encode_to_vec()
            }
            methods::GET_TABLE_SCHEMA => {
                let args = TableArgs::decode(body)?;
                let result = match self.connection(&args.connection_id).await {
                    Ok(conn) => conn.get_table_schema(&args.table_name).await,
                    Err(e) => Err(e),
                };
                payload(result).encode_to_vec()
            }
            methods::PLAN_TABLE_SCHEMA => {
                let args = PlanTableArgs::decode(body)?;
                string_list(self.plan_table(&args).await).encode_to_vec()
            }
            methods::PLAN_VIEW_SCHEMA => {
                let args = PlanViewArgs::decode(body)?;
                string_list(self.plan_view(&args).await).encode_to_vec()
            }
            methods::PLAN_FUNCTION_SCHEMA => {
                let args = PlanFunctionArgs::decode(body)?;
                string_list(self.plan_function(&args).await).encode_to_vec()
            }
            methods::PLAN_EXTENSION_SCHEMA => {
                let args = PlanExtensionArgs::decode(body)?;
                string_list(self.plan_extension(&args).await).encode_to_vec()
            }
            methods::DEPLOY_STATEMENTS => {
                let args = DeployArgs::decode(body)?;
                let result = match self.connection(&args.connection_id).await {
                    Ok(conn) => conn.deploy_statements(&args.statements).await,
                    Err(e) => Err(e),
                };
                ErrorReply {
                    error: error_text(&result),
                }
                .encode_to_vec()
            }
            methods::GENERATE_FIXTURES => {
                let args = GenerateFixturesArgs::decode(body)?;
                string_list(self.generate_fixtures(&args).await).encode_to_vec()
            }
            other => {
                return Err(PluginError::Protocol(format!("unknown method {}", other)));
            }
        };
        Ok(reply)
    }

    /// Serve calls from one host stream until it closes.
    ///
    /// Calls run concurrently; replies are written in completion order.
    pub async fn serve_stream<S>(self: Arc<Self>, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::channel::<Envelope>(64);

        let writer_task = tokio::spawn(async move {
            while let Some(reply) = rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &reply).await {
                    warn!(error = %e, "Failed to write reply");
                    break;
                }
            }
        });

        while let Some(request) = read_frame(&mut reader).await? {
            let server = self.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let reply = match server.dispatch(&request.method, &request.body).await {
                    Ok(body) => Envelope {
                        seq: request.seq,
                        method: request.method,
                        body,
                        error: String::new(),
                    },
                    Err(e) => Envelope {
                        seq: request.seq,
                        method: request.method,
                        body: Vec::new(),
                        error: e.to_string(),
                    },
                };
                let _ = tx.send(reply).await;
            });
        }

        drop(tx);
        let _ = writer_task.await;
        debug!("Host closed plugin stream");
        Ok(())
    }
}

/// Run `plugin` as a plugin process. Returns when the host disconnects.
pub async fn serve<P: EnginePlugin + 'static>(plugin: P) -> Result<()> {
    if std::env::var(MAGIC_COOKIE_KEY).ok().as_deref() != Some(MAGIC_COOKIE_VALUE) {
        return Err(PluginError::Handshake(
            "this binary is a schemahero plugin and must be launched by the schemahero manager"
                .to_string(),
        ));
    }
    codec::register_payload_types();

    let path = std::env::temp_dir().join(format!("schemahero-plugin-{}.sock", uuid::Uuid::new_v4()));
    let listener = UnixListener::bind(&path)?;
    let line = Handshake::unix(&path.to_string_lossy()).to_line();
    let mut stdout = tokio::io::stdout();
    stdout.write_all(format!("{}\n", line).as_bytes()).await?;
    stdout.flush().await?;

    let (stream, _) = listener.accept().await?;
    let _ = std::fs::remove_file(&path);

    let server = Arc::new(PluginServer::new(Arc::new(plugin)));
    let mut terminate = signal(SignalKind::terminate())?;
    let result = tokio::select! {
        result = server.clone().serve_stream(stream) => result,
        _ = terminate.recv() => {
            info!("Received SIGTERM, shutting down plugin");
            if let Err(e) = server.plugin.shutdown().await {
                warn!(error = %e, "Plugin shutdown failed");
            }
            Ok(())
        }
    };
    server.close_all().await;
    result
}
