//! Plugin wire protocol.
//!
//! Every message is a 4-byte big-endian length followed by a prost-encoded
//! [`Envelope`]. Requests and replies share the envelope; `seq` pairs them,
//! so several calls can be in flight on one stream. The envelope `body`
//! holds the method-specific argument or reply message below.

use std::collections::HashMap;

use prost::Message;
use prost_types::Any;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::error::{PluginError, Result};

/// Upper bound on a single frame.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Environment variable a plugin checks before serving.
pub const MAGIC_COOKIE_KEY: &str = "SCHEMAHERO_PLUGIN";
pub const MAGIC_COOKIE_VALUE: &str = "schemahero-database-plugin";
pub const PROTOCOL_VERSION: u32 = 1;

/// Method names.
pub mod methods {
    pub const NAME: &str = "Plugin.Name";
    pub const VERSION: &str = "Plugin.Version";
    pub const SUPPORTED_ENGINES: &str = "Plugin.SupportedEngines";
    pub const CONNECT: &str = "Plugin.Connect";
    pub const VALIDATE: &str = "Plugin.Validate";
    pub const INITIALIZE: &str = "Plugin.Initialize";
    pub const SHUTDOWN: &str = "Plugin.Shutdown";

    pub const CLOSE: &str = "Plugin.ConnectionClose";
    pub const DATABASE_NAME: &str = "Plugin.ConnectionDatabaseName";
    pub const ENGINE_VERSION: &str = "Plugin.ConnectionEngineVersion";
    pub const LIST_TABLES: &str = "Plugin.ConnectionListTables";
    pub const LIST_TABLE_FOREIGN_KEYS: &str = "Plugin.ConnectionListTableForeignKeys";
    pub const LIST_TABLE_INDEXES: &str = "Plugin.ConnectionListTableIndexes";
    pub const GET_TABLE_PRIMARY_KEY: &str = "Plugin.ConnectionGetTablePrimaryKey";
    pub const GET_TABLE_SCHEMA: &str = "Plugin.ConnectionGetTableSchema";
    pub const PLAN_TABLE_SCHEMA: &str = "Plugin.ConnectionPlanTableSchema";
    pub const PLAN_VIEW_SCHEMA: &str = "Plugin.ConnectionPlanViewSchema";
    pub const PLAN_FUNCTION_SCHEMA: &str = "Plugin.ConnectionPlanFunctionSchema";
    pub const PLAN_EXTENSION_SCHEMA: &str = "Plugin.ConnectionPlanExtensionSchema";
    pub const DEPLOY_STATEMENTS: &str = "Plugin.ConnectionDeployStatements";
    pub const GENERATE_FIXTURES: &str = "Plugin.ConnectionGenerateFixtures";
}

#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    #[prost(uint64, tag = "1")]
    pub seq: u64,
    #[prost(string, tag = "2")]
    pub method: String,
    #[prost(bytes = "vec", tag = "3")]
    pub body: Vec<u8>,
    /// Transport-level failure; the body is empty when set.
    #[prost(string, tag = "4")]
    pub error: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Empty {}

#[derive(Clone, PartialEq, Message)]
pub struct ErrorReply {
    #[prost(string, tag = "1")]
    pub error: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct StringReply {
    #[prost(string, tag = "1")]
    pub value: String,
    #[prost(string, tag = "2")]
    pub error: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct StringListReply {
    #[prost(string, repeated, tag = "1")]
    pub values: Vec<String>,
    #[prost(string, tag = "2")]
    pub error: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct PayloadReply {
    #[prost(message, optional, tag = "1")]
    pub payload: Option<Any>,
    #[prost(string, tag = "2")]
    pub error: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ValidateArgs {
    #[prost(map = "string, string", tag = "1")]
    pub options: HashMap<String, String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ConnectArgs {
    #[prost(string, tag = "1")]
    pub uri: String,
    #[prost(map = "string, string", tag = "2")]
    pub options: HashMap<String, String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ConnectReply {
    #[prost(string, tag = "1")]
    pub connection_id: String,
    #[prost(string, tag = "2")]
    pub error: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ConnectionArgs {
    #[prost(string, tag = "1")]
    pub connection_id: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct TableArgs {
    #[prost(string, tag = "1")]
    pub connection_id: String,
    #[prost(string, tag = "2")]
    pub table_name: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct PlanTableArgs {
    #[prost(string, tag = "1")]
    pub connection_id: String,
    #[prost(string, tag = "2")]
    pub table_name: String,
    #[prost(message, optional, tag = "3")]
    pub schema: Option<Any>,
    #[prost(message, optional, tag = "4")]
    pub seed_data: Option<Any>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PlanViewArgs {
    #[prost(string, tag = "1")]
    pub connection_id: String,
    #[prost(string, tag = "2")]
    pub view_name: String,
    #[prost(message, optional, tag = "3")]
    pub schema: Option<Any>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PlanFunctionArgs {
    #[prost(string, tag = "1")]
    pub connection_id: String,
    #[prost(string, tag = "2")]
    pub function_name: String,
    #[prost(message, optional, tag = "3")]
    pub schema: Option<Any>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PlanExtensionArgs {
    #[prost(string, tag = "1")]
    pub connection_id: String,
    #[prost(message, optional, tag = "2")]
    pub extension: Option<Any>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DeployArgs {
    #[prost(string, tag = "1")]
    pub connection_id: String,
    #[prost(string, repeated, tag = "2")]
    pub statements: Vec<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct GenerateFixturesArgs {
    #[prost(string, tag = "1")]
    pub connection_id: String,
    #[prost(string, tag = "2")]
    pub table_name: String,
    #[prost(message, optional, tag = "3")]
    pub schema: Option<Any>,
    #[prost(message, optional, tag = "4")]
    pub seed_data: Option<Any>,
}

/// Write one length-prefixed envelope.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, envelope: &Envelope) -> Result<()> {
    let body = envelope.encode_to_vec();
    if body.len() > MAX_FRAME_LEN {
        return Err(PluginError::Protocol(format!(
            "frame of {} bytes exceeds limit",
            body.len()
        )));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one envelope. `None` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Envelope>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(PluginError::Protocol(format!(
            "frame of {} bytes exceeds limit",
            len
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(Envelope::decode(&buf[..])?))
}

/// Address a plugin announces on stdout once it is serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: u32,
    pub network: String,
    pub address: String,
}

impl Handshake {
    pub fn unix(path: &str) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            network: "unix".to_string(),
            address: path.to_string(),
        }
    }

    /// `{core}|{protocol}|{network}|{address}|frame`
    pub fn to_line(&self) -> String {
        format!(
            "1|{}|{}|{}|frame",
            self.protocol_version, self.network, self.address
        )
    }

    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.trim().split('|').collect();
        if parts.len() != 5 {
            return Err(PluginError::Handshake(format!(
                "malformed handshake line: {:?}",
                line
            )));
        }
        let protocol_version: u32 = parts[1]
            .parse()
            .map_err(|_| PluginError::Handshake(format!("bad protocol version {:?}", parts[1])))?;
        if protocol_version != PROTOCOL_VERSION {
            return Err(PluginError::Handshake(format!(
                "unsupported protocol version {}",
                protocol_version
            )));
        }
        if parts[2] != "unix" {
            return Err(PluginError::Handshake(format!(
                "unsupported network {:?}",
                parts[2]
            )));
        }
        if parts[4] != "frame" {
            return Err(PluginError::Handshake(format!(
                "unsupported wire protocol {:?}",
                parts[4]
            )));
        }
        Ok(Self {
            protocol_version,
            network: parts[2].to_string(),
            address: parts[3].to_string(),
        })
    }
}
