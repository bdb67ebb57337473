use crate::{
    errors::ServerError,
    io::{ChRead, ChWrite},
    Error, Result,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub const DBMS_MIN_REVISION_WITH_CLIENT_INFO: u64 = 54032;
pub const DBMS_MIN_REVISION_WITH_SERVER_TIMEZONE: u64 = 54058;
pub const DBMS_MIN_REVISION_WITH_QUOTA_KEY_IN_CLIENT_INFO: u64 = 54060;
pub const DBMS_MIN_REVISION_WITH_SERVER_DISPLAY_NAME: u64 = 54372;
pub const DBMS_MIN_REVISION_WITH_VERSION_PATCH: u64 = 54401;
pub const DBMS_MIN_REVISION_WITH_CLIENT_WRITE_INFO: u64 = 54420;
pub const DBMS_MIN_REVISION_WITH_SETTINGS_SERIALIZED_AS_STRINGS: u64 = 54429;
pub const DBMS_MIN_REVISION_WITH_INTERSERVER_SECRET: u64 = 54441;
pub const DBMS_MIN_REVISION_WITH_OPENTELEMETRY: u64 = 54442;
pub const DBMS_MIN_PROTOCOL_VERSION_WITH_DISTRIBUTED_DEPTH: u64 = 54448;

pub const DBMS_TCP_PROTOCOL_VERSION: u64 = 54448;

pub const MAX_STRING_SIZE: usize = 1 << 30;

#[repr(u64)]
#[derive(Clone, Copy, Debug)]
pub enum ClientPacketId {
    Hello = 0,
    Query = 1,
    Data = 2,
    Cancel = 3,
    Ping = 4,
}

#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerPacketId {
    Hello,
    Data,
    Exception,
    Progress,
    Pong,
    EndOfStream,
    ProfileInfo,
    Totals,
    Extremes,
    TablesStatusResponse,
    Log,
    TableColumns,
}

impl ServerPacketId {
    pub fn from_u64(i: u64) -> Result<Self> {
        Ok(match i {
            0 => ServerPacketId::Hello,
            1 => ServerPacketId::Data,
            2 => ServerPacketId::Exception,
            3 => ServerPacketId::Progress,
            4 => ServerPacketId::Pong,
            5 => ServerPacketId::EndOfStream,
            6 => ServerPacketId::ProfileInfo,
            7 => ServerPacketId::Totals,
            8 => ServerPacketId::Extremes,
            9 => ServerPacketId::TablesStatusResponse,
            10 => ServerPacketId::Log,
            11 => ServerPacketId::TableColumns,
            x => {
                return Err(Error::Protocol(format!(
                    "invalid packet id from server: {x}"
                )))
            }
        })
    }
}

/// Server identity negotiated at handshake. Optional fields are gated by the
/// revision the server advertises.
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    pub name: String,
    pub major_version: u64,
    pub minor_version: u64,
    pub revision: u64,
    pub timezone: Option<String>,
    pub display_name: Option<String>,
    pub patch_version: u64,
}

impl ServerInfo {
    pub async fn read<R: ChRead>(reader: &mut R) -> Result<Self> {
        let name = reader.read_utf8_string().await?;
        let major_version = reader.read_var_uint().await?;
        let minor_version = reader.read_var_uint().await?;
        let revision = reader.read_var_uint().await?;
        let timezone = if revision >= DBMS_MIN_REVISION_WITH_SERVER_TIMEZONE {
            Some(reader.read_utf8_string().await?)
        } else {
            None
        };
        let display_name = if revision >= DBMS_MIN_REVISION_WITH_SERVER_DISPLAY_NAME {
            Some(reader.read_utf8_string().await?)
        } else {
            None
        };
        let patch_version = if revision >= DBMS_MIN_REVISION_WITH_VERSION_PATCH {
            reader.read_var_uint().await?
        } else {
            revision
        };
        Ok(ServerInfo {
            name,
            major_version,
            minor_version,
            revision,
            timezone,
            display_name,
            patch_version,
        })
    }

    pub async fn write<W: ChWrite>(&self, writer: &mut W) -> Result<()> {
        writer.write_string(&self.name).await?;
        writer.write_var_uint(self.major_version).await?;
        writer.write_var_uint(self.minor_version).await?;
        writer.write_var_uint(self.revision).await?;
        if self.revision >= DBMS_MIN_REVISION_WITH_SERVER_TIMEZONE {
            writer
                .write_string(self.timezone.as_deref().unwrap_or("UTC"))
                .await?;
        }
        if self.revision >= DBMS_MIN_REVISION_WITH_SERVER_DISPLAY_NAME {
            writer
                .write_string(self.display_name.as_deref().unwrap_or(""))
                .await?;
        }
        if self.revision >= DBMS_MIN_REVISION_WITH_VERSION_PATCH {
            writer.write_var_uint(self.patch_version).await?;
        }
        Ok(())
    }
}

/// Reads a full server exception chain and folds it into [`Error::Server`].
pub async fn read_exception<R: ChRead>(reader: &mut R) -> Result<Error> {
    let mut chain = Vec::new();
    loop {
        let code = reader.read_i32_le().await?;
        let name = reader.read_utf8_string().await?;
        let message = reader.read_utf8_string().await?;
        let stack_trace = reader.read_utf8_string().await?;
        let has_nested = reader.read_u8().await? != 0;
        chain.push(ServerError {
            code,
            name,
            message,
            stack_trace,
        });
        if !has_nested {
            break;
        }
    }
    let head = chain.remove(0);
    // The server prefixes messages with "<name>: "; strip it so the display
    // matches the canonical " DB::Exception (code): message" rendering.
    let message = head
        .message
        .strip_prefix(&format!("{}: ", head.name))
        .unwrap_or(&head.message)
        .to_string();
    Ok(Error::Server {
        code: head.code,
        name: head.name,
        message,
        stack_trace: head.stack_trace,
        nested: chain,
    })
}

/// Writes one exception link (used by in-process protocol peers in tests).
pub async fn write_exception<W: ChWrite>(
    writer: &mut W,
    code: i32,
    name: &str,
    message: &str,
) -> Result<()> {
    writer.write_i32_le(code).await?;
    writer.write_string(name).await?;
    writer.write_string(message).await?;
    writer.write_string("").await?;
    writer.write_u8(0).await?;
    Ok(())
}

/// Statistics the server sends about a finished block stream.
#[derive(Debug, Clone, Default)]
pub struct ProfileInfo {
    pub rows: u64,
    pub blocks: u64,
    pub bytes: u64,
    pub applied_limit: bool,
    pub rows_before_limit: u64,
    pub calculated_rows_before_limit: bool,
}

impl ProfileInfo {
    pub async fn read<R: ChRead>(reader: &mut R) -> Result<Self> {
        let rows = reader.read_var_uint().await?;
        let blocks = reader.read_var_uint().await?;
        let bytes = reader.read_var_uint().await?;
        let applied_limit = reader.read_u8().await? != 0;
        let rows_before_limit = reader.read_var_uint().await?;
        let calculated_rows_before_limit = reader.read_u8().await? != 0;
        Ok(ProfileInfo {
            rows,
            blocks,
            bytes,
            applied_limit,
            rows_before_limit,
            calculated_rows_before_limit,
        })
    }

    pub async fn write<W: ChWrite>(&self, writer: &mut W) -> Result<()> {
        writer.write_var_uint(self.rows).await?;
        writer.write_var_uint(self.blocks).await?;
        writer.write_var_uint(self.bytes).await?;
        writer.write_u8(self.applied_limit as u8).await?;
        writer.write_var_uint(self.rows_before_limit).await?;
        writer
            .write_u8(self.calculated_rows_before_limit as u8)
            .await?;
        Ok(())
    }
}

/// Aggregated outcome of one exec/select/insert exchange.
#[derive(Debug, Clone, Default)]
pub struct Profile {
    pub progress: crate::Progress,
    pub profile_info: Option<ProfileInfo>,
}

/// Block payload compression negotiated per connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompressionMethod {
    #[cfg_attr(not(feature = "compression"), default)]
    None,
    #[cfg_attr(feature = "compression", default)]
    Lz4,
    Zstd,
}

impl CompressionMethod {
    pub fn byte(&self) -> u8 {
        match self {
            CompressionMethod::None => 0x02,
            CompressionMethod::Lz4 => 0x82,
            CompressionMethod::Zstd => 0x90,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, CompressionMethod::None)
    }
}
