use log::{debug, trace, warn};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::{
    block::Block,
    config::ConnConfig,
    insert::InsertStmt,
    io::{ChRead, ChWrite},
    progress::Progress,
    protocol::{
        read_exception, ClientPacketId, CompressionMethod, Profile, ProfileInfo, ServerInfo,
        ServerPacketId, DBMS_MIN_PROTOCOL_VERSION_WITH_DISTRIBUTED_DEPTH,
        DBMS_MIN_REVISION_WITH_CLIENT_INFO, DBMS_MIN_REVISION_WITH_INTERSERVER_SECRET,
        DBMS_MIN_REVISION_WITH_OPENTELEMETRY, DBMS_MIN_REVISION_WITH_QUOTA_KEY_IN_CLIENT_INFO,
        DBMS_MIN_REVISION_WITH_SETTINGS_SERIALIZED_AS_STRINGS, DBMS_MIN_REVISION_WITH_VERSION_PATCH,
        DBMS_TCP_PROTOCOL_VERSION,
    },
    select::SelectStream,
    settings::{write_string_setting, Settings, SETTING_FLAG_CUSTOM},
    watcher::{guard, ContextWatcher},
    Error, Result,
};

// QueryProcessingStage::Complete
const STAGE_COMPLETE: u64 = 2;

pub(crate) type Reader = BufReader<Box<dyn AsyncRead + Send + Sync + Unpin>>;
pub(crate) type Writer = BufWriter<Box<dyn AsyncWrite + Send + Sync + Unpin>>;

/// Connection lifecycle. Exactly one exchange runs at a time; the busy guard
/// is taken by each top-level operation and dropped when the exchange
/// reaches EndOfStream or fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Uninitialized,
    Idle,
    Busy,
    Closed,
}

/// A single native-protocol connection.
///
/// All operations take a per-call [`CancellationToken`]; a fired token tears
/// down the in-flight wire operation at the next packet boundary and closes
/// the connection.
pub struct Connection {
    id: u64,
    pub(crate) reader: Reader,
    pub(crate) writer: Writer,
    pub(crate) status: ConnStatus,
    pub(crate) server: ServerInfo,
    pub(crate) config: ConnConfig,
    pub(crate) watcher: ContextWatcher,
}

fn next_conn_id() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Non-data packets surfaced by the packet pump.
pub(crate) enum ServerEvent {
    Data(Block),
    Done,
}

impl Connection {
    /// Connects over TCP, trying each configured host in order, and performs
    /// the handshake.
    pub async fn connect(config: &ConnConfig, token: &CancellationToken) -> Result<Connection> {
        if token.is_cancelled() {
            return Err(Error::Canceled);
        }
        let mut last_err = None;
        for (host, port) in &config.hosts {
            match Self::connect_host(config, host, *port, token).await {
                Ok(conn) => return Ok(conn),
                Err(e) if e.is_canceled() => return Err(e),
                Err(e) => {
                    warn!("connect to {host}:{port} failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Config("no hosts to connect to".to_string())))
    }

    async fn connect_host(
        config: &ConnConfig,
        host: &str,
        port: u16,
        token: &CancellationToken,
    ) -> Result<Connection> {
        let stream = guard(Some(token.clone()), async {
            let connect = TcpStream::connect((host, port));
            match config.connect_timeout {
                Some(limit) => tokio::time::timeout(limit, connect)
                    .await
                    .map_err(|_| Error::Timeout)?
                    .map_err(Error::from),
                None => connect.await.map_err(Error::from),
            }
        })
        .await?;
        let (read, write) = stream.into_split();
        Self::connect_stream(read, write, config, token).await
    }

    /// Runs the handshake over a caller-provided byte stream. Use for
    /// transports other than plain TCP.
    pub async fn connect_stream(
        read: impl AsyncRead + Send + Sync + Unpin + 'static,
        write: impl AsyncWrite + Send + Sync + Unpin + 'static,
        config: &ConnConfig,
        token: &CancellationToken,
    ) -> Result<Connection> {
        #[cfg(not(feature = "compression"))]
        if !config.compression.is_none() {
            return Err(Error::Config(
                "compression requested but chx was built without the compression feature"
                    .to_string(),
            ));
        }
        let mut conn = Connection {
            id: next_conn_id(),
            reader: BufReader::new(Box::new(read) as Box<dyn AsyncRead + Send + Sync + Unpin>),
            writer: BufWriter::new(Box::new(write) as Box<dyn AsyncWrite + Send + Sync + Unpin>),
            status: ConnStatus::Uninitialized,
            server: ServerInfo::default(),
            config: config.clone(),
            watcher: ContextWatcher::new(),
        };
        conn.watcher.watch(token);
        let result = conn.handshake().await;
        conn.watcher.unwatch();
        match result {
            Ok(()) => {
                conn.status = ConnStatus::Idle;
                debug!(
                    "connected to {} {}.{}.{} (revision {})",
                    conn.server.name,
                    conn.server.major_version,
                    conn.server.minor_version,
                    conn.server.patch_version,
                    conn.server.revision
                );
                Ok(conn)
            }
            Err(e) => Err(e),
        }
    }

    async fn handshake(&mut self) -> Result<()> {
        let token = self.watcher.current();
        guard(token, async {
            self.writer
                .write_var_uint(ClientPacketId::Hello as u64)
                .await?;
            self.writer.write_string(&self.config.client_name).await?;
            self.writer.write_var_uint(crate::VERSION_MAJOR).await?;
            self.writer.write_var_uint(crate::VERSION_MINOR).await?;
            self.writer.write_var_uint(DBMS_TCP_PROTOCOL_VERSION).await?;
            self.writer.write_string(&self.config.database).await?;
            self.writer.write_string(&self.config.user).await?;
            self.writer.write_string(&self.config.password).await?;
            self.writer.flush().await?;

            let id = ServerPacketId::from_u64(self.reader.read_var_uint().await?)?;
            match id {
                ServerPacketId::Hello => {
                    self.server = ServerInfo::read(&mut self.reader).await?;
                    Ok(())
                }
                ServerPacketId::Exception => Err(read_exception(&mut self.reader).await?),
                other => Err(Error::Protocol(format!(
                    "unexpected packet {other:?}, expected server hello"
                ))),
            }
        })
        .await
    }

    /// Process-unique id of this connection, stable across pool reuse.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server
    }

    pub fn status(&self) -> ConnStatus {
        self.status
    }

    pub fn is_busy(&self) -> bool {
        self.status == ConnStatus::Busy
    }

    pub fn is_closed(&self) -> bool {
        self.status == ConnStatus::Closed
    }

    /// Marks the connection closed. The socket is dropped with the value.
    pub fn close(&mut self) {
        self.status = ConnStatus::Closed;
    }

    /// Takes the busy guard for one exchange.
    pub(crate) fn lock(&mut self) -> Result<()> {
        match self.status {
            ConnStatus::Uninitialized => Err(Error::Usage("conn uninitialized")),
            ConnStatus::Busy => Err(Error::Usage("conn busy")),
            ConnStatus::Closed => Err(Error::Usage("conn closed")),
            ConnStatus::Idle => {
                self.status = ConnStatus::Busy;
                Ok(())
            }
        }
    }

    pub(crate) fn unlock(&mut self) {
        if self.status == ConnStatus::Busy {
            self.status = ConnStatus::Idle;
        }
    }

    /// Applies the error propagation policy at the end of an exchange: a
    /// clean server exception releases the busy guard, anything ambiguous
    /// closes the connection.
    pub(crate) fn settle(&mut self, e: Error) -> Error {
        if e.poisons_connection() {
            self.status = ConnStatus::Closed;
        } else {
            self.unlock();
        }
        e
    }

    fn finish_exchange<T>(&mut self, result: Result<T>) -> Result<T> {
        self.watcher.unwatch();
        match result {
            Ok(value) => {
                self.unlock();
                Ok(value)
            }
            Err(e) => Err(self.settle(e)),
        }
    }

    /// Check that the connection to the server is alive.
    pub async fn ping(&mut self, token: &CancellationToken) -> Result<()> {
        self.lock()?;
        self.watcher.watch(token);
        let current = self.watcher.current();
        let result = guard(current, async {
            self.writer
                .write_var_uint(ClientPacketId::Ping as u64)
                .await?;
            self.writer.flush().await?;
            let id = ServerPacketId::from_u64(self.reader.read_var_uint().await?)?;
            match id {
                ServerPacketId::Pong => Ok(()),
                other => Err(Error::Protocol(format!(
                    "unexpected packet {other:?}, expected pong"
                ))),
            }
        })
        .await;
        self.finish_exchange(result)
    }

    /// Runs a query and discards any result blocks, returning the aggregated
    /// profile.
    pub async fn execute(&mut self, token: &CancellationToken, query: &str) -> Result<Profile> {
        self.execute_callback(token, query, &Settings::default(), "", None)
            .await
    }

    pub async fn execute_with_settings(
        &mut self,
        token: &CancellationToken,
        query: &str,
        settings: &Settings,
    ) -> Result<Profile> {
        self.execute_callback(token, query, settings, "", None).await
    }

    pub async fn execute_callback(
        &mut self,
        token: &CancellationToken,
        query: &str,
        settings: &Settings,
        query_id: &str,
        mut on_progress: Option<&mut (dyn FnMut(&Progress) + Send)>,
    ) -> Result<Profile> {
        self.lock()?;
        self.watcher.watch(token);
        let current = self.watcher.current();
        let mut profile = Profile::default();
        let result = guard(current, async {
            self.send_query(query, query_id, settings).await?;
            self.send_data(&Block::new(0)).await?;
            loop {
                match self.next_event(&mut profile, &mut on_progress).await? {
                    ServerEvent::Data(_) => {}
                    ServerEvent::Done => return Ok(()),
                }
            }
        })
        .await;
        self.finish_exchange(result.map(|()| profile))
    }

    /// Runs a query and returns a stream of result blocks.
    pub async fn select(
        &mut self,
        token: &CancellationToken,
        query: &str,
    ) -> Result<SelectStream<&mut Connection>> {
        SelectStream::start(self, token, query, &Settings::default(), "").await
    }

    pub async fn select_with_settings(
        &mut self,
        token: &CancellationToken,
        query: &str,
        settings: &Settings,
        query_id: &str,
    ) -> Result<SelectStream<&mut Connection>> {
        SelectStream::start(self, token, query, settings, query_id).await
    }

    /// Starts an insert, returning a statement carrying the target schema.
    pub async fn insert(
        &mut self,
        token: &CancellationToken,
        query: &str,
    ) -> Result<InsertStmt<&mut Connection>> {
        InsertStmt::start(self, token, query, &Settings::default(), "").await
    }

    pub async fn insert_with_settings(
        &mut self,
        token: &CancellationToken,
        query: &str,
        settings: &Settings,
        query_id: &str,
    ) -> Result<InsertStmt<&mut Connection>> {
        InsertStmt::start(self, token, query, settings, query_id).await
    }

    pub(crate) async fn send_query(
        &mut self,
        query: &str,
        query_id: &str,
        settings: &Settings,
    ) -> Result<()> {
        let revision = self.server.revision;
        self.writer
            .write_var_uint(ClientPacketId::Query as u64)
            .await?;
        self.writer.write_string(query_id).await?;
        if revision >= DBMS_MIN_REVISION_WITH_CLIENT_INFO {
            self.write_client_info().await?;
        }
        settings.write(&mut self.writer, revision).await?;
        if revision >= DBMS_MIN_REVISION_WITH_SETTINGS_SERIALIZED_AS_STRINGS {
            for (name, value) in &self.config.runtime_params {
                write_string_setting(&mut self.writer, name, SETTING_FLAG_CUSTOM, value).await?;
            }
        }
        self.writer.write_string("").await?;
        if revision >= DBMS_MIN_REVISION_WITH_INTERSERVER_SECRET {
            self.writer.write_string("").await?;
        }
        self.writer.write_var_uint(STAGE_COMPLETE).await?;
        self.writer
            .write_u8(if self.config.compression.is_none() { 0 } else { 1 })
            .await?;
        self.writer.write_string(query).await?;
        Ok(())
    }

    async fn write_client_info(&mut self) -> Result<()> {
        let revision = self.server.revision;
        // initial query over TCP
        self.writer.write_u8(1).await?;
        self.writer.write_string("").await?;
        self.writer.write_string("").await?;
        self.writer.write_string("0.0.0.0:0").await?;
        self.writer.write_u8(1).await?;
        self.writer.write_string("").await?;
        self.writer.write_string("localhost").await?;
        self.writer.write_string(&self.config.client_name).await?;
        self.writer.write_var_uint(crate::VERSION_MAJOR).await?;
        self.writer.write_var_uint(crate::VERSION_MINOR).await?;
        self.writer.write_var_uint(DBMS_TCP_PROTOCOL_VERSION).await?;
        if revision >= DBMS_MIN_REVISION_WITH_QUOTA_KEY_IN_CLIENT_INFO {
            self.writer.write_string("").await?;
        }
        if revision >= DBMS_MIN_PROTOCOL_VERSION_WITH_DISTRIBUTED_DEPTH {
            self.writer.write_var_uint(0).await?;
        }
        if revision >= DBMS_MIN_REVISION_WITH_VERSION_PATCH {
            self.writer.write_var_uint(crate::VERSION_PATCH).await?;
        }
        if revision >= DBMS_MIN_REVISION_WITH_OPENTELEMETRY {
            self.writer.write_u8(0).await?;
        }
        Ok(())
    }

    pub(crate) async fn send_data(&mut self, block: &Block) -> Result<()> {
        self.writer
            .write_var_uint(ClientPacketId::Data as u64)
            .await?;
        self.writer.write_string("").await?;
        match self.config.compression {
            CompressionMethod::None => {
                block.write(&mut self.writer, self.server.revision).await?;
            }
            #[cfg(feature = "compression")]
            method => {
                crate::compression::write_compressed_block(
                    &mut self.writer,
                    block,
                    self.server.revision,
                    method,
                )
                .await?;
            }
            #[cfg(not(feature = "compression"))]
            _ => unreachable!("compression rejected at connect"),
        }
        self.writer.flush().await?;
        Ok(())
    }

    pub(crate) async fn send_cancel(&mut self) -> Result<()> {
        self.writer
            .write_var_uint(ClientPacketId::Cancel as u64)
            .await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn receive_data(&mut self) -> Result<Block> {
        let _temporary_table = self.reader.read_utf8_string().await?;
        match self.config.compression {
            CompressionMethod::None => Block::read(&mut self.reader, self.server.revision).await,
            #[cfg(feature = "compression")]
            _ => {
                crate::compression::read_compressed_block(&mut self.reader, self.server.revision)
                    .await
            }
            #[cfg(not(feature = "compression"))]
            _ => unreachable!("compression rejected at connect"),
        }
    }

    // Server logs are never compressed, whatever the connection negotiated.
    async fn receive_log(&mut self) -> Result<()> {
        let _temporary_table = self.reader.read_utf8_string().await?;
        let block = Block::read(&mut self.reader, self.server.revision).await?;
        trace!("server log block with {} rows", block.rows);
        Ok(())
    }

    /// Reads packets until a data block or end of stream, folding service
    /// packets (progress, profile info, logs, table columns) into `profile`
    /// and the optional progress sink.
    pub(crate) async fn next_event<'s, 'pr, 'q, 'p, 'y>(
        &'s mut self,
        profile: &'pr mut Profile,
        on_progress: &'q mut Option<&'p mut (dyn FnMut(&Progress) + Send + 'y)>,
    ) -> Result<ServerEvent> {
        loop {
            let id = ServerPacketId::from_u64(self.reader.read_var_uint().await?)?;
            trace!("server packet: {id:?}");
            match id {
                ServerPacketId::Data => {
                    return Ok(ServerEvent::Data(self.receive_data().await?));
                }
                ServerPacketId::Totals | ServerPacketId::Extremes => {
                    let _ = self.receive_data().await?;
                }
                ServerPacketId::Progress => {
                    let progress = Progress::read(&mut self.reader, self.server.revision).await?;
                    profile.progress.add(&progress);
                    if let Some(sink) = on_progress.as_deref_mut() {
                        sink(&progress);
                    }
                }
                ServerPacketId::ProfileInfo => {
                    profile.profile_info = Some(ProfileInfo::read(&mut self.reader).await?);
                }
                ServerPacketId::Log => {
                    self.receive_log().await?;
                }
                ServerPacketId::TableColumns => {
                    let name = self.reader.read_utf8_string().await?;
                    let description = self.reader.read_utf8_string().await?;
                    debug!("table columns for '{name}': {} bytes", description.len());
                }
                ServerPacketId::Exception => {
                    return Err(read_exception(&mut self.reader).await?);
                }
                ServerPacketId::EndOfStream => return Ok(ServerEvent::Done),
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected packet {other:?} during query"
                    )))
                }
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}
