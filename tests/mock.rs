//! An in-process peer speaking the native protocol over TCP, backed by a
//! tiny table store. Built on the crate's own wire codec so both directions
//! of every packet get exercised end to end without a live server.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use chx::io::{ChRead, ChWrite};
use chx::protocol::{
    write_exception, ProfileInfo, ServerInfo, ServerPacketId, DBMS_TCP_PROTOCOL_VERSION,
};
use chx::{Block, Column, Progress, Result, Type};

const REVISION: u64 = DBMS_TCP_PROTOCOL_VERSION;

struct Table {
    schema: Vec<(String, Type)>,
    blocks: Vec<Block>,
}

type Tables = Arc<Mutex<HashMap<String, Table>>>;

pub struct MockServer {
    pub addr: SocketAddr,
    tables: Tables,
    connections: Arc<AtomicUsize>,
    handle: tokio::task::JoinHandle<()>,
}

impl MockServer {
    pub async fn spawn() -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let tables: Tables = Arc::new(Mutex::new(HashMap::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let accept_tables = tables.clone();
        let accept_connections = connections.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                accept_connections.fetch_add(1, Ordering::SeqCst);
                let tables = accept_tables.clone();
                tokio::spawn(async move {
                    let _ = serve_connection(stream, tables).await;
                });
            }
        });

        MockServer {
            addr,
            tables,
            connections,
            handle,
        }
    }

    /// Registers an empty table with the given column type strings.
    pub async fn add_table(&self, name: &str, schema: &[(&str, &str)]) {
        let schema = schema
            .iter()
            .map(|(name, type_)| (name.to_string(), type_.parse::<Type>().unwrap()))
            .collect();
        self.tables.lock().await.insert(
            name.to_string(),
            Table {
                schema,
                blocks: Vec::new(),
            },
        );
    }

    /// Connections accepted so far.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn conn_string(&self) -> String {
        format!("host={} port={}", self.addr.ip(), self.addr.port())
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

type Reader = BufReader<tokio::net::tcp::OwnedReadHalf>;
type Writer = BufWriter<tokio::net::tcp::OwnedWriteHalf>;

async fn serve_connection(stream: TcpStream, tables: Tables) -> Result<()> {
    let (read, write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut writer = BufWriter::new(write);

    // client hello
    let packet = reader.read_var_uint().await?;
    assert_eq!(packet, 0, "expected client hello");
    let _client_name = reader.read_utf8_string().await?;
    let _major = reader.read_var_uint().await?;
    let _minor = reader.read_var_uint().await?;
    let _client_revision = reader.read_var_uint().await?;
    let _database = reader.read_utf8_string().await?;
    let _user = reader.read_utf8_string().await?;
    let _password = reader.read_utf8_string().await?;

    writer
        .write_var_uint(ServerPacketId::Hello as u64)
        .await?;
    ServerInfo {
        name: "MockHouse".to_string(),
        major_version: 23,
        minor_version: 8,
        revision: REVISION,
        timezone: Some("UTC".to_string()),
        display_name: Some("mock".to_string()),
        patch_version: 3,
    }
    .write(&mut writer)
    .await?;
    writer.flush().await?;

    loop {
        let Ok(packet) = reader.read_var_uint().await else {
            return Ok(());
        };
        match packet {
            // Ping
            4 => {
                writer.write_var_uint(ServerPacketId::Pong as u64).await?;
                writer.flush().await?;
            }
            // Query
            1 => {
                let (query, compression) = read_query(&mut reader).await?;
                // external tables terminator
                let external = read_client_data(&mut reader, compression).await?;
                assert!(external.is_empty(), "expected empty external tables block");
                handle_query(&mut reader, &mut writer, &tables, &query, compression).await?;
            }
            // stray Cancel between exchanges
            3 => {}
            other => panic!("unexpected client packet {other}"),
        }
    }
}

async fn read_query(reader: &mut Reader) -> Result<(String, bool)> {
    let _query_id = reader.read_utf8_string().await?;
    let kind = reader.read_u8().await?;
    if kind != 0 {
        let _initial_user = reader.read_utf8_string().await?;
        let _initial_query_id = reader.read_utf8_string().await?;
        let _initial_address = reader.read_utf8_string().await?;
        let _interface = reader.read_u8().await?;
        let _os_user = reader.read_utf8_string().await?;
        let _hostname = reader.read_utf8_string().await?;
        let _client_name = reader.read_utf8_string().await?;
        let _major = reader.read_var_uint().await?;
        let _minor = reader.read_var_uint().await?;
        let _revision = reader.read_var_uint().await?;
        let _quota_key = reader.read_utf8_string().await?;
        let _distributed_depth = reader.read_var_uint().await?;
        let _patch = reader.read_var_uint().await?;
        let telemetry = reader.read_u8().await?;
        assert_eq!(telemetry, 0, "mock does not understand telemetry");
    }
    loop {
        let name = reader.read_utf8_string().await?;
        if name.is_empty() {
            break;
        }
        let _flags = reader.read_var_uint().await?;
        let _value = reader.read_utf8_string().await?;
    }
    let _interserver_secret = reader.read_utf8_string().await?;
    let _stage = reader.read_var_uint().await?;
    let compression = reader.read_u8().await? != 0;
    let query = reader.read_utf8_string().await?;
    Ok((query, compression))
}

async fn read_client_data(reader: &mut Reader, compression: bool) -> Result<Block> {
    let packet = reader.read_var_uint().await?;
    assert_eq!(packet, 2, "expected client data packet");
    let _temporary_table = reader.read_utf8_string().await?;
    if compression {
        chx::compression::read_compressed_block(reader, REVISION).await
    } else {
        Block::read(reader, REVISION).await
    }
}

async fn send_data(writer: &mut Writer, block: &Block, compression: bool) -> Result<()> {
    writer.write_var_uint(ServerPacketId::Data as u64).await?;
    writer.write_string("").await?;
    if compression {
        chx::compression::write_compressed_block(
            writer,
            block,
            REVISION,
            chx::CompressionMethod::Lz4,
        )
        .await?;
    } else {
        block.write(writer, REVISION).await?;
    }
    writer.flush().await?;
    Ok(())
}

async fn send_progress(writer: &mut Writer, read_rows: u64) -> Result<()> {
    writer
        .write_var_uint(ServerPacketId::Progress as u64)
        .await?;
    Progress {
        read_rows,
        read_bytes: read_rows * 8,
        total_rows_to_read: read_rows,
        written_rows: 0,
        written_bytes: 0,
    }
    .write(writer, REVISION)
    .await?;
    Ok(())
}

async fn send_end_of_stream(writer: &mut Writer) -> Result<()> {
    writer
        .write_var_uint(ServerPacketId::EndOfStream as u64)
        .await?;
    writer.flush().await?;
    Ok(())
}

async fn send_table_missing(writer: &mut Writer, table: &str) -> Result<()> {
    writer
        .write_var_uint(ServerPacketId::Exception as u64)
        .await?;
    write_exception(
        writer,
        60,
        "DB::Exception",
        &format!("DB::Exception: Table default.{table} doesn't exist"),
    )
    .await?;
    writer.flush().await?;
    Ok(())
}

fn schema_block(schema: &[(String, Type)]) -> Block {
    let mut block = Block::new(0);
    for (name, type_) in schema {
        block = block.with_column(name.clone(), type_.clone(), Column::for_type(type_).unwrap());
    }
    block
}

fn word_after<'a>(query: &'a str, keyword: &str) -> Option<&'a str> {
    let lower = query.to_ascii_lowercase();
    let words: Vec<&str> = lower.split_whitespace().collect();
    let position = words.iter().position(|w| *w == keyword)?;
    let raw = query
        .split_whitespace()
        .nth(position + 1)?
        .trim_end_matches(';');
    Some(raw.split('(').next().unwrap_or(raw))
}

async fn handle_query(
    reader: &mut Reader,
    writer: &mut Writer,
    tables: &Tables,
    query: &str,
    compression: bool,
) -> Result<()> {
    let lower = query.trim().to_ascii_lowercase();

    if lower.starts_with("insert") {
        let Some(table_name) = word_after(query, "into") else {
            send_table_missing(writer, "?").await?;
            return Ok(());
        };
        let mut tables = tables.lock().await;
        let Some(table) = tables.get_mut(table_name) else {
            send_table_missing(writer, table_name).await?;
            return Ok(());
        };
        send_data(writer, &schema_block(&table.schema), compression).await?;
        let mut written = 0;
        loop {
            let block = read_client_data(reader, compression).await?;
            if block.is_empty() {
                break;
            }
            written += block.rows;
            table.blocks.push(block);
        }
        send_progress(writer, written).await?;
        send_end_of_stream(writer).await?;
        return Ok(());
    }

    // a query that holds the exchange open until Cancel or client loss
    if lower.contains("sleep") {
        match tokio::time::timeout(Duration::from_secs(10), reader.read_var_uint()).await {
            Ok(Ok(3)) => send_end_of_stream(writer).await?,
            Ok(Ok(other)) => panic!("unexpected packet {other} while sleeping"),
            Ok(Err(_)) => return Ok(()),
            Err(_) => send_end_of_stream(writer).await?,
        }
        return Ok(());
    }

    if let Some(table_name) = word_after(query, "from") {
        let tables = tables.lock().await;
        let Some(table) = tables.get(table_name) else {
            send_table_missing(writer, table_name).await?;
            return Ok(());
        };
        send_data(writer, &schema_block(&table.schema), compression).await?;
        let mut rows = 0;
        for block in &table.blocks {
            rows += block.rows;
            send_data(writer, block, compression).await?;
        }
        send_progress(writer, rows).await?;
        writer
            .write_var_uint(ServerPacketId::ProfileInfo as u64)
            .await?;
        ProfileInfo {
            rows,
            blocks: table.blocks.len() as u64,
            bytes: rows * 8,
            applied_limit: false,
            rows_before_limit: 0,
            calculated_rows_before_limit: false,
        }
        .write(writer)
        .await?;
        send_end_of_stream(writer).await?;
        return Ok(());
    }

    // DDL, SET and scalar selects: acknowledge and finish
    send_progress(writer, 1).await?;
    send_end_of_stream(writer).await?;
    Ok(())
}
