use crate::{connect, mock::MockServer};
use chx::{CancellationToken, Column, ConnConfig, ConnStatus, Connection, Error};

fn token() -> CancellationToken {
    CancellationToken::new()
}

#[tokio::test]
async fn handshake_negotiates_server_info() {
    let server = MockServer::spawn().await;
    let conn = connect(&server).await;
    let info = conn.server_info();
    assert_eq!(info.name, "MockHouse");
    assert_eq!(info.timezone.as_deref(), Some("UTC"));
    assert_eq!(info.display_name.as_deref(), Some("mock"));
    assert_eq!(info.patch_version, 3);
    assert_eq!(conn.status(), ConnStatus::Idle);
}

#[tokio::test]
async fn ping_pong() {
    let server = MockServer::spawn().await;
    let mut conn = connect(&server).await;
    conn.ping(&token()).await.unwrap();
    conn.ping(&token()).await.unwrap();
    assert!(!conn.is_busy());
}

#[tokio::test]
async fn execute_aggregates_progress() {
    let server = MockServer::spawn().await;
    let mut conn = connect(&server).await;
    let profile = conn.execute(&token(), "SELECT 1").await.unwrap();
    assert_eq!(profile.progress.read_rows, 1);
    assert!(!conn.is_busy());
}

#[tokio::test]
async fn server_exception_keeps_connection_usable() {
    let server = MockServer::spawn().await;
    let mut conn = connect(&server).await;
    let err = conn
        .execute(&token(), "SELECT * FROM not_found_table LIMIT 10")
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        " DB::Exception (60): Table default.not_found_table doesn't exist"
    );
    assert!(matches!(err, Error::Server { code: 60, .. }));
    // the exchange terminated cleanly, the connection must still work
    conn.ping(&token()).await.unwrap();
}

#[tokio::test]
async fn select_close_drains_and_releases() {
    let server = MockServer::spawn().await;
    server.add_table("closable", &[("x", "UInt32")]).await;
    let mut conn = connect(&server).await;

    let mut col = Column::uint32();
    col.append(5u32);
    conn.insert(&token(), "INSERT INTO closable (x) VALUES")
        .await
        .unwrap()
        .commit_with(vec![col])
        .await
        .unwrap();

    let stream = conn.select(&token(), "SELECT * FROM closable").await.unwrap();
    // close without reading any block: drains to end of stream
    let profile = stream.close().await.unwrap();
    assert_eq!(profile.progress.read_rows, 1);
    assert!(!conn.is_busy());
    conn.ping(&token()).await.unwrap();
}

#[tokio::test]
async fn abandoned_select_leaves_connection_busy() {
    let server = MockServer::spawn().await;
    server.add_table("abandoned", &[("x", "UInt32")]).await;
    let mut conn = connect(&server).await;

    let stream = conn
        .select(&token(), "SELECT * FROM abandoned")
        .await
        .unwrap();
    drop(stream);

    assert!(conn.is_busy());
    let err = conn.ping(&token()).await.unwrap_err();
    assert_eq!(err.to_string(), "conn busy");
    assert!(matches!(err, Error::Usage("conn busy")));
}

#[tokio::test]
async fn cancel_packet_drains_exchange() {
    let server = MockServer::spawn().await;
    let mut conn = connect(&server).await;
    let mut stream = conn.select(&token(), "SELECT sleep(10)").await.unwrap();
    stream.cancel().await.unwrap();
    assert!(stream.is_done());
    drop(stream);
    assert!(!conn.is_busy());
    conn.ping(&token()).await.unwrap();
}

#[tokio::test]
async fn fired_token_closes_connection() {
    let server = MockServer::spawn().await;
    let mut conn = connect(&server).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = conn.execute(&cancel, "SELECT 1").await.unwrap_err();
    assert!(matches!(err, Error::Canceled), "{err:?}");
    assert!(conn.is_closed());

    let err = conn.ping(&token()).await.unwrap_err();
    assert!(matches!(err, Error::Usage("conn closed")), "{err:?}");
}

#[tokio::test]
async fn token_fired_mid_select_cancels() {
    let server = MockServer::spawn().await;
    let mut conn = connect(&server).await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let mut stream = conn.select(&cancel, "SELECT sleep(10)").await.unwrap();
    let err = stream.next_block().await.unwrap_err();
    assert!(matches!(err, Error::Canceled), "{err:?}");
    drop(stream);
    assert!(conn.is_closed());
}

#[tokio::test]
async fn connect_with_cancelled_token_fails() {
    let server = MockServer::spawn().await;
    let cancel = CancellationToken::new();
    cancel.cancel();
    let config = ConnConfig::parse(&server.conn_string()).unwrap();
    let err = Connection::connect(&config, &cancel).await.unwrap_err();
    assert!(matches!(err, Error::Canceled), "{err:?}");
}

#[tokio::test]
async fn insert_schema_mismatch_rejected_before_rows() {
    let server = MockServer::spawn().await;
    server
        .add_table("strict", &[("a", "Int8"), ("b", "String")])
        .await;
    let mut conn = connect(&server).await;

    // wrong column count
    let stmt = conn
        .insert(&token(), "INSERT INTO strict (a, b) VALUES")
        .await
        .unwrap();
    let mut only = Column::int8();
    only.append(1i8);
    let err = stmt.commit_with(vec![only]).await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)), "{err:?}");

    // the failed statement never went busy-free; reconnect and send a
    // mismatched type instead
    let mut conn = connect(&server).await;
    let stmt = conn
        .insert(&token(), "INSERT INTO strict (a, b) VALUES")
        .await
        .unwrap();
    let mut a = Column::int8();
    a.append(1i8);
    let mut b = Column::uint64();
    b.append(2u64);
    let err = stmt.commit_with(vec![a, b]).await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)), "{err:?}");
}

#[tokio::test]
async fn compressed_connection_round_trips() {
    let server = MockServer::spawn().await;
    server.add_table("packed", &[("v", "UInt64")]).await;
    let config =
        ConnConfig::parse(&format!("{} compress=lz4", server.conn_string())).unwrap();
    let mut conn = Connection::connect(&config, &token()).await.unwrap();

    let mut col = Column::uint64();
    for i in 0..2000u64 {
        col.append(i);
    }
    conn.insert(&token(), "INSERT INTO packed (v) VALUES")
        .await
        .unwrap()
        .commit_with(vec![col])
        .await
        .unwrap();

    let mut stream = conn.select(&token(), "SELECT * FROM packed").await.unwrap();
    let block = stream.next_block().await.unwrap().unwrap();
    assert_eq!(block.rows, 2000);
    assert_eq!(block.column(0).value::<u64>(1999), 1999);
    stream.close().await.unwrap();
}
