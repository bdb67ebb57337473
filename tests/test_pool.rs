use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{init_logging, mock::MockServer};
use chx::{CancellationToken, Column, Error, Pool, PoolConfig};

fn token() -> CancellationToken {
    CancellationToken::new()
}

async fn mock_pool_config(server: &MockServer) -> PoolConfig {
    init_logging();
    PoolConfig::parse(&server.conn_string()).unwrap()
}

async fn mock_pool(server: &MockServer) -> Pool {
    let config = mock_pool_config(server).await;
    Pool::connect_config(&token(), config).await.unwrap()
}

#[tokio::test]
async fn connect_and_close() {
    let server = MockServer::spawn().await;
    let pool = Pool::connect(&token(), &server.conn_string()).await.unwrap();
    pool.close().await;
}

#[tokio::test]
async fn acquire_and_release() {
    let server = MockServer::spawn().await;
    let pool = mock_pool(&server).await;
    let conn = pool.acquire(&token()).await.unwrap();
    assert_eq!(pool.stat().acquired_conns(), 1);
    conn.release();
    assert_eq!(pool.stat().acquired_conns(), 0);
    assert_eq!(pool.stat().total_conns(), 1);
    pool.close().await;
}

#[tokio::test]
async fn fresh_pool_has_one_idle_connection() {
    let server = MockServer::spawn().await;
    let pool = mock_pool(&server).await;
    let idle = pool.acquire_all_idle();
    assert_eq!(idle.len(), 1);
    for conn in idle {
        conn.release();
    }

    let mut conns = Vec::new();
    for _ in 0..3 {
        conns.push(pool.acquire(&token()).await.unwrap());
    }
    for conn in conns {
        conn.release();
    }
    assert_eq!(pool.acquire_all_idle().len(), 3);
    pool.close().await;
}

#[tokio::test]
async fn stats_track_acquires() {
    let server = MockServer::spawn().await;
    server.add_table("stat_t", &[("x", "UInt8")]).await;
    let pool = mock_pool(&server).await;

    pool.execute(&token(), "SELECT * FROM stat_t").await.unwrap();

    let stream = pool.select(&token(), "SELECT * FROM stat_t").await.unwrap();
    let stats = pool.stat();
    assert_eq!(stats.acquired_conns(), 1);
    assert_eq!(stats.total_conns(), 1);
    stream.close().await.unwrap();

    let stats = pool.stat();
    assert_eq!(stats.acquired_conns(), 0);
    assert_eq!(stats.idle_conns(), 1);
    // initial connect + execute + select
    assert_eq!(stats.acquire_count(), 3);
    // only the initial connect had to construct
    assert_eq!(stats.empty_acquire_count(), 1);
    assert_eq!(stats.canceled_acquire_count(), 0);
    assert_eq!(stats.constructing_conns(), 0);
    assert!(stats.acquire_duration() < Duration::from_secs(1));
    pool.close().await;
}

#[tokio::test]
async fn lazy_connect_with_cancelled_token() {
    let server = MockServer::spawn().await;
    let mut config = mock_pool_config(&server).await;
    config.lazy_connect = true;

    let cancel = CancellationToken::new();
    cancel.cancel();

    // pool construction succeeds without touching the network
    let pool = Pool::connect_config(&cancel, config).await.unwrap();

    let err = pool.execute(&cancel, "SELECT 1").await.unwrap_err();
    assert!(err.to_string().starts_with("acquire: "), "{err}");
    match err {
        Error::Acquire(inner) => assert!(matches!(*inner, Error::Canceled)),
        other => panic!("expected acquire wrapper, got {other:?}"),
    }
    pool.close().await;
}

#[tokio::test]
async fn eager_connect_with_cancelled_token_fails() {
    let server = MockServer::spawn().await;
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = Pool::connect(&cancel, &server.conn_string())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Canceled), "{err:?}");
}

#[tokio::test]
async fn closed_pool_refuses_acquires() {
    let server = MockServer::spawn().await;
    let pool = mock_pool(&server).await;
    pool.close().await;

    let err = pool.execute(&token(), "SET enable_http_compression=1")
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "acquire: closed pool");

    let err = pool
        .select(&token(), "SELECT * FROM not_found_table LIMIT 10")
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "acquire: closed pool");
}

#[tokio::test]
async fn before_acquire_vetoes_every_second_candidate() {
    let server = MockServer::spawn().await;
    let attempts = Arc::new(AtomicUsize::new(0));
    let hook_attempts = attempts.clone();

    let mut config = mock_pool_config(&server).await;
    config.before_acquire = Some(Arc::new(move |_conn| {
        hook_attempts.fetch_add(1, Ordering::SeqCst) % 2 == 1
    }));

    let pool = Pool::connect_config(&token(), config).await.unwrap();

    let mut conns = Vec::new();
    for _ in 0..4 {
        conns.push(pool.acquire(&token()).await.unwrap());
    }
    for conn in conns {
        conn.release();
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 8);

    let idle = pool.acquire_all_idle();
    assert_eq!(idle.len(), 2);
    for conn in idle {
        conn.release();
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 12);
    pool.close().await;
}

#[tokio::test]
async fn after_release_vetoes_every_second_connection() {
    let server = MockServer::spawn().await;
    let releases = Arc::new(AtomicUsize::new(0));
    let hook_releases = releases.clone();

    let mut config = mock_pool_config(&server).await;
    config.after_release = Some(Arc::new(move |_conn| {
        hook_releases.fetch_add(1, Ordering::SeqCst) % 2 == 0
    }));

    let pool = Pool::connect_config(&token(), config).await.unwrap();
    for _ in 0..10 {
        let conn = pool.acquire(&token()).await.unwrap();
        conn.release();
    }
    // initial construction plus one rebuild after each vetoed release
    assert_eq!(server.connection_count(), 5);
    pool.close().await;
}

#[tokio::test]
async fn after_connect_failure_surfaces() {
    let server = MockServer::spawn().await;
    let mut config = mock_pool_config(&server).await;
    config.after_connect = Some(Arc::new(|_conn| {
        Box::pin(async { Err(Error::Config("afterConnect err".to_string())) })
    }));
    let err = Pool::connect_config(&token(), config).await.unwrap_err();
    assert_eq!(err.to_string(), "afterConnect err");
}

#[tokio::test]
async fn before_connect_can_rewrite_config() {
    let server = MockServer::spawn().await;
    let mut config = mock_pool_config(&server).await;
    // start from a bogus host and let the hook point at the live server
    let good_hosts = config.conn.hosts.clone();
    config.conn.hosts = vec![("192.0.2.1".to_string(), 9)];
    config.conn.connect_timeout = Some(Duration::from_millis(200));
    config.before_connect = Some(Arc::new(move |conn_config| {
        conn_config.hosts = good_hosts.clone();
        Box::pin(async { Ok(()) })
    }));
    let pool = Pool::connect_config(&token(), config).await.unwrap();
    pool.ping(&token()).await.unwrap();
    pool.close().await;
}

#[tokio::test]
async fn release_checks_max_conn_lifetime() {
    let server = MockServer::spawn().await;
    let mut config = mock_pool_config(&server).await;
    config.max_conn_lifetime = Duration::from_millis(250);

    let pool = Pool::connect_config(&token(), config).await.unwrap();
    let conn = pool.acquire(&token()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    conn.release();
    assert_eq!(pool.stat().total_conns(), 0);
    pool.close().await;
}

#[tokio::test]
async fn release_destroys_busy_connection() {
    let server = MockServer::spawn().await;
    server.add_table("busy_t", &[("x", "UInt8")]).await;
    let pool = mock_pool(&server).await;

    let stream = pool.select(&token(), "SELECT * FROM busy_t").await.unwrap();
    assert_eq!(pool.stat().total_conns(), 1);
    // dropped mid-exchange: the connection is still busy and must not be
    // returned to the idle list
    drop(stream);
    assert_eq!(pool.stat().total_conns(), 0);
    pool.close().await;
}

#[tokio::test]
async fn background_enforces_max_conn_lifetime() {
    let server = MockServer::spawn().await;
    let mut config = mock_pool_config(&server).await;
    config.max_conn_lifetime = Duration::from_millis(100);
    config.health_check_period = Duration::from_millis(100);

    let pool = Pool::connect_config(&token(), config).await.unwrap();
    let conn = pool.acquire(&token()).await.unwrap();
    conn.release();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(pool.stat().total_conns(), 0);
    pool.close().await;
}

#[tokio::test]
async fn background_enforces_max_conn_idle_time() {
    let server = MockServer::spawn().await;
    let mut config = mock_pool_config(&server).await;
    config.max_conn_lifetime = Duration::from_secs(60);
    config.max_conn_idle_time = Duration::from_millis(100);
    config.health_check_period = Duration::from_millis(150);

    let pool = Pool::connect_config(&token(), config).await.unwrap();
    let conn = pool.acquire(&token()).await.unwrap();
    conn.release();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(pool.stat().total_conns(), 0);
    pool.close().await;
}

#[tokio::test]
async fn background_maintains_min_conns() {
    let server = MockServer::spawn().await;
    let mut config = mock_pool_config(&server).await;
    config.health_check_period = Duration::from_millis(100);
    config.min_conns = 2;
    config.lazy_connect = true;

    let pool = Pool::connect_config(&token(), config).await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(pool.stat().total_conns(), 2);
    assert_eq!(pool.stat().idle_conns(), 2);
    pool.close().await;
}

#[tokio::test]
async fn waiters_are_served_when_capacity_frees() {
    let server = MockServer::spawn().await;
    let mut config = mock_pool_config(&server).await;
    config.max_conns = 1;

    let pool = Pool::connect_config(&token(), config).await.unwrap();
    let held = pool.acquire(&token()).await.unwrap();

    let waiter_pool = pool.clone();
    let waiter = tokio::spawn(async move {
        waiter_pool.acquire(&token()).await.unwrap().release();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    held.release();
    tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("waiter starved")
        .unwrap();

    let stats = pool.stat();
    assert_eq!(stats.total_conns(), 1);
    assert!(stats.empty_acquire_count() >= 2);
    pool.close().await;
}

#[tokio::test]
async fn cancelled_waiter_never_receives_a_connection() {
    let server = MockServer::spawn().await;
    let mut config = mock_pool_config(&server).await;
    config.max_conns = 1;

    let pool = Pool::connect_config(&token(), config).await.unwrap();
    let held = pool.acquire(&token()).await.unwrap();

    let cancel = CancellationToken::new();
    let waiter_pool = pool.clone();
    let waiter_token = cancel.clone();
    let waiter = tokio::spawn(async move {
        waiter_pool.acquire(&waiter_token).await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(Error::Canceled)), "{result:?}");
    assert_eq!(pool.stat().canceled_acquire_count(), 1);

    held.release();
    assert_eq!(pool.stat().total_conns(), 1);
    pool.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_load_never_shares_a_connection() {
    let server = MockServer::spawn().await;
    server.add_table("load_t", &[("x", "UInt64")]).await;
    let pool = {
        let mut config = mock_pool_config(&server).await;
        config.max_conns = 8;
        Pool::connect_config(&token(), config).await.unwrap()
    };

    {
        let mut col = Column::uint64();
        for i in 0..100u64 {
            col.append(i);
        }
        let stmt = pool
            .insert(&token(), "INSERT INTO load_t (x) VALUES")
            .await
            .unwrap();
        stmt.commit_with(vec![col]).await.unwrap();
    }

    let acquired: Arc<Mutex<HashSet<u64>>> = Arc::new(Mutex::new(HashSet::new()));
    let mut tasks = Vec::new();
    for _ in 0..100 {
        let pool = pool.clone();
        let acquired = acquired.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..5 {
                let mut conn = pool.acquire(&token()).await.unwrap();
                let key = conn.id();
                assert!(
                    acquired.lock().unwrap().insert(key),
                    "connection handed out twice concurrently"
                );

                let mut stream = conn
                    .select(&token(), "SELECT * FROM load_t")
                    .await
                    .unwrap();
                let mut rows = 0;
                while let Some(block) = stream.next_block().await.unwrap() {
                    rows += block.rows;
                }
                assert_eq!(rows, 100);
                drop(stream);

                acquired.lock().unwrap().remove(&key);
                conn.release();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let stats = pool.stat();
    assert_eq!(stats.acquired_conns(), 0);
    assert!(stats.total_conns() <= 8);
    pool.close().await;
}
