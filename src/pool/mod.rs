use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use log::{debug, warn};
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

use crate::{
    config::PoolConfig,
    connection::{ConnStatus, Connection},
    insert::InsertStmt,
    protocol::Profile,
    select::SelectStream,
    settings::Settings,
    Error, Result,
};

mod conn;
mod stat;

pub use conn::PooledConn;
pub use stat::Stat;

/// A connection plus its lifetime bookkeeping.
pub(crate) struct PoolEntry {
    pub(crate) conn: Connection,
    created_at: Instant,
    last_used_at: Instant,
}

impl PoolEntry {
    fn new(conn: Connection) -> Self {
        let now = Instant::now();
        PoolEntry {
            conn,
            created_at: now,
            last_used_at: now,
        }
    }

    fn lifetime_expired(&self, config: &PoolConfig) -> bool {
        self.created_at.elapsed() > config.max_conn_lifetime
    }
}

struct PoolState {
    idle: Vec<PoolEntry>,
    waiters: VecDeque<oneshot::Sender<()>>,
    total: u32,
    constructing: u32,
    acquired: u32,
    closed: bool,
    acquire_count: u64,
    acquire_duration: Duration,
    canceled_acquire_count: u64,
    empty_acquire_count: u64,
}

impl PoolState {
    /// Wakes the first waiter still listening.
    fn wake_one(&mut self) {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                break;
            }
        }
    }
}

struct PoolInner {
    state: Mutex<PoolState>,
    config: PoolConfig,
    drained: Notify,
    background: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

enum Plan {
    Take(PoolEntry),
    Construct,
    Wait(oneshot::Receiver<()>),
}

/// A concurrent pool of connections.
///
/// Cheap to clone; all clones share the same state. The pool owns every
/// connection: callers hold a [`PooledConn`] for the duration of an
/// exchange, and a connection released in any state other than `Idle`
/// (abandoned select, fired cancellation token, closed socket) is destroyed
/// rather than reused.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Parses a connection string (including the `pool_*` keys) and builds a
    /// pool. Unless lazy connect is configured, one connection is
    /// established immediately.
    pub async fn connect(token: &CancellationToken, conn_string: &str) -> Result<Pool> {
        Self::connect_config(token, PoolConfig::parse(conn_string)?).await
    }

    pub async fn connect_config(token: &CancellationToken, config: PoolConfig) -> Result<Pool> {
        let lazy = config.lazy_connect;
        let pool = Pool {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    waiters: VecDeque::new(),
                    total: 0,
                    constructing: 0,
                    acquired: 0,
                    closed: false,
                    acquire_count: 0,
                    acquire_duration: Duration::ZERO,
                    canceled_acquire_count: 0,
                    empty_acquire_count: 0,
                }),
                config,
                drained: Notify::new(),
                background: Mutex::new(None),
            }),
        };
        *pool.inner.background.lock().unwrap() = Some(spawn_background(pool.clone()));
        if !lazy {
            // the initial connection bypasses the before-acquire hook: it is
            // a warm-up, not a handout the caller asked to vet
            match pool.acquire_inner(token, false).await {
                Ok(conn) => conn.release(),
                Err(e) => {
                    pool.close().await;
                    return Err(e);
                }
            }
        }
        Ok(pool)
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.inner.state.lock().unwrap()
    }

    /// Acquires a connection, waiting FIFO behind earlier callers when the
    /// pool is at capacity.
    pub async fn acquire(&self, token: &CancellationToken) -> Result<PooledConn> {
        self.acquire_inner(token, true).await
    }

    async fn acquire_inner(&self, token: &CancellationToken, vet: bool) -> Result<PooledConn> {
        let config = &self.inner.config;
        let start = Instant::now();
        let mut emptied = false;
        loop {
            if token.is_cancelled() {
                self.state().canceled_acquire_count += 1;
                return Err(Error::Canceled);
            }
            let plan = {
                let mut state = self.state();
                if state.closed {
                    return Err(Error::PoolClosed);
                }
                loop {
                    match state.idle.pop() {
                        Some(entry)
                            if entry.conn.is_closed() || entry.lifetime_expired(config) =>
                        {
                            state.total -= 1;
                        }
                        Some(entry) => break Plan::Take(entry),
                        None => {
                            break if state.total < config.max_conns {
                                state.total += 1;
                                state.constructing += 1;
                                Plan::Construct
                            } else {
                                let (tx, rx) = oneshot::channel();
                                state.waiters.push_back(tx);
                                Plan::Wait(rx)
                            };
                        }
                    }
                }
            };
            match plan {
                Plan::Take(entry) => {
                    if vet && !self.admit(&entry) {
                        self.destroy_entry(entry);
                        continue;
                    }
                    let mut state = self.state();
                    state.acquired += 1;
                    state.acquire_count += 1;
                    state.acquire_duration += start.elapsed();
                    if emptied {
                        state.empty_acquire_count += 1;
                    }
                    drop(state);
                    return Ok(PooledConn {
                        pool: self.clone(),
                        entry: Some(entry),
                    });
                }
                Plan::Construct => {
                    emptied = true;
                    match self.construct(token).await {
                        Ok(conn) => {
                            let entry = PoolEntry::new(conn);
                            if vet && !self.admit(&entry) {
                                let mut state = self.state();
                                state.constructing -= 1;
                                state.total -= 1;
                                state.wake_one();
                                drop(state);
                                drop(entry);
                                continue;
                            }
                            let mut state = self.state();
                            state.constructing -= 1;
                            state.acquired += 1;
                            state.acquire_count += 1;
                            state.acquire_duration += start.elapsed();
                            state.empty_acquire_count += 1;
                            drop(state);
                            return Ok(PooledConn {
                                pool: self.clone(),
                                entry: Some(entry),
                            });
                        }
                        Err(e) => {
                            let mut state = self.state();
                            state.constructing -= 1;
                            state.total -= 1;
                            state.wake_one();
                            return Err(e);
                        }
                    }
                }
                Plan::Wait(rx) => {
                    emptied = true;
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            self.state().canceled_acquire_count += 1;
                            return Err(Error::Canceled);
                        }
                        // a dropped sender (pool closing) also wakes us; the
                        // next iteration observes the closed flag
                        _ = rx => {}
                    }
                }
            }
        }
    }

    /// Before-acquire hook, run outside the pool mutex for every candidate,
    /// idle or freshly constructed.
    fn admit(&self, entry: &PoolEntry) -> bool {
        match &self.inner.config.before_acquire {
            Some(hook) => hook(&entry.conn),
            None => true,
        }
    }

    async fn construct(&self, token: &CancellationToken) -> Result<Connection> {
        let mut conn_config = self.inner.config.conn.clone();
        if let Some(hook) = &self.inner.config.before_connect {
            hook(&mut conn_config).await?;
        }
        let mut conn = Connection::connect(&conn_config, token).await?;
        if let Some(hook) = &self.inner.config.after_connect {
            hook(&mut conn).await?;
        }
        Ok(conn)
    }

    fn destroy_entry(&self, entry: PoolEntry) {
        let mut state = self.state();
        state.total -= 1;
        state.wake_one();
        drop(state);
        drop(entry);
    }

    pub(crate) fn release_entry(&self, mut entry: PoolEntry) {
        let config = &self.inner.config;
        let mut retain =
            entry.conn.status() == ConnStatus::Idle && !entry.lifetime_expired(config);
        if retain {
            if let Some(hook) = &config.after_release {
                retain = hook(&entry.conn);
            }
        }
        let mut state = self.state();
        state.acquired -= 1;
        if retain && !state.closed {
            entry.last_used_at = Instant::now();
            state.idle.push(entry);
        } else {
            state.total -= 1;
            debug!("destroying released connection");
        }
        state.wake_one();
        let drained = state.closed && state.acquired == 0;
        drop(state);
        if drained {
            self.inner.drained.notify_waiters();
        }
    }

    /// Snapshot of currently idle connections, handed out as acquired
    /// entries. Candidates the before-acquire hook vetoes are destroyed.
    pub fn acquire_all_idle(&self) -> Vec<PooledConn> {
        let config = &self.inner.config;
        let idle = {
            let mut state = self.state();
            if state.closed {
                return Vec::new();
            }
            std::mem::take(&mut state.idle)
        };
        let mut out = Vec::new();
        for entry in idle {
            if entry.conn.is_closed() || entry.lifetime_expired(config) || !self.admit(&entry) {
                self.destroy_entry(entry);
                continue;
            }
            self.state().acquired += 1;
            out.push(PooledConn {
                pool: self.clone(),
                entry: Some(entry),
            });
        }
        out
    }

    pub fn stat(&self) -> Stat {
        let state = self.state();
        Stat {
            acquire_count: state.acquire_count,
            acquire_duration: state.acquire_duration,
            canceled_acquire_count: state.canceled_acquire_count,
            empty_acquire_count: state.empty_acquire_count,
            idle_conns: state.idle.len() as u32,
            acquired_conns: state.acquired,
            constructing_conns: state.constructing,
            max_conns: self.inner.config.max_conns,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    fn wrap_acquire(e: Error) -> Error {
        Error::Acquire(Box::new(e))
    }

    /// Acquires a connection and pings it.
    pub async fn ping(&self, token: &CancellationToken) -> Result<()> {
        let mut conn = self.acquire(token).await.map_err(Self::wrap_acquire)?;
        let result = conn.ping(token).await;
        conn.release();
        result
    }

    /// Acquires a connection and runs a query on it, discarding result
    /// blocks.
    pub async fn execute(&self, token: &CancellationToken, query: &str) -> Result<Profile> {
        self.execute_with_settings(token, query, &Settings::default())
            .await
    }

    pub async fn execute_with_settings(
        &self,
        token: &CancellationToken,
        query: &str,
        settings: &Settings,
    ) -> Result<Profile> {
        let mut conn = self.acquire(token).await.map_err(Self::wrap_acquire)?;
        let result = conn
            .execute_callback(token, query, settings, "", None)
            .await;
        conn.release();
        result
    }

    /// Acquires a connection and starts a select on it. The stream owns the
    /// acquisition and releases it when closed or dropped.
    pub async fn select(
        &self,
        token: &CancellationToken,
        query: &str,
    ) -> Result<SelectStream<PooledConn>> {
        let conn = self.acquire(token).await.map_err(Self::wrap_acquire)?;
        SelectStream::start(conn, token, query, &Settings::default(), "").await
    }

    pub async fn select_with_settings(
        &self,
        token: &CancellationToken,
        query: &str,
        settings: &Settings,
        query_id: &str,
    ) -> Result<SelectStream<PooledConn>> {
        let conn = self.acquire(token).await.map_err(Self::wrap_acquire)?;
        SelectStream::start(conn, token, query, settings, query_id).await
    }

    /// Acquires a connection and starts an insert on it.
    pub async fn insert(
        &self,
        token: &CancellationToken,
        query: &str,
    ) -> Result<InsertStmt<PooledConn>> {
        let conn = self.acquire(token).await.map_err(Self::wrap_acquire)?;
        InsertStmt::start(conn, token, query, &Settings::default(), "").await
    }

    pub async fn insert_with_settings(
        &self,
        token: &CancellationToken,
        query: &str,
        settings: &Settings,
        query_id: &str,
    ) -> Result<InsertStmt<PooledConn>> {
        let conn = self.acquire(token).await.map_err(Self::wrap_acquire)?;
        InsertStmt::start(conn, token, query, settings, query_id).await
    }

    /// Refuses new acquires, waits for outstanding connections to be
    /// released, destroys everything and stops the background loop.
    pub async fn close(&self) {
        let idle = {
            let mut state = self.state();
            if state.closed && state.idle.is_empty() && state.waiters.is_empty() {
                Vec::new()
            } else {
                state.closed = true;
                state.total -= state.idle.len() as u32;
                state.waiters.clear();
                std::mem::take(&mut state.idle)
            }
        };
        drop(idle);
        if let Some(handle) = self.inner.background.lock().unwrap().take() {
            handle.abort();
        }
        loop {
            let drained = self.inner.drained.notified();
            if self.state().acquired == 0 {
                break;
            }
            drained.await;
        }
    }

    async fn health_check(&self) {
        let config = &self.inner.config;
        let now = Instant::now();
        // lifetime first, then idle time
        let expired = {
            let mut state = self.state();
            let mut keep = Vec::with_capacity(state.idle.len());
            let mut expired = Vec::new();
            for entry in state.idle.drain(..) {
                if entry.conn.is_closed()
                    || entry.lifetime_expired(config)
                    || now.duration_since(entry.last_used_at) > config.max_conn_idle_time
                {
                    expired.push(entry);
                } else {
                    keep.push(entry);
                }
            }
            state.idle = keep;
            state.total -= expired.len() as u32;
            for _ in 0..expired.len() {
                state.wake_one();
            }
            expired
        };
        if !expired.is_empty() {
            debug!("health check destroyed {} idle connections", expired.len());
        }
        drop(expired);

        if config.health_check_ping {
            self.ping_idle().await;
        }

        // top up to min_conns; concurrency bounded by the deficit itself
        let need = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            let need = config.min_conns.saturating_sub(state.total);
            state.total += need;
            state.constructing += need;
            need
        };
        if need == 0 {
            return;
        }
        let token = CancellationToken::new();
        let results = join_all((0..need).map(|_| self.construct(&token))).await;
        for result in results {
            let mut state = self.state();
            state.constructing -= 1;
            match result {
                Ok(conn) if !state.closed => {
                    state.idle.push(PoolEntry::new(conn));
                    state.wake_one();
                }
                Ok(conn) => {
                    state.total -= 1;
                    drop(state);
                    drop(conn);
                }
                Err(e) => {
                    state.total -= 1;
                    drop(state);
                    warn!("failed to construct connection for min_conns: {e}");
                }
            }
        }
    }

    // Optional ping of every idle connection; failures destroy.
    async fn ping_idle(&self) {
        let idle = std::mem::take(&mut self.state().idle);
        let token = CancellationToken::new();
        for mut entry in idle {
            match entry.conn.ping(&token).await {
                Ok(()) => {
                    entry.last_used_at = Instant::now();
                    self.state().idle.push(entry);
                }
                Err(e) => {
                    warn!("idle health check ping failed: {e}");
                    let mut state = self.state();
                    state.total -= 1;
                    state.wake_one();
                }
            }
        }
    }
}

fn spawn_background(pool: Pool) -> tokio::task::JoinHandle<()> {
    let period = pool.inner.config.health_check_period;
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if pool.state().closed {
                return;
            }
            pool.health_check().await;
        }
    })
}
