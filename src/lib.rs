//! `chx` is a pure-Rust client for the ClickHouse native TCP protocol in
//! async environments, built around columnar blocks: callers append typed
//! values into [`Column`] builders for inserts and read them back from
//! decoded blocks on selects. A built-in connection [`Pool`] provides
//! acquisition, health checking, sizing and lifecycle hooks.

// Client version advertised in the handshake and client info.
pub const VERSION_MAJOR: u64 = 21;
pub const VERSION_MINOR: u64 = 6;
pub const VERSION_PATCH: u64 = 1;

pub mod block;
pub mod column;
#[cfg(feature = "compression")]
pub mod compression;
mod config;
mod connection;
pub mod errors;
mod insert;
pub mod io;
pub mod pool;
mod progress;
pub mod protocol;
mod select;
mod settings;
mod types;
mod value;
mod watcher;

pub use block::{Block, BlockColumn, BlockInfo};
pub use column::{
    ArrayColumn, Column, FixedColumn, FixedValue, LowCardinalityColumn, NullableColumn,
    StringColumn,
};
pub use config::{
    AfterConnectHook, AfterReleaseHook, BeforeAcquireHook, BeforeConnectHook, ConnConfig,
    PoolConfig,
};
pub use connection::{ConnStatus, Connection};
pub use errors::{Error, Result, ServerError};
pub use insert::InsertStmt;
pub use pool::{Pool, PooledConn, Stat};
pub use progress::Progress;
pub use protocol::{CompressionMethod, Profile, ProfileInfo, ServerInfo};
pub use select::SelectStream;
pub use settings::{SettingValue, Settings};
pub use types::{Type, Tz};
pub use value::{i256, u256, Date, DateTime, DateTime64};

pub use tokio_util::sync::CancellationToken;
pub use uuid::Uuid;
