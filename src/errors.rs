use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All errors surfaced by this crate.
///
/// Network, protocol, checksum and cancellation errors leave the connection
/// unusable (it transitions to `Closed` and the pool destroys it on release).
/// [`Error::Server`] terminates the exchange cleanly and leaves the
/// connection usable.
#[derive(Error, Debug)]
pub enum Error {
    #[error("operation canceled")]
    Canceled,
    #[error("operation timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    /// An exception packet from the server. The display format matches the
    /// server's own rendering (e.g. ` DB::Exception (60): ...`), including
    /// the leading space.
    #[error(" {name} ({code}): {message}")]
    Server {
        code: i32,
        name: String,
        message: String,
        stack_trace: String,
        nested: Vec<ServerError>,
    },
    #[error("compressed block checksum mismatch")]
    Checksum,
    #[error("unsupported type: {0}")]
    UnsupportedType(String),
    #[error("{0}")]
    Config(String),
    #[error("closed pool")]
    PoolClosed,
    #[error("pool exhausted")]
    PoolExhausted,
    /// API misuse that never touches the network: `conn uninitialized`,
    /// `conn busy`, `conn closed`, reuse after release.
    #[error("{0}")]
    Usage(&'static str),
    #[error("data shape mismatch: {0}")]
    DataShape(String),
    #[error("value out of representable bounds: {0}")]
    Overflow(String),
    /// Acquisition failure surfaced by a pool-level operation.
    #[error("acquire: {0}")]
    Acquire(#[source] Box<Error>),
}

/// One link of a server exception chain.
#[derive(Debug, Clone)]
pub struct ServerError {
    pub code: i32,
    pub name: String,
    pub message: String,
    pub stack_trace: String,
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// True for errors that must mark the connection `Closed`: everything
    /// except a clean server exception and local usage/config mistakes.
    pub fn poisons_connection(&self) -> bool {
        !matches!(
            self,
            Error::Server { .. } | Error::Usage(_) | Error::Config(_) | Error::DataShape(_)
        )
    }

    pub fn is_canceled(&self) -> bool {
        match self {
            Error::Canceled | Error::Timeout => true,
            Error::Acquire(inner) => inner.is_canceled(),
            _ => false,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        // A short read means the peer violated the framing, not the transport.
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::Protocol("short read".to_string())
        } else {
            Error::Network(e)
        }
    }
}
