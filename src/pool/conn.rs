use std::ops::{Deref, DerefMut};

use super::{Pool, PoolEntry};
use crate::connection::Connection;

/// An acquired connection.
///
/// Carries unique mutation rights until released; release is exactly-once by
/// construction, since [`PooledConn::release`] consumes the handle and drop
/// releases whatever was not explicitly released.
pub struct PooledConn {
    pub(crate) pool: Pool,
    pub(crate) entry: Option<PoolEntry>,
}

impl PooledConn {
    /// Returns the connection to the pool: back to the idle list if it is
    /// clean and young enough and the after-release hook keeps it, otherwise
    /// destroyed.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.pool.release_entry(entry);
        }
    }
}

impl Deref for PooledConn {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.entry.as_ref().expect("connection used after release").conn
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.entry.as_mut().expect("connection used after release").conn
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        self.release_inner();
    }
}
