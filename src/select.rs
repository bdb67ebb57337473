use std::ops::DerefMut;

use tokio_util::sync::CancellationToken;

use crate::{
    block::Block,
    connection::{Connection, ServerEvent},
    progress::Progress,
    protocol::Profile,
    settings::Settings,
    watcher::guard,
    Result,
};

/// A select in flight: an iterator over result blocks.
///
/// The stream holds the connection's busy guard. Reading to the end (or
/// calling [`SelectStream::close`], which drains) releases the guard and the
/// connection returns to `Idle`. Dropping the stream mid-result leaves the
/// connection busy with unread packets on the wire, and the pool destroys it
/// on release.
///
/// Generic over the connection handle so it works both for a borrowed
/// [`Connection`] and a pooled one.
pub struct SelectStream<C: DerefMut<Target = Connection>> {
    conn: C,
    done: bool,
    profile: Profile,
    on_progress: Option<Box<dyn FnMut(&Progress) + Send>>,
}

impl<C: DerefMut<Target = Connection>> SelectStream<C> {
    pub(crate) async fn start(
        mut conn: C,
        token: &CancellationToken,
        query: &str,
        settings: &Settings,
        query_id: &str,
    ) -> Result<Self> {
        conn.lock()?;
        conn.watcher.watch(token);
        let current = conn.watcher.current();
        let connection = &mut *conn;
        let result = guard(current, async {
            connection.send_query(query, query_id, settings).await?;
            connection.send_data(&Block::new(0)).await
        })
        .await;
        if let Err(e) = result {
            conn.watcher.unwatch();
            return Err(conn.settle(e));
        }
        Ok(SelectStream {
            conn,
            done: false,
            profile: Profile::default(),
            on_progress: None,
        })
    }

    /// Installs a sink receiving every progress packet as it arrives.
    pub fn on_progress(mut self, sink: impl FnMut(&Progress) + Send + 'static) -> Self {
        self.on_progress = Some(Box::new(sink));
        self
    }

    /// Reads the next non-empty result block, or `None` at end of stream.
    /// The zero-row header block the server sends first is skipped.
    pub async fn next_block(&mut self) -> Result<Option<Block>> {
        if self.done {
            return Ok(None);
        }
        let current = self.conn.watcher.current();
        let conn = &mut *self.conn;
        let profile = &mut self.profile;
        let mut on_progress = self.on_progress.as_deref_mut();
        let result = guard(current, async {
            loop {
                match conn.next_event(profile, &mut on_progress).await? {
                    ServerEvent::Data(block) if block.rows > 0 => return Ok(Some(block)),
                    ServerEvent::Data(_) => {}
                    ServerEvent::Done => return Ok(None),
                }
            }
        })
        .await;
        match result {
            Ok(Some(block)) => Ok(Some(block)),
            Ok(None) => {
                self.done = true;
                self.conn.watcher.unwatch();
                self.conn.unlock();
                Ok(None)
            }
            Err(e) => {
                self.done = true;
                self.conn.watcher.unwatch();
                Err(self.conn.settle(e))
            }
        }
    }

    /// Sends a Cancel packet and drains the stream. The server stops at its
    /// next packet boundary; already-produced blocks are discarded.
    pub async fn cancel(&mut self) -> Result<()> {
        if self.done {
            return Ok(());
        }
        let current = self.conn.watcher.current();
        let connection = &mut *self.conn;
        let result = guard(current, connection.send_cancel()).await;
        if let Err(e) = result {
            self.done = true;
            self.conn.watcher.unwatch();
            return Err(self.conn.settle(e));
        }
        while self.next_block().await?.is_some() {}
        Ok(())
    }

    /// Drains any remaining packets and releases the connection, returning
    /// the aggregated profile.
    pub async fn close(mut self) -> Result<Profile> {
        while self.next_block().await?.is_some() {}
        Ok(self.profile)
    }

    /// Progress and profile info aggregated so far.
    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}
