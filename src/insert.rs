use std::ops::DerefMut;

use tokio_util::sync::CancellationToken;

use crate::{
    block::Block,
    column::Column,
    connection::{Connection, ServerEvent},
    protocol::Profile,
    settings::Settings,
    watcher::guard,
    Error, Result,
};

/// An insert in flight.
///
/// After the query is sent the server answers with a zero-row block
/// describing the target schema; caller columns are validated against it
/// before any rows go out. One or more [`InsertStmt::write`] calls stream
/// data blocks, and [`InsertStmt::commit`] sends the empty terminator block
/// and waits for EndOfStream.
pub struct InsertStmt<C: DerefMut<Target = Connection>> {
    conn: C,
    schema: Block,
    profile: Profile,
    done: bool,
}

impl<C: DerefMut<Target = Connection>> InsertStmt<C> {
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
        let mut profile = Profile::default();
        let result = guard(current, async {
            connection.send_query(query, query_id, settings).await?;
            connection.send_data(&Block::new(0)).await?;
            loop {
                match connection.next_event(&mut profile, &mut None).await? {
                    ServerEvent::Data(block) => return Ok(block),
                    ServerEvent::Done => {
                        return Err(Error::Protocol(
                            "unexpected end of stream, expected insert schema block".to_string(),
                        ))
                    }
                }
            }
        })
        .await;
        match result {
            Ok(schema) => Ok(InsertStmt {
                conn,
                schema,
                profile,
                done: false,
            }),
            Err(e) => {
                conn.watcher.unwatch();
                Err(conn.settle(e))
            }
        }
    }

    /// The target schema: column names and types with zero rows.
    pub fn schema(&self) -> &Block {
        &self.schema
    }

    fn build_block(&self, columns: Vec<Column>) -> Result<Block> {
        if columns.len() != self.schema.columns.len() {
            return Err(Error::Protocol(format!(
                "insert expects {} columns, got {}",
                self.schema.columns.len(),
                columns.len()
            )));
        }
        let mut rows = None;
        for (column, schema) in columns.iter().zip(&self.schema.columns) {
            if !column.matches(&schema.type_) {
                return Err(Error::Protocol(format!(
                    "column '{}' does not match insert type {}",
                    schema.name, schema.type_
                )));
            }
            match rows {
                None => rows = Some(column.len()),
                Some(expected) if expected != column.len() => {
                    return Err(Error::DataShape(format!(
                        "column '{}' holds {} rows, expected {expected}",
                        schema.name,
                        column.len()
                    )))
                }
                Some(_) => {}
            }
        }
        let mut block = Block::new(rows.unwrap_or(0) as u64);
        for (column, schema) in columns.into_iter().zip(&self.schema.columns) {
            block = block.with_column(schema.name.clone(), schema.type_.clone(), column);
        }
        Ok(block)
    }

    /// Validates `columns` against the schema and sends them as one data
    /// block. Columns are supplied positionally.
    pub async fn write(&mut self, columns: Vec<Column>) -> Result<()> {
        if self.done {
            return Err(Error::Usage("insert already finished"));
        }
        let block = self.build_block(columns)?;
        let current = self.conn.watcher.current();
        let connection = &mut *self.conn;
        let result = guard(current, connection.send_data(&block)).await;
        if let Err(e) = result {
            self.done = true;
            self.conn.watcher.unwatch();
            return Err(self.conn.settle(e));
        }
        Ok(())
    }

    /// Sends the empty terminator block and waits for EndOfStream.
    pub async fn commit(mut self) -> Result<Profile> {
        if self.done {
            return Err(Error::Usage("insert already finished"));
        }
        self.done = true;
        let current = self.conn.watcher.current();
        let connection = &mut *self.conn;
        let profile = &mut self.profile;
        let result = guard(current, async {
            connection.send_data(&Block::new(0)).await?;
            loop {
                match connection.next_event(profile, &mut None).await? {
                    ServerEvent::Data(_) => {}
                    ServerEvent::Done => return Ok(()),
                }
            }
        })
        .await;
        self.conn.watcher.unwatch();
        match result {
            Ok(()) => {
                self.conn.unlock();
                Ok(std::mem::take(&mut self.profile))
            }
            Err(e) => Err(self.conn.settle(e)),
        }
    }

    /// Writes one block and commits, the common single-batch insert.
    pub async fn commit_with(mut self, columns: Vec<Column>) -> Result<Profile> {
        self.write(columns).await?;
        self.commit().await
    }
}
