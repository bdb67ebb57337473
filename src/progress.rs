use crate::{
    io::{ChRead, ChWrite},
    protocol::DBMS_MIN_REVISION_WITH_CLIENT_WRITE_INFO,
    Result,
};

/// A progress packet, or the running aggregate of all progress packets seen
/// during one exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub read_rows: u64,
    pub read_bytes: u64,
    pub total_rows_to_read: u64,
    pub written_rows: u64,
    pub written_bytes: u64,
}

impl Progress {
    pub async fn read<R: ChRead>(reader: &mut R, revision: u64) -> Result<Self> {
        let read_rows = reader.read_var_uint().await?;
        let read_bytes = reader.read_var_uint().await?;
        let total_rows_to_read = reader.read_var_uint().await?;
        let (written_rows, written_bytes) = if revision >= DBMS_MIN_REVISION_WITH_CLIENT_WRITE_INFO
        {
            (
                reader.read_var_uint().await?,
                reader.read_var_uint().await?,
            )
        } else {
            (0, 0)
        };
        Ok(Progress {
            read_rows,
            read_bytes,
            total_rows_to_read,
            written_rows,
            written_bytes,
        })
    }

    pub async fn write<W: ChWrite>(&self, writer: &mut W, revision: u64) -> Result<()> {
        writer.write_var_uint(self.read_rows).await?;
        writer.write_var_uint(self.read_bytes).await?;
        writer.write_var_uint(self.total_rows_to_read).await?;
        if revision >= DBMS_MIN_REVISION_WITH_CLIENT_WRITE_INFO {
            writer.write_var_uint(self.written_rows).await?;
            writer.write_var_uint(self.written_bytes).await?;
        }
        Ok(())
    }

    /// Folds an incremental packet into the aggregate. `total_rows_to_read`
    /// is a high-water mark, the rest are deltas.
    pub fn add(&mut self, other: &Progress) {
        self.read_rows += other.read_rows;
        self.read_bytes += other.read_bytes;
        self.total_rows_to_read = self.total_rows_to_read.max(other.total_rows_to_read);
        self.written_rows += other.written_rows;
        self.written_bytes += other.written_bytes;
    }
}
