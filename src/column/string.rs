use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{
    io::{ChRead, ChWrite},
    protocol::MAX_STRING_SIZE,
    Error, Result,
};

/// Variable-length string rows: one contiguous byte payload plus a
/// lookaside offset table for O(1) row indexing. On the wire each row is a
/// var-int length followed by raw bytes.
#[derive(Debug, Clone, Default)]
pub struct StringColumn {
    data: Vec<u8>,
    // offsets[i] is the end of row i in `data`
    offsets: Vec<usize>,
    cursor: usize,
}

impl StringColumn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn append(&mut self, value: impl AsRef<[u8]>) {
        self.data.extend_from_slice(value.as_ref());
        self.offsets.push(self.data.len());
    }

    pub fn append_empty(&mut self) {
        self.offsets.push(self.data.len());
    }

    pub fn value(&self, row: usize) -> &[u8] {
        let start = if row == 0 { 0 } else { self.offsets[row - 1] };
        &self.data[start..self.offsets[row]]
    }

    pub fn value_str(&self, row: usize) -> Result<&str> {
        std::str::from_utf8(self.value(row))
            .map_err(|e| Error::Protocol(format!("invalid utf-8 string row: {e}")))
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> + '_ {
        (0..self.len()).map(move |i| self.value(i))
    }

    pub fn read_all(&self, out: &mut Vec<Vec<u8>>) {
        out.reserve(self.len());
        out.extend(self.iter().map(|v| v.to_vec()));
    }

    /// Bulk read into a caller slice, continuing from the read cursor.
    pub fn fill(&mut self, out: &mut [Vec<u8>]) {
        for slot in out.iter_mut() {
            *slot = self.value(self.cursor).to_vec();
            self.cursor += 1;
        }
    }

    pub fn reset(&mut self) {
        self.data.clear();
        self.offsets.clear();
        self.cursor = 0;
    }

    pub(crate) async fn read<R: ChRead>(&mut self, reader: &mut R, rows: usize) -> Result<()> {
        self.reset();
        self.offsets.reserve(rows);
        for _ in 0..rows {
            let len = reader.read_var_uint().await? as usize;
            if len > MAX_STRING_SIZE || self.data.len() + len > MAX_STRING_SIZE {
                return Err(Error::Protocol(format!("string row too large: {len}")));
            }
            let start = self.data.len();
            self.data.resize(start + len, 0);
            reader.read_exact(&mut self.data[start..]).await?;
            self.offsets.push(self.data.len());
        }
        Ok(())
    }

    pub(crate) async fn write<W: ChWrite>(&self, writer: &mut W) -> Result<()> {
        for row in self.iter() {
            writer.write_var_uint(row.len() as u64).await?;
            writer.write_all(row).await?;
        }
        Ok(())
    }
}
