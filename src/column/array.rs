use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{
    column::Column,
    io::{ChRead, ChWrite},
    Error, Result,
};

/// Array wrapper: one cumulative u64 row offset per parent row, then the
/// inner column's payload for the total child-row count. Offsets count rows
/// of the inner column, not bytes.
#[derive(Debug)]
pub struct ArrayColumn {
    offsets: Vec<u64>,
    inner: Box<Column>,
}

impl ArrayColumn {
    pub fn new(inner: Column) -> Self {
        ArrayColumn {
            offsets: Vec::new(),
            inner: Box::new(inner),
        }
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn inner(&self) -> &Column {
        &self.inner
    }

    /// Child-value sink; append the row's values here after [`Self::append_len`].
    pub fn inner_mut(&mut self) -> &mut Column {
        &mut self.inner
    }

    /// Declares the next row as holding `len` child values.
    pub fn append_len(&mut self, len: usize) {
        let last = self.offsets.last().copied().unwrap_or(0);
        self.offsets.push(last + len as u64);
    }

    pub fn append_empty(&mut self) {
        self.append_len(0);
    }

    /// Child-row range of one parent row.
    pub fn range(&self, row: usize) -> std::ops::Range<usize> {
        let start = if row == 0 { 0 } else { self.offsets[row - 1] as usize };
        start..self.offsets[row] as usize
    }

    pub fn row_len(&self, row: usize) -> usize {
        self.range(row).len()
    }

    pub fn reset(&mut self) {
        self.offsets.clear();
        self.inner.reset();
    }

    pub(crate) async fn read<R: ChRead>(&mut self, reader: &mut R, rows: usize) -> Result<()> {
        self.reset();
        self.offsets.reserve(rows);
        let mut last = 0u64;
        for _ in 0..rows {
            let offset = reader.read_u64_le().await?;
            if offset < last {
                return Err(Error::DataShape(format!(
                    "array offsets decreased: {offset} after {last}"
                )));
            }
            last = offset;
            self.offsets.push(offset);
        }
        let total = usize::try_from(last)
            .map_err(|_| Error::Overflow(format!("array offset {last} exceeds address space")))?;
        self.inner.read(reader, total).await
    }

    pub(crate) async fn write<W: ChWrite>(&self, writer: &mut W) -> Result<()> {
        let last = self.offsets.last().copied().unwrap_or(0);
        if last != self.inner.len() as u64 {
            return Err(Error::DataShape(format!(
                "array offsets end at {last} but inner column holds {} rows",
                self.inner.len()
            )));
        }
        for offset in &self.offsets {
            writer.write_u64_le(*offset).await?;
        }
        self.inner.write(writer).await
    }
}
