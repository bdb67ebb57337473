use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{
    column::{Column, FixedValue},
    io::{ChRead, ChWrite},
    Error, Result,
};

/// Nullable wrapper: one flag byte per row (1 = null) followed by the inner
/// column's full payload. Null rows still occupy a zeroed slot in the inner
/// column.
#[derive(Debug)]
pub struct NullableColumn {
    nulls: Vec<u8>,
    inner: Box<Column>,
}

impl NullableColumn {
    pub fn new(inner: Column) -> Self {
        NullableColumn {
            nulls: Vec::new(),
            inner: Box::new(inner),
        }
    }

    pub fn len(&self) -> usize {
        self.nulls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nulls.is_empty()
    }

    pub fn inner(&self) -> &Column {
        &self.inner
    }

    pub(crate) fn inner_mut(&mut self) -> &mut Column {
        &mut self.inner
    }

    pub fn append<T: FixedValue>(&mut self, value: Option<T>) {
        match value {
            Some(value) => {
                self.nulls.push(0);
                self.inner.append(value);
            }
            None => self.append_null(),
        }
    }

    pub fn append_str(&mut self, value: Option<impl AsRef<[u8]>>) {
        match value {
            Some(value) => {
                self.nulls.push(0);
                self.inner.append_str(value);
            }
            None => self.append_null(),
        }
    }

    pub fn append_null(&mut self) {
        self.nulls.push(1);
        self.inner.append_empty();
    }

    pub fn append_empty(&mut self) {
        self.nulls.push(0);
        self.inner.append_empty();
    }

    pub fn is_null(&self, row: usize) -> bool {
        self.nulls[row] != 0
    }

    pub fn value<T: FixedValue>(&self, row: usize) -> Option<T> {
        if self.is_null(row) {
            None
        } else {
            Some(self.inner.value(row))
        }
    }

    pub fn value_bytes(&self, row: usize) -> Option<&[u8]> {
        if self.is_null(row) {
            None
        } else {
            Some(self.inner.value_bytes(row))
        }
    }

    pub fn iter<T: FixedValue>(&self) -> impl Iterator<Item = Option<T>> + '_ {
        (0..self.len()).map(move |i| self.value(i))
    }

    pub fn read_all<T: FixedValue>(&self, out: &mut Vec<Option<T>>) {
        out.reserve(self.len());
        out.extend(self.iter::<T>());
    }

    pub fn reset(&mut self) {
        self.nulls.clear();
        self.inner.reset();
    }

    pub(crate) async fn read<R: ChRead>(&mut self, reader: &mut R, rows: usize) -> Result<()> {
        self.nulls.clear();
        self.nulls.resize(rows, 0);
        reader.read_exact(&mut self.nulls[..]).await?;
        self.inner.read(reader, rows).await
    }

    pub(crate) async fn write<W: ChWrite>(&self, writer: &mut W) -> Result<()> {
        if self.nulls.len() != self.inner.len() {
            return Err(Error::DataShape(format!(
                "null bitmap holds {} rows but inner column holds {}",
                self.nulls.len(),
                self.inner.len()
            )));
        }
        writer.write_all(&self.nulls).await?;
        self.inner.write(writer).await
    }
}
