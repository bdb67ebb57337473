use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use crate::{
    io::{ChRead, ChWrite},
    protocol::MAX_STRING_SIZE,
    value::{i256, u256, Date, DateTime, DateTime64},
    Error, Result,
};

/// A value with a fixed wire width, packed little-endian.
///
/// Implementations convert between the host representation and the wire
/// bytes; the column buffer always holds wire bytes, so bulk transfers on
/// little-endian hosts can alias the buffer directly while big-endian hosts
/// byteswap through `get`/`put`.
pub trait FixedValue: Copy + Default {
    const SIZE: usize;

    fn put(self, out: &mut Vec<u8>);

    /// `bytes` is exactly `SIZE` long.
    fn get(bytes: &[u8]) -> Self;
}

macro_rules! impl_fixed_le {
    ($($t:ty),* $(,)?) => {
        $(
            impl FixedValue for $t {
                const SIZE: usize = std::mem::size_of::<$t>();

                fn put(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn get(bytes: &[u8]) -> Self {
                    <$t>::from_le_bytes(bytes.try_into().unwrap())
                }
            }
        )*
    };
}

impl_fixed_le!(i8, i16, i32, i64, i128, u8, u16, u32, u64, u128, f32, f64);

impl FixedValue for Date {
    const SIZE: usize = 2;

    fn put(self, out: &mut Vec<u8>) {
        self.0.put(out)
    }

    fn get(bytes: &[u8]) -> Self {
        Date(u16::get(bytes))
    }
}

impl FixedValue for DateTime {
    const SIZE: usize = 4;

    fn put(self, out: &mut Vec<u8>) {
        self.0.put(out)
    }

    fn get(bytes: &[u8]) -> Self {
        DateTime(u32::get(bytes))
    }
}

impl FixedValue for DateTime64 {
    const SIZE: usize = 8;

    fn put(self, out: &mut Vec<u8>) {
        self.0.put(out)
    }

    fn get(bytes: &[u8]) -> Self {
        DateTime64(i64::get(bytes))
    }
}

impl FixedValue for i256 {
    const SIZE: usize = 32;

    fn put(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0);
    }

    fn get(bytes: &[u8]) -> Self {
        i256(bytes.try_into().unwrap())
    }
}

impl FixedValue for u256 {
    const SIZE: usize = 32;

    fn put(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0);
    }

    fn get(bytes: &[u8]) -> Self {
        u256(bytes.try_into().unwrap())
    }
}

// UUIDs travel as two little-endian u64 halves; reversing each 8-byte half
// maps between that and the canonical big-endian byte form.
impl FixedValue for Uuid {
    const SIZE: usize = 16;

    fn put(self, out: &mut Vec<u8>) {
        let b = self.into_bytes();
        let mut wire = [0u8; 16];
        for i in 0..8 {
            wire[i] = b[7 - i];
            wire[8 + i] = b[15 - i];
        }
        out.extend_from_slice(&wire);
    }

    fn get(bytes: &[u8]) -> Self {
        let mut b = [0u8; 16];
        for i in 0..8 {
            b[i] = bytes[7 - i];
            b[8 + i] = bytes[15 - i];
        }
        Uuid::from_bytes(b)
    }
}

/// Rows of a fixed byte width, packed back to back in wire order.
///
/// Covers every fixed-width type: integers, floats, decimals (raw scaled
/// integers), Date/DateTime/DateTime64, UUID, and FixedString(N).
#[derive(Debug, Clone, Default)]
pub struct FixedColumn {
    size: usize,
    data: Vec<u8>,
    cursor: usize,
}

impl FixedColumn {
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "zero-width column");
        FixedColumn {
            size,
            data: Vec::new(),
            cursor: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.data.len() / self.size
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Appends one typed row.
    ///
    /// Panics if `T`'s wire width does not match the column width.
    pub fn append<T: FixedValue>(&mut self, value: T) {
        assert_eq!(T::SIZE, self.size, "value width does not match column");
        value.put(&mut self.data);
    }

    /// Appends one row of raw wire bytes (FixedString rows, UUID wire form).
    pub fn append_raw(&mut self, row: &[u8]) {
        assert_eq!(row.len(), self.size, "row width does not match column");
        self.data.extend_from_slice(row);
    }

    /// Appends bytes padded with zeros up to the row width (FixedString).
    pub fn append_padded(&mut self, row: &[u8]) -> Result<()> {
        if row.len() > self.size {
            return Err(Error::DataShape(format!(
                "value of {} bytes does not fit FixedString({})",
                row.len(),
                self.size
            )));
        }
        self.data.extend_from_slice(row);
        self.data
            .resize(self.data.len() + self.size - row.len(), 0);
        Ok(())
    }

    /// Appends a zeroed row. Null slots in a nullable column are stored this
    /// way.
    pub fn append_empty(&mut self) {
        self.data.resize(self.data.len() + self.size, 0);
    }

    pub fn value<T: FixedValue>(&self, row: usize) -> T {
        assert_eq!(T::SIZE, self.size, "value width does not match column");
        T::get(&self.data[row * self.size..(row + 1) * self.size])
    }

    pub fn raw_value(&self, row: usize) -> &[u8] {
        &self.data[row * self.size..(row + 1) * self.size]
    }

    pub fn iter<'a, T: FixedValue + 'a>(&'a self) -> impl Iterator<Item = T> + 'a {
        assert_eq!(T::SIZE, self.size, "value width does not match column");
        self.data.chunks_exact(self.size).map(T::get)
    }

    /// Bulk read of every row, appended to `out`.
    pub fn read_all<T: FixedValue>(&self, out: &mut Vec<T>) {
        out.reserve(self.len());
        out.extend(self.iter::<T>());
    }

    /// Bulk read into a caller slice, continuing from the read cursor.
    pub fn fill<T: FixedValue>(&mut self, out: &mut [T]) {
        assert_eq!(T::SIZE, self.size, "value width does not match column");
        for slot in out.iter_mut() {
            *slot = self.value(self.cursor);
            self.cursor += 1;
        }
    }

    /// Zero-copy view of the rows as a typed slice.
    ///
    /// Only available on little-endian hosts, where the wire layout and host
    /// layout agree; returns `None` if the buffer happens to be misaligned
    /// for `T`. Big-endian hosts must use the copying [`Self::read_all`].
    /// The alias is invalidated by any append, so the borrow checker keeps
    /// it from outliving a buffer reallocation.
    #[cfg(target_endian = "little")]
    pub fn as_slice<T: FixedValue>(&self) -> Option<&[T]> {
        assert_eq!(T::SIZE, self.size, "value width does not match column");
        let (prefix, mid, suffix) = unsafe { self.data.align_to::<T>() };
        if prefix.is_empty() && suffix.is_empty() {
            Some(mid)
        } else {
            None
        }
    }

    pub fn reset(&mut self) {
        self.data.clear();
        self.cursor = 0;
    }

    pub(crate) async fn read<R: ChRead>(&mut self, reader: &mut R, rows: usize) -> Result<()> {
        self.reset();
        let len = rows
            .checked_mul(self.size)
            .filter(|l| *l <= MAX_STRING_SIZE)
            .ok_or_else(|| {
                Error::Protocol(format!("column payload too large: {rows} rows of {}", self.size))
            })?;
        self.data.resize(len, 0);
        reader.read_exact(&mut self.data[..]).await?;
        Ok(())
    }

    pub(crate) async fn write<W: ChWrite>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.data).await?;
        Ok(())
    }
}
