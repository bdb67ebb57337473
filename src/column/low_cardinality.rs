use indexmap::IndexSet;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{
    column::{Column, FixedValue},
    io::{ChRead, ChWrite},
    protocol::MAX_STRING_SIZE,
    types::Type,
    Error, Result,
};

pub const NEED_GLOBAL_DICTIONARY_BIT: u64 = 1u64 << 8;
pub const HAS_ADDITIONAL_KEYS_BIT: u64 = 1u64 << 9;
pub const NEED_UPDATE_DICTIONARY_BIT: u64 = 1u64 << 10;

const TUINT8: u64 = 0;
const TUINT16: u64 = 1;
const TUINT32: u64 = 2;
const TUINT64: u64 = 3;

pub const LOW_CARDINALITY_VERSION: u64 = 1;

/// Low-cardinality wrapper: a per-block dictionary of distinct values plus
/// one narrow integer key per row. Appended values are interned on their
/// wire bytes; for a nullable inner type, dictionary index 0 is the null
/// sentinel and holds an unused default value.
#[derive(Debug)]
pub struct LowCardinalityColumn {
    dict: Box<Column>,
    intern: IndexSet<Vec<u8>>,
    keys: Vec<u64>,
    nullable: bool,
}

impl LowCardinalityColumn {
    pub(crate) fn for_inner(inner: &Type) -> Result<Self> {
        let nullable = inner.is_nullable();
        let dict = Column::for_type(inner.strip_null())?;
        if !matches!(dict, Column::Fixed(_) | Column::String(_)) {
            return Err(Error::UnsupportedType(format!(
                "LowCardinality cannot wrap '{inner}'"
            )));
        }
        let mut column = LowCardinalityColumn {
            dict: Box::new(dict),
            intern: IndexSet::new(),
            keys: Vec::new(),
            nullable,
        };
        if nullable {
            column.dict.append_empty();
        }
        Ok(column)
    }

    fn sentinel(&self) -> u64 {
        self.nullable as u64
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn dict_len(&self) -> usize {
        self.dict.len()
    }

    pub(crate) fn matches_inner(&self, inner: &Type) -> bool {
        self.nullable == inner.is_nullable() && self.dict.matches(inner.strip_null())
    }

    pub fn append<T: FixedValue>(&mut self, value: T) {
        let mut bytes = Vec::with_capacity(T::SIZE);
        value.put(&mut bytes);
        self.append_interned(bytes);
    }

    pub fn append_opt<T: FixedValue>(&mut self, value: Option<T>) {
        match value {
            Some(value) => self.append(value),
            None => self.append_null(),
        }
    }

    pub fn append_str(&mut self, value: impl AsRef<[u8]>) {
        let value = value.as_ref();
        let bytes = match &*self.dict {
            // FixedString dictionaries hold zero-padded rows
            Column::Fixed(c) => {
                assert!(value.len() <= c.size(), "value does not fit row width");
                let mut padded = value.to_vec();
                padded.resize(c.size(), 0);
                padded
            }
            _ => value.to_vec(),
        };
        self.append_interned(bytes);
    }

    pub fn append_str_opt(&mut self, value: Option<impl AsRef<[u8]>>) {
        match value {
            Some(value) => self.append_str(value),
            None => self.append_null(),
        }
    }

    pub fn append_null(&mut self) {
        assert!(self.nullable, "append_null on a non-nullable column");
        self.keys.push(0);
    }

    pub fn append_empty(&mut self) {
        if self.nullable {
            self.append_null();
        } else {
            let bytes = match &*self.dict {
                Column::Fixed(c) => vec![0u8; c.size()],
                _ => Vec::new(),
            };
            self.append_interned(bytes);
        }
    }

    fn append_interned(&mut self, bytes: Vec<u8>) {
        let sentinel = self.sentinel();
        match self.intern.get_index_of(&bytes[..]) {
            Some(index) => self.keys.push(index as u64 + sentinel),
            None => {
                match &mut *self.dict {
                    Column::Fixed(c) => c.append_raw(&bytes),
                    Column::String(c) => c.append(&bytes),
                    _ => unreachable!(),
                }
                let (index, _) = self.intern.insert_full(bytes);
                self.keys.push(index as u64 + sentinel);
            }
        }
    }

    /// Dictionary bytes of one row, `None` for null.
    pub fn value_bytes(&self, row: usize) -> Option<&[u8]> {
        let key = self.keys[row];
        if self.nullable && key == 0 {
            return None;
        }
        Some(match &*self.dict {
            Column::Fixed(c) => c.raw_value(key as usize),
            Column::String(c) => c.value(key as usize),
            _ => unreachable!(),
        })
    }

    pub fn value<T: FixedValue>(&self, row: usize) -> Option<T> {
        self.value_bytes(row).map(T::get)
    }

    pub fn iter_bytes(&self) -> impl Iterator<Item = Option<&[u8]>> + '_ {
        (0..self.len()).map(move |i| self.value_bytes(i))
    }

    pub fn reset(&mut self) {
        self.dict.reset();
        self.intern.clear();
        self.keys.clear();
        if self.nullable {
            self.dict.append_empty();
        }
    }

    pub(crate) async fn read<R: ChRead>(&mut self, reader: &mut R, rows: usize) -> Result<()> {
        let flags = reader.read_u64_le().await?;
        if flags & NEED_GLOBAL_DICTIONARY_BIT != 0 || flags & HAS_ADDITIONAL_KEYS_BIT == 0 {
            return Err(Error::UnsupportedType(
                "LowCardinality global dictionaries are not supported".to_string(),
            ));
        }
        // NEED_UPDATE_DICTIONARY_BIT only matters for global dictionaries.
        let _ = flags & NEED_UPDATE_DICTIONARY_BIT;
        let key_width = flags & 0xFF;

        let dict_size = reader.read_u64_le().await?;
        if dict_size as usize > MAX_STRING_SIZE {
            return Err(Error::Protocol(format!(
                "low cardinality dictionary too large: {dict_size}"
            )));
        }
        self.dict.read(reader, dict_size as usize).await?;

        self.intern.clear();
        for i in self.sentinel() as usize..self.dict.len() {
            let bytes = match &*self.dict {
                Column::Fixed(c) => c.raw_value(i).to_vec(),
                Column::String(c) => c.value(i).to_vec(),
                _ => unreachable!(),
            };
            self.intern.insert(bytes);
        }

        let key_count = reader.read_u64_le().await?;
        if key_count != rows as u64 {
            return Err(Error::DataShape(format!(
                "low cardinality key count {key_count} does not match {rows} rows"
            )));
        }
        self.keys.clear();
        self.keys.reserve(rows);
        for _ in 0..rows {
            let key = match key_width {
                TUINT8 => reader.read_u8().await? as u64,
                TUINT16 => reader.read_u16_le().await? as u64,
                TUINT32 => reader.read_u32_le().await? as u64,
                TUINT64 => reader.read_u64_le().await?,
                x => {
                    return Err(Error::Protocol(format!(
                        "bad low cardinality key width: {x}"
                    )))
                }
            };
            if key >= dict_size {
                return Err(Error::Protocol(format!(
                    "low cardinality key {key} out of dictionary range {dict_size}"
                )));
            }
            self.keys.push(key);
        }
        Ok(())
    }

    pub(crate) async fn write<W: ChWrite>(&self, writer: &mut W) -> Result<()> {
        // Key width is the smallest unsigned type fitting dict size - 1.
        let max_key = (self.dict.len() as u64).saturating_sub(1);
        let width_tag = if max_key <= u8::MAX as u64 {
            TUINT8
        } else if max_key <= u16::MAX as u64 {
            TUINT16
        } else if max_key <= u32::MAX as u64 {
            TUINT32
        } else {
            TUINT64
        };
        writer
            .write_u64_le(width_tag | HAS_ADDITIONAL_KEYS_BIT)
            .await?;
        writer.write_u64_le(self.dict.len() as u64).await?;
        self.dict.write(writer).await?;
        writer.write_u64_le(self.keys.len() as u64).await?;
        for key in &self.keys {
            match width_tag {
                TUINT8 => writer.write_u8(*key as u8).await?,
                TUINT16 => writer.write_u16_le(*key as u16).await?,
                TUINT32 => writer.write_u32_le(*key as u32).await?,
                _ => writer.write_u64_le(*key).await?,
            }
        }
        Ok(())
    }
}
