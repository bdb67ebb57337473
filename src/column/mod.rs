use futures_util::{future::BoxFuture, FutureExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{
    io::{ChRead, ChWrite},
    types::Type,
    Error, Result,
};

mod array;
mod fixed;
mod low_cardinality;
mod nullable;
mod string;

pub use array::ArrayColumn;
pub use fixed::{FixedColumn, FixedValue};
pub use low_cardinality::LowCardinalityColumn;
pub use nullable::NullableColumn;
pub use string::StringColumn;

use low_cardinality::LOW_CARDINALITY_VERSION;

/// One column of a block: a typed builder for inserts and a typed reader for
/// select results.
///
/// The representation is a small tagged set of shapes: a packed fixed-width
/// buffer, a string buffer with offsets, and the wrapper variants. Hot
/// append/decode paths are monomorphized over [`FixedValue`]; only the block
/// framer's heterogeneous per-column loop dispatches on the tag.
#[derive(Debug)]
pub enum Column {
    Fixed(FixedColumn),
    String(StringColumn),
    Nullable(NullableColumn),
    Array(ArrayColumn),
    LowCardinality(LowCardinalityColumn),
}

macro_rules! scalar_constructors {
    ($($name:ident => $t:ident),* $(,)?) => {
        paste::paste! {
            $(
                #[doc = "Creates a builder for `" $t "` rows."]
                pub fn $name() -> Column {
                    Column::Fixed(FixedColumn::new(std::mem::size_of::<$t>()))
                }
            )*
        }
    };
}

impl Column {
    scalar_constructors! {
        int8 => i8, int16 => i16, int32 => i32, int64 => i64, int128 => i128,
        uint8 => u8, uint16 => u16, uint32 => u32, uint64 => u64, uint128 => u128,
        float32 => f32, float64 => f64,
    }

    pub fn int256() -> Column {
        Column::Fixed(FixedColumn::new(32))
    }

    pub fn uint256() -> Column {
        Column::Fixed(FixedColumn::new(32))
    }

    pub fn date() -> Column {
        Column::Fixed(FixedColumn::new(2))
    }

    pub fn datetime() -> Column {
        Column::Fixed(FixedColumn::new(4))
    }

    pub fn datetime64() -> Column {
        Column::Fixed(FixedColumn::new(8))
    }

    pub fn uuid() -> Column {
        Column::Fixed(FixedColumn::new(16))
    }

    pub fn fixed_string(size: usize) -> Column {
        Column::Fixed(FixedColumn::new(size))
    }

    pub fn string() -> Column {
        Column::String(StringColumn::new())
    }

    pub fn nullable(inner: Column) -> Column {
        Column::Nullable(NullableColumn::new(inner))
    }

    pub fn array(inner: Column) -> Column {
        Column::Array(ArrayColumn::new(inner))
    }

    /// Builds an empty column matching a block type string.
    pub fn for_type(type_: &Type) -> Result<Column> {
        Ok(match type_ {
            Type::String => Column::string(),
            Type::Nullable(inner) => Column::nullable(Column::for_type(inner)?),
            Type::Array(inner) => Column::array(Column::for_type(inner)?),
            Type::LowCardinality(inner) => {
                Column::LowCardinality(LowCardinalityColumn::for_inner(inner)?)
            }
            Type::FixedString(0) => {
                return Err(Error::UnsupportedType("FixedString(0)".to_string()))
            }
            other => {
                let width = other
                    .fixed_width()
                    .ok_or_else(|| Error::UnsupportedType(other.to_string()))?;
                Column::Fixed(FixedColumn::new(width))
            }
        })
    }

    pub fn len(&self) -> usize {
        match self {
            Column::Fixed(c) => c.len(),
            Column::String(c) => c.len(),
            Column::Nullable(c) => c.len(),
            Column::Array(c) => c.len(),
            Column::LowCardinality(c) => c.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset(&mut self) {
        match self {
            Column::Fixed(c) => c.reset(),
            Column::String(c) => c.reset(),
            Column::Nullable(c) => c.reset(),
            Column::Array(c) => c.reset(),
            Column::LowCardinality(c) => c.reset(),
        }
    }

    /// Appends one scalar row.
    ///
    /// Works on fixed, nullable (appends non-null) and low-cardinality
    /// columns; panics on string and array shapes.
    pub fn append<T: FixedValue>(&mut self, value: T) {
        match self {
            Column::Fixed(c) => c.append(value),
            Column::Nullable(c) => c.append(Some(value)),
            Column::LowCardinality(c) => c.append(value),
            _ => panic!("append on a non-scalar column"),
        }
    }

    pub fn append_opt<T: FixedValue>(&mut self, value: Option<T>) {
        match self {
            Column::Nullable(c) => c.append(value),
            Column::LowCardinality(c) => c.append_opt(value),
            _ => panic!("append_opt on a non-nullable column"),
        }
    }

    /// Appends one string/bytes row (String, FixedString, or their nullable
    /// and low-cardinality wrappers). FixedString rows shorter than the row
    /// width are zero padded.
    pub fn append_str(&mut self, value: impl AsRef<[u8]>) {
        match self {
            Column::Fixed(c) => c.append_padded(value.as_ref()).expect("row too wide"),
            Column::String(c) => c.append(value),
            Column::Nullable(c) => c.append_str(Some(value)),
            Column::LowCardinality(c) => c.append_str(value),
            _ => panic!("append_str on an array column"),
        }
    }

    pub fn append_str_opt(&mut self, value: Option<impl AsRef<[u8]>>) {
        match self {
            Column::Nullable(c) => c.append_str(value),
            Column::LowCardinality(c) => c.append_str_opt(value),
            _ => panic!("append_str_opt on a non-nullable column"),
        }
    }

    pub fn append_null(&mut self) {
        match self {
            Column::Nullable(c) => c.append_null(),
            Column::LowCardinality(c) => c.append_null(),
            _ => panic!("append_null on a non-nullable column"),
        }
    }

    /// Appends a default-valued row (zero bytes, empty string, empty array).
    pub fn append_empty(&mut self) {
        match self {
            Column::Fixed(c) => c.append_empty(),
            Column::String(c) => c.append_empty(),
            Column::Nullable(c) => c.append_empty(),
            Column::Array(c) => c.append_empty(),
            Column::LowCardinality(c) => c.append_empty(),
        }
    }

    pub fn value<T: FixedValue>(&self, row: usize) -> T {
        match self {
            Column::Fixed(c) => c.value(row),
            _ => panic!("value on a non-fixed column"),
        }
    }

    pub fn value_opt<T: FixedValue>(&self, row: usize) -> Option<T> {
        match self {
            Column::Nullable(c) => c.value(row),
            Column::LowCardinality(c) => c.value(row),
            _ => panic!("value_opt on a non-nullable column"),
        }
    }

    pub fn value_bytes(&self, row: usize) -> &[u8] {
        match self {
            Column::Fixed(c) => c.raw_value(row),
            Column::String(c) => c.value(row),
            _ => panic!("value_bytes on a wrapped column"),
        }
    }

    pub fn value_bytes_opt(&self, row: usize) -> Option<&[u8]> {
        match self {
            Column::Nullable(c) => c.value_bytes(row),
            Column::LowCardinality(c) => c.value_bytes(row),
            _ => panic!("value_bytes_opt on a non-nullable column"),
        }
    }

    pub fn as_fixed(&self) -> Option<&FixedColumn> {
        match self {
            Column::Fixed(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&StringColumn> {
        match self {
            Column::String(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_nullable(&self) -> Option<&NullableColumn> {
        match self {
            Column::Nullable(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayColumn> {
        match self {
            Column::Array(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_array_mut(&mut self) -> Option<&mut ArrayColumn> {
        match self {
            Column::Array(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_low_cardinality(&self) -> Option<&LowCardinalityColumn> {
        match self {
            Column::LowCardinality(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_low_cardinality_mut(&mut self) -> Option<&mut LowCardinalityColumn> {
        match self {
            Column::LowCardinality(c) => Some(c),
            _ => None,
        }
    }

    /// Whether this column's shape can carry rows of `type_`. Used to check
    /// caller columns against the server's insert schema.
    pub fn matches(&self, type_: &Type) -> bool {
        match (self, type_) {
            (Column::Nullable(c), Type::Nullable(inner)) => c.inner().matches(inner),
            (Column::Array(c), Type::Array(inner)) => c.inner().matches(inner),
            (Column::LowCardinality(c), Type::LowCardinality(inner)) => c.matches_inner(inner),
            (Column::String(_), Type::String) => true,
            (Column::Fixed(c), other) => other.fixed_width() == Some(c.size()),
            _ => false,
        }
    }

    /// Reads the serialization prefix written once per column before row
    /// data; only low-cardinality columns carry one (the version word).
    pub(crate) fn read_prefix<'a, R: ChRead>(
        &'a mut self,
        reader: &'a mut R,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            match self {
                Column::Fixed(_) | Column::String(_) => Ok(()),
                Column::Nullable(c) => c.inner_mut().read_prefix(reader).await,
                Column::Array(c) => c.inner_mut().read_prefix(reader).await,
                Column::LowCardinality(_) => {
                    let version = reader.read_u64_le().await?;
                    if version != LOW_CARDINALITY_VERSION {
                        return Err(Error::UnsupportedType(format!(
                            "low cardinality serialization version {version}"
                        )));
                    }
                    Ok(())
                }
            }
        }
        .boxed()
    }

    pub(crate) fn write_prefix<'a, W: ChWrite>(
        &'a self,
        writer: &'a mut W,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            match self {
                Column::Fixed(_) | Column::String(_) => Ok(()),
                Column::Nullable(c) => c.inner().write_prefix(writer).await,
                Column::Array(c) => c.inner().write_prefix(writer).await,
                Column::LowCardinality(_) => {
                    writer.write_u64_le(LOW_CARDINALITY_VERSION).await?;
                    Ok(())
                }
            }
        }
        .boxed()
    }

    /// Decodes `rows` rows from the wire, replacing current contents.
    pub(crate) fn read<'a, R: ChRead>(
        &'a mut self,
        reader: &'a mut R,
        rows: usize,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            match self {
                Column::Fixed(c) => c.read(reader, rows).await,
                Column::String(c) => c.read(reader, rows).await,
                Column::Nullable(c) => c.read(reader, rows).await,
                Column::Array(c) => c.read(reader, rows).await,
                Column::LowCardinality(c) => c.read(reader, rows).await,
            }
        }
        .boxed()
    }

    /// Encodes all rows to the wire.
    pub(crate) fn write<'a, W: ChWrite>(&'a self, writer: &'a mut W) -> BoxFuture<'a, Result<()>> {
        async move {
            match self {
                Column::Fixed(c) => c.write(writer).await,
                Column::String(c) => c.write(writer).await,
                Column::Nullable(c) => c.write(writer).await,
                Column::Array(c) => c.write(writer).await,
                Column::LowCardinality(c) => c.write(writer).await,
            }
        }
        .boxed()
    }
}
