use std::str::FromStr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{
    column::Column,
    io::{ChRead, ChWrite},
    types::Type,
    Error, Result,
};

/// Out-of-band block attributes, a tagged field sequence terminated by
/// field number 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub is_overflows: bool,
    pub bucket_num: i32,
}

impl Default for BlockInfo {
    fn default() -> Self {
        BlockInfo {
            is_overflows: false,
            bucket_num: -1,
        }
    }
}

impl BlockInfo {
    pub async fn read<R: ChRead>(reader: &mut R) -> Result<Self> {
        let mut new = Self::default();
        loop {
            let field_num = reader.read_var_uint().await?;
            match field_num {
                0 => break,
                1 => {
                    new.is_overflows = reader.read_u8().await? != 0;
                }
                2 => {
                    new.bucket_num = reader.read_i32_le().await?;
                }
                field_num => {
                    return Err(Error::Protocol(format!(
                        "unknown block info field number: {field_num}"
                    )));
                }
            }
        }
        Ok(new)
    }

    pub async fn write<W: ChWrite>(&self, writer: &mut W) -> Result<()> {
        writer.write_var_uint(1).await?;
        writer.write_u8(self.is_overflows as u8).await?;
        writer.write_var_uint(2).await?;
        writer.write_i32_le(self.bucket_num).await?;
        writer.write_var_uint(0).await?;
        Ok(())
    }
}

/// One named, typed column of a block.
#[derive(Debug)]
pub struct BlockColumn {
    pub name: String,
    pub type_: Type,
    pub data: Column,
}

/// A batch of rows, the unit of transfer in both directions. An empty block
/// (zero rows, zero columns) terminates a select result stream, and the
/// client sends one to commit an insert.
#[derive(Debug, Default)]
pub struct Block {
    pub info: BlockInfo,
    pub rows: u64,
    pub columns: Vec<BlockColumn>,
}

impl Block {
    pub fn new(rows: u64) -> Self {
        Block {
            info: BlockInfo::default(),
            rows,
            columns: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0 && self.columns.is_empty()
    }

    pub fn with_column(mut self, name: impl Into<String>, type_: Type, data: Column) -> Self {
        self.columns.push(BlockColumn {
            name: name.into(),
            type_,
            data,
        });
        self
    }

    pub fn column(&self, index: usize) -> &Column {
        &self.columns[index].data
    }

    pub fn column_by_name(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| &c.data)
    }

    pub async fn read<R: ChRead>(reader: &mut R, revision: u64) -> Result<Self> {
        let info = if revision > 0 {
            BlockInfo::read(reader).await?
        } else {
            Default::default()
        };
        let columns = reader.read_var_uint().await?;
        let rows = reader.read_var_uint().await?;
        let mut block = Block {
            info,
            rows,
            columns: Vec::with_capacity(columns as usize),
        };
        for _ in 0..columns {
            let name = reader.read_utf8_string().await?;
            let type_name = reader.read_utf8_string().await?;
            let type_ = Type::from_str(&type_name)?;
            let mut data = Column::for_type(&type_)?;
            if rows > 0 {
                data.read_prefix(reader).await?;
                data.read(reader, rows as usize).await?;
            }
            block.columns.push(BlockColumn { name, type_, data });
        }
        Ok(block)
    }

    pub async fn write<W: ChWrite>(&self, writer: &mut W, revision: u64) -> Result<()> {
        if revision > 0 {
            self.info.write(writer).await?;
        }
        writer.write_var_uint(self.columns.len() as u64).await?;
        writer.write_var_uint(self.rows).await?;
        for column in &self.columns {
            writer.write_string(&column.name).await?;
            writer.write_string(&column.type_.to_string()).await?;
            if column.data.len() as u64 != self.rows {
                return Err(Error::DataShape(format!(
                    "column '{}' holds {} rows, block declares {}",
                    column.name,
                    column.data.len(),
                    self.rows
                )));
            }
            if self.rows > 0 {
                column.data.write_prefix(writer).await?;
                column.data.write(writer).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DBMS_TCP_PROTOCOL_VERSION;

    #[tokio::test]
    async fn block_round_trip() {
        let mut ids = Column::uint64();
        let mut names = Column::string();
        for (id, name) in [(1u64, "alpha"), (2, "beta"), (3, "gamma")] {
            ids.append(id);
            names.append_str(name);
        }
        let block = Block::new(3)
            .with_column("id", "UInt64".parse().unwrap(), ids)
            .with_column("name", "String".parse().unwrap(), names);

        let mut buf = Vec::new();
        block
            .write(&mut buf, DBMS_TCP_PROTOCOL_VERSION)
            .await
            .unwrap();

        let mut slice = &buf[..];
        let decoded = Block::read(&mut slice, DBMS_TCP_PROTOCOL_VERSION)
            .await
            .unwrap();
        assert!(slice.is_empty());
        assert_eq!(decoded.rows, 3);
        assert_eq!(decoded.columns.len(), 2);
        assert_eq!(decoded.columns[0].name, "id");
        assert_eq!(decoded.columns[1].type_, Type::String);
        assert_eq!(decoded.column(0).value::<u64>(2), 3);
        assert_eq!(
            decoded.column_by_name("name").unwrap().value_bytes(1),
            b"beta"
        );
    }

    #[tokio::test]
    async fn empty_block_form() {
        let block = Block::new(0);
        let mut buf = Vec::new();
        block
            .write(&mut buf, DBMS_TCP_PROTOCOL_VERSION)
            .await
            .unwrap();

        let decoded = Block::read(&mut &buf[..], DBMS_TCP_PROTOCOL_VERSION)
            .await
            .unwrap();
        assert!(decoded.is_empty());
    }

    #[tokio::test]
    async fn row_count_mismatch_rejected() {
        let mut ids = Column::uint64();
        ids.append(1u64);
        let block = Block::new(2).with_column("id", "UInt64".parse().unwrap(), ids);
        let mut buf = Vec::new();
        let err = block
            .write(&mut buf, DBMS_TCP_PROTOCOL_VERSION)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DataShape(_)), "{err:?}");
    }

    #[tokio::test]
    async fn unknown_type_string_rejected() {
        let mut buf = Vec::new();
        BlockInfo::default().write(&mut buf).await.unwrap();
        buf.write_var_uint(1).await.unwrap();
        buf.write_var_uint(1).await.unwrap();
        buf.write_string("c").await.unwrap();
        buf.write_string("Ring").await.unwrap();
        let err = Block::read(&mut &buf[..], DBMS_TCP_PROTOCOL_VERSION)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedType(_)), "{err:?}");
    }
}
