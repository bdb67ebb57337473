use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{protocol::MAX_STRING_SIZE, Error, Result};

/// Byte-level reader for the native wire format: unsigned var-ints, fixed
/// little-endian integers (via [`AsyncReadExt`]), and var-int
/// length-prefixed strings.
#[async_trait::async_trait]
pub trait ChRead: AsyncRead + Unpin + Send + Sync {
    async fn read_var_uint(&mut self) -> Result<u64>;

    async fn read_utf8_string(&mut self) -> Result<String>;

    async fn read_binary(&mut self) -> Result<Vec<u8>>;
}

#[async_trait::async_trait]
impl<T: AsyncRead + Unpin + Send + Sync> ChRead for T {
    async fn read_var_uint(&mut self) -> Result<u64> {
        let mut out = 0u64;
        for i in 0..9u64 {
            let octet = self.read_u8().await?;
            out |= ((octet & 0x7F) as u64) << (7 * i);
            if (octet & 0x80) == 0 {
                break;
            }
        }
        Ok(out)
    }

    async fn read_utf8_string(&mut self) -> Result<String> {
        let buf = self.read_binary().await?;
        String::from_utf8(buf).map_err(|e| Error::Protocol(format!("invalid utf-8 string: {e}")))
    }

    async fn read_binary(&mut self) -> Result<Vec<u8>> {
        let len = self.read_var_uint().await?;
        if len as usize > MAX_STRING_SIZE {
            return Err(Error::Protocol(format!(
                "string too large: {} > {}",
                len, MAX_STRING_SIZE
            )));
        }
        let mut buf = vec![0u8; len as usize];
        self.read_exact(&mut buf[..]).await?;
        Ok(buf)
    }
}

/// Byte-level writer counterpart of [`ChRead`]. Writes land in the
/// connection's buffered writer and are flushed at packet boundaries.
#[async_trait::async_trait]
pub trait ChWrite: AsyncWrite + Unpin + Send + Sync {
    async fn write_var_uint(&mut self, value: u64) -> Result<()>;

    async fn write_string(&mut self, value: &str) -> Result<()>;

    async fn write_binary(&mut self, value: &[u8]) -> Result<()>;
}

#[async_trait::async_trait]
impl<T: AsyncWrite + Unpin + Send + Sync> ChWrite for T {
    async fn write_var_uint(&mut self, mut value: u64) -> Result<()> {
        for _ in 0..9u64 {
            let mut byte = value & 0x7F;
            if value > 0x7F {
                byte |= 0x80;
            }
            self.write_all(&[byte as u8]).await?;
            value >>= 7;
            if value == 0 {
                break;
            }
        }
        Ok(())
    }

    async fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_binary(value.as_bytes()).await
    }

    async fn write_binary(&mut self, value: &[u8]) -> Result<()> {
        self.write_var_uint(value.len() as u64).await?;
        self.write_all(value).await?;
        Ok(())
    }
}
