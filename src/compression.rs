use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{
    block::Block,
    io::{ChRead, ChWrite},
    protocol::CompressionMethod,
    Error, Result,
};

pub(crate) const MAX_COMPRESSION_SIZE: u32 = 0x40000000;

// Frame header past the checksum: method byte + compressed size + raw size.
const FRAME_HEADER_SIZE: usize = 9;

fn compress(method: CompressionMethod, raw: &[u8]) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::Lz4 => lz4::block::compress(raw, None, false)
            .map_err(|e| Error::Protocol(format!("lz4 compression failed: {e}"))),
        CompressionMethod::Zstd => zstd::bulk::compress(raw, 0)
            .map_err(|e| Error::Protocol(format!("zstd compression failed: {e}"))),
        CompressionMethod::None => unreachable!("uncompressed blocks are not framed"),
    }
}

fn decompress(method_byte: u8, payload: &[u8], raw_size: usize) -> Result<Vec<u8>> {
    match method_byte {
        0x82 => lz4::block::decompress(payload, Some(raw_size as i32))
            .map_err(|e| Error::Protocol(format!("malformed lz4 block: {e}"))),
        0x90 => zstd::bulk::decompress(payload, raw_size)
            .map_err(|e| Error::Protocol(format!("malformed zstd block: {e}"))),
        x => Err(Error::Protocol(format!(
            "unknown compression method byte: {x:#x}"
        ))),
    }
}

/// Writes a block as a compressed frame: 16-byte checksum, method byte,
/// compressed size (including the 9 header bytes), uncompressed size,
/// payload. The checksum is CityHash 1.0.2 over everything after itself.
pub async fn write_compressed_block<W: ChWrite>(
    writer: &mut W,
    block: &Block,
    revision: u64,
    method: CompressionMethod,
) -> Result<()> {
    let mut raw = Vec::new();
    block.write(&mut raw, revision).await?;
    if raw.len() > MAX_COMPRESSION_SIZE as usize {
        return Err(Error::Protocol(format!(
            "block too large to compress: {}",
            raw.len()
        )));
    }
    let compressed = compress(method, &raw)?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + compressed.len());
    frame.push(method.byte());
    frame.extend_from_slice(&((compressed.len() + FRAME_HEADER_SIZE) as u32).to_le_bytes());
    frame.extend_from_slice(&(raw.len() as u32).to_le_bytes());
    frame.extend_from_slice(&compressed);

    let hash = cityhash_rs::cityhash_102_128(&frame);
    writer.write_u64_le((hash >> 64) as u64).await?;
    writer.write_u64_le(hash as u64).await?;
    writer.write_all(&frame).await?;
    Ok(())
}

/// Reads one compressed frame and decodes the block inside it.
pub async fn read_compressed_block<R: ChRead>(reader: &mut R, revision: u64) -> Result<Block> {
    let checksum_hi = reader.read_u64_le().await?;
    let checksum_lo = reader.read_u64_le().await?;

    let mut header = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let method_byte = header[0];
    let compressed_size = u32::from_le_bytes(header[1..5].try_into().unwrap());
    let raw_size = u32::from_le_bytes(header[5..9].try_into().unwrap());
    if compressed_size < FRAME_HEADER_SIZE as u32
        || compressed_size > MAX_COMPRESSION_SIZE
        || raw_size > MAX_COMPRESSION_SIZE
    {
        return Err(Error::Protocol(format!(
            "bad compressed frame sizes: {compressed_size}/{raw_size}"
        )));
    }

    let mut frame = vec![0u8; compressed_size as usize];
    frame[..FRAME_HEADER_SIZE].copy_from_slice(&header);
    reader.read_exact(&mut frame[FRAME_HEADER_SIZE..]).await?;

    let hash = cityhash_rs::cityhash_102_128(&frame);
    if (hash >> 64) as u64 != checksum_hi || hash as u64 != checksum_lo {
        return Err(Error::Checksum);
    }

    let raw = decompress(method_byte, &frame[FRAME_HEADER_SIZE..], raw_size as usize)?;
    Block::read(&mut &raw[..], revision).await
}
