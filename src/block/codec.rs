//! Deterministic binary codec for composite blocks.
//!
//! Record format: [4-byte length (u32 big-endian)][bincode payload]
//! Block-list payloads are records back to back with no separator; the
//! length prefix keeps record boundaries independent of payload bytes.

use crate::block::types::CompositeBlock;
use crate::constants::protocol::MAX_BLOCK_BYTES;
use crate::error::CodecError;

/// Serialize one block as a length-prefixed record.
pub fn encode_block(block: &CompositeBlock) -> Result<Vec<u8>, CodecError> {
    let payload = bincode::serialize(block)?;
    let len = payload.len() as u32;
    if len > MAX_BLOCK_BYTES {
        return Err(CodecError::Oversized(len));
    }
    let mut record = Vec::with_capacity(4 + payload.len());
    record.extend_from_slice(&len.to_be_bytes());
    record.extend_from_slice(&payload);
    Ok(record)
}

/// Decode one length-prefixed record from the front of `buf`. Returns the
/// block and the number of bytes consumed.
pub fn decode_block(buf: &[u8]) -> Result<(CompositeBlock, usize), CodecError> {
    if buf.len() < 4 {
        return Err(CodecError::Truncated {
            needed: 4,
            available: buf.len(),
        });
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if len > MAX_BLOCK_BYTES {
        return Err(CodecError::Oversized(len));
    }
    let end = 4 + len as usize;
    if buf.len() < end {
        return Err(CodecError::Truncated {
            needed: end,
            available: buf.len(),
        });
    }
    let block: CompositeBlock = bincode::deserialize(&buf[4..end])?;
    Ok((block, end))
}

/// Serialize a list of blocks as concatenated records.
pub fn encode_block_list(blocks: &[CompositeBlock]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    for block in blocks {
        out.extend_from_slice(&encode_block(block)?);
    }
    Ok(out)
}

/// Decode concatenated records until the buffer is exhausted. A trailing
/// partial record is a codec error, not a silent drop.
pub fn decode_block_list(buf: &[u8]) -> Result<Vec<CompositeBlock>, CodecError> {
    let mut blocks = Vec::new();
    let mut offset = 0;
    while offset < buf.len() {
        let (block, consumed) = decode_block(&buf[offset..])?;
        blocks.push(block);
        offset += consumed;
    }
    Ok(blocks)
}
