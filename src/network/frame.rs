//! Tag-framed wire protocol for block exchange.
//!
//! Frame format: [7 ASCII tag bytes]["[*]"][payload]
//! Payload fields, where a tag defines them, are joined with the same
//! three-byte separator. Block payloads are length-framed records (see
//! `block::codec`), so the separator never collides with block bytes.
//!
//! Reassembly: the transport delivers variable chunks. A chunk of exactly
//! `CONTINUATION_CHUNK_BYTES` is a fragment of a larger message and is
//! buffered; a chunk of any other length terminates the buffered message.

use crate::constants::protocol::{
    CONTINUATION_CHUNK_BYTES, MAX_MESSAGE_BYTES, SEPARATOR, TAG_LEN,
};
use crate::error::CodecError;
use bytes::BytesMut;

/// Every tag the protocol speaks. Unknown tags are a `CodecError`, not a
/// silent drop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameTag {
    /// `0000R01` peer introduction: host, port, peer id
    Intro,
    /// `0005R01` list services
    ListServices,
    /// `0006R01` read block range (full sync): low, high
    GetBlockRange,
    /// `0007W01` write block list
    BlockList,
    /// `0008R01` read highest block
    GetHighest,
    /// `0008W01` write highest block / announce
    Highest,
    /// `0009R01` read multiverse (selective sync): low, high
    GetMultiverse,
    /// `0010W01` write multiverse
    MultiverseList,
}

impl FrameTag {
    pub const ALL: [FrameTag; 8] = [
        FrameTag::Intro,
        FrameTag::ListServices,
        FrameTag::GetBlockRange,
        FrameTag::BlockList,
        FrameTag::GetHighest,
        FrameTag::Highest,
        FrameTag::GetMultiverse,
        FrameTag::MultiverseList,
    ];

    pub const fn as_bytes(self) -> &'static [u8; 7] {
        match self {
            FrameTag::Intro => b"0000R01",
            FrameTag::ListServices => b"0005R01",
            FrameTag::GetBlockRange => b"0006R01",
            FrameTag::BlockList => b"0007W01",
            FrameTag::GetHighest => b"0008R01",
            FrameTag::Highest => b"0008W01",
            FrameTag::GetMultiverse => b"0009R01",
            FrameTag::MultiverseList => b"0010W01",
        }
    }

    pub fn parse(raw: &[u8]) -> Result<Self, CodecError> {
        for tag in Self::ALL {
            if tag.as_bytes() == raw {
                return Ok(tag);
            }
        }
        Err(CodecError::UnknownTag(
            String::from_utf8_lossy(raw).to_string(),
        ))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub tag: FrameTag,
    pub payload: Vec<u8>,
}

/// Assemble a complete frame: tag, separator, payload.
pub fn encode_frame(tag: FrameTag, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(TAG_LEN + SEPARATOR.len() + payload.len());
    out.extend_from_slice(tag.as_bytes());
    out.extend_from_slice(SEPARATOR);
    out.extend_from_slice(payload);
    out
}

/// Parse a complete buffered message into tag and payload.
pub fn decode_frame(buf: &[u8]) -> Result<Frame, CodecError> {
    if buf.len() < TAG_LEN + SEPARATOR.len() {
        return Err(CodecError::MalformedFrame(format!(
            "{} bytes is below the frame minimum",
            buf.len()
        )));
    }
    let tag = FrameTag::parse(&buf[..TAG_LEN])?;
    if &buf[TAG_LEN..TAG_LEN + SEPARATOR.len()] != SEPARATOR {
        return Err(CodecError::MalformedFrame(
            "missing separator after tag".to_string(),
        ));
    }
    Ok(Frame {
        tag,
        payload: buf[TAG_LEN + SEPARATOR.len()..].to_vec(),
    })
}

/// Split a payload into fields on the wire separator.
pub fn split_fields(payload: &[u8]) -> Vec<&[u8]> {
    let mut fields = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + SEPARATOR.len() <= payload.len() {
        if &payload[i..i + SEPARATOR.len()] == SEPARATOR {
            fields.push(&payload[start..i]);
            i += SEPARATOR.len();
            start = i;
        } else {
            i += 1;
        }
    }
    fields.push(&payload[start..]);
    fields
}

/// Join payload fields with the wire separator.
pub fn join_fields(fields: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.extend_from_slice(SEPARATOR);
        }
        out.extend_from_slice(field);
    }
    out
}

pub fn parse_ascii_u64(field: &[u8]) -> Result<u64, CodecError> {
    std::str::from_utf8(field)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .ok_or_else(|| CodecError::BadNumber(String::from_utf8_lossy(field).to_string()))
}

/// Per-connection reassembly buffer implementing the continuation rule.
#[derive(Default)]
pub struct ChunkAssembler {
    buf: BytesMut,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one transport chunk. Returns the completed message when this
    /// chunk terminates one. A message whose last fragment is itself
    /// exactly the continuation size only completes on the next short
    /// chunk; that is the wire contract, odd as it is.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>, CodecError> {
        if self.buf.len() + chunk.len() > MAX_MESSAGE_BYTES {
            self.buf.clear();
            return Err(CodecError::MalformedFrame(
                "reassembled message exceeds maximum size".to_string(),
            ));
        }
        self.buf.extend_from_slice(chunk);
        if chunk.len() == CONTINUATION_CHUNK_BYTES {
            return Ok(None);
        }
        let message = self.buf.split().to_vec();
        Ok(Some(message))
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_bit_exact() {
        assert_eq!(FrameTag::Highest.as_bytes(), b"0008W01");
        assert_eq!(FrameTag::GetBlockRange.as_bytes(), b"0006R01");
        assert_eq!(SEPARATOR, b"[*]");
        for tag in FrameTag::ALL {
            assert_eq!(FrameTag::parse(tag.as_bytes()).unwrap(), tag);
        }
        assert!(matches!(
            FrameTag::parse(b"0042X99"),
            Err(CodecError::UnknownTag(_))
        ));
    }

    #[test]
    fn frame_layout() {
        let frame = encode_frame(FrameTag::GetBlockRange, b"5[*]8");
        assert_eq!(&frame[..7], b"0006R01");
        assert_eq!(&frame[7..10], b"[*]");
        assert_eq!(&frame[10..], b"5[*]8");

        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded.tag, FrameTag::GetBlockRange);
        assert_eq!(
            split_fields(&decoded.payload),
            vec![b"5" as &[u8], b"8" as &[u8]]
        );
    }

    #[test]
    fn empty_payload_frame() {
        let frame = encode_frame(FrameTag::GetHighest, b"");
        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded.tag, FrameTag::GetHighest);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn short_chunk_completes_immediately() {
        let mut assembler = ChunkAssembler::new();
        let out = assembler.push(b"0008R01[*]").unwrap();
        assert_eq!(out.unwrap(), b"0008R01[*]".to_vec());
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn continuation_chunks_concatenate() {
        let mut assembler = ChunkAssembler::new();
        let first = vec![b'a'; CONTINUATION_CHUNK_BYTES];
        let second = vec![b'b'; CONTINUATION_CHUNK_BYTES];
        assert!(assembler.push(&first).unwrap().is_none());
        assert!(assembler.push(&second).unwrap().is_none());
        let out = assembler.push(b"tail").unwrap().unwrap();
        assert_eq!(out.len(), 2 * CONTINUATION_CHUNK_BYTES + 4);
        assert_eq!(&out[..CONTINUATION_CHUNK_BYTES], &first[..]);
        assert_eq!(&out[out.len() - 4..], b"tail");
    }

    #[test]
    fn exact_multiple_waits_for_next_short_chunk() {
        // a message that ends on the continuation boundary does not
        // complete until something shorter arrives
        let mut assembler = ChunkAssembler::new();
        let chunk = vec![b'x'; CONTINUATION_CHUNK_BYTES];
        assert!(assembler.push(&chunk).unwrap().is_none());
        assert_eq!(assembler.pending(), CONTINUATION_CHUNK_BYTES);
        let out = assembler.push(b"y").unwrap().unwrap();
        assert_eq!(out.len(), CONTINUATION_CHUNK_BYTES + 1);
    }

    #[test]
    fn oversized_message_is_rejected() {
        let mut assembler = ChunkAssembler::new();
        let chunk = vec![b'x'; CONTINUATION_CHUNK_BYTES];
        let mut pushed = 0;
        loop {
            match assembler.push(&chunk) {
                Ok(None) => pushed += chunk.len(),
                Ok(Some(_)) => panic!("continuation chunks never complete"),
                Err(CodecError::MalformedFrame(_)) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
            assert!(pushed <= MAX_MESSAGE_BYTES + CONTINUATION_CHUNK_BYTES);
        }
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn separator_inside_field_bytes_still_splits() {
        // field splitting is byte-oriented; callers relying on raw bytes
        // must length-frame them (blocks do)
        let payload = join_fields(&[b"host", b"16061", b"peer"]);
        assert_eq!(payload, b"host[*]16061[*]peer".to_vec());
        assert_eq!(split_fields(&payload).len(), 3);
    }
}
