//! Typed view over the wire frames.
//!
//! One enum for the whole protocol; encoding produces the full frame bytes
//! and decoding is exhaustive over the tag table in `frame`.

use crate::block::codec::{decode_block, decode_block_list, encode_block, encode_block_list};
use crate::block::types::CompositeBlock;
use crate::error::CodecError;
use crate::network::frame::{
    decode_frame, encode_frame, join_fields, parse_ascii_u64, split_fields, FrameTag,
};

#[derive(Clone, Debug, PartialEq)]
pub enum ProtocolMessage {
    /// Who is dialing: reachable host, port, and base58 peer id.
    Intro {
        host: String,
        port: u16,
        peer_id: String,
    },
    ListServices,
    /// Reply to `ListServices`: the tags this node speaks.
    Services(Vec<String>),
    /// Full-sync range request, inclusive bounds.
    GetBlockRange { low: u64, high: u64 },
    BlockList(Vec<CompositeBlock>),
    GetHighest,
    /// Tip response and unsolicited new-block announcement.
    Highest(CompositeBlock),
    /// Selective-sync range request.
    GetMultiverse { low: u64, high: u64 },
    MultiverseList(Vec<CompositeBlock>),
}

impl ProtocolMessage {
    pub fn tag(&self) -> FrameTag {
        match self {
            ProtocolMessage::Intro { .. } => FrameTag::Intro,
            ProtocolMessage::ListServices | ProtocolMessage::Services(_) => FrameTag::ListServices,
            ProtocolMessage::GetBlockRange { .. } => FrameTag::GetBlockRange,
            ProtocolMessage::BlockList(_) => FrameTag::BlockList,
            ProtocolMessage::GetHighest => FrameTag::GetHighest,
            ProtocolMessage::Highest(_) => FrameTag::Highest,
            ProtocolMessage::GetMultiverse { .. } => FrameTag::GetMultiverse,
            ProtocolMessage::MultiverseList(_) => FrameTag::MultiverseList,
        }
    }

    /// Full frame bytes, ready for the transport.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let payload = match self {
            ProtocolMessage::Intro {
                host,
                port,
                peer_id,
            } => join_fields(&[
                host.as_bytes(),
                port.to_string().as_bytes(),
                peer_id.as_bytes(),
            ]),
            ProtocolMessage::ListServices => Vec::new(),
            ProtocolMessage::Services(tags) => {
                let fields: Vec<&[u8]> = tags.iter().map(|t| t.as_bytes()).collect();
                join_fields(&fields)
            }
            ProtocolMessage::GetBlockRange { low, high }
            | ProtocolMessage::GetMultiverse { low, high } => {
                join_fields(&[low.to_string().as_bytes(), high.to_string().as_bytes()])
            }
            ProtocolMessage::BlockList(blocks) | ProtocolMessage::MultiverseList(blocks) => {
                encode_block_list(blocks)?
            }
            ProtocolMessage::GetHighest => Vec::new(),
            ProtocolMessage::Highest(block) => encode_block(block)?,
        };
        Ok(encode_frame(self.tag(), &payload))
    }

    /// Parse a complete reassembled message.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let frame = decode_frame(buf)?;
        match frame.tag {
            FrameTag::Intro => {
                let fields = split_fields(&frame.payload);
                if fields.len() != 3 {
                    return Err(CodecError::MalformedFrame(format!(
                        "intro carries {} fields, expected 3",
                        fields.len()
                    )));
                }
                Ok(ProtocolMessage::Intro {
                    host: String::from_utf8_lossy(fields[0]).to_string(),
                    port: parse_ascii_u64(fields[1])? as u16,
                    peer_id: String::from_utf8_lossy(fields[2]).to_string(),
                })
            }
            FrameTag::ListServices => {
                if frame.payload.is_empty() {
                    Ok(ProtocolMessage::ListServices)
                } else {
                    let tags = split_fields(&frame.payload)
                        .into_iter()
                        .map(|f| String::from_utf8_lossy(f).to_string())
                        .collect();
                    Ok(ProtocolMessage::Services(tags))
                }
            }
            FrameTag::GetBlockRange | FrameTag::GetMultiverse => {
                let fields = split_fields(&frame.payload);
                if fields.len() != 2 {
                    return Err(CodecError::MalformedFrame(format!(
                        "range request carries {} fields, expected 2",
                        fields.len()
                    )));
                }
                let low = parse_ascii_u64(fields[0])?;
                let high = parse_ascii_u64(fields[1])?;
                Ok(match frame.tag {
                    FrameTag::GetBlockRange => ProtocolMessage::GetBlockRange { low, high },
                    _ => ProtocolMessage::GetMultiverse { low, high },
                })
            }
            FrameTag::BlockList => Ok(ProtocolMessage::BlockList(decode_block_list(
                &frame.payload,
            )?)),
            FrameTag::GetHighest => Ok(ProtocolMessage::GetHighest),
            FrameTag::Highest => {
                let (block, consumed) = decode_block(&frame.payload)?;
                if consumed != frame.payload.len() {
                    return Err(CodecError::MalformedFrame(
                        "trailing bytes after highest block".to_string(),
                    ));
                }
                Ok(ProtocolMessage::Highest(block))
            }
            FrameTag::MultiverseList => Ok(ProtocolMessage::MultiverseList(decode_block_list(
                &frame.payload,
            )?)),
        }
    }
}
