use super::FileId;
use crate::block::{BlockId, PieceId};
use crate::error::{Result, TransferError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::{BTreeMap, BTreeSet};

/// Messages exchanged on a piece-transfer connection.
///
/// Every message carries the correlation id of the request it belongs to
/// and the file the connection transfers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// Blocks the leecher wants cached at the seeder
    CacheHintRequest {
        id: u64,
        file: FileId,
        stamp: u64,
        blocks: BTreeSet<BlockId>,
    },
    CacheHintResponse {
        id: u64,
        file: FileId,
        stamp: u64,
        ok: bool,
    },
    /// `echo` is the requester's send timestamp, returned untouched
    PieceRequest {
        id: u64,
        file: FileId,
        piece: PieceId,
        echo: u64,
    },
    PieceResponse {
        id: u64,
        file: FileId,
        piece: PieceId,
        echo: u64,
        data: Bytes,
    },
    HashRequest {
        id: u64,
        file: FileId,
        blocks: BTreeSet<BlockId>,
    },
    HashResponse {
        id: u64,
        file: FileId,
        hashes: BTreeMap<BlockId, Bytes>,
    },
}

impl WireMessage {
    /// Message type IDs
    const CACHE_HINT_REQUEST: u8 = 1;
    const CACHE_HINT_RESPONSE: u8 = 2;
    const PIECE_REQUEST: u8 = 3;
    const PIECE_RESPONSE: u8 = 4;
    const HASH_REQUEST: u8 = 5;
    const HASH_RESPONSE: u8 = 6;

    /// kind + id + file
    const HEADER_LEN: usize = 1 + 8 + 8;

    pub fn id(&self) -> u64 {
        match self {
            WireMessage::CacheHintRequest { id, .. }
            | WireMessage::CacheHintResponse { id, .. }
            | WireMessage::PieceRequest { id, .. }
            | WireMessage::PieceResponse { id, .. }
            | WireMessage::HashRequest { id, .. }
            | WireMessage::HashResponse { id, .. } => *id,
        }
    }

    pub fn file(&self) -> FileId {
        match self {
            WireMessage::CacheHintRequest { file, .. }
            | WireMessage::CacheHintResponse { file, .. }
            | WireMessage::PieceRequest { file, .. }
            | WireMessage::PieceResponse { file, .. }
            | WireMessage::HashRequest { file, .. }
            | WireMessage::HashResponse { file, .. } => *file,
        }
    }

    fn kind(&self) -> u8 {
        match self {
            WireMessage::CacheHintRequest { .. } => Self::CACHE_HINT_REQUEST,
            WireMessage::CacheHintResponse { .. } => Self::CACHE_HINT_RESPONSE,
            WireMessage::PieceRequest { .. } => Self::PIECE_REQUEST,
            WireMessage::PieceResponse { .. } => Self::PIECE_RESPONSE,
            WireMessage::HashRequest { .. } => Self::HASH_REQUEST,
            WireMessage::HashResponse { .. } => Self::HASH_RESPONSE,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            WireMessage::CacheHintRequest { .. } => "cache-hint-request",
            WireMessage::CacheHintResponse { .. } => "cache-hint-response",
            WireMessage::PieceRequest { .. } => "piece-request",
            WireMessage::PieceResponse { .. } => "piece-response",
            WireMessage::HashRequest { .. } => "hash-request",
            WireMessage::HashResponse { .. } => "hash-response",
        }
    }

    /// Serialize message to bytes
    /// Format: <length prefix><message ID><correlation id><file id><payload>
    pub fn to_bytes(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(Self::HEADER_LEN + self.payload_len());
        body.put_u8(self.kind());
        body.put_u64(self.id());
        body.put_u64(self.file().0);

        match self {
            WireMessage::CacheHintRequest { stamp, blocks, .. } => {
                body.put_u64(*stamp);
                put_block_set(&mut body, blocks);
            }
            WireMessage::CacheHintResponse { stamp, ok, .. } => {
                body.put_u64(*stamp);
                body.put_u8(u8::from(*ok));
            }
            WireMessage::PieceRequest { piece, echo, .. } => {
                body.put_u32(piece.block.0);
                body.put_u32(piece.index);
                body.put_u64(*echo);
            }
            WireMessage::PieceResponse {
                piece, echo, data, ..
            } => {
                body.put_u32(piece.block.0);
                body.put_u32(piece.index);
                body.put_u64(*echo);
                body.put_slice(data);
            }
            WireMessage::HashRequest { blocks, .. } => {
                put_block_set(&mut body, blocks);
            }
            WireMessage::HashResponse { hashes, .. } => {
                body.put_u32(hashes.len() as u32);
                for (block, hash) in hashes {
                    body.put_u32(block.0);
                    body.put_u32(hash.len() as u32);
                    body.put_slice(hash);
                }
            }
        }

        let mut buf = BytesMut::with_capacity(4 + body.len());
        buf.put_u32(body.len() as u32);
        buf.put(body);
        buf.freeze()
    }

    fn payload_len(&self) -> usize {
        match self {
            WireMessage::CacheHintRequest { blocks, .. } => 8 + 4 + 4 * blocks.len(),
            WireMessage::CacheHintResponse { .. } => 8 + 1,
            WireMessage::PieceRequest { .. } => 16,
            WireMessage::PieceResponse { data, .. } => 16 + data.len(),
            WireMessage::HashRequest { blocks, .. } => 4 + 4 * blocks.len(),
            WireMessage::HashResponse { hashes, .. } => {
                4 + hashes.values().map(|h| 8 + h.len()).sum::<usize>()
            }
        }
    }

    /// Deserialize a message from one complete frame.
    ///
    /// Piece data is sliced out of `frame` without copying.
    pub fn from_bytes(mut frame: Bytes) -> Result<Self> {
        need(&frame, 4, "length prefix")?;
        let length = frame.get_u32() as usize;

        if frame.remaining() != length {
            return Err(TransferError::Codec(format!(
                "Frame length {} does not match {} bytes received",
                length,
                frame.remaining()
            )));
        }

        need(&frame, Self::HEADER_LEN, "header")?;
        let kind = frame.get_u8();
        let id = frame.get_u64();
        let file = FileId(frame.get_u64());

        match kind {
            Self::CACHE_HINT_REQUEST => {
                need(&frame, 8, "cache hint stamp")?;
                let stamp = frame.get_u64();
                let blocks = get_block_set(&mut frame)?;
                Ok(WireMessage::CacheHintRequest {
                    id,
                    file,
                    stamp,
                    blocks,
                })
            }
            Self::CACHE_HINT_RESPONSE => {
                need(&frame, 9, "cache hint response")?;
                let stamp = frame.get_u64();
                let ok = frame.get_u8() != 0;
                Ok(WireMessage::CacheHintResponse {
                    id,
                    file,
                    stamp,
                    ok,
                })
            }
            Self::PIECE_REQUEST => {
                need(&frame, 16, "piece request")?;
                let piece = PieceId::new(BlockId(frame.get_u32()), frame.get_u32());
                let echo = frame.get_u64();
                Ok(WireMessage::PieceRequest {
                    id,
                    file,
                    piece,
                    echo,
                })
            }
            Self::PIECE_RESPONSE => {
                need(&frame, 16, "piece response")?;
                let piece = PieceId::new(BlockId(frame.get_u32()), frame.get_u32());
                let echo = frame.get_u64();
                let data = frame.copy_to_bytes(frame.remaining());
                Ok(WireMessage::PieceResponse {
                    id,
                    file,
                    piece,
                    echo,
                    data,
                })
            }
            Self::HASH_REQUEST => {
                let blocks = get_block_set(&mut frame)?;
                Ok(WireMessage::HashRequest { id, file, blocks })
            }
            Self::HASH_RESPONSE => {
                need(&frame, 4, "hash count")?;
                let count = frame.get_u32();
                let mut hashes = BTreeMap::new();
                for _ in 0..count {
                    need(&frame, 8, "hash entry")?;
                    let block = BlockId(frame.get_u32());
                    let len = frame.get_u32() as usize;
                    need(&frame, len, "hash bytes")?;
                    hashes.insert(block, frame.copy_to_bytes(len));
                }
                Ok(WireMessage::HashResponse { id, file, hashes })
            }
            _ => Err(TransferError::Codec(format!("Unknown message ID: {}", kind))),
        }
    }
}

fn need(frame: &Bytes, len: usize, what: &str) -> Result<()> {
    if frame.remaining() < len {
        return Err(TransferError::Codec(format!("Truncated {}", what)));
    }
    Ok(())
}

fn put_block_set(buf: &mut BytesMut, blocks: &BTreeSet<BlockId>) {
    buf.put_u32(blocks.len() as u32);
    for block in blocks {
        buf.put_u32(block.0);
    }
}

fn get_block_set(frame: &mut Bytes) -> Result<BTreeSet<BlockId>> {
    need(frame, 4, "block count")?;
    let count = frame.get_u32() as usize;
    need(frame, count.saturating_mul(4), "block list")?;
    Ok((0..count).map(|_| BlockId(frame.get_u32())).collect())
}
