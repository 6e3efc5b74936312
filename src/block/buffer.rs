use super::{BlockDetails, BlockId};
use crate::error::{Result, TransferError};
use bytes::{Bytes, BytesMut};

/// Assembles the pieces of one block into a contiguous buffer
#[derive(Debug)]
pub struct BlockBuffer {
    block: BlockId,
    details: BlockDetails,
    data: BytesMut,
    written: Vec<bool>,
    remaining: u32,
}

impl BlockBuffer {
    pub fn new(block: BlockId, details: BlockDetails) -> Self {
        Self {
            block,
            details,
            data: BytesMut::zeroed(details.block_size as usize),
            written: vec![false; details.nr_pieces as usize],
            remaining: details.nr_pieces,
        }
    }

    pub fn details(&self) -> &BlockDetails {
        &self.details
    }

    /// Write a piece into the buffer.
    ///
    /// Returns `Ok(true)` if the piece was new, `Ok(false)` if the index had
    /// already been written (the buffer is left untouched). Panics on an index
    /// outside the block.
    pub fn write_piece(&mut self, index: u32, bytes: &[u8]) -> Result<bool> {
        assert!(
            self.details.contains(index),
            "piece index {} out of range for block {} ({} pieces)",
            index,
            self.block,
            self.details.nr_pieces
        );

        if self.written[index as usize] {
            return Ok(false);
        }

        let range = self.details.piece_range(index);
        if bytes.len() != range.len() {
            return Err(TransferError::Codec(format!(
                "piece {}:{} has {} bytes, expected {}",
                self.block,
                index,
                bytes.len(),
                range.len()
            )));
        }

        self.data[range].copy_from_slice(bytes);
        self.written[index as usize] = true;
        self.remaining -= 1;

        Ok(true)
    }

    #[cfg(test)]
    pub fn has_piece(&self, index: u32) -> bool {
        self.written.get(index as usize).copied().unwrap_or(false)
    }

    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }

    /// Indices not yet written, ascending
    #[cfg(test)]
    pub fn missing(&self) -> impl Iterator<Item = u32> + '_ {
        self.written
            .iter()
            .enumerate()
            .filter(|(_, written)| !**written)
            .map(|(index, _)| index as u32)
    }

    /// Consume a complete buffer and return the assembled block
    pub fn take_bytes(self) -> Bytes {
        assert!(
            self.is_complete(),
            "block {} taken with {} pieces missing",
            self.block,
            self.remaining
        );
        self.data.freeze()
    }
}
