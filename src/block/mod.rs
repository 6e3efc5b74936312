mod buffer;

pub use buffer::BlockBuffer;

use crate::error::{Result, TransferError};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

/// Standard piece size (16 KB)
pub const DEFAULT_PIECE_SIZE: u32 = 16 * 1024;

/// Standard block size (1 MB, 64 pieces)
pub const DEFAULT_BLOCK_SIZE: u32 = 64 * DEFAULT_PIECE_SIZE;

/// Identifies a block within a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a piece: a block plus the piece index inside it.
///
/// Ordering is by block first, then index, which is the order pieces are
/// requested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceId {
    pub block: BlockId,
    pub index: u32,
}

impl PieceId {
    pub fn new(block: BlockId, index: u32) -> Self {
        Self { block, index }
    }
}

impl fmt::Display for PieceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block.0, self.index)
    }
}

/// Layout of a single block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDetails {
    pub block_size: u32,
    pub nr_pieces: u32,
    pub piece_size: u32,
    pub last_piece_size: u32,
}

impl BlockDetails {
    pub fn new(block_size: u32, piece_size: u32) -> Self {
        assert!(piece_size > 0, "piece size must be non-zero");

        let nr_pieces = block_size.div_ceil(piece_size);
        let last_piece_size = if nr_pieces == 0 {
            0
        } else {
            block_size - (nr_pieces - 1) * piece_size
        };

        Self {
            block_size,
            nr_pieces,
            piece_size,
            last_piece_size,
        }
    }

    /// Byte length of the piece at `index`
    pub fn piece_len(&self, index: u32) -> u32 {
        if index + 1 == self.nr_pieces {
            self.last_piece_size
        } else {
            self.piece_size
        }
    }

    /// Byte range of the piece at `index` within the block
    pub fn piece_range(&self, index: u32) -> Range<usize> {
        let start = index as usize * self.piece_size as usize;
        start..start + self.piece_len(index) as usize
    }

    pub fn contains(&self, index: u32) -> bool {
        index < self.nr_pieces
    }
}

/// Block layout of a whole file: a default block plus irregular overrides
#[derive(Debug, Clone)]
pub struct FileLayout {
    file_len: u64,
    nr_blocks: u32,
    default: BlockDetails,
    overrides: BTreeMap<BlockId, BlockDetails>,
}

impl FileLayout {
    pub fn new(file_len: u64, block_size: u32, piece_size: u32) -> Result<Self> {
        if block_size == 0 || piece_size == 0 {
            return Err(TransferError::Config(
                "block and piece sizes must be non-zero".to_string(),
            ));
        }

        let default = BlockDetails::new(block_size, piece_size);
        let nr_blocks = u32::try_from(file_len.div_ceil(block_size as u64)).map_err(|_| {
            TransferError::Config(format!(
                "{} bytes is more than {} blocks of {} bytes",
                file_len,
                u32::MAX,
                block_size
            ))
        })?;

        let mut overrides = BTreeMap::new();
        // Below block_size, so it fits
        let remainder = (file_len % block_size as u64) as u32;
        if remainder != 0 {
            // Last block might be smaller
            overrides.insert(
                BlockId(nr_blocks - 1),
                BlockDetails::new(remainder, piece_size),
            );
        }

        Ok(Self {
            file_len,
            nr_blocks,
            default,
            overrides,
        })
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    pub fn nr_blocks(&self) -> u32 {
        self.nr_blocks
    }

    pub fn default_details(&self) -> BlockDetails {
        self.default
    }

    pub fn overrides(&self) -> &BTreeMap<BlockId, BlockDetails> {
        &self.overrides
    }

    pub fn details(&self, block: BlockId) -> BlockDetails {
        self.overrides.get(&block).copied().unwrap_or(self.default)
    }

    /// Byte offset of a block within the file
    pub fn block_offset(&self, block: BlockId) -> u64 {
        block.0 as u64 * self.default.block_size as u64
    }

    pub fn contains(&self, block: BlockId) -> bool {
        block.0 < self.nr_blocks
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> {
        (0..self.nr_blocks).map(BlockId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regular_details() {
        let details = BlockDetails::new(64, 16);
        assert_eq!(details.nr_pieces, 4);
        assert_eq!(details.last_piece_size, 16);
        assert_eq!(details.piece_range(3), 48..64);
    }

    #[test]
    fn test_irregular_details() {
        let details = BlockDetails::new(50, 16);
        assert_eq!(details.nr_pieces, 4);
        assert_eq!(details.last_piece_size, 2);
        assert_eq!(details.piece_len(0), 16);
        assert_eq!(details.piece_len(3), 2);
        assert_eq!(details.piece_range(3), 48..50);
    }

    #[test]
    fn test_piece_ordering() {
        let a = PieceId::new(BlockId(1), 7);
        let b = PieceId::new(BlockId(2), 0);
        let c = PieceId::new(BlockId(2), 1);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_file_layout_last_block_override() {
        let layout = FileLayout::new(100, 32, 8).unwrap();
        assert_eq!(layout.nr_blocks(), 4);
        assert_eq!(layout.details(BlockId(0)), BlockDetails::new(32, 8));
        assert_eq!(layout.details(BlockId(3)), BlockDetails::new(4, 8));
        assert_eq!(layout.overrides().len(), 1);
        assert_eq!(layout.block_offset(BlockId(3)), 96);
    }

    #[test]
    fn test_file_layout_exact_multiple() {
        let layout = FileLayout::new(96, 32, 8).unwrap();
        assert_eq!(layout.nr_blocks(), 3);
        assert!(layout.overrides().is_empty());
        assert!(!layout.contains(BlockId(3)));
    }

    #[test]
    fn test_file_layout_rejects_zero_sizes() {
        assert!(matches!(
            FileLayout::new(96, 0, 8),
            Err(TransferError::Config(_))
        ));
        assert!(matches!(
            FileLayout::new(96, 32, 0),
            Err(TransferError::Config(_))
        ));
    }

    #[test]
    fn test_file_layout_rejects_too_many_blocks() {
        // One byte per block past the block id range
        let file_len = u32::MAX as u64 + 2;
        assert!(matches!(
            FileLayout::new(file_len, 1, 1),
            Err(TransferError::Config(_))
        ));

        let layout = FileLayout::new(u32::MAX as u64, 1, 1).unwrap();
        assert_eq!(layout.nr_blocks(), u32::MAX);
        assert!(layout.overrides().is_empty());
    }
}
