use crate::block::{BlockDetails, BlockId, PieceId};
use crate::storage::FetchedBlocks;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// A block held for one peer
#[derive(Debug, Clone)]
pub struct ServedEntry {
    pub data: Bytes,
    pub hash: Option<Bytes>,
    pub irregular: Option<BlockDetails>,
}

/// Blocks currently advertised as cached to one peer.
///
/// The cache owns one reference to each block buffer. Piece responses take
/// their own reference by slicing, which is released when the response is
/// dropped after sending.
#[derive(Debug)]
pub struct ServedBlockCache {
    default_details: BlockDetails,
    entries: BTreeMap<BlockId, ServedEntry>,
}

impl ServedBlockCache {
    pub fn new(default_details: BlockDetails) -> Self {
        Self {
            default_details,
            entries: BTreeMap::new(),
        }
    }

    /// Split a requested block set into `(to_fetch, to_evict)`
    pub fn diff(&self, requested: &BTreeSet<BlockId>) -> (BTreeSet<BlockId>, BTreeSet<BlockId>) {
        let served: BTreeSet<BlockId> = self.entries.keys().copied().collect();
        let to_fetch = requested.difference(&served).copied().collect();
        let to_evict = served.difference(requested).copied().collect();
        (to_fetch, to_evict)
    }

    /// Release the given blocks, returns how many were held
    pub fn evict(&mut self, blocks: &BTreeSet<BlockId>) -> usize {
        let mut released = 0;
        for block in blocks {
            if self.entries.remove(block).is_some() {
                released += 1;
            }
        }
        if released > 0 {
            debug!("Evicted {} blocks", released);
        }
        released
    }

    /// Take ownership of fetched blocks, restricted to `wanted`
    pub fn merge(&mut self, mut fetched: FetchedBlocks, wanted: &BTreeSet<BlockId>) {
        for (block, data) in std::mem::take(&mut fetched.blocks) {
            if !wanted.contains(&block) {
                continue;
            }
            self.entries.insert(
                block,
                ServedEntry {
                    data,
                    hash: fetched.hashes.remove(&block),
                    irregular: fetched.irregular.remove(&block),
                },
            );
        }
    }

    pub fn insert(&mut self, block: BlockId, entry: ServedEntry) {
        self.entries.insert(block, entry);
    }

    /// Bytes of one piece, sharing the cached buffer
    pub fn piece(&self, piece: PieceId) -> Option<Bytes> {
        let entry = self.entries.get(&piece.block)?;
        let details = entry.irregular.unwrap_or(self.default_details);

        if !details.contains(piece.index) {
            return None;
        }

        let range = details.piece_range(piece.index);
        if range.end > entry.data.len() {
            return None;
        }

        Some(entry.data.slice(range))
    }

    /// Hashes of all `blocks`, or `None` if any is missing
    pub fn hashes(&self, blocks: &BTreeSet<BlockId>) -> Option<BTreeMap<BlockId, Bytes>> {
        blocks
            .iter()
            .map(|block| {
                let hash = self.entries.get(block)?.hash.clone()?;
                Some((*block, hash))
            })
            .collect()
    }

    #[cfg(test)]
    pub fn contains(&self, block: BlockId) -> bool {
        self.entries.contains_key(&block)
    }

    #[cfg(test)]
    pub fn blocks(&self) -> BTreeSet<BlockId> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Release every held block
    pub fn clear(&mut self) -> usize {
        let released = self.entries.len();
        self.entries.clear();
        released
    }
}
