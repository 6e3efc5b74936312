use super::{BlockState, CacheHint};
use crate::block::{BlockBuffer, BlockDetails, BlockId, PieceId};
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, info, warn};

/// Outcome of writing a received piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteOutcome {
    Written,
    Duplicate,
    Rejected,
    UnknownBlock,
}

/// Leecher-side piece scheduling for one connection.
///
/// Blocks move through `Wanted -> PendingCache -> Cached -> Assembling ->
/// Completed` and are forgotten once drained. A piece is either queued for
/// sending or in flight, never both.
pub struct PieceWorkScheduler {
    default_details: BlockDetails,
    overrides: BTreeMap<BlockId, BlockDetails>,
    /// Every block not yet drained
    known: BTreeSet<BlockId>,
    next_blocks: VecDeque<BlockId>,
    pending_cache_blocks: VecDeque<BlockId>,
    cached_blocks: VecDeque<BlockId>,
    ongoing_blocks: BTreeMap<BlockId, BlockBuffer>,
    completed_blocks: BTreeMap<BlockId, Bytes>,
    to_send: BTreeSet<PieceId>,
    in_flight: BTreeSet<PieceId>,
    last_hint: CacheHint,
    hint_dirty: bool,
    hint_confirmed: bool,
}

impl PieceWorkScheduler {
    pub fn new(default_details: BlockDetails) -> Self {
        Self {
            default_details,
            overrides: BTreeMap::new(),
            known: BTreeSet::new(),
            next_blocks: VecDeque::new(),
            pending_cache_blocks: VecDeque::new(),
            cached_blocks: VecDeque::new(),
            ongoing_blocks: BTreeMap::new(),
            completed_blocks: BTreeMap::new(),
            to_send: BTreeSet::new(),
            in_flight: BTreeSet::new(),
            last_hint: CacheHint::default(),
            hint_dirty: false,
            hint_confirmed: true,
        }
    }

    /// Register newly wanted blocks. Blocks already tracked are ignored.
    pub fn add(
        &mut self,
        blocks: impl IntoIterator<Item = BlockId>,
        irregular: impl IntoIterator<Item = (BlockId, BlockDetails)>,
    ) {
        self.overrides.extend(irregular);

        let mut added = 0;
        for block in blocks {
            if self.known.insert(block) {
                self.next_blocks.push_back(block);
                added += 1;
            }
        }

        if added > 0 {
            debug!("Added {} wanted blocks", added);
            self.hint_dirty = true;
        }
    }

    pub fn has_new_hint(&self) -> bool {
        self.hint_confirmed && self.hint_dirty
    }

    /// Build the next cache hint. Must only be called when `has_new_hint()`.
    pub fn new_hint(&mut self) -> CacheHint {
        assert!(
            self.hint_confirmed,
            "cache hint {} is still unconfirmed",
            self.last_hint.stamp
        );

        self.pending_cache_blocks.extend(self.next_blocks.drain(..));

        let mut blocks: BTreeSet<BlockId> = self.ongoing_blocks.keys().copied().collect();
        blocks.extend(self.cached_blocks.iter().copied());
        blocks.extend(self.pending_cache_blocks.iter().copied());

        self.last_hint = CacheHint {
            stamp: self.last_hint.stamp + 1,
            blocks,
        };
        self.hint_dirty = false;
        self.hint_confirmed = false;

        debug!(
            "Issued cache hint {} for {} blocks",
            self.last_hint.stamp,
            self.last_hint.blocks.len()
        );

        self.last_hint.clone()
    }

    /// The seeder acknowledged the last issued hint
    pub fn cache_confirmed(&mut self) {
        let hinted = &self.last_hint.blocks;
        let (confirmed, still_pending): (VecDeque<_>, VecDeque<_>) = self
            .pending_cache_blocks
            .drain(..)
            .partition(|block| hinted.contains(block));

        self.cached_blocks.extend(confirmed);
        self.pending_cache_blocks = still_pending;
        self.hint_confirmed = true;

        debug!(
            "Cache hint {} confirmed, {} blocks cached",
            self.last_hint.stamp,
            self.cached_blocks.len()
        );
    }

    /// Whether a piece is ready to be requested, activating the next cached
    /// block if nothing is queued.
    pub fn has_next_piece(&mut self) -> bool {
        while self.to_send.is_empty() {
            let Some(block) = self.cached_blocks.pop_front() else {
                break;
            };
            self.activate(block);
        }
        !self.to_send.is_empty()
    }

    fn activate(&mut self, block: BlockId) {
        let details = self.details(block);
        let buffer = BlockBuffer::new(block, details);

        if buffer.is_complete() {
            // Empty block, nothing to request
            self.complete(block, buffer);
            return;
        }

        self.to_send
            .extend((0..details.nr_pieces).map(|index| PieceId::new(block, index)));
        self.ongoing_blocks.insert(block, buffer);

        debug!("Started block {} ({} pieces)", block, details.nr_pieces);
    }

    /// Pop the next piece to request and mark it in flight
    pub fn next(&mut self) -> Option<PieceId> {
        let piece = self.to_send.pop_first()?;
        self.in_flight.insert(piece);
        Some(piece)
    }

    /// A request for `piece` timed out; queue it again if still unresolved
    pub fn piece_timeout(&mut self, piece: PieceId) {
        if self.in_flight.remove(&piece) {
            self.to_send.insert(piece);
        }
    }

    /// An on-time response for `piece`
    pub fn piece(&mut self, piece: PieceId, bytes: &[u8]) {
        if !self.in_flight.remove(&piece) {
            return;
        }

        if self.write(piece, bytes) == WriteOutcome::Rejected {
            self.to_send.insert(piece);
        }
    }

    /// A response for `piece` whose request had already timed out
    pub fn late_piece(&mut self, piece: PieceId, bytes: &[u8]) {
        match self.write(piece, bytes) {
            WriteOutcome::Written | WriteOutcome::Duplicate => {
                self.to_send.remove(&piece);
                self.in_flight.remove(&piece);
            }
            WriteOutcome::Rejected | WriteOutcome::UnknownBlock => {}
        }
    }

    fn write(&mut self, piece: PieceId, bytes: &[u8]) -> WriteOutcome {
        let Some(buffer) = self.ongoing_blocks.get_mut(&piece.block) else {
            return WriteOutcome::UnknownBlock;
        };

        if !buffer.details().contains(piece.index) {
            warn!("Dropping piece {} outside its block", piece);
            return WriteOutcome::Rejected;
        }

        match buffer.write_piece(piece.index, bytes) {
            Ok(true) => {}
            Ok(false) => return WriteOutcome::Duplicate,
            Err(e) => {
                warn!("Rejected piece {}: {}", piece, e);
                return WriteOutcome::Rejected;
            }
        }

        if buffer.is_complete() {
            if let Some(buffer) = self.ongoing_blocks.remove(&piece.block) {
                self.complete(piece.block, buffer);
            }
        }

        WriteOutcome::Written
    }

    fn complete(&mut self, block: BlockId, buffer: BlockBuffer) {
        self.completed_blocks.insert(block, buffer.take_bytes());
        // The seeder can drop it from its cache on the next hint
        self.hint_dirty = true;
        info!("Block {} complete", block);
    }

    pub fn has_complete(&self) -> bool {
        !self.completed_blocks.is_empty()
    }

    /// Remove and return every completed block
    pub fn drain_complete(&mut self) -> BTreeMap<BlockId, Bytes> {
        let completed = std::mem::take(&mut self.completed_blocks);
        for block in completed.keys() {
            self.known.remove(block);
        }
        completed
    }

    pub fn details(&self, block: BlockId) -> BlockDetails {
        self.overrides
            .get(&block)
            .copied()
            .unwrap_or(self.default_details)
    }

    pub fn block_state(&self, block: BlockId) -> Option<BlockState> {
        if self.completed_blocks.contains_key(&block) {
            Some(BlockState::Completed)
        } else if self.ongoing_blocks.contains_key(&block) {
            Some(BlockState::Assembling)
        } else if self.cached_blocks.contains(&block) {
            Some(BlockState::Cached)
        } else if self.pending_cache_blocks.contains(&block) {
            Some(BlockState::PendingCache)
        } else if self.next_blocks.contains(&block) {
            Some(BlockState::Wanted)
        } else {
            None
        }
    }

    #[cfg(test)]
    pub fn is_in_flight(&self, piece: PieceId) -> bool {
        self.in_flight.contains(&piece)
    }

    #[cfg(test)]
    pub fn is_queued(&self, piece: PieceId) -> bool {
        self.to_send.contains(&piece)
    }

    /// Number of blocks not yet drained
    pub fn outstanding_blocks(&self) -> usize {
        self.known.len()
    }
}
