mod scheduler;

pub use scheduler::PieceWorkScheduler;

use crate::block::BlockId;
use std::collections::BTreeSet;

/// The set of blocks a leecher wants resident in the seeder's cache
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheHint {
    /// Strictly increasing per connection; 0 means no hint issued yet
    pub stamp: u64,
    pub blocks: BTreeSet<BlockId>,
}

/// Where a block currently sits in the leecher's life-cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Known, not yet part of any hint
    Wanted,
    /// Included in the latest hint, not yet confirmed
    PendingCache,
    /// Confirmed cached at the seeder, not yet started
    Cached,
    /// Pieces being requested and assembled
    Assembling,
    /// Fully assembled, waiting to be drained
    Completed,
}
