use super::cache::ServedBlockCache;
use crate::block::{BlockDetails, BlockId};
use crate::error::Result;
use crate::peer::{ConnectionIdentity, WireMessage};
use crate::storage::FetchedBlocks;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Something the seeder engine wants done on its behalf
#[derive(Debug, Clone)]
pub enum UploadAction {
    Send(WireMessage),
    /// Read these blocks from the backing source and hand them to `on_fetched`
    Fetch(BTreeSet<BlockId>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadStats {
    pub pieces_served: u64,
    pub bytes_served: u64,
    pub pieces_dropped: u64,
    pub hash_batches_dropped: u64,
}

/// A hint whose answer waits for the backing source
#[derive(Debug)]
struct PendingNegotiation {
    id: u64,
    stamp: u64,
    fetching: BTreeSet<BlockId>,
}

/// Seeder-side protocol engine for one connection
pub struct UploadConnection {
    identity: ConnectionIdentity,
    cache: ServedBlockCache,
    pending: Option<PendingNegotiation>,
    last_stamp: u64,
    actions: Vec<UploadAction>,
    stats: UploadStats,
}

impl UploadConnection {
    pub fn new(identity: ConnectionIdentity, default_details: BlockDetails) -> Self {
        Self {
            identity,
            cache: ServedBlockCache::new(default_details),
            pending: None,
            last_stamp: 0,
            actions: Vec::new(),
            stats: UploadStats::default(),
        }
    }

    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    #[cfg(test)]
    pub fn cache(&self) -> &ServedBlockCache {
        &self.cache
    }

    #[cfg(test)]
    pub fn cache_mut(&mut self) -> &mut ServedBlockCache {
        &mut self.cache
    }

    pub fn stats(&self) -> UploadStats {
        self.stats
    }

    #[cfg(test)]
    pub fn is_negotiating(&self) -> bool {
        self.pending.is_some()
    }

    pub fn take_actions(&mut self) -> Vec<UploadAction> {
        std::mem::take(&mut self.actions)
    }

    /// Apply one inbound message
    pub fn on_message(&mut self, message: WireMessage) {
        if message.file() != self.identity.file {
            warn!(
                "Dropping {} for file {}, connection serves {}",
                message.name(),
                message.file(),
                self.identity.file
            );
            return;
        }

        match message {
            WireMessage::CacheHintRequest {
                id, stamp, blocks, ..
            } => self.on_cache_hint(id, stamp, blocks),
            WireMessage::PieceRequest {
                id, piece, echo, ..
            } => {
                let Some(data) = self.cache.piece(piece) else {
                    // The peer times out and asks again
                    debug!("Dropping request for piece {} not in cache", piece);
                    self.stats.pieces_dropped += 1;
                    return;
                };

                self.stats.pieces_served += 1;
                self.stats.bytes_served += data.len() as u64;
                self.send(WireMessage::PieceResponse {
                    id,
                    file: self.identity.file,
                    piece,
                    echo,
                    data,
                });
            }
            WireMessage::HashRequest { id, blocks, .. } => match self.cache.hashes(&blocks) {
                Some(hashes) => self.send(WireMessage::HashResponse {
                    id,
                    file: self.identity.file,
                    hashes,
                }),
                None => {
                    debug!("Dropping hash batch of {} blocks, some missing", blocks.len());
                    self.stats.hash_batches_dropped += 1;
                }
            },
            other => {
                warn!("Unexpected {} on upload connection", other.name());
            }
        }
    }

    fn on_cache_hint(&mut self, id: u64, stamp: u64, blocks: BTreeSet<BlockId>) {
        if let Some(pending) = &self.pending {
            debug!(
                "Cache hint {} arrived while {} is negotiating",
                stamp, pending.stamp
            );
            return;
        }

        if stamp < self.last_stamp {
            // Duplicate of an already applied hint
            self.answer_hint(id, stamp, true);
            return;
        }

        let (to_fetch, to_evict) = self.cache.diff(&blocks);
        self.cache.evict(&to_evict);
        self.last_stamp = stamp;

        debug!(
            "Cache hint {}: {} to fetch, {} evicted, {} served",
            stamp,
            to_fetch.len(),
            to_evict.len(),
            self.cache.len()
        );

        if to_fetch.is_empty() {
            self.answer_hint(id, stamp, true);
            return;
        }

        self.pending = Some(PendingNegotiation {
            id,
            stamp,
            fetching: to_fetch.clone(),
        });
        self.actions.push(UploadAction::Fetch(to_fetch));
    }

    /// The backing source finished a fetch
    pub fn on_fetched(&mut self, result: Result<FetchedBlocks>) {
        let Some(pending) = self.pending.take() else {
            warn!("Fetch completed without a pending cache hint");
            return;
        };

        let ok = match result {
            Ok(fetched) if fetched.covers(&pending.fetching) => {
                self.cache.merge(fetched, &pending.fetching);
                true
            }
            Ok(fetched) => {
                warn!(
                    "Backing source delivered {} of {} blocks for hint {}",
                    fetched.blocks.len(),
                    pending.fetching.len(),
                    pending.stamp
                );
                self.cache.merge(fetched, &pending.fetching);
                false
            }
            Err(e) => {
                warn!("Backing source failed for hint {}: {}", pending.stamp, e);
                false
            }
        };

        self.answer_hint(pending.id, pending.stamp, ok);
    }

    fn answer_hint(&mut self, id: u64, stamp: u64, ok: bool) {
        self.send(WireMessage::CacheHintResponse {
            id,
            file: self.identity.file,
            stamp,
            ok,
        });
    }

    fn send(&mut self, message: WireMessage) {
        self.actions.push(UploadAction::Send(message));
    }

    /// Release every cached block. Returns the number released.
    pub fn close(&mut self) -> usize {
        self.pending = None;
        self.actions.clear();
        let released = self.cache.clear();
        info!(
            "Upload connection closed: {} pieces served, {} blocks released",
            self.stats.pieces_served, released
        );
        released
    }
}
