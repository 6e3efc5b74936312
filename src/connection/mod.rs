//! Per-connection protocol engines
//!
//! `DownloadConnection` and `UploadConnection` are synchronous state
//! machines: every inbound event is applied in one call and the resulting
//! outbound messages are collected for the caller. The `actor` module runs
//! each of them as its own task.

mod actor;
mod cache;
mod download;
mod upload;

pub use actor::{spawn_download, spawn_upload, DownloadHandle};
pub use download::DownloadConnection;
pub use upload::{UploadAction, UploadConnection, UploadStats};

use crate::block::{BlockDetails, BlockId};
use crate::peer::{FileId, PeerId, WireMessage};
use bytes::Bytes;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// A message to send plus how the transport should retry it
#[derive(Debug, Clone)]
pub struct Outbound {
    pub message: WireMessage,
    /// Per-attempt timeout
    pub timeout: Duration,
    /// Retransmissions before the timeout is surfaced
    pub retries: u32,
}

/// Periodic telemetry of a download connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionReport {
    pub file: u64,
    pub peer: String,
    pub queue_delay: Duration,
    pub window_adjustment: i64,
    pub window: u64,
    pub in_flight: u64,
    pub pieces_received: u64,
    pub late_pieces: u64,
    pub timeouts: u64,
}

impl ConnectionReport {
    pub(crate) fn new(file: FileId, peer: PeerId) -> Self {
        Self {
            file: file.0,
            peer: peer.to_string(),
            queue_delay: Duration::ZERO,
            window_adjustment: 0,
            window: 0,
            in_flight: 0,
            pieces_received: 0,
            late_pieces: 0,
            timeouts: 0,
        }
    }
}

/// Upward events of a download connection
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    /// Fully assembled blocks
    Completed(BTreeMap<BlockId, Bytes>),
    /// Block hashes delivered by the peer
    Hashes(BTreeMap<BlockId, Bytes>),
    /// Hashes that can no longer be requested on this connection
    HashesUnavailable(BTreeSet<BlockId>),
    Report(ConnectionReport),
}

/// Blocks to download and the layout of irregular ones
#[derive(Debug, Clone, Default)]
pub struct WantedBlocks {
    pub blocks: Vec<BlockId>,
    pub irregular: BTreeMap<BlockId, BlockDetails>,
}
