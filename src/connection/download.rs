use super::{ConnectionReport, DownloadEvent, Outbound, WantedBlocks};
use crate::block::{BlockDetails, BlockId, PieceId};
use crate::config::ConnectionConfig;
use crate::congestion::CongestionController;
use crate::error::{Result, TransferError};
use crate::peer::{ConnectionIdentity, WireMessage};
use crate::piece::{BlockState, PieceWorkScheduler};
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    CacheHint { stamp: u64 },
    Piece(PieceId),
    Hashes(BTreeSet<BlockId>),
}

/// A request still waiting for its answer
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub kind: RequestKind,
    pub sent_at: Instant,
}

/// Leecher-side protocol engine for one connection.
///
/// Requests are only tracked here by correlation id; an answer or timeout
/// for an id that is no longer pending was already resolved and is handed
/// to the scheduler's own dedup.
pub struct DownloadConnection<C> {
    identity: ConnectionIdentity,
    config: ConnectionConfig,
    scheduler: PieceWorkScheduler,
    congestion: C,
    pending: BTreeMap<u64, PendingRequest>,
    next_id: u64,
    /// Reference point of the echo timestamps in piece requests
    epoch: Instant,
    wanted_hashes: BTreeSet<BlockId>,
    outbox: Vec<Outbound>,
    events: Vec<DownloadEvent>,
    report: ConnectionReport,
}

impl<C: CongestionController> DownloadConnection<C> {
    pub fn new(
        identity: ConnectionIdentity,
        config: ConnectionConfig,
        default_details: BlockDetails,
        congestion: C,
    ) -> Self {
        Self {
            report: ConnectionReport::new(identity.file, identity.peer),
            identity,
            config,
            scheduler: PieceWorkScheduler::new(default_details),
            congestion,
            pending: BTreeMap::new(),
            next_id: 1,
            epoch: Instant::now(),
            wanted_hashes: BTreeSet::new(),
            outbox: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_pending(&self, id: u64) -> bool {
        self.pending.contains_key(&id)
    }

    /// Nothing wanted, nothing in flight
    #[cfg(test)]
    pub fn is_idle(&self) -> bool {
        self.scheduler.outstanding_blocks() == 0
            && self.wanted_hashes.is_empty()
            && self.pending.is_empty()
    }

    pub fn take_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    pub fn take_events(&mut self) -> Vec<DownloadEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn add_wanted(&mut self, wanted: WantedBlocks, now: Instant) {
        self.scheduler.add(wanted.blocks, wanted.irregular);
        self.try_download(now);
    }

    pub fn request_hashes(&mut self, blocks: impl IntoIterator<Item = BlockId>, now: Instant) {
        self.wanted_hashes.extend(blocks);
        self.try_download(now);
    }

    /// Advance timer tick
    pub fn tick(&mut self, now: Instant) {
        self.try_download(now);
    }

    /// Issue whatever the scheduler and the congestion window allow
    pub fn try_download(&mut self, now: Instant) {
        if self.scheduler.has_new_hint() {
            let hint = self.scheduler.new_hint();
            self.withdraw_evicted_hashes(&hint.blocks);
            let id = self.allocate_id();
            let message = WireMessage::CacheHintRequest {
                id,
                file: self.identity.file,
                stamp: hint.stamp,
                blocks: hint.blocks,
            };
            self.track(id, RequestKind::CacheHint { stamp: hint.stamp }, now);
            self.outbox.push(Outbound {
                message,
                timeout: self.config.hint_timeout,
                retries: self.config.hint_retries,
            });
        }

        self.try_request_hashes(now);

        while self.scheduler.has_next_piece() && self.congestion.can_send() {
            let Some(piece) = self.scheduler.next() else {
                break;
            };
            let id = self.allocate_id();
            let message = WireMessage::PieceRequest {
                id,
                file: self.identity.file,
                piece,
                echo: self.echo(now),
            };
            self.track(id, RequestKind::Piece(piece), now);
            self.outbox.push(Outbound {
                message,
                timeout: self.congestion.rto(),
                retries: 0,
            });
            self.congestion.request(now, self.config.mss);
        }
    }

    /// The seeder evicts every block a hint leaves out and only answers a
    /// hash batch it holds in full, so a batch naming an evicted block is
    /// withdrawn and its blocks classified again.
    fn withdraw_evicted_hashes(&mut self, hinted: &BTreeSet<BlockId>) {
        let evicted: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| match &p.kind {
                RequestKind::Hashes(blocks) => !blocks.is_subset(hinted),
                _ => false,
            })
            .map(|(id, _)| *id)
            .collect();

        for id in evicted {
            if let Some(PendingRequest {
                kind: RequestKind::Hashes(blocks),
                ..
            }) = self.pending.remove(&id)
            {
                debug!("Withdrawing hash request {} for evicted blocks", id);
                self.wanted_hashes.extend(blocks);
            }
        }
    }

    fn try_request_hashes(&mut self, now: Instant) {
        if self.wanted_hashes.is_empty() {
            return;
        }
        let in_flight = self
            .pending
            .values()
            .any(|p| matches!(p.kind, RequestKind::Hashes(_)));
        if in_flight {
            return;
        }

        // Only blocks confirmed in the seeder's cache can have their hash served
        let mut eligible = BTreeSet::new();
        let mut unavailable = BTreeSet::new();
        for block in &self.wanted_hashes {
            match self.scheduler.block_state(*block) {
                Some(BlockState::Cached | BlockState::Assembling) => {
                    eligible.insert(*block);
                }
                Some(BlockState::Wanted | BlockState::PendingCache) => {}
                Some(BlockState::Completed) | None => {
                    unavailable.insert(*block);
                }
            }
        }

        if !unavailable.is_empty() {
            warn!("Hashes of {} blocks no longer obtainable", unavailable.len());
            self.wanted_hashes.retain(|block| !unavailable.contains(block));
            self.events.push(DownloadEvent::HashesUnavailable(unavailable));
        }

        if eligible.is_empty() {
            return;
        }

        self.wanted_hashes.retain(|block| !eligible.contains(block));
        let id = self.allocate_id();
        let message = WireMessage::HashRequest {
            id,
            file: self.identity.file,
            blocks: eligible.clone(),
        };
        self.track(id, RequestKind::Hashes(eligible), now);
        self.outbox.push(Outbound {
            message,
            timeout: self.config.hash_timeout,
            retries: self.config.hash_retries,
        });
    }

    /// Apply one inbound message. An error is fatal for this connection.
    pub fn on_message(&mut self, message: WireMessage, now: Instant) -> Result<()> {
        if message.file() != self.identity.file {
            warn!(
                "Dropping {} for file {}, connection transfers {}",
                message.name(),
                message.file(),
                self.identity.file
            );
            return Ok(());
        }

        match message {
            WireMessage::CacheHintResponse { id, stamp, ok, .. } => {
                self.on_hint_response(id, stamp, ok, now)?
            }
            WireMessage::PieceResponse {
                id,
                piece,
                echo,
                data,
                ..
            } => self.on_piece(id, piece, echo, data, now),
            WireMessage::HashResponse { id, hashes, .. } => self.on_hashes(id, hashes, now),
            other => {
                warn!("Unexpected {} on download connection", other.name());
            }
        }

        Ok(())
    }

    fn on_hint_response(&mut self, id: u64, stamp: u64, ok: bool, now: Instant) -> Result<()> {
        match self.pending.get(&id).map(|p| &p.kind) {
            Some(RequestKind::CacheHint { stamp: expected }) if *expected == stamp => {}
            Some(_) => {
                warn!("Cache hint response {} does not match its request", id);
                return Ok(());
            }
            None => {
                debug!("Duplicate cache hint response {}", id);
                return Ok(());
            }
        }
        self.pending.remove(&id);

        if !ok {
            error!("Cache hint {} rejected by {}", stamp, self.identity.peer);
            return Err(TransferError::HintRejected { stamp });
        }

        self.scheduler.cache_confirmed();
        self.try_download(now);
        Ok(())
    }

    fn on_piece(&mut self, id: u64, piece: PieceId, echo: u64, data: Bytes, now: Instant) {
        let sample = self.sample(echo, now);
        let on_time = match self.pending.get(&id).map(|p| &p.kind) {
            Some(RequestKind::Piece(expected)) => Some(*expected == piece),
            Some(_) => Some(false),
            None => None,
        };

        match on_time {
            Some(true) => {
                self.pending.remove(&id);
                self.scheduler.piece(piece, &data);
                self.congestion.success(now, self.config.mss, sample);
                self.report.pieces_received += 1;
            }
            Some(false) => {
                warn!("Piece response {} does not match its request", id);
                return;
            }
            None => {
                debug!("Late piece {}", piece);
                self.scheduler.late_piece(piece, &data);
                self.congestion.late(now, self.config.mss, sample);
                self.report.late_pieces += 1;
            }
        }

        self.publish_completed();
        self.try_download(now);
    }

    fn on_hashes(&mut self, id: u64, hashes: BTreeMap<BlockId, Bytes>, now: Instant) {
        let requested = match self.pending.get(&id).map(|p| &p.kind) {
            Some(RequestKind::Hashes(blocks)) => blocks.clone(),
            Some(_) => {
                warn!("Hash response {} does not match its request", id);
                return;
            }
            None => {
                debug!("Duplicate hash response {}", id);
                return;
            }
        };
        self.pending.remove(&id);

        let missing: Vec<BlockId> = requested
            .iter()
            .filter(|block| !hashes.contains_key(block))
            .copied()
            .collect();
        if !missing.is_empty() {
            warn!("Hash response {} lacks {} blocks", id, missing.len());
            self.wanted_hashes.extend(missing);
        }

        let delivered: BTreeMap<BlockId, Bytes> = hashes
            .into_iter()
            .filter(|(block, _)| requested.contains(block))
            .collect();
        if !delivered.is_empty() {
            self.events.push(DownloadEvent::Hashes(delivered));
        }

        self.try_download(now);
    }

    /// A request timed out after the transport gave up on it.
    /// An error is fatal for this connection.
    pub fn on_timeout(&mut self, id: u64, now: Instant) -> Result<()> {
        let Some(request) = self.pending.remove(&id) else {
            return Ok(());
        };

        match request.kind {
            RequestKind::CacheHint { stamp } => {
                error!("Cache hint {} to {} timed out", stamp, self.identity.peer);
                return Err(TransferError::HintTimeout { stamp });
            }
            RequestKind::Piece(piece) => {
                debug!(
                    "Piece {} timed out after {:?}",
                    piece,
                    now.saturating_duration_since(request.sent_at)
                );
                self.scheduler.piece_timeout(piece);
                self.congestion.timeout(now, self.config.mss);
                self.report.timeouts += 1;
            }
            RequestKind::Hashes(blocks) => {
                debug!("Hash request for {} blocks timed out", blocks.len());
                self.wanted_hashes.extend(blocks);
            }
        }

        self.publish_completed();
        self.try_download(now);
        Ok(())
    }

    fn publish_completed(&mut self) {
        if !self.scheduler.has_complete() {
            return;
        }
        let completed = self.scheduler.drain_complete();
        info!(
            "Publishing {} completed blocks from {}",
            completed.len(),
            self.identity.peer
        );
        self.events.push(DownloadEvent::Completed(completed));
    }

    /// Snapshot for the report timer; resets the window adjustment
    pub fn report(&mut self) -> ConnectionReport {
        self.report.queue_delay = self.congestion.queue_delay();
        self.report.window_adjustment = self.congestion.take_adjustment();
        self.report.window = self.congestion.window();
        self.report.in_flight = self.congestion.in_flight();
        self.report.clone()
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn track(&mut self, id: u64, kind: RequestKind, now: Instant) {
        self.pending.insert(
            id,
            PendingRequest {
                kind,
                sent_at: now,
            },
        );
    }

    fn echo(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_micros() as u64
    }

    /// Round trip of a piece request from its echoed send time
    fn sample(&self, echo: u64, now: Instant) -> Duration {
        self.epoch
            .checked_add(Duration::from_micros(echo))
            .map(|sent| now.saturating_duration_since(sent))
            .unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::congestion::FixedWindow;
    use crate::peer::{Direction, FileId, PeerId};

    const FILE: FileId = FileId(5);

    fn connection(window: u64) -> DownloadConnection<FixedWindow> {
        let identity = ConnectionIdentity::new(
            PeerId::generate(),
            PeerId::generate(),
            FILE,
            Direction::Download,
        );
        DownloadConnection::new(
            identity,
            ConnectionConfig::default(),
            BlockDetails::new(64, 16),
            FixedWindow::new(window, Duration::from_millis(500)),
        )
    }

    fn wanted(blocks: &[u32]) -> WantedBlocks {
        WantedBlocks {
            blocks: blocks.iter().copied().map(BlockId).collect(),
            irregular: BTreeMap::new(),
        }
    }

    /// Confirm the outstanding hint, returning the outbox it produced
    fn confirm_hint(conn: &mut DownloadConnection<FixedWindow>, now: Instant) -> Vec<Outbound> {
        let outbox = conn.take_outbox();
        let (id, stamp) = match &outbox[0].message {
            WireMessage::CacheHintRequest { id, stamp, .. } => (*id, *stamp),
            other => panic!("expected a cache hint, got {:?}", other),
        };
        conn.on_message(
            WireMessage::CacheHintResponse {
                id,
                file: FILE,
                stamp,
                ok: true,
            },
            now,
        )
        .unwrap();
        conn.take_outbox()
    }

    fn piece_requests(outbox: &[Outbound]) -> Vec<(u64, PieceId, u64)> {
        outbox
            .iter()
            .filter_map(|o| match &o.message {
                WireMessage::PieceRequest {
                    id, piece, echo, ..
                } => Some((*id, *piece, *echo)),
                _ => None,
            })
            .collect()
    }

    fn respond(id: u64, piece: PieceId, echo: u64) -> WireMessage {
        WireMessage::PieceResponse {
            id,
            file: FILE,
            piece,
            echo,
            data: Bytes::from(vec![piece.index as u8; 16]),
        }
    }

    fn completed(events: Vec<DownloadEvent>) -> Vec<BlockId> {
        events
            .into_iter()
            .filter_map(|e| match e {
                DownloadEvent::Completed(blocks) => Some(blocks.into_keys().collect::<Vec<_>>()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn test_hint_sent_before_any_piece() {
        let now = Instant::now();
        let mut conn = connection(8);
        conn.add_wanted(wanted(&[0]), now);

        let outbox = conn.take_outbox();
        assert_eq!(outbox.len(), 1);
        assert!(matches!(
            outbox[0].message,
            WireMessage::CacheHintRequest { stamp: 1, .. }
        ));
        assert_eq!(outbox[0].retries, conn.config().hint_retries);
    }

    #[test]
    fn test_confirm_releases_window_of_requests() {
        let now = Instant::now();
        let mut conn = connection(3);
        conn.add_wanted(wanted(&[0, 1]), now);

        let requests = piece_requests(&confirm_hint(&mut conn, now));
        let pieces: Vec<_> = requests.iter().map(|(_, p, _)| *p).collect();
        assert_eq!(
            pieces,
            vec![
                PieceId::new(BlockId(0), 0),
                PieceId::new(BlockId(0), 1),
                PieceId::new(BlockId(0), 2)
            ]
        );
        assert_eq!(conn.congestion.in_flight(), 3);
    }

    #[test]
    fn test_no_second_hint_until_confirmed() {
        let now = Instant::now();
        let mut conn = connection(1);
        conn.add_wanted(wanted(&[0]), now);
        conn.add_wanted(wanted(&[1]), now);

        let outbox = conn.take_outbox();
        assert_eq!(outbox.len(), 1);
        conn.tick(now);
        assert!(conn.take_outbox().is_empty());
    }

    #[test]
    fn test_scenario_timeout_then_late_completes_once() {
        let now = Instant::now();
        let mut conn = connection(4);
        conn.add_wanted(wanted(&[0]), now);
        let requests = piece_requests(&confirm_hint(&mut conn, now));
        assert_eq!(requests.len(), 4);

        for (id, piece, echo) in &requests[..3] {
            conn.on_message(respond(*id, *piece, *echo), now).unwrap();
        }
        assert!(completed(conn.take_events()).is_empty());

        let (id, piece, echo) = requests[3];
        conn.on_timeout(id, now).unwrap();
        assert!(!conn.is_pending(id));

        // The timeout freed a slot, so the piece is requested again
        let reissued = piece_requests(&conn.take_outbox());
        assert_eq!(reissued.len(), 1);
        assert_eq!(reissued[0].1, piece);

        conn.on_message(respond(id, piece, echo), now).unwrap();
        assert_eq!(completed(conn.take_events()), vec![BlockId(0)]);

        // The re-issued request's answer is absorbed without a second completion
        let (new_id, _, new_echo) = reissued[0];
        conn.on_message(respond(new_id, piece, new_echo), now).unwrap();
        assert!(completed(conn.take_events()).is_empty());
        assert_eq!(conn.congestion.in_flight(), 0);
    }

    #[test]
    fn test_completion_triggers_new_hint() {
        let now = Instant::now();
        let mut conn = connection(8);
        conn.add_wanted(wanted(&[0, 1]), now);
        let requests = piece_requests(&confirm_hint(&mut conn, now));

        for (id, piece, echo) in requests.iter().filter(|(_, p, _)| p.block == BlockId(0)) {
            conn.on_message(respond(*id, *piece, *echo), now).unwrap();
        }

        let hints: Vec<_> = conn
            .take_outbox()
            .into_iter()
            .filter_map(|o| match o.message {
                WireMessage::CacheHintRequest { stamp, blocks, .. } => Some((stamp, blocks)),
                _ => None,
            })
            .collect();
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].0, 2);
        assert_eq!(hints[0].1, [BlockId(1)].into_iter().collect());
    }

    #[test]
    fn test_hint_timeout_is_fatal() {
        let now = Instant::now();
        let mut conn = connection(1);
        conn.add_wanted(wanted(&[0]), now);
        let id = conn.take_outbox()[0].message.id();

        let result = conn.on_timeout(id, now);
        assert!(matches!(result, Err(TransferError::HintTimeout { stamp: 1 })));
    }

    #[test]
    fn test_rejected_hint_is_fatal() {
        let now = Instant::now();
        let mut conn = connection(1);
        conn.add_wanted(wanted(&[0]), now);
        let id = conn.take_outbox()[0].message.id();

        let result = conn.on_message(
            WireMessage::CacheHintResponse {
                id,
                file: FILE,
                stamp: 1,
                ok: false,
            },
            now,
        );
        assert!(matches!(result, Err(TransferError::HintRejected { .. })));
    }

    #[test]
    fn test_unknown_ids_are_ignored() {
        let now = Instant::now();
        let mut conn = connection(1);
        assert!(conn.on_timeout(999, now).is_ok());
        assert!(conn
            .on_message(
                WireMessage::CacheHintResponse {
                    id: 999,
                    file: FILE,
                    stamp: 1,
                    ok: true
                },
                now
            )
            .is_ok());
        assert!(conn.take_outbox().is_empty());
    }

    #[test]
    fn test_hashes_requested_once_cached() {
        let now = Instant::now();
        let mut conn = connection(1);
        conn.add_wanted(wanted(&[0]), now);
        conn.request_hashes([BlockId(0)], now);

        // Not yet confirmed: only the hint goes out
        assert_eq!(conn.outbox.len(), 1);

        let outbox = confirm_hint(&mut conn, now);
        let hash_id = outbox
            .iter()
            .find_map(|o| match &o.message {
                WireMessage::HashRequest { id, blocks, .. } => {
                    assert_eq!(blocks.len(), 1);
                    Some(*id)
                }
                _ => None,
            })
            .unwrap();

        let mut hashes = BTreeMap::new();
        hashes.insert(BlockId(0), Bytes::from_static(&[1u8; 20]));
        conn.on_message(
            WireMessage::HashResponse {
                id: hash_id,
                file: FILE,
                hashes,
            },
            now,
        )
        .unwrap();

        let events = conn.take_events();
        assert!(matches!(&events[..], [DownloadEvent::Hashes(h)] if h.contains_key(&BlockId(0))));
    }

    #[test]
    fn test_hash_timeout_requeues() {
        let now = Instant::now();
        let mut conn = connection(0);
        conn.add_wanted(wanted(&[0]), now);
        conn.request_hashes([BlockId(0)], now);
        let outbox = confirm_hint(&mut conn, now);
        let hash_id = outbox[0].message.id();

        conn.on_timeout(hash_id, now).unwrap();
        let outbox = conn.take_outbox();
        assert!(matches!(outbox[..], [Outbound { message: WireMessage::HashRequest { .. }, .. }]));
    }

    #[test]
    fn test_hint_evicting_hashed_block_reissues_hashes() {
        let now = Instant::now();
        let mut conn = connection(4);
        conn.add_wanted(wanted(&[0, 1]), now);
        conn.request_hashes([BlockId(0), BlockId(1)], now);

        let outbox = confirm_hint(&mut conn, now);
        let stale_id = outbox
            .iter()
            .find_map(|o| match &o.message {
                WireMessage::HashRequest { id, .. } => Some(*id),
                _ => None,
            })
            .unwrap();
        for (id, piece, echo) in piece_requests(&outbox) {
            conn.on_message(respond(id, piece, echo), now).unwrap();
        }
        assert_eq!(completed(conn.take_events()), vec![BlockId(0)]);
        conn.take_outbox();

        // The next hint leaves out block 0, so the seeder drops the batch
        conn.add_wanted(wanted(&[2]), now);
        assert!(!conn.is_pending(stale_id));

        let events = conn.take_events();
        assert!(matches!(
            &events[..],
            [DownloadEvent::HashesUnavailable(b)] if b.iter().eq([&BlockId(0)])
        ));

        let reissued: Vec<_> = conn
            .take_outbox()
            .into_iter()
            .filter_map(|o| match o.message {
                WireMessage::HashRequest { id, blocks, .. } => Some((id, blocks)),
                _ => None,
            })
            .collect();
        assert_eq!(reissued.len(), 1);
        assert_ne!(reissued[0].0, stale_id);
        assert!(reissued[0].1.iter().eq([&BlockId(1)]));

        // Expiry of the withdrawn request is already resolved
        conn.on_timeout(stale_id, now).unwrap();
        assert!(conn.take_outbox().is_empty());
        assert!(conn.take_events().is_empty());
    }

    #[test]
    fn test_hash_of_unknown_block_unavailable() {
        let now = Instant::now();
        let mut conn = connection(1);
        conn.request_hashes([BlockId(3)], now);

        let events = conn.take_events();
        assert!(matches!(&events[..], [DownloadEvent::HashesUnavailable(b)] if b.len() == 1));
        assert!(conn.is_idle());
    }

    #[test]
    fn test_report_reads_congestion() {
        let now = Instant::now();
        let mut conn = connection(2);
        conn.add_wanted(wanted(&[0]), now);
        confirm_hint(&mut conn, now);

        let report = conn.report();
        assert_eq!(report.window, 2);
        assert_eq!(report.in_flight, 2);
        assert_eq!(report.file, FILE.0);
    }
}
