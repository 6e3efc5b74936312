use super::{
    DownloadConnection, DownloadEvent, UploadAction, UploadConnection, UploadStats, WantedBlocks,
};
use crate::block::BlockId;
use crate::congestion::CongestionController;
use crate::error::{Result, TransferError};
use crate::peer::WireMessage;
use crate::storage::{BlockSource, FetchedBlocks};
use crate::transport::{Expiry, LinkEnd, RetryTimers};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Debug)]
pub enum DownloadCommand {
    AddWanted(WantedBlocks),
    RequestHashes(BTreeSet<BlockId>),
    Shutdown,
}

#[derive(Debug)]
pub enum UploadCommand {
    Shutdown,
}

/// Drive a download connection until shutdown or a fatal error
pub async fn run_download<C: CongestionController>(
    mut conn: DownloadConnection<C>,
    mut link: LinkEnd,
    mut commands: mpsc::Receiver<DownloadCommand>,
    events: mpsc::Sender<DownloadEvent>,
) -> Result<()> {
    let identity = *conn.identity();
    let span = info_span!(
        "connection",
        file = %identity.file,
        peer = %identity.peer,
        direction = %identity.direction
    );

    let result = async move {
        let mut timers = RetryTimers::new();
        let mut advance = time::interval(conn.config().advance_period);
        advance.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut report = time::interval(conn.config().report_period);
        report.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Download connection started");

        'run: loop {
            for outbound in conn.take_outbox() {
                link.send_message(&outbound.message);
                timers.arm(outbound);
            }
            for event in conn.take_events() {
                if events.send(event).await.is_err() {
                    debug!("Event receiver gone");
                    break 'run;
                }
            }

            tokio::select! {
                frame = link.recv() => {
                    let Some(frame) = frame else {
                        return Err(TransferError::ChannelClosed("link to seeder".to_string()));
                    };
                    let message = match WireMessage::from_bytes(frame) {
                        Ok(message) => message,
                        Err(e) => {
                            warn!("Undecodable frame: {}", e);
                            continue;
                        }
                    };

                    let id = message.id();
                    conn.on_message(message, Instant::now())?;
                    if !conn.is_pending(id) {
                        timers.resolve(id);
                    }
                }

                command = commands.recv() => match command {
                    Some(DownloadCommand::AddWanted(wanted)) => {
                        debug!("{} blocks wanted", wanted.blocks.len());
                        conn.add_wanted(wanted, Instant::now());
                    }
                    Some(DownloadCommand::RequestHashes(blocks)) => {
                        conn.request_hashes(blocks, Instant::now());
                    }
                    Some(DownloadCommand::Shutdown) | None => break 'run,
                },

                _ = advance.tick() => conn.tick(Instant::now()),

                _ = report.tick() => {
                    if events.send(DownloadEvent::Report(conn.report())).await.is_err() {
                        debug!("Event receiver gone");
                        break 'run;
                    }
                }

                Some((id, attempt)) = timers.next_expired() => {
                    match timers.expire(id, attempt, conn.is_pending(id)) {
                        Expiry::Retransmit(message) => {
                            debug!("Retransmitting {} {}", message.name(), id);
                            link.send_message(&message);
                        }
                        Expiry::TimedOut(id) => conn.on_timeout(id, Instant::now())?,
                        Expiry::Stale => {}
                    }
                }
            }
        }

        let report = conn.report();
        info!(
            "Download connection stopped: {} pieces, {} late, {} timeouts",
            report.pieces_received, report.late_pieces, report.timeouts
        );
        Ok::<(), TransferError>(())
    }
    .instrument(span.clone())
    .await;

    if let Err(e) = &result {
        span.in_scope(|| {
            if e.is_fatal() {
                error!("Download connection closed: {}", e);
            } else {
                warn!("Download connection failed: {}", e);
            }
        });
    }
    result
}

/// Serve a leecher until shutdown or until it goes away
pub async fn run_upload<S: BlockSource>(
    mut conn: UploadConnection,
    source: Arc<S>,
    mut link: LinkEnd,
    mut commands: mpsc::Receiver<UploadCommand>,
) -> Result<UploadStats> {
    let identity = *conn.identity();
    let span = info_span!(
        "connection",
        file = %identity.file,
        peer = %identity.peer,
        direction = %identity.direction
    );

    async move {
        let mut fetches: JoinSet<Result<FetchedBlocks>> = JoinSet::new();
        info!("Upload connection started");

        loop {
            for action in conn.take_actions() {
                match action {
                    UploadAction::Send(message) => link.send_message(&message),
                    UploadAction::Fetch(blocks) => {
                        let source = source.clone();
                        fetches.spawn(async move { source.fetch(blocks).await });
                    }
                }
            }

            tokio::select! {
                frame = link.recv() => {
                    let Some(frame) = frame else {
                        info!("Leecher went away");
                        break;
                    };
                    match WireMessage::from_bytes(frame) {
                        Ok(message) => conn.on_message(message),
                        Err(e) => warn!("Undecodable frame: {}", e),
                    }
                }

                command = commands.recv() => match command {
                    Some(UploadCommand::Shutdown) | None => break,
                },

                Some(joined) = fetches.join_next() => {
                    let result = joined
                        .map_err(|e| TransferError::Source(e.to_string()))
                        .and_then(|fetched| fetched);
                    conn.on_fetched(result);
                }
            }
        }

        fetches.abort_all();
        conn.close();
        Ok(conn.stats())
    }
    .instrument(span)
    .await
}

/// Control side of a running download connection
pub struct DownloadHandle {
    commands: mpsc::Sender<DownloadCommand>,
    events: mpsc::Receiver<DownloadEvent>,
    task: JoinHandle<Result<()>>,
}

impl DownloadHandle {
    pub async fn add_wanted(&self, wanted: WantedBlocks) -> Result<()> {
        self.commands.send(DownloadCommand::AddWanted(wanted)).await?;
        Ok(())
    }

    pub async fn request_hashes(&self, blocks: BTreeSet<BlockId>) -> Result<()> {
        self.commands
            .send(DownloadCommand::RequestHashes(blocks))
            .await?;
        Ok(())
    }

    /// Next upward event, `None` once the connection has stopped
    pub async fn next_event(&mut self) -> Option<DownloadEvent> {
        self.events.recv().await
    }

    /// Stop the connection and return how it ended
    pub async fn shutdown(self) -> Result<()> {
        // The task may already be gone after a fatal error
        let _ = self.commands.send(DownloadCommand::Shutdown).await;
        drop(self.events);
        self.task
            .await
            .map_err(|e| TransferError::ChannelClosed(e.to_string()))?
    }
}

/// Control side of a running upload connection
pub struct UploadHandle {
    commands: mpsc::Sender<UploadCommand>,
    task: JoinHandle<Result<UploadStats>>,
}

impl UploadHandle {
    pub async fn shutdown(self) -> Result<UploadStats> {
        let _ = self.commands.send(UploadCommand::Shutdown).await;
        self.task
            .await
            .map_err(|e| TransferError::ChannelClosed(e.to_string()))?
    }
}

pub fn spawn_download<C>(conn: DownloadConnection<C>, link: LinkEnd) -> DownloadHandle
where
    C: CongestionController + 'static,
{
    let capacity = conn.config().channel_capacity;
    let (command_tx, command_rx) = mpsc::channel(capacity);
    let (event_tx, event_rx) = mpsc::channel(capacity);

    let task = tokio::spawn(run_download(conn, link, command_rx, event_tx));

    DownloadHandle {
        commands: command_tx,
        events: event_rx,
        task,
    }
}

pub fn spawn_upload<S: BlockSource>(
    conn: UploadConnection,
    source: Arc<S>,
    link: LinkEnd,
) -> UploadHandle {
    let (command_tx, command_rx) = mpsc::channel(1);
    let task = tokio::spawn(run_upload(conn, source, link, command_rx));

    UploadHandle {
        commands: command_tx,
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::FileLayout;
    use crate::config::ConnectionConfig;
    use crate::congestion::FixedWindow;
    use crate::peer::{ConnectionIdentity, Direction, FileId, PeerId};
    use crate::storage::MemoryBlockSource;
    use crate::transport::{link_pair, LinkOptions};
    use bytes::Bytes;
    use std::collections::BTreeMap;
    use std::time::Duration;

    const FILE: FileId = FileId(0xfeed);

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            advance_period: Duration::from_millis(10),
            report_period: Duration::from_millis(50),
            hint_timeout: Duration::from_millis(40),
            hint_retries: 30,
            hash_timeout: Duration::from_millis(40),
            hash_retries: 30,
            mss: 16,
            channel_capacity: 64,
        }
    }

    fn file_data(len: usize) -> Bytes {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
    }

    fn wanted(layout: &FileLayout) -> WantedBlocks {
        WantedBlocks {
            blocks: layout.block_ids().collect(),
            irregular: layout.overrides().clone(),
        }
    }

    fn start(data: Bytes, options: LinkOptions) -> (DownloadHandle, UploadHandle, FileLayout) {
        let source = Arc::new(MemoryBlockSource::new(data, 64, 16));
        let layout = source.layout().clone();
        let (leecher_end, seeder_end) = link_pair(options);

        let leecher = PeerId::generate();
        let seeder = PeerId::generate();
        let download = DownloadConnection::new(
            ConnectionIdentity::new(leecher, seeder, FILE, Direction::Download),
            config(),
            layout.default_details(),
            FixedWindow::new(8, Duration::from_millis(30)),
        );
        let upload = UploadConnection::new(
            ConnectionIdentity::new(seeder, leecher, FILE, Direction::Upload),
            layout.default_details(),
        );

        let upload = spawn_upload(upload, source, seeder_end);
        let download = spawn_download(download, leecher_end);
        (download, upload, layout)
    }

    #[derive(Default)]
    struct Collected {
        blocks: BTreeMap<BlockId, Bytes>,
        hashes: BTreeMap<BlockId, Bytes>,
        unavailable: BTreeSet<BlockId>,
    }

    /// Collect events until every block of `layout` completed and its hash
    /// was either delivered or given up on
    async fn collect(handle: &mut DownloadHandle, layout: &FileLayout) -> Collected {
        let mut collected = Collected::default();
        let total = layout.nr_blocks() as usize;

        while collected.blocks.len() < total
            || collected.hashes.len() + collected.unavailable.len() < total
        {
            match handle.next_event().await {
                Some(DownloadEvent::Completed(done)) => collected.blocks.extend(done),
                Some(DownloadEvent::Hashes(delivered)) => collected.hashes.extend(delivered),
                Some(DownloadEvent::HashesUnavailable(blocks)) => {
                    collected.unavailable.extend(blocks)
                }
                Some(DownloadEvent::Report(_)) => {}
                None => panic!("connection stopped early"),
            }
        }
        collected
    }

    fn assemble(blocks: BTreeMap<BlockId, Bytes>) -> Vec<u8> {
        blocks.into_values().flat_map(|b| b.to_vec()).collect()
    }

    #[tokio::test]
    async fn test_transfer_over_clean_link() {
        let data = file_data(300);
        let (mut download, upload, layout) = start(data.clone(), LinkOptions::default());

        download.add_wanted(wanted(&layout)).await.unwrap();
        download
            .request_hashes(layout.block_ids().collect())
            .await
            .unwrap();

        let collected = time::timeout(Duration::from_secs(10), collect(&mut download, &layout))
            .await
            .unwrap();

        assert!(collected.unavailable.is_empty());
        for (block, data) in &collected.blocks {
            crate::storage::verify_block(*block, data, &collected.hashes[block]).unwrap();
        }
        assert_eq!(assemble(collected.blocks), data.to_vec());

        download.shutdown().await.unwrap();
        let stats = upload.shutdown().await.unwrap();
        assert!(stats.pieces_served >= 19);
    }

    #[tokio::test]
    async fn test_transfer_over_lossy_link() {
        let data = file_data(1000);
        let options = LinkOptions {
            loss: 0.2,
            latency: Duration::from_millis(1),
            jitter: Duration::from_millis(4),
        };
        let (mut download, upload, layout) = start(data.clone(), options);

        download.add_wanted(wanted(&layout)).await.unwrap();
        download
            .request_hashes(layout.block_ids().collect())
            .await
            .unwrap();

        let collected = time::timeout(Duration::from_secs(30), collect(&mut download, &layout))
            .await
            .unwrap();
        assert_eq!(assemble(collected.blocks), data.to_vec());

        download.shutdown().await.unwrap();
        upload.shutdown().await.unwrap();
    }

    struct OfflineSource;

    impl BlockSource for OfflineSource {
        async fn fetch(&self, _blocks: BTreeSet<BlockId>) -> Result<FetchedBlocks> {
            Err(TransferError::Source("offline".to_string()))
        }
    }

    #[tokio::test]
    async fn test_rejected_hint_stops_download() {
        let layout = FileLayout::new(128, 64, 16).unwrap();
        let (leecher_end, seeder_end) = link_pair(LinkOptions::default());
        let (leecher, seeder) = (PeerId::generate(), PeerId::generate());

        let upload = spawn_upload(
            UploadConnection::new(
                ConnectionIdentity::new(seeder, leecher, FILE, Direction::Upload),
                layout.default_details(),
            ),
            Arc::new(OfflineSource),
            seeder_end,
        );
        let mut download = spawn_download(
            DownloadConnection::new(
                ConnectionIdentity::new(leecher, seeder, FILE, Direction::Download),
                config(),
                layout.default_details(),
                FixedWindow::new(4, Duration::from_millis(30)),
            ),
            leecher_end,
        );

        download.add_wanted(wanted(&layout)).await.unwrap();
        while download.next_event().await.is_some() {}

        let result = download.shutdown().await;
        assert!(matches!(result, Err(TransferError::HintRejected { stamp: 1 })));
        assert_eq!(upload.shutdown().await.unwrap().pieces_served, 0);
    }

    #[tokio::test]
    async fn test_fatal_error_stays_on_its_connection() {
        let data = file_data(300);
        let (mut healthy, healthy_upload, layout) = start(data.clone(), LinkOptions::default());

        let (leecher_end, seeder_end) = link_pair(LinkOptions::default());
        let (leecher, seeder) = (PeerId::generate(), PeerId::generate());
        let failing_upload = spawn_upload(
            UploadConnection::new(
                ConnectionIdentity::new(seeder, leecher, FILE, Direction::Upload),
                layout.default_details(),
            ),
            Arc::new(OfflineSource),
            seeder_end,
        );
        let mut failing = spawn_download(
            DownloadConnection::new(
                ConnectionIdentity::new(leecher, seeder, FILE, Direction::Download),
                config(),
                layout.default_details(),
                FixedWindow::new(4, Duration::from_millis(30)),
            ),
            leecher_end,
        );

        failing.add_wanted(wanted(&layout)).await.unwrap();
        healthy.add_wanted(wanted(&layout)).await.unwrap();
        healthy
            .request_hashes(layout.block_ids().collect())
            .await
            .unwrap();

        let (collected, ()) = time::timeout(Duration::from_secs(10), async {
            tokio::join!(collect(&mut healthy, &layout), async {
                while failing.next_event().await.is_some() {}
            })
        })
        .await
        .unwrap();

        assert!(matches!(
            failing.shutdown().await,
            Err(TransferError::HintRejected { stamp: 1 })
        ));
        assert_eq!(failing_upload.shutdown().await.unwrap().pieces_served, 0);

        assert_eq!(collected.blocks.len(), layout.nr_blocks() as usize);
        assert_eq!(assemble(collected.blocks), data.to_vec());
        healthy.shutdown().await.unwrap();
        assert!(healthy_upload.shutdown().await.unwrap().pieces_served >= 19);
    }

    #[tokio::test]
    async fn test_upload_stops_when_leecher_leaves() {
        let layout = FileLayout::new(64, 64, 16).unwrap();
        let (leecher_end, seeder_end) = link_pair(LinkOptions::default());
        let upload = spawn_upload(
            UploadConnection::new(
                ConnectionIdentity::new(
                    PeerId::generate(),
                    PeerId::generate(),
                    FILE,
                    Direction::Upload,
                ),
                layout.default_details(),
            ),
            Arc::new(MemoryBlockSource::new(file_data(64), 64, 16)),
            seeder_end,
        );

        drop(leecher_end);
        let stats = upload.shutdown().await.unwrap();
        assert_eq!(stats, UploadStats::default());
    }
}
