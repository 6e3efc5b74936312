use crate::block::{BlockId, FileLayout, DEFAULT_BLOCK_SIZE, DEFAULT_PIECE_SIZE};
use crate::config::ConnectionConfig;
use crate::congestion::{CongestionController, FixedWindow, LedbatController};
use crate::connection::{
    spawn_download, spawn_upload, DownloadConnection, DownloadEvent, DownloadHandle,
    UploadConnection, UploadStats, WantedBlocks,
};
use crate::error::{Result, TransferError};
use crate::peer::{ConnectionIdentity, Direction, FileId, PeerId};
use crate::storage::{block_hash, verify_block, BlockWriter, FileBlockSource};
use crate::transport::{link_pair, LinkOptions};
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tracing::{debug, info, warn};

/// Retransmission timeout of a fixed window
const FIXED_WINDOW_RTO: Duration = Duration::from_secs(1);

/// Configuration of a local transfer
#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub block_size: u32,
    pub piece_size: u32,
    pub link: LinkOptions,
    /// Constant request window; delay-based control when unset
    pub window: Option<u64>,
    /// Blocks handed to the leecher at a time
    pub hint_window: usize,
    pub connection: ConnectionConfig,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            piece_size: DEFAULT_PIECE_SIZE,
            link: LinkOptions::default(),
            window: None,
            hint_window: 8,
            connection: ConnectionConfig::default(),
        }
    }
}

/// Outcome of a finished transfer
#[derive(Debug, Clone)]
pub struct TransferSummary {
    pub blocks: u32,
    pub bytes: u64,
    /// Blocks checked against their own hash
    pub verified: u32,
    /// Blocks only covered by the whole-file check
    pub unverified: u32,
    pub elapsed: Duration,
    pub upload: UploadStats,
}

/// Transfers one file between a local seeder and leecher
pub struct TransferSession {
    options: TransferOptions,
    local: PeerId,
    remote: PeerId,
}

impl TransferSession {
    pub fn new(options: TransferOptions) -> Result<Self> {
        options.connection.validate()?;
        if options.block_size == 0 || options.piece_size == 0 {
            return Err(TransferError::Config(
                "block and piece size must be non-zero".to_string(),
            ));
        }
        if options.hint_window == 0 {
            return Err(TransferError::Config(
                "hint window must be non-zero".to_string(),
            ));
        }
        if options.window == Some(0) {
            return Err(TransferError::Config(
                "fixed window must allow at least one request".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&options.link.loss) {
            return Err(TransferError::Config(format!(
                "loss {} outside [0, 1)",
                options.link.loss
            )));
        }

        let local = PeerId::generate();
        let remote = PeerId::generate();
        info!("Session initialized with peer_id: {}", local);

        Ok(Self {
            options,
            local,
            remote,
        })
    }

    /// Copy `input` to `output` through a seeder and a leecher connection
    pub async fn run(&self, input: &Path, output: &Path) -> Result<TransferSummary> {
        match self.options.window {
            Some(window) => {
                info!("Using a fixed window of {} requests", window);
                self.transfer(input, output, FixedWindow::new(window, FIXED_WINDOW_RTO))
                    .await
            }
            None => self.transfer(input, output, LedbatController::new()).await,
        }
    }

    async fn transfer<C>(&self, input: &Path, output: &Path, congestion: C) -> Result<TransferSummary>
    where
        C: CongestionController + 'static,
    {
        let started = Instant::now();
        info!("Starting transfer: {} -> {}", input.display(), output.display());

        let source = Arc::new(
            FileBlockSource::open(input, self.options.block_size, self.options.piece_size).await?,
        );
        let layout = source.layout().clone();
        let file = FileId(rand::random());

        info!("File: {}", file);
        info!("Total size: {} bytes", layout.file_len());
        info!("Blocks: {}", layout.nr_blocks());

        let writer = BlockWriter::create(output, layout.clone()).await?;

        let (leecher_end, seeder_end) = link_pair(self.options.link);
        let upload = spawn_upload(
            UploadConnection::new(
                ConnectionIdentity::new(self.remote, self.local, file, Direction::Upload),
                layout.default_details(),
            ),
            source,
            seeder_end,
        );
        let mut download = spawn_download(
            DownloadConnection::new(
                ConnectionIdentity::new(self.local, self.remote, file, Direction::Download),
                self.options.connection.clone(),
                layout.default_details(),
                congestion,
            ),
            leecher_end,
        );

        let result = self.drive(&mut download, &layout, &writer).await;

        let download_result = download.shutdown().await;
        let upload_stats = upload.shutdown().await?;
        download_result?;
        let (verified, unverified) = result?;

        // Blocks without their own hash are covered here
        let expected = block_hash(&fs::read(input).await?);
        let written = block_hash(&fs::read(output).await?);
        if expected != written {
            return Err(TransferError::Verification(format!(
                "{} differs from {}",
                output.display(),
                input.display()
            )));
        }

        let summary = TransferSummary {
            blocks: layout.nr_blocks(),
            bytes: layout.file_len(),
            verified,
            unverified,
            elapsed: started.elapsed(),
            upload: upload_stats,
        };
        info!(
            "Transfer complete: {} blocks in {:?} ({} verified by hash, {} pieces served, {} dropped)",
            summary.blocks,
            summary.elapsed,
            summary.verified,
            summary.upload.pieces_served,
            summary.upload.pieces_dropped
        );
        Ok(summary)
    }

    /// Feed wanted blocks and consume events until every block is written
    async fn drive(
        &self,
        download: &mut DownloadHandle,
        layout: &FileLayout,
        writer: &BlockWriter,
    ) -> Result<(u32, u32)> {
        let mut pending: Vec<BlockId> = layout.block_ids().collect();
        pending.reverse();
        let mut progress = Progress::default();
        let mut fed = 0usize;

        while progress.written < layout.nr_blocks() {
            // Top up once less than a window is outstanding
            let outstanding = fed - progress.written as usize;
            if outstanding < self.options.hint_window && !pending.is_empty() {
                let take = self.options.hint_window.min(pending.len());
                let window: Vec<BlockId> = (0..take).filter_map(|_| pending.pop()).collect();
                fed += window.len();

                let irregular = window
                    .iter()
                    .filter_map(|block| layout.overrides().get(block).map(|d| (*block, *d)))
                    .collect();
                let hashes: BTreeSet<BlockId> = window.iter().copied().collect();
                debug!("Feeding {} blocks, {} outstanding", window.len(), outstanding);
                download
                    .add_wanted(WantedBlocks {
                        blocks: window,
                        irregular,
                    })
                    .await?;
                download.request_hashes(hashes).await?;
            }

            let Some(event) = download.next_event().await else {
                return Err(TransferError::ChannelClosed(
                    "download connection stopped".to_string(),
                ));
            };

            match event {
                DownloadEvent::Completed(blocks) => {
                    for (block, data) in blocks {
                        progress.completed(block, data);
                    }
                }
                DownloadEvent::Hashes(hashes) => progress.hashes.extend(hashes),
                DownloadEvent::HashesUnavailable(blocks) => {
                    warn!("{} blocks will only be checked with the whole file", blocks.len());
                    progress.unavailable.extend(blocks);
                }
                DownloadEvent::Report(report) => {
                    debug!(
                        "Window {} ({:+}), {} in flight, queue delay {:?}, {} received, {} late, {} timeouts",
                        report.window,
                        report.window_adjustment,
                        report.in_flight,
                        report.queue_delay,
                        report.pieces_received,
                        report.late_pieces,
                        report.timeouts
                    );
                }
            }

            progress.flush(writer).await?;
        }

        Ok((progress.verified, progress.unverified))
    }
}

/// Completed blocks waiting for their hash
#[derive(Default)]
struct Progress {
    awaiting: BTreeMap<BlockId, Bytes>,
    hashes: BTreeMap<BlockId, Bytes>,
    unavailable: BTreeSet<BlockId>,
    written: u32,
    verified: u32,
    unverified: u32,
}

impl Progress {
    fn completed(&mut self, block: BlockId, data: Bytes) {
        self.awaiting.insert(block, data);
    }

    /// Write every awaiting block whose hash question is settled
    async fn flush(&mut self, writer: &BlockWriter) -> Result<()> {
        let ready: Vec<BlockId> = self
            .awaiting
            .keys()
            .filter(|block| self.hashes.contains_key(block) || self.unavailable.contains(block))
            .copied()
            .collect();

        for block in ready {
            let Some(data) = self.awaiting.remove(&block) else {
                continue;
            };

            match self.hashes.remove(&block) {
                Some(expected) => {
                    verify_block(block, &data, &expected)?;
                    self.verified += 1;
                }
                None => self.unverified += 1,
            }

            writer.write_block(block, &data).await?;
            self.written += 1;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("piecewire-{}-{}", name, rand::random::<u64>()))
    }

    fn fast_connection() -> ConnectionConfig {
        ConnectionConfig {
            advance_period: Duration::from_millis(10),
            report_period: Duration::from_millis(100),
            hint_timeout: Duration::from_millis(50),
            hint_retries: 40,
            hash_timeout: Duration::from_millis(50),
            hash_retries: 10,
            ..ConnectionConfig::default()
        }
    }

    async fn write_input(len: usize) -> (PathBuf, Vec<u8>) {
        let path = temp_path("input");
        let data: Vec<u8> = (0..len).map(|_| rand::random::<u8>()).collect();
        fs::write(&path, &data).await.unwrap();
        (path, data)
    }

    #[tokio::test]
    async fn test_transfer_with_fixed_window() {
        let (input, data) = write_input(5000).await;
        let output = temp_path("output");

        let session = TransferSession::new(TransferOptions {
            block_size: 256,
            piece_size: 64,
            window: Some(8),
            hint_window: 4,
            connection: fast_connection(),
            ..TransferOptions::default()
        })
        .unwrap();

        let summary = session.run(&input, &output).await.unwrap();
        assert_eq!(summary.blocks, 20);
        assert_eq!(summary.bytes, 5000);
        assert_eq!(summary.verified + summary.unverified, 20);
        assert_eq!(fs::read(&output).await.unwrap(), data);

        fs::remove_file(&input).await.unwrap();
        fs::remove_file(&output).await.unwrap();
    }

    #[tokio::test]
    async fn test_transfer_over_lossy_link() {
        let (input, data) = write_input(3000).await;
        let output = temp_path("output");

        let session = TransferSession::new(TransferOptions {
            block_size: 512,
            piece_size: 128,
            link: LinkOptions {
                loss: 0.1,
                latency: Duration::from_millis(1),
                jitter: Duration::from_millis(3),
            },
            window: Some(4),
            hint_window: 2,
            connection: fast_connection(),
        })
        .unwrap();

        let summary = tokio::time::timeout(Duration::from_secs(60), session.run(&input, &output))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.blocks, 6);
        assert_eq!(fs::read(&output).await.unwrap(), data);

        fs::remove_file(&input).await.unwrap();
        fs::remove_file(&output).await.unwrap();
    }

    #[tokio::test]
    async fn test_transfer_with_delay_based_window() {
        let (input, data) = write_input(2048).await;
        let output = temp_path("output");

        let session = TransferSession::new(TransferOptions {
            block_size: 1024,
            piece_size: 256,
            connection: fast_connection(),
            ..TransferOptions::default()
        })
        .unwrap();

        session.run(&input, &output).await.unwrap();
        assert_eq!(fs::read(&output).await.unwrap(), data);

        fs::remove_file(&input).await.unwrap();
        fs::remove_file(&output).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_input_fails() {
        let session = TransferSession::new(TransferOptions::default()).unwrap();
        let result = session
            .run(&temp_path("absent"), &temp_path("never-written"))
            .await;
        assert!(matches!(result, Err(TransferError::Io(_))));
    }

    #[test]
    fn test_invalid_options_rejected() {
        let options = TransferOptions {
            hint_window: 0,
            ..TransferOptions::default()
        };
        assert!(matches!(
            TransferSession::new(options),
            Err(TransferError::Config(_))
        ));

        let options = TransferOptions {
            link: LinkOptions {
                loss: 1.0,
                ..LinkOptions::default()
            },
            ..TransferOptions::default()
        };
        assert!(TransferSession::new(options).is_err());

        let options = TransferOptions {
            window: Some(0),
            ..TransferOptions::default()
        };
        assert!(matches!(
            TransferSession::new(options),
            Err(TransferError::Config(_))
        ));

        let options = TransferOptions {
            window: Some(1),
            ..TransferOptions::default()
        };
        assert!(TransferSession::new(options).is_ok());
    }

    #[tokio::test]
    async fn test_flush_waits_for_hash() {
        let path = temp_path("flush");
        let writer = BlockWriter::create(&path, FileLayout::new(8, 4, 2).unwrap())
            .await
            .unwrap();
        let mut progress = Progress::default();

        progress.completed(BlockId(0), Bytes::from_static(b"abcd"));
        progress.completed(BlockId(1), Bytes::from_static(b"efgh"));
        progress.flush(&writer).await.unwrap();
        assert_eq!(progress.written, 0);

        progress.hashes.insert(BlockId(0), block_hash(b"abcd"));
        progress.unavailable.insert(BlockId(1));
        progress.flush(&writer).await.unwrap();
        assert_eq!((progress.written, progress.verified, progress.unverified), (2, 1, 1));

        progress.completed(BlockId(0), Bytes::from_static(b"zzzz"));
        progress.hashes.insert(BlockId(0), block_hash(b"abcd"));
        assert!(matches!(
            progress.flush(&writer).await,
            Err(TransferError::Verification(_))
        ));

        fs::remove_file(&path).await.unwrap();
    }
}
