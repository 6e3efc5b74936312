mod source;

pub use source::FileBlockSource;
#[cfg(test)]
pub use source::MemoryBlockSource;

use crate::block::{BlockDetails, BlockId, FileLayout};
use crate::error::{Result, TransferError};
use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

/// Blocks delivered by a backing source
#[derive(Debug, Clone, Default)]
pub struct FetchedBlocks {
    pub blocks: BTreeMap<BlockId, Bytes>,
    pub hashes: BTreeMap<BlockId, Bytes>,
    /// Details of blocks that deviate from the file's default layout
    pub irregular: BTreeMap<BlockId, BlockDetails>,
}

impl FetchedBlocks {
    /// Whether every block in `wanted` was delivered
    pub fn covers(&self, wanted: &BTreeSet<BlockId>) -> bool {
        wanted.iter().all(|block| self.blocks.contains_key(block))
    }
}

/// Where a seeder reads the blocks it serves
pub trait BlockSource: Send + Sync + 'static {
    fn fetch(
        &self,
        blocks: BTreeSet<BlockId>,
    ) -> impl Future<Output = Result<FetchedBlocks>> + Send;
}

/// SHA-1 of a block
pub fn block_hash(data: &[u8]) -> Bytes {
    let mut hasher = Sha1::new();
    hasher.update(data);
    Bytes::copy_from_slice(hasher.finalize().as_slice())
}

/// Check a completed block against its expected hash
pub fn verify_block(block: BlockId, data: &[u8], expected: &[u8]) -> Result<()> {
    if block_hash(data).as_ref() != expected {
        return Err(TransferError::Verification(format!(
            "Block {} hash mismatch",
            block
        )));
    }
    Ok(())
}

/// Writes completed blocks into an output file
pub struct BlockWriter {
    path: PathBuf,
    layout: FileLayout,
}

impl BlockWriter {
    /// Create (or truncate) the output file at its final length
    pub async fn create<P: AsRef<Path>>(path: P, layout: FileLayout) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;
        file.set_len(layout.file_len()).await?;

        info!(
            "Output initialized: {:?}, {} blocks, {} bytes",
            path,
            layout.nr_blocks(),
            layout.file_len()
        );

        Ok(Self { path, layout })
    }

    /// Write a block at its offset
    pub async fn write_block(&self, block: BlockId, data: &[u8]) -> Result<()> {
        let expected = self.layout.details(block).block_size as usize;
        if !self.layout.contains(block) || data.len() != expected {
            return Err(TransferError::Storage(format!(
                "Block {} does not fit the layout ({} bytes, expected {})",
                block,
                data.len(),
                expected
            )));
        }

        let offset = self.layout.block_offset(block);
        let mut file = OpenOptions::new().write(true).open(&self.path).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;

        debug!("Wrote block {} at offset {} ({} bytes)", block, offset, data.len());
        Ok(())
    }
}
