use super::{block_hash, BlockSource, FetchedBlocks};
use crate::block::{BlockId, FileLayout};
use crate::error::{Result, TransferError};
use bytes::Bytes;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// Serves blocks read from a file on disk
pub struct FileBlockSource {
    path: PathBuf,
    layout: FileLayout,
}

impl FileBlockSource {
    pub async fn open<P: AsRef<Path>>(path: P, block_size: u32, piece_size: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file_len = fs::metadata(&path).await?.len();

        let layout = FileLayout::new(file_len, block_size, piece_size)?;
        Ok(Self { path, layout })
    }

    pub fn layout(&self) -> &FileLayout {
        &self.layout
    }

    async fn read_block(&self, file: &mut File, block: BlockId) -> Result<Bytes> {
        let offset = self.layout.block_offset(block);
        let length = self.layout.details(block).block_size as usize;

        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut buffer = vec![0u8; length];
        file.read_exact(&mut buffer).await?;

        Ok(Bytes::from(buffer))
    }
}

impl BlockSource for FileBlockSource {
    async fn fetch(&self, blocks: BTreeSet<BlockId>) -> Result<FetchedBlocks> {
        let mut file = File::open(&self.path).await?;
        let mut fetched = FetchedBlocks::default();

        for block in blocks {
            if !self.layout.contains(block) {
                return Err(TransferError::Source(format!(
                    "Block {} beyond end of {:?}",
                    block, self.path
                )));
            }

            let data = self.read_block(&mut file, block).await?;
            fetched.hashes.insert(block, block_hash(&data));
            fetched.blocks.insert(block, data);
            if let Some(details) = self.layout.overrides().get(&block) {
                fetched.irregular.insert(block, *details);
            }
        }

        debug!("Read {} blocks from {:?}", fetched.blocks.len(), self.path);
        Ok(fetched)
    }
}

/// Serves blocks sliced out of an in-memory file
#[cfg(test)]
pub struct MemoryBlockSource {
    data: Bytes,
    layout: FileLayout,
}

#[cfg(test)]
impl MemoryBlockSource {
    pub fn new(data: Bytes, block_size: u32, piece_size: u32) -> Self {
        let layout = FileLayout::new(data.len() as u64, block_size, piece_size)
            .expect("test source layout");
        Self { data, layout }
    }

    pub fn layout(&self) -> &FileLayout {
        &self.layout
    }
}

#[cfg(test)]
impl BlockSource for MemoryBlockSource {
    async fn fetch(&self, blocks: BTreeSet<BlockId>) -> Result<FetchedBlocks> {
        let mut fetched = FetchedBlocks::default();

        for block in blocks {
            if !self.layout.contains(block) {
                return Err(TransferError::Source(format!("Unknown block {}", block)));
            }

            let start = self.layout.block_offset(block) as usize;
            let end = start + self.layout.details(block).block_size as usize;
            let data = self.data.slice(start..end);

            fetched.hashes.insert(block, block_hash(&data));
            fetched.blocks.insert(block, data);
            if let Some(details) = self.layout.overrides().get(&block) {
                fetched.irregular.insert(block, *details);
            }
        }

        Ok(fetched)
    }
}
