use crate::block::{FileLayout, DEFAULT_BLOCK_SIZE, DEFAULT_PIECE_SIZE};
use crate::client::{TransferOptions, TransferSession};
use crate::error::Result;
use crate::transport::LinkOptions;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "piecewire")]
#[command(about = "Block and piece transfer between a seeder and a leecher", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Transfer a file through a local seeder and leecher
    Transfer {
        /// File to serve
        #[arg(short, long)]
        input: PathBuf,

        /// Where the leecher writes the file
        #[arg(short, long)]
        output: PathBuf,

        /// Block size in bytes
        #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
        block_size: u32,

        /// Piece size in bytes
        #[arg(long, default_value_t = DEFAULT_PIECE_SIZE)]
        piece_size: u32,

        /// Probability of losing a frame on the link
        #[arg(long, default_value = "0.0")]
        loss: f64,

        /// One-way link latency
        #[arg(long, default_value = "0")]
        latency_ms: u64,

        /// Extra random delay on top of the latency
        #[arg(long, default_value = "0")]
        jitter_ms: u64,

        /// Fixed number of outstanding piece requests instead of delay-based control
        #[arg(short, long)]
        window: Option<u64>,

        /// Blocks handed to the leecher at a time
        #[arg(long, default_value = "8")]
        hint_window: usize,
    },

    /// Show how a file splits into blocks and pieces
    Layout {
        /// File to inspect
        #[arg(short, long)]
        input: PathBuf,

        /// Block size in bytes
        #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
        block_size: u32,

        /// Piece size in bytes
        #[arg(long, default_value_t = DEFAULT_PIECE_SIZE)]
        piece_size: u32,
    },
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Commands::Transfer {
                input,
                output,
                block_size,
                piece_size,
                loss,
                latency_ms,
                jitter_ms,
                window,
                hint_window,
            } => {
                let options = TransferOptions {
                    block_size: *block_size,
                    piece_size: *piece_size,
                    link: LinkOptions {
                        loss: *loss,
                        latency: Duration::from_millis(*latency_ms),
                        jitter: Duration::from_millis(*jitter_ms),
                    },
                    window: *window,
                    hint_window: *hint_window,
                    ..TransferOptions::default()
                };

                let session = TransferSession::new(options)?;
                let summary = session.run(input, output).await?;

                println!("Transferred {} bytes in {:?}", summary.bytes, summary.elapsed);
                println!(
                    "Blocks: {} ({} verified by hash, {} by whole-file check)",
                    summary.blocks, summary.verified, summary.unverified
                );
                println!(
                    "Pieces served: {} ({} bytes), dropped: {}",
                    summary.upload.pieces_served,
                    summary.upload.bytes_served,
                    summary.upload.pieces_dropped
                );
            }

            Commands::Layout {
                input,
                block_size,
                piece_size,
            } => {
                self.show_layout(input, *block_size, *piece_size).await?;
            }
        }

        Ok(())
    }

    async fn show_layout(&self, input: &PathBuf, block_size: u32, piece_size: u32) -> Result<()> {
        let file_len = tokio::fs::metadata(input).await?.len();
        let layout = FileLayout::new(file_len, block_size, piece_size)?;
        let details = layout.default_details();

        println!("File Layout");
        println!("===========");
        println!("Path: {}", input.display());
        println!("Total Size: {} bytes", layout.file_len());
        println!("Block Size: {} bytes", details.block_size);
        println!("Piece Size: {} bytes", details.piece_size);
        println!("Pieces per Block: {}", details.nr_pieces);
        println!("Number of Blocks: {}", layout.nr_blocks());

        if !layout.overrides().is_empty() {
            println!("\nIrregular Blocks:");
            for (block, details) in layout.overrides() {
                println!(
                    "  {}: {} bytes, {} pieces, last piece {} bytes",
                    block, details.block_size, details.nr_pieces, details.last_piece_size
                );
            }
        }

        Ok(())
    }
}
