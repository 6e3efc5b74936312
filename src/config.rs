use crate::error::{Result, TransferError};
use crate::block::DEFAULT_PIECE_SIZE;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-connection tuning, handed to every connection at construction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Period of the advance timer driving piece scheduling
    pub advance_period: Duration,
    /// Period of the report timer
    pub report_period: Duration,
    /// Timeout of a single cache hint attempt
    pub hint_timeout: Duration,
    /// Retransmissions of a cache hint before its timeout is surfaced
    pub hint_retries: u32,
    /// Timeout of a single hash request attempt
    pub hash_timeout: Duration,
    /// Retransmissions of a hash request before the batch is re-queued
    pub hash_retries: u32,
    /// Bytes accounted against the congestion window per piece request
    pub mss: u32,
    /// Capacity of the upward event channel
    pub channel_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            advance_period: Duration::from_millis(100),
            report_period: Duration::from_secs(1),
            hint_timeout: Duration::from_secs(2),
            hint_retries: 4,
            hash_timeout: Duration::from_secs(2),
            hash_retries: 4,
            mss: DEFAULT_PIECE_SIZE,
            channel_capacity: 256,
        }
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.advance_period.is_zero() || self.report_period.is_zero() {
            return Err(TransferError::Config(
                "timer periods must be non-zero".to_string(),
            ));
        }
        if self.hint_timeout.is_zero() || self.hash_timeout.is_zero() {
            return Err(TransferError::Config("timeouts must be non-zero".to_string()));
        }
        if self.mss == 0 {
            return Err(TransferError::Config("mss must be non-zero".to_string()));
        }
        if self.channel_capacity == 0 {
            return Err(TransferError::Config(
                "channel capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
