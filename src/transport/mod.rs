//! Datagram plumbing between connection actors
//!
//! Frames travel over an in-memory link that may drop, delay and reorder
//! them. Requests are retransmitted by `RetryTimers` until they are
//! answered or their retries run out.

use crate::connection::Outbound;
use crate::peer::WireMessage;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::debug;

/// Behaviour of one direction of a link
#[derive(Debug, Clone, Copy)]
pub struct LinkOptions {
    /// Probability of dropping a frame, in `[0, 1]`
    pub loss: f64,
    pub latency: Duration,
    /// Extra delay drawn uniformly from `[0, jitter)`
    pub jitter: Duration,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            loss: 0.0,
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }
}

impl LinkOptions {
    fn delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.latency;
        }
        self.latency + self.jitter.mul_f64(rand::random::<f64>())
    }

    fn drops(&self) -> bool {
        self.loss > 0.0 && rand::random::<f64>() < self.loss
    }
}

/// One end of a link
pub struct LinkEnd {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl LinkEnd {
    /// Fire-and-forget send of an encoded frame
    pub fn send(&self, frame: Bytes) {
        if self.tx.send(frame).is_err() {
            debug!("Link closed, frame discarded");
        }
    }

    pub fn send_message(&self, message: &WireMessage) {
        self.send(message.to_bytes());
    }

    /// Next frame, `None` once the other end is gone
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

/// Two connected link ends. Must be called inside a tokio runtime.
pub fn link_pair(options: LinkOptions) -> (LinkEnd, LinkEnd) {
    let (a_tx, a_out) = mpsc::unbounded_channel();
    let (b_tx, b_out) = mpsc::unbounded_channel();
    let (a_in_tx, a_in) = mpsc::unbounded_channel();
    let (b_in_tx, b_in) = mpsc::unbounded_channel();

    tokio::spawn(forward(a_out, b_in_tx, options));
    tokio::spawn(forward(b_out, a_in_tx, options));

    (
        LinkEnd { tx: a_tx, rx: a_in },
        LinkEnd { tx: b_tx, rx: b_in },
    )
}

async fn forward(
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    tx: mpsc::UnboundedSender<Bytes>,
    options: LinkOptions,
) {
    while let Some(frame) = rx.recv().await {
        if options.drops() {
            continue;
        }

        let delay = options.delay();
        if delay.is_zero() {
            if tx.send(frame).is_err() {
                break;
            }
            continue;
        }

        let tx = tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(frame);
        });
    }
}

/// What to do about an expired request timer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expiry {
    /// Send the request again under the same correlation id
    Retransmit(WireMessage),
    /// Retries exhausted, surface the timeout to the connection
    TimedOut(u64),
    /// The request was answered or superseded meanwhile
    Stale,
}

#[derive(Debug)]
struct Tracked {
    message: WireMessage,
    timeout: Duration,
    retries_left: u32,
    attempt: u32,
}

/// Timeout timers of outstanding requests.
///
/// Dropping the timers cancels every one of them.
#[derive(Default)]
pub struct RetryTimers {
    timers: JoinSet<(u64, u32)>,
    tracked: BTreeMap<u64, Tracked>,
}

impl RetryTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the timer of a freshly sent request
    pub fn arm(&mut self, outbound: Outbound) {
        let id = outbound.message.id();
        self.tracked.insert(
            id,
            Tracked {
                message: outbound.message,
                timeout: outbound.timeout,
                retries_left: outbound.retries,
                attempt: 0,
            },
        );
        self.spawn_timer(id, 0, outbound.timeout);
    }

    fn spawn_timer(&mut self, id: u64, attempt: u32, after: Duration) {
        self.timers.spawn(async move {
            tokio::time::sleep(after).await;
            (id, attempt)
        });
    }

    /// Forget a request that got its answer
    pub fn resolve(&mut self, id: u64) {
        self.tracked.remove(&id);
    }

    #[cfg(test)]
    pub fn outstanding(&self) -> usize {
        self.tracked.len()
    }

    /// Wait for the next timer to fire. Returns `None` when no timer runs.
    pub async fn next_expired(&mut self) -> Option<(u64, u32)> {
        loop {
            match self.timers.join_next().await? {
                Ok(fired) => return Some(fired),
                Err(_) => continue,
            }
        }
    }

    /// Decide on a fired timer. `still_pending` tells whether the
    /// connection is still waiting for the request.
    pub fn expire(&mut self, id: u64, attempt: u32, still_pending: bool) -> Expiry {
        let Some(tracked) = self.tracked.get_mut(&id) else {
            return Expiry::Stale;
        };
        if tracked.attempt != attempt {
            return Expiry::Stale;
        }
        if !still_pending {
            self.tracked.remove(&id);
            return Expiry::Stale;
        }

        if tracked.retries_left > 0 {
            tracked.retries_left -= 1;
            tracked.attempt += 1;
            let (attempt, timeout, message) =
                (tracked.attempt, tracked.timeout, tracked.message.clone());
            self.spawn_timer(id, attempt, timeout);
            return Expiry::Retransmit(message);
        }

        self.tracked.remove(&id);
        Expiry::TimedOut(id)
    }
}
