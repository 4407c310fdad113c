// src/progress.rs

use crate::models::{ItemId, TransferStatus};
use std::time::Duration;
use tokio::time::Instant;

/// Notifications for whoever renders the transfer list. They only say what
/// changed; the current values are read back from the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Added { id: ItemId },
    Progress { id: ItemId },
    StatusChanged { id: ItemId, status: TransferStatus },
    Removed { id: ItemId },
}

impl TransferEvent {
    pub fn id(&self) -> ItemId {
        match self {
            TransferEvent::Added { id }
            | TransferEvent::Progress { id }
            | TransferEvent::StatusChanged { id, .. }
            | TransferEvent::Removed { id } => *id,
        }
    }
}

/// Average rate of the bytes one worker run has fetched since streaming
/// began. Time spent paused does not count.
#[derive(Debug)]
pub struct Throughput {
    active: Duration,
    running_since: Option<Instant>,
    bytes: u64,
}

impl Throughput {
    pub fn start() -> Self {
        Self { active: Duration::ZERO, running_since: Some(Instant::now()), bytes: 0 }
    }

    pub fn add(&mut self, bytes: u64) {
        self.bytes += bytes;
    }

    /// Stops the clock until `resume`.
    pub fn pause(&mut self) {
        if let Some(since) = self.running_since.take() {
            self.active += since.elapsed();
        }
    }

    pub fn resume(&mut self) {
        self.running_since.get_or_insert_with(Instant::now);
    }

    fn elapsed(&self) -> Duration {
        self.active + self.running_since.map(|since| since.elapsed()).unwrap_or_default()
    }

    /// Bytes per second, once a measurable amount of time has passed.
    pub fn bytes_per_sec(&self) -> Option<f64> {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed <= f64::EPSILON {
            return None;
        }
        Some(self.bytes as f64 / elapsed)
    }
}

/// Bounds the notification rate to one per `every` bytes transferred.
#[derive(Debug)]
pub struct ProgressThrottle {
    every: u64,
    since_last: u64,
}

impl ProgressThrottle {
    /// `every == 0` notifies on every chunk.
    pub fn new(every: u64) -> Self {
        Self { every, since_last: 0 }
    }

    /// Accounts `bytes` and reports whether a notification is due.
    pub fn advance(&mut self, bytes: u64) -> bool {
        self.since_last += bytes;
        if self.since_last >= self.every {
            self.since_last = 0;
            true
        } else {
            false
        }
    }
}
