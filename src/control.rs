// src/control.rs

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Why a paused wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Resumed,
    Canceled,
    Detached,
}

/// Cooperative signals shared between the registry and one worker.
///
/// Nothing here interrupts the worker. It looks at the flags between chunks
/// and while it sits in a paused wait.
#[derive(Debug)]
pub struct TransferControl {
    paused: AtomicBool,
    fresh_start: AtomicBool,
    canceled: CancellationToken,
    detached: CancellationToken,
}

impl Default for TransferControl {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferControl {
    pub fn new() -> Self {
        Self {
            paused: AtomicBool::new(false),
            fresh_start: AtomicBool::new(true),
            canceled: CancellationToken::new(),
            detached: CancellationToken::new(),
        }
    }

    /// A control whose worker will pick up an existing partial file instead
    /// of overwriting it.
    pub fn resuming() -> Self {
        let control = Self::new();
        control.fresh_start.store(false, Ordering::SeqCst);
        control
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.fresh_start.store(false, Ordering::SeqCst);
    }

    pub fn cancel(&self) {
        self.canceled.cancel();
    }

    /// Releases the worker from its registry. A paused worker gives up.
    pub fn detach(&self) {
        self.detached.cancel();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.is_cancelled()
    }

    pub fn is_detached(&self) -> bool {
        self.detached.is_cancelled()
    }

    pub fn is_fresh_start(&self) -> bool {
        self.fresh_start.load(Ordering::SeqCst)
    }

    /// Blocks while paused, re-checking every `poll`. Cancellation and
    /// detachment cut the current poll short.
    pub async fn wait_while_paused(&self, poll: Duration) -> WaitOutcome {
        loop {
            if self.is_canceled() {
                return WaitOutcome::Canceled;
            }
            if !self.is_paused() {
                return WaitOutcome::Resumed;
            }
            if self.is_detached() {
                return WaitOutcome::Detached;
            }
            tokio::select! {
                _ = tokio::time::sleep(poll) => {},
                _ = self.canceled.cancelled() => {},
                _ = self.detached.cancelled() => {},
            }
        }
    }
}
