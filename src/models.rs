// src/models.rs

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::sync::Mutex;

/// Stable handle of a transfer item. Never reused within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(pub u64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The status of a transfer item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransferStatus {
    Connecting,
    Downloading,
    Paused,
    Completed,
    Canceled,
    Failed(String), // Storing a reason for failure
}

impl TransferStatus {
    /// Completed, Canceled and Failed admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Canceled | TransferStatus::Failed(_)
        )
    }

    /// Returns true while a worker may still be moving bytes for this item.
    pub fn is_active(&self) -> bool {
        matches!(self, TransferStatus::Connecting | TransferStatus::Downloading)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::Connecting => f.write_str("Connecting"),
            TransferStatus::Downloading => f.write_str("Downloading"),
            TransferStatus::Paused => f.write_str("Paused"),
            TransferStatus::Completed => f.write_str("Completed"),
            TransferStatus::Canceled => f.write_str("Canceled"),
            TransferStatus::Failed(reason) => write!(f, "Failed: {reason}"),
        }
    }
}

/// Mutable, observable part of an item. Guarded by a single lock so that a
/// snapshot never mixes counters from two different chunks.
#[derive(Debug)]
struct ItemState {
    status: TransferStatus,
    bytes_downloaded: u64,
    bytes_total: Option<u64>,
    throughput_bps: Option<f64>,
    /// Set once the worker has opened the remote body.
    streaming: bool,
}

/// One requested transfer and its tracked state.
///
/// The source location and id never change. The local name is assigned at
/// most once. Everything else is written by the owning worker, except the
/// pause/resume/cancel status flips issued by the registry.
#[derive(Debug)]
pub struct TransferItem {
    id: ItemId,
    source: String,
    local_name: OnceLock<PathBuf>,
    state: Mutex<ItemState>,
}

impl TransferItem {
    pub fn new(id: ItemId, source: String) -> Self {
        Self {
            id,
            source,
            local_name: OnceLock::new(),
            state: Mutex::new(ItemState {
                status: TransferStatus::Connecting,
                bytes_downloaded: 0,
                bytes_total: None,
                throughput_bps: None,
                streaming: false,
            }),
        }
    }

    /// A new item whose destination was already decided, e.g. when a failed
    /// transfer is resubmitted onto its partial file.
    pub fn with_local_name(id: ItemId, source: String, local_name: PathBuf) -> Self {
        let item = Self::new(id, source);
        let _ = item.local_name.set(local_name);
        item
    }

    pub fn id(&self) -> ItemId {
        self.id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn local_name(&self) -> Option<&Path> {
        self.local_name.get().map(PathBuf::as_path)
    }

    /// Assigns the destination. Returns false if one was already assigned.
    pub(crate) fn set_local_name(&self, path: PathBuf) -> bool {
        self.local_name.set(path).is_ok()
    }

    pub async fn status(&self) -> TransferStatus {
        self.state.lock().await.status.clone()
    }

    pub async fn snapshot(&self) -> TransferSnapshot {
        let state = self.state.lock().await;
        TransferSnapshot {
            id: self.id,
            source: self.source.clone(),
            local_name: self.local_name.get().cloned(),
            status: state.status.clone(),
            bytes_downloaded: state.bytes_downloaded,
            bytes_total: state.bytes_total,
            progress_percent: progress_percent(state.bytes_downloaded, state.bytes_total),
            throughput_bps: state.throughput_bps,
        }
    }

    /// Called once the remote body is open. `resumed` is the byte count
    /// already on disk; it becomes the starting point of the counter.
    pub(crate) async fn begin_streaming(&self, resumed: u64, total: Option<u64>) {
        let mut state = self.state.lock().await;
        state.bytes_downloaded = resumed;
        state.bytes_total = total.filter(|t| *t > 0);
        state.throughput_bps = None;
        state.streaming = true;
        // A pause issued while connecting stays in force.
        if state.status == TransferStatus::Connecting {
            state.status = TransferStatus::Downloading;
        }
    }

    /// Accounts one written chunk and returns the new byte count.
    pub(crate) async fn record_chunk(&self, len: u64, throughput_bps: Option<f64>) -> u64 {
        let mut state = self.state.lock().await;
        state.bytes_downloaded += len;
        if let Some(total) = state.bytes_total {
            // The remote under-declared its size; keep downloaded <= total.
            if state.bytes_downloaded > total {
                state.bytes_total = Some(state.bytes_downloaded);
            }
        }
        if throughput_bps.is_some() {
            state.throughput_bps = throughput_bps;
        }
        state.bytes_downloaded
    }

    /// Connecting/Downloading -> Paused. Returns whether the status changed.
    pub(crate) async fn mark_paused(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.status.is_active() {
            state.status = TransferStatus::Paused;
            true
        } else {
            false
        }
    }

    /// Paused -> Downloading, or back to Connecting if the body was never opened.
    pub(crate) async fn mark_resumed(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.status != TransferStatus::Paused {
            return false;
        }
        state.status = if state.streaming {
            TransferStatus::Downloading
        } else {
            TransferStatus::Connecting
        };
        true
    }

    /// Any non-terminal status -> Canceled.
    pub(crate) async fn mark_canceled(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.status.is_terminal() {
            false
        } else {
            state.status = TransferStatus::Canceled;
            true
        }
    }

    /// Settles the terminal status of a finished worker run. Cancellation
    /// wins over both success and failure.
    pub(crate) async fn finish(&self, canceled: bool, failure: Option<String>) -> TransferStatus {
        let mut state = self.state.lock().await;
        state.status = if canceled || state.status == TransferStatus::Canceled {
            TransferStatus::Canceled
        } else if let Some(reason) = failure {
            TransferStatus::Failed(reason)
        } else {
            if state.bytes_total.is_none() && state.bytes_downloaded > 0 {
                // Size is known now that the stream ended.
                state.bytes_total = Some(state.bytes_downloaded);
            }
            TransferStatus::Completed
        };
        state.status.clone()
    }
}

/// Point-in-time copy of an item, handed to whatever renders progress.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferSnapshot {
    pub id: ItemId,
    pub source: String,
    pub local_name: Option<PathBuf>,
    pub status: TransferStatus,
    pub bytes_downloaded: u64,
    /// `None` when the remote did not declare a length.
    pub bytes_total: Option<u64>,
    pub progress_percent: Option<u8>,
    pub throughput_bps: Option<f64>,
}

impl TransferSnapshot {
    pub fn size_label(&self) -> String {
        format_size(self.bytes_total)
    }

    /// Display name, or a placeholder while the name is being resolved.
    pub fn display_name(&self) -> String {
        match &self.local_name {
            Some(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            None => "Processing...".to_string(),
        }
    }
}

/// floor(downloaded * 100 / total), only defined for a known, non-zero total.
pub fn progress_percent(downloaded: u64, total: Option<u64>) -> Option<u8> {
    let total = total.filter(|t| *t > 0)?;
    let pct = (downloaded as u128 * 100) / total as u128;
    Some(pct.min(100) as u8)
}

/// Human-readable size, or "Unknown" when the size could not be determined.
pub fn format_size(size: Option<u64>) -> String {
    match size {
        None | Some(0) => "Unknown".to_string(),
        Some(s) if s < 1024 => format!("{s} B"),
        Some(s) if s < 1024 * 1024 => format!("{} KB", s / 1024),
        Some(s) => format!("{} MB", s / (1024 * 1024)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_is_floored_and_undefined_without_total() {
        assert_eq!(progress_percent(0, Some(1000)), Some(0));
        assert_eq!(progress_percent(999, Some(1000)), Some(99));
        assert_eq!(progress_percent(1000, Some(1000)), Some(100));
        assert_eq!(progress_percent(400_000, Some(1_000_000)), Some(40));
        assert_eq!(progress_percent(10, None), None);
        assert_eq!(progress_percent(10, Some(0)), None);
    }

    #[test]
    fn sizes_format_like_the_table() {
        assert_eq!(format_size(None), "Unknown");
        assert_eq!(format_size(Some(0)), "Unknown");
        assert_eq!(format_size(Some(512)), "512 B");
        assert_eq!(format_size(Some(2048)), "2 KB");
        assert_eq!(format_size(Some(1_000_000)), "976 KB");
        assert_eq!(format_size(Some(5 * 1024 * 1024 + 1)), "5 MB");
    }

    #[tokio::test]
    async fn new_item_is_connecting_with_nothing_downloaded() {
        let item = TransferItem::new(ItemId(1), "https://example.test/a.png".into());
        let snap = item.snapshot().await;
        assert_eq!(snap.status, TransferStatus::Connecting);
        assert_eq!(snap.bytes_downloaded, 0);
        assert_eq!(snap.bytes_total, None);
        assert_eq!(snap.progress_percent, None);
        assert_eq!(snap.display_name(), "Processing...");
    }

    #[tokio::test]
    async fn local_name_is_assigned_once() {
        let item = TransferItem::new(ItemId(1), "u".into());
        assert!(item.set_local_name(PathBuf::from("a.png")));
        assert!(!item.set_local_name(PathBuf::from("b.png")));
        assert_eq!(item.local_name(), Some(Path::new("a.png")));
    }

    #[tokio::test]
    async fn pause_during_connect_survives_stream_start() {
        let item = TransferItem::new(ItemId(1), "u".into());
        assert!(item.mark_paused().await);
        item.begin_streaming(0, Some(10)).await;
        assert_eq!(item.status().await, TransferStatus::Paused);
        assert!(item.mark_resumed().await);
        assert_eq!(item.status().await, TransferStatus::Downloading);
    }

    #[tokio::test]
    async fn resume_before_stream_start_returns_to_connecting() {
        let item = TransferItem::new(ItemId(1), "u".into());
        item.mark_paused().await;
        item.mark_resumed().await;
        assert_eq!(item.status().await, TransferStatus::Connecting);
        assert!(!item.mark_resumed().await);
    }

    #[tokio::test]
    async fn downloaded_never_exceeds_known_total() {
        let item = TransferItem::new(ItemId(1), "u".into());
        item.begin_streaming(0, Some(10)).await;
        item.record_chunk(8, None).await;
        item.record_chunk(8, None).await;
        let snap = item.snapshot().await;
        assert_eq!(snap.bytes_downloaded, 16);
        assert_eq!(snap.bytes_total, Some(16));
    }

    #[tokio::test]
    async fn unknown_total_is_settled_on_completion() {
        let item = TransferItem::new(ItemId(1), "u".into());
        item.begin_streaming(0, None).await;
        item.record_chunk(300, None).await;
        assert_eq!(item.snapshot().await.size_label(), "Unknown");
        assert_eq!(item.finish(false, None).await, TransferStatus::Completed);
        let snap = item.snapshot().await;
        assert_eq!(snap.bytes_total, Some(300));
        assert_eq!(snap.progress_percent, Some(100));
    }

    #[tokio::test]
    async fn cancel_wins_and_terminal_states_stick() {
        let item = TransferItem::new(ItemId(1), "u".into());
        assert!(item.mark_canceled().await);
        assert_eq!(item.finish(false, None).await, TransferStatus::Canceled);
        assert!(!item.mark_paused().await);
        assert!(!item.mark_canceled().await);

        let item = TransferItem::new(ItemId(2), "u".into());
        let status = item.finish(false, Some("boom".into())).await;
        assert_eq!(status, TransferStatus::Failed("boom".into()));
        assert_eq!(status.to_string(), "Failed: boom");
        assert!(!item.mark_canceled().await);
    }
}
