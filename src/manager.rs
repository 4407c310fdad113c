// src/manager.rs

use crate::config::{ConfigError, EngineConfig};
use crate::control::TransferControl;
use crate::downloader::Worker;
use crate::models::{ItemId, TransferItem, TransferSnapshot, TransferStatus};
use crate::naming::{NameReservation, NameResolver};
use crate::progress::TransferEvent;
use reqwest::Client;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("location must not be empty")]
    EmptyLocation,
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("cannot build http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// What happens to live workers when the registry goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Cancel everything and wait for partial files to be removed.
    Cancel,
    /// Let running transfers finish on their own. Paused ones give up and
    /// keep their partial data.
    Detach,
}

/// A worker that has been started for an item, and the signals it listens to.
struct ActiveTransfer {
    control: Arc<TransferControl>,
    handle: JoinHandle<TransferStatus>,
}

/// The only component that starts, pauses, resumes or cancels workers.
///
/// Control calls only flip flags; the worker reacts at its next check point,
/// so a pause may still let one more chunk through after the call returns.
pub struct Registry {
    config: Arc<EngineConfig>,
    http_client: Client,
    resolver: NameResolver,
    // Lock order: items before controls.
    items: Mutex<Vec<Arc<TransferItem>>>,
    controls: Mutex<HashMap<ItemId, ActiveTransfer>>,
    // Workers whose control entry is gone but whose cleanup may still run.
    retired: Mutex<Vec<JoinHandle<TransferStatus>>>,
    events: broadcast::Sender<TransferEvent>,
    next_item_id: AtomicU64,
}

impl Registry {
    pub fn new(config: EngineConfig) -> Result<Self, RegistryError> {
        config.validate()?;

        let http_client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout)
            .build()?;
        let resolver = NameResolver::new(
            http_client.clone(),
            config.download_dir.clone(),
            config.media_types.clone(),
            config.connect_timeout,
        );
        let (events, _) = broadcast::channel(config.event_capacity);

        Ok(Self {
            config: Arc::new(config),
            http_client,
            resolver,
            items: Mutex::new(Vec::new()),
            controls: Mutex::new(HashMap::new()),
            retired: Mutex::new(Vec::new()),
            events,
            next_item_id: AtomicU64::new(1),
        })
    }

    /// Progress and status notifications for every item.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    /// Adds a transfer and starts its worker. The item is visible as
    /// `Connecting` by the time this returns.
    pub async fn submit(&self, location: &str) -> Result<ItemId, RegistryError> {
        let location = location.trim();
        if location.is_empty() {
            return Err(RegistryError::EmptyLocation);
        }
        let id = self.allocate_id();
        let item = Arc::new(TransferItem::new(id, location.to_string()));
        self.start(item, TransferControl::new(), None).await;
        info!(%id, location, "transfer submitted");
        Ok(id)
    }

    /// Retries a failed item as a new item on the same destination, picking
    /// up whatever partial data the failed run left behind. If another item
    /// has taken that destination in the meantime, the retry starts over under
    /// a freshly resolved name.
    ///
    /// Returns the new handle, or `None` if `id` is not a failed item.
    pub async fn resubmit(&self, id: ItemId) -> Option<ItemId> {
        let old = {
            let mut items = self.items.lock().await;
            let pos = items.iter().position(|item| item.id() == id)?;
            if !matches!(items[pos].status().await, TransferStatus::Failed(_)) {
                return None;
            }
            items.remove(pos)
        };
        // The failed worker lets go of its name only once it has fully exited.
        if let Some(active) = self.controls.lock().await.remove(&id) {
            if let Err(e) = active.handle.await {
                debug!(%id, error = %e, "worker ended abnormally");
            }
        }
        self.notify(TransferEvent::Removed { id });

        let new_id = self.allocate_id();
        let source = old.source().to_string();
        let inherited = match old.local_name() {
            Some(path) => self.claim_inherited(path).await,
            None => None,
        };
        match inherited {
            Some(held) => {
                let item = TransferItem::with_local_name(new_id, source, held.path().to_path_buf());
                self.start(Arc::new(item), TransferControl::resuming(), Some(held)).await;
            }
            None => {
                if let Some(path) = old.local_name() {
                    warn!(old = %id, path = %path.display(), "previous destination is taken, resolving a new name");
                }
                self.start(Arc::new(TransferItem::new(new_id, source)), TransferControl::new(), None).await;
            }
        }
        info!(old = %id, new = %new_id, "failed transfer resubmitted");
        Some(new_id)
    }

    pub async fn pause(&self, id: ItemId) {
        let Some(control) = self.control(id).await else {
            return;
        };
        let Some(item) = self.item(id).await else {
            return;
        };
        if item.mark_paused().await {
            control.pause();
            info!(%id, "transfer paused");
            self.notify(TransferEvent::StatusChanged { id, status: TransferStatus::Paused });
        }
    }

    pub async fn resume(&self, id: ItemId) {
        let Some(control) = self.control(id).await else {
            return;
        };
        let Some(item) = self.item(id).await else {
            return;
        };
        if item.mark_resumed().await {
            control.resume();
            info!(%id, "transfer resumed");
            self.notify(TransferEvent::StatusChanged { id, status: item.status().await });
        }
    }

    /// Signals the worker to stop. The worker removes the partial file when
    /// it notices. Canceling a finished item does nothing.
    pub async fn cancel(&self, id: ItemId) {
        let Some(active) = self.controls.lock().await.remove(&id) else {
            return;
        };
        active.control.cancel();
        self.keep_retired(active.handle).await;

        if let Some(item) = self.item(id).await {
            if item.mark_canceled().await {
                info!(%id, "transfer canceled");
                self.notify(TransferEvent::StatusChanged { id, status: TransferStatus::Canceled });
            }
        }
    }

    pub async fn pause_many(&self, ids: &[ItemId]) {
        for id in ids {
            self.pause(*id).await;
        }
    }

    pub async fn resume_many(&self, ids: &[ItemId]) {
        for id in ids {
            self.resume(*id).await;
        }
    }

    pub async fn cancel_many(&self, ids: &[ItemId]) {
        for id in ids {
            self.cancel(*id).await;
        }
    }

    /// Drops every Completed, Canceled and Failed item. Returns the handles
    /// that were removed.
    pub async fn clear_terminal(&self) -> Vec<ItemId> {
        let mut removed = Vec::new();
        {
            let mut items = self.items.lock().await;
            let mut kept = Vec::with_capacity(items.len());
            for item in items.drain(..) {
                if item.status().await.is_terminal() {
                    removed.push(item.id());
                } else {
                    kept.push(item);
                }
            }
            *items = kept;
        }
        for id in &removed {
            self.retire(*id).await;
            self.notify(TransferEvent::Removed { id: *id });
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "cleared finished transfers");
        }
        removed
    }

    pub async fn snapshot(&self, id: ItemId) -> Option<TransferSnapshot> {
        let item = self.item(id).await?;
        Some(item.snapshot().await)
    }

    /// Every item, in submission order.
    pub async fn snapshots(&self) -> Vec<TransferSnapshot> {
        let items: Vec<_> = self.items.lock().await.clone();
        let mut result = Vec::with_capacity(items.len());
        for item in items {
            result.push(item.snapshot().await);
        }
        result
    }

    pub async fn ids(&self) -> Vec<ItemId> {
        self.items.lock().await.iter().map(|item| item.id()).collect()
    }

    /// True once every item has reached a terminal status.
    pub async fn is_idle(&self) -> bool {
        let items: Vec<_> = self.items.lock().await.clone();
        for item in items {
            if !item.status().await.is_terminal() {
                return false;
            }
        }
        true
    }

    /// Tears down all live workers.
    pub async fn shutdown(&self, mode: ShutdownMode) {
        let active: Vec<(ItemId, ActiveTransfer)> = self.controls.lock().await.drain().collect();
        info!(workers = active.len(), ?mode, "registry shutting down");

        let mut handles = Vec::with_capacity(active.len());
        for (id, transfer) in active {
            match mode {
                ShutdownMode::Cancel => {
                    transfer.control.cancel();
                    if let Some(item) = self.item(id).await {
                        if item.mark_canceled().await {
                            self.notify(TransferEvent::StatusChanged { id, status: TransferStatus::Canceled });
                        }
                    }
                }
                ShutdownMode::Detach => transfer.control.detach(),
            }
            handles.push(transfer.handle);
        }
        handles.append(&mut *self.retired.lock().await);

        if mode == ShutdownMode::Cancel {
            for handle in handles {
                if let Err(e) = handle.await {
                    debug!(error = %e, "worker ended abnormally");
                }
            }
        }
    }

    async fn start(
        &self,
        item: Arc<TransferItem>,
        control: TransferControl,
        reservation: Option<NameReservation>,
    ) {
        let id = item.id();
        let control = Arc::new(control);
        self.items.lock().await.push(item.clone());
        self.notify(TransferEvent::Added { id });

        let mut worker = Worker::new(
            self.http_client.clone(),
            self.config.clone(),
            self.resolver.clone(),
            item,
            control.clone(),
            self.events.clone(),
        );
        if let Some(held) = reservation {
            worker = worker.with_reservation(held);
        }
        let handle = tokio::spawn(worker.run());
        self.controls.lock().await.insert(id, ActiveTransfer { control, handle });
    }

    /// Forgets the control of an item, keeping its worker handle so shutdown
    /// can still wait for it.
    async fn retire(&self, id: ItemId) {
        if let Some(active) = self.controls.lock().await.remove(&id) {
            self.keep_retired(active.handle).await;
        }
    }

    async fn keep_retired(&self, handle: JoinHandle<TransferStatus>) {
        let mut retired = self.retired.lock().await;
        retired.retain(|h| !h.is_finished());
        if !handle.is_finished() {
            retired.push(handle);
        }
    }

    /// Claims a failed item's destination for its retry, unless a live worker
    /// holds it or another item owns the file.
    async fn claim_inherited(&self, path: &Path) -> Option<NameReservation> {
        let owned_elsewhere = self
            .items
            .lock()
            .await
            .iter()
            .any(|item| item.local_name() == Some(path));
        if owned_elsewhere {
            return None;
        }
        self.resolver.claim(path)
    }

    async fn item(&self, id: ItemId) -> Option<Arc<TransferItem>> {
        self.items.lock().await.iter().find(|item| item.id() == id).cloned()
    }

    async fn control(&self, id: ItemId) -> Option<Arc<TransferControl>> {
        self.controls.lock().await.get(&id).map(|active| active.control.clone())
    }

    fn allocate_id(&self) -> ItemId {
        ItemId(self.next_item_id.fetch_add(1, Ordering::SeqCst))
    }

    fn notify(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        // Workers outlive the registry; make sure none waits on a resume that
        // can no longer arrive.
        for active in self.controls.get_mut().values() {
            active.control.detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn all_workers_exited(registry: &Registry) -> bool {
        registry.controls.lock().await.values().all(|active| active.handle.is_finished())
    }

    #[tokio::test]
    async fn canceling_finished_items_leaves_no_handles_behind() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(EngineConfig::default().with_download_dir(dir.path())).unwrap();

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(registry.submit("not a url").await.unwrap());
        }
        tokio::time::timeout(Duration::from_secs(10), async {
            while !all_workers_exited(&registry).await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        registry.cancel_many(&ids).await;

        assert!(registry.retired.lock().await.is_empty());
        assert!(registry.controls.lock().await.is_empty());
        for id in ids {
            assert!(matches!(registry.snapshot(id).await.unwrap().status, TransferStatus::Failed(_)));
        }
    }
}
