use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast;
use reqwest::{header, Client, StatusCode};
use thiserror::Error;
use futures_util::TryStreamExt;
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::control::{TransferControl, WaitOutcome};
use crate::models::{TransferItem, TransferStatus};
use crate::naming::{NameReservation, NameResolver, ResolveError};
use crate::progress::{ProgressThrottle, Throughput, TransferEvent};

/// Everything that can end a transfer as `Failed`. The `Display` text is the
/// reason recorded on the item.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("cannot resolve local name: {0}")]
    Resolution(#[from] ResolveError),
    #[error("connection failed: {0}")]
    Connect(#[source] reqwest::Error),
    #[error("transfer interrupted: {0}")]
    Stream(#[from] io::Error),
    #[error("pause wait interrupted: transfer was detached")]
    InterruptedWait,
}

/// How the stream loop ended when it did not fail.
enum LoopEnd {
    Finished,
    Canceled,
}

/// Fetches exactly one item, honoring its control.
pub struct Worker {
    client: Client,
    config: Arc<EngineConfig>,
    resolver: NameResolver,
    item: Arc<TransferItem>,
    control: Arc<TransferControl>,
    events: broadcast::Sender<TransferEvent>,
    reservation: Option<NameReservation>,
}

impl Worker {
    pub fn new(
        client: Client,
        config: Arc<EngineConfig>,
        resolver: NameResolver,
        item: Arc<TransferItem>,
        control: Arc<TransferControl>,
        events: broadcast::Sender<TransferEvent>,
    ) -> Self {
        Self { client, config, resolver, item, control, events, reservation: None }
    }

    /// Hands the worker a name already claimed for its item.
    pub fn with_reservation(mut self, reservation: NameReservation) -> Self {
        self.reservation = Some(reservation);
        self
    }

    /// Runs the transfer to a terminal status. Never returns an error: every
    /// failure is recorded on the item instead.
    pub async fn run(mut self) -> TransferStatus {
        let id = self.item.id();
        info!(%id, source = self.item.source(), "worker starting");

        // Held until cleanup is done so the name cannot be handed out while
        // a canceled partial file is still on disk.
        let mut reservation = self.reservation.take();
        let result = self.transfer(&mut reservation).await;

        let failure = match &result {
            Ok(()) => None,
            Err(e) => Some(e.to_string()),
        };
        let status = self.item.finish(self.control.is_canceled(), failure).await;

        match &status {
            TransferStatus::Canceled => {
                if let Some(path) = self.item.local_name() {
                    remove_partial(path).await;
                }
                info!(%id, "transfer canceled");
            }
            TransferStatus::Failed(reason) => warn!(%id, %reason, "transfer failed"),
            _ => info!(%id, "transfer completed"),
        }
        drop(reservation);

        // Final notification, whatever throttling held back.
        self.notify(TransferEvent::Progress { id });
        self.notify(TransferEvent::StatusChanged { id, status: status.clone() });
        status
    }

    async fn transfer(&self, reservation: &mut Option<NameReservation>) -> Result<(), TransferError> {
        let path = self.claim_local_name(reservation).await?;
        self.notify(TransferEvent::Progress { id: self.item.id() });

        if self.control.is_canceled() {
            return Ok(());
        }

        // Only a transfer that has been resumed trusts bytes already on disk.
        let on_disk = if self.control.is_fresh_start() {
            0
        } else {
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => meta.len(),
                _ => 0,
            }
        };

        let mut request = self.client.get(self.item.source());
        if on_disk > 0 {
            request = request.header(header::RANGE, format!("bytes={on_disk}-"));
        }
        let response = request
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(TransferError::Connect)?;
        if self.control.is_canceled() {
            return Ok(());
        }

        let resumed = if on_disk > 0 && response.status() != StatusCode::PARTIAL_CONTENT {
            warn!(id = %self.item.id(), status = %response.status(), "range not honored, restarting from zero");
            0
        } else {
            on_disk
        };
        let total = response.content_length().map(|remaining| remaining + resumed);
        debug!(id = %self.item.id(), resumed, ?total, "remote opened");

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = if resumed > 0 {
            OpenOptions::new().append(true).open(&path).await?
        } else {
            File::create(&path).await?
        };

        self.item.begin_streaming(resumed, total).await;
        self.notify(TransferEvent::StatusChanged { id: self.item.id(), status: self.item.status().await });

        let body = response.bytes_stream().map_err(io::Error::other);
        let mut reader = StreamReader::new(Box::pin(body));

        let end = self.pump(&mut reader, &mut file).await;
        let flushed = file.flush().await;
        match end? {
            LoopEnd::Canceled => Ok(()),
            LoopEnd::Finished => {
                flushed?;
                Ok(())
            }
        }
    }

    /// The item's destination: the one it was created with, or a freshly
    /// resolved one. Either way the name is held exclusively.
    async fn claim_local_name(
        &self,
        reservation: &mut Option<NameReservation>,
    ) -> Result<PathBuf, TransferError> {
        if let Some(held) = reservation.as_ref() {
            return Ok(held.path().to_path_buf());
        }
        if let Some(path) = self.item.local_name() {
            let held = self
                .resolver
                .claim(path)
                .ok_or_else(|| ResolveError::InUse(path.to_path_buf()))?;
            *reservation = Some(held);
            return Ok(path.to_path_buf());
        }
        let held = self.resolver.resolve(self.item.source()).await?;
        let path = held.path().to_path_buf();
        self.item.set_local_name(path.clone());
        *reservation = Some(held);
        Ok(path)
    }

    /// Copies the body to `file` one buffer at a time, checking the control
    /// before each write.
    async fn pump<R>(&self, reader: &mut R, file: &mut File) -> Result<LoopEnd, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        let id = self.item.id();
        let mut buffer = vec![0u8; self.config.buffer_size];
        let mut meter = Throughput::start();
        let mut throttle = ProgressThrottle::new(self.config.notify_every_bytes);

        loop {
            let read = reader.read(&mut buffer).await?;
            if read == 0 {
                return Ok(LoopEnd::Finished);
            }

            if self.control.is_canceled() {
                return Ok(LoopEnd::Canceled);
            }
            if self.control.is_paused() {
                debug!(%id, "paused");
                meter.pause();
                self.notify(TransferEvent::Progress { id });
                match self.control.wait_while_paused(self.config.pause_poll_interval).await {
                    WaitOutcome::Resumed => {
                        debug!(%id, "resumed");
                        meter.resume();
                    }
                    WaitOutcome::Canceled => return Ok(LoopEnd::Canceled),
                    WaitOutcome::Detached => return Err(TransferError::InterruptedWait),
                }
            }

            file.write_all(&buffer[..read]).await?;
            meter.add(read as u64);
            self.item.record_chunk(read as u64, meter.bytes_per_sec()).await;

            if throttle.advance(read as u64) {
                self.notify(TransferEvent::Progress { id });
            }
        }
    }

    fn notify(&self, event: TransferEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Best effort: a partial file that cannot be removed is only logged.
async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed partial file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "could not remove partial file"),
    }
}
