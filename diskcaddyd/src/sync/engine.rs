use std::sync::Arc;
use std::time::{Duration, Instant};

use diskcaddy_core::{DeviceClient, DeviceError, DiskRef, ZipError, build_archive};
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use super::queue::{DiskQueue, ImportError, ImportOutcome};
use super::session::{EXPORT_FAIL_LABEL, FILE_ERROR_LABEL, SyncSession, SyncState};

pub const DEFAULT_RECONNECT_GRACE: Duration = Duration::from_millis(5000);

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("upload of item {index} ({name}) failed: {source}")]
    Item {
        index: usize,
        name: String,
        #[source]
        source: DeviceError,
    },
    #[error("commit failed: {0}")]
    Commit(#[source] DeviceError),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
    #[error("archive error: {0}")]
    Zip(#[from] ZipError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Another poll or an upload was in flight; no request was sent.
    Skipped,
    Alive,
    Unreachable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Not ready, already uploading, or nothing queued.
    Skipped,
    Committed { items: usize },
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub reconnect_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reconnect_grace: DEFAULT_RECONNECT_GRACE,
        }
    }
}

/// Everything a front end needs to redraw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub label: String,
    pub state: SyncState,
    pub queue: Vec<String>,
    pub optimized: bool,
    pub dirty_count: u32,
    pub dirty_items: Vec<DiskRef>,
    pub dirty_prompt_visible: bool,
}

impl StatusSnapshot {
    pub fn is_ready(&self) -> bool {
        self.state == SyncState::Ready
    }
}

#[derive(Debug, Default)]
struct EngineState {
    queue: DiskQueue,
    session: SyncSession,
}

impl EngineState {
    fn snapshot(&self, now: Instant) -> StatusSnapshot {
        let dirty = self.session.dirty();
        StatusSnapshot {
            label: self.session.status_label(now),
            state: self.session.state(),
            queue: self.queue.names(),
            optimized: self.queue.is_optimized(),
            dirty_count: dirty.count,
            dirty_items: dirty.items.clone(),
            dirty_prompt_visible: dirty.prompt_visible,
        }
    }
}

/// Owns the disk queue and the device session behind one lock. The lock is
/// never held across a device request.
pub struct SyncEngine {
    client: DeviceClient,
    config: EngineConfig,
    state: Mutex<EngineState>,
    status_tx: watch::Sender<StatusSnapshot>,
}

impl SyncEngine {
    pub fn new(client: DeviceClient, config: EngineConfig) -> Self {
        let state = EngineState::default();
        let (status_tx, _) = watch::channel(state.snapshot(Instant::now()));
        Self {
            client,
            config,
            state: Mutex::new(state),
            status_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status_tx.subscribe()
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        self.state.lock().await.snapshot(Instant::now())
    }

    fn publish(&self, state: &EngineState) {
        let snapshot = state.snapshot(Instant::now());
        self.status_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    pub async fn add_file(&self, name: &str, bytes: Vec<u8>) -> Result<ImportOutcome, ImportError> {
        let mut state = self.state.lock().await;
        let result = state.queue.import_file(name, bytes);
        match &result {
            Ok(outcome) => debug!(name, ?outcome, "file imported"),
            Err(err) => {
                warn!(name, "import failed: {err}");
                state.session.mark_error(err.label(), Instant::now());
            }
        }
        self.publish(&state);
        result
    }

    /// Surfaces a file the front end could not read.
    pub async fn report_file_error(&self, name: &str, err: &std::io::Error) {
        warn!(name, "failed to read file: {err}");
        let mut state = self.state.lock().await;
        state.session.mark_error(FILE_ERROR_LABEL, Instant::now());
        self.publish(&state);
    }

    pub async fn is_queue_full(&self) -> bool {
        self.state.lock().await.queue.is_full()
    }

    pub async fn move_up(&self, index: usize) {
        self.mutate_queue(|queue| queue.move_up(index)).await;
    }

    pub async fn remove(&self, index: usize) {
        self.mutate_queue(|queue| {
            queue.remove(index);
        })
        .await;
    }

    pub async fn rename(&self, index: usize, new_name: &str) {
        self.mutate_queue(|queue| queue.rename(index, new_name)).await;
    }

    pub async fn optimize_names(&self) {
        self.mutate_queue(DiskQueue::optimize_names).await;
    }

    pub async fn undo_optimize_names(&self) {
        self.mutate_queue(DiskQueue::undo_optimize_names).await;
    }

    pub async fn toggle_optimize(&self) {
        self.mutate_queue(DiskQueue::toggle_optimize).await;
    }

    pub async fn clear(&self) {
        self.mutate_queue(DiskQueue::clear).await;
    }

    async fn mutate_queue<F>(&self, op: F)
    where
        F: FnOnce(&mut DiskQueue),
    {
        let mut state = self.state.lock().await;
        op(&mut state.queue);
        self.publish(&state);
    }

    pub async fn export_queue(&self) -> Result<Option<Vec<u8>>, ZipError> {
        self.state.lock().await.queue.export_archive()
    }

    pub async fn dismiss_dirty_prompt(&self) {
        let mut state = self.state.lock().await;
        state.session.dismiss_dirty_prompt();
        self.publish(&state);
    }

    /// Expires overlays and returns the label to display.
    pub async fn refresh_status(&self) -> String {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.session.expire(now);
        self.publish(&state);
        state.session.status_label(now)
    }

    /// One liveness round trip. A dirty-set listing it triggers runs in a
    /// background task so the next poll is never held up by it.
    pub async fn poll_hello(self: &Arc<Self>) -> PollOutcome {
        {
            let mut state = self.state.lock().await;
            if !state.session.begin_poll() {
                return PollOutcome::Skipped;
            }
        }

        let result = self.client.hello().await;

        let grace = self.config.reconnect_grace;
        let (outcome, fetch) = {
            let mut state = self.state.lock().await;
            let applied = match result {
                Ok(hello) => {
                    let fetch = state.session.finish_poll(&hello, Instant::now(), grace);
                    (PollOutcome::Alive, fetch)
                }
                Err(err) => {
                    if err.is_timeout() {
                        debug!("hello timed out");
                    } else {
                        debug!("hello failed: {err}");
                    }
                    state.session.fail_poll();
                    (PollOutcome::Unreachable, None)
                }
            };
            self.publish(&state);
            applied
        };

        if let Some(modified_id) = fetch {
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                engine.refresh_modified(modified_id).await;
            });
        }
        outcome
    }

    async fn refresh_modified(&self, modified_id: u64) {
        let files = match self.client.list_modified().await {
            Ok(list) => {
                info!(modified_id, count = list.files.len(), "modified disks listed");
                Some(list.files)
            }
            Err(err) => {
                warn!(modified_id, "failed to list modified disks: {err}");
                None
            }
        };
        let mut state = self.state.lock().await;
        state.session.finish_modified_fetch(modified_id, files);
        self.publish(&state);
    }

    /// Runs one nonce-scoped transaction: every queued image in order, then
    /// the commit. The first failure aborts without committing.
    pub async fn upload_queue(&self) -> Result<UploadOutcome, TransactionError> {
        let (nonce, items) = {
            let mut state = self.state.lock().await;
            if state.queue.is_empty() {
                return Ok(UploadOutcome::Skipped);
            }
            let Some(nonce) = state.session.begin_upload() else {
                return Ok(UploadOutcome::Skipped);
            };
            let items: Vec<(String, Vec<u8>)> = state
                .queue
                .items()
                .iter()
                .map(|item| (item.name.clone(), item.data.clone()))
                .collect();
            self.publish(&state);
            (nonce, items)
        };

        info!(nonce, items = items.len(), "upload transaction started");
        let result = self.run_transaction(nonce, items).await;

        let mut state = self.state.lock().await;
        state.session.finish_upload(result.is_ok(), Instant::now());
        self.publish(&state);
        match result {
            Ok(items) => {
                info!(nonce, items, "upload transaction committed");
                Ok(UploadOutcome::Committed { items })
            }
            Err(err) => {
                warn!(nonce, "upload transaction aborted: {err}");
                Err(err)
            }
        }
    }

    async fn run_transaction(
        &self,
        nonce: u64,
        items: Vec<(String, Vec<u8>)>,
    ) -> Result<usize, TransactionError> {
        let count = items.len();
        for (index, (name, data)) in items.into_iter().enumerate() {
            let result = self.client.add_image(nonce, &name, data).await;
            if let Err(source) = result {
                return Err(TransactionError::Item {
                    index,
                    name,
                    source,
                });
            }
            debug!(nonce, index, name = %name, "image staged");
        }
        self.client
            .commit(nonce)
            .await
            .map_err(TransactionError::Commit)?;
        Ok(count)
    }

    /// Rebuilds the device's active set as a stored ZIP; `None` when the
    /// device has no active disks.
    pub async fn export_session(&self) -> Result<Option<Vec<u8>>, EngineError> {
        match self.fetch_session_archive().await {
            Ok(archive) => Ok(archive),
            Err(err) => {
                warn!("session export failed: {err}");
                let mut state = self.state.lock().await;
                state.session.mark_error(EXPORT_FAIL_LABEL, Instant::now());
                self.publish(&state);
                Err(err)
            }
        }
    }

    async fn fetch_session_archive(&self) -> Result<Option<Vec<u8>>, EngineError> {
        let list = self.client.list_active().await?;
        if list.files.is_empty() {
            return Ok(None);
        }
        let mut items = Vec::with_capacity(list.files.len());
        for disk in &list.files {
            let data = self.client.download_active(disk.i).await?;
            items.push((disk.name.as_str(), data));
        }
        let archive = build_archive(
            items
                .iter()
                .map(|(name, data)| (*name, data.as_slice())),
        )?;
        Ok(Some(archive))
    }

    /// Lists the disks the device reports as modified and downloads each,
    /// in listing order. Names are returned as the device reported them.
    pub async fn download_dirty_disks(&self) -> Result<Vec<(String, Vec<u8>)>, DeviceError> {
        let list = self.client.list_modified().await?;
        let mut disks = Vec::with_capacity(list.files.len());
        for disk in list.files {
            let data = self.client.download_modified(disk.i, &disk.name).await?;
            debug!(index = disk.i, name = %disk.name, bytes = data.len(), "modified disk downloaded");
            disks.push((disk.name, data));
        }
        Ok(disks)
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
