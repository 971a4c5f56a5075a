use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use diskcaddy_core::DeviceClient;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::sync::engine::{EngineConfig, StatusSnapshot, SyncEngine, UploadOutcome};
use crate::sync::names::sanitize_name;

const DEFAULT_DEVICE_URL: &str = "http://pi1541.local";
const DEFAULT_POLL_MS: u64 = 1000;
const DEFAULT_HELLO_TIMEOUT_MS: u64 = 1500;
const DEFAULT_STATUS_MS: u64 = 250;
const DEFAULT_GRACE_MS: u64 = 5000;
const DEFAULT_LOG_VERBOSITY: u8 = 2;
const READY_WAIT_LIMIT: Duration = Duration::from_secs(30);

pub const ACTIVE_SET_FILE_NAME: &str = "pi1541_active_set.zip";
pub const SESSION_FILE_NAME: &str = "pi1541_session.zip";

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub device_url: String,
    pub poll_interval: Duration,
    pub hello_timeout: Duration,
    pub status_interval: Duration,
    pub reconnect_grace: Duration,
    pub log_verbosity: u8,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let device_url = std::env::var("DISKCADDY_URL")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_DEVICE_URL.to_string());

        Ok(Self {
            device_url,
            poll_interval: Duration::from_millis(read_u64_env(
                "DISKCADDY_POLL_MS",
                DEFAULT_POLL_MS,
            )),
            hello_timeout: Duration::from_millis(read_u64_env(
                "DISKCADDY_HELLO_TIMEOUT_MS",
                DEFAULT_HELLO_TIMEOUT_MS,
            )),
            status_interval: Duration::from_millis(read_u64_env(
                "DISKCADDY_STATUS_MS",
                DEFAULT_STATUS_MS,
            )),
            reconnect_grace: Duration::from_millis(read_u64_env(
                "DISKCADDY_GRACE_MS",
                DEFAULT_GRACE_MS,
            )),
            log_verbosity: read_u8_env("DISKCADDY_LOG", DEFAULT_LOG_VERBOSITY),
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            reconnect_grace: self.reconnect_grace,
        }
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    engine: Arc<SyncEngine>,
}

impl DaemonRuntime {
    pub fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let client = DeviceClient::new(&config.device_url)
            .with_context(|| format!("invalid device url {}", config.device_url))?
            .with_hello_timeout(config.hello_timeout);
        let engine = Arc::new(SyncEngine::new(client, config.engine_config()));
        Ok(Self { config, engine })
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            device = %self.config.device_url,
            poll_ms = self.config.poll_interval.as_millis() as u64,
            "daemon started"
        );

        let engine_for_poll = Arc::clone(&self.engine);
        let poll_interval = self.config.poll_interval;
        let poll_handle = tokio::spawn(async move {
            loop {
                engine_for_poll.poll_hello().await;
                tokio::time::sleep(poll_interval).await;
            }
        });

        let engine_for_status = Arc::clone(&self.engine);
        let status_interval = self.config.status_interval;
        let status_handle = tokio::spawn(async move {
            loop {
                engine_for_status.refresh_status().await;
                tokio::time::sleep(status_interval).await;
            }
        });

        let observer_handle = tokio::spawn(log_status_changes(self.engine.subscribe()));

        let shutdown = tokio::signal::ctrl_c().await;

        poll_handle.abort();
        status_handle.abort();
        observer_handle.abort();
        shutdown.context("failed waiting for shutdown signal")?;
        info!("daemon stopped");
        Ok(())
    }

    /// Queues `inputs` and sends them to the device as one transaction.
    pub async fn mount(&self, inputs: &[PathBuf]) -> anyhow::Result<usize> {
        let files = collect_inputs(inputs).await?;
        let added = import_paths(&self.engine, &files).await;
        if self.engine.snapshot().await.queue.is_empty() {
            anyhow::bail!("no disk images to mount");
        }
        info!(added, "waiting for device");

        wait_until_ready(&self.engine, self.config.poll_interval, READY_WAIT_LIMIT).await?;
        match self.engine.upload_queue().await? {
            UploadOutcome::Committed { items } => Ok(items),
            UploadOutcome::Skipped => anyhow::bail!("device was not ready for upload"),
        }
    }

    /// Writes the queue archive built from `inputs` and returns its path.
    pub async fn export_queue(
        &self,
        out: &Path,
        inputs: &[PathBuf],
        optimize: bool,
    ) -> anyhow::Result<PathBuf> {
        let files = collect_inputs(inputs).await?;
        import_paths(&self.engine, &files).await;
        if optimize {
            self.engine.optimize_names().await;
        }
        let archive = self
            .engine
            .export_queue()
            .await
            .context("failed to build queue archive")?
            .context("no disk images to export")?;
        let target = export_target(out, ACTIVE_SET_FILE_NAME).await;
        write_archive(&target, &archive).await?;
        Ok(target)
    }

    /// Writes the device's active set; `None` when the device has none.
    pub async fn export_session(&self, out: &Path) -> anyhow::Result<Option<PathBuf>> {
        let Some(archive) = self
            .engine
            .export_session()
            .await
            .context("failed to export device session")?
        else {
            return Ok(None);
        };
        let target = export_target(out, SESSION_FILE_NAME).await;
        write_archive(&target, &archive).await?;
        Ok(Some(target))
    }

    /// Saves every disk the device reports as modified into the `out`
    /// directory and returns the written paths.
    pub async fn download_modified(&self, out: &Path) -> anyhow::Result<Vec<PathBuf>> {
        let disks = self
            .engine
            .download_dirty_disks()
            .await
            .context("failed to download modified disks")?;
        tokio::fs::create_dir_all(out)
            .await
            .with_context(|| format!("failed to create {}", out.display()))?;

        let mut written = Vec::with_capacity(disks.len());
        for (name, data) in disks {
            let Some(file_name) = download_file_name(&name) else {
                warn!(name = %name, "skipping modified disk with unusable name");
                continue;
            };
            let target = out.join(file_name);
            tokio::fs::write(&target, &data)
                .await
                .with_context(|| format!("failed to write {}", target.display()))?;
            info!(path = %target.display(), bytes = data.len(), "modified disk saved");
            written.push(target);
        }
        Ok(written)
    }
}

async fn log_status_changes(mut rx: watch::Receiver<StatusSnapshot>) {
    let mut last = rx.borrow_and_update().clone();
    while rx.changed().await.is_ok() {
        let current = rx.borrow_and_update().clone();
        if current.label != last.label {
            info!(label = %current.label, "status changed");
        }
        if current.dirty_items != last.dirty_items || current.dirty_count != last.dirty_count {
            if current.dirty_count == 0 {
                info!("device reports no modified disks");
            } else {
                let names: Vec<&str> = current
                    .dirty_items
                    .iter()
                    .map(|disk| disk.name.as_str())
                    .collect();
                warn!(
                    count = current.dirty_count,
                    disks = ?names,
                    "device has modified disks"
                );
            }
        }
        last = current;
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
