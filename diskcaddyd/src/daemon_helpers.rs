fn read_u64_env(name: &str, default: u64) -> u64 {
    parse_positive_u64(std::env::var(name).ok().as_deref(), default)
}

fn read_u8_env(name: &str, default: u8) -> u8 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u8>().ok())
        .unwrap_or(default)
}

fn parse_positive_u64(value: Option<&str>, default: u64) -> u64 {
    value
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

/// Expands folders into their files, recursively and in sorted order.
/// Paths that cannot be inspected are kept so the import reports them.
async fn collect_inputs(inputs: &[PathBuf]) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        let mut pending = vec![input.clone()];
        while let Some(path) = pending.pop() {
            let is_dir = tokio::fs::metadata(&path)
                .await
                .map(|meta| meta.is_dir())
                .unwrap_or(false);
            if !is_dir {
                files.push(path);
                continue;
            }
            let mut entries = tokio::fs::read_dir(&path)
                .await
                .with_context(|| format!("failed to list {}", path.display()))?;
            let mut children = Vec::new();
            while let Some(entry) = entries
                .next_entry()
                .await
                .with_context(|| format!("failed to list {}", path.display()))?
            {
                children.push(entry.path());
            }
            children.sort();
            pending.extend(children.into_iter().rev());
        }
    }
    Ok(files)
}

/// Imports files one at a time so each capacity check sees the earlier ones.
/// Returns how many images were queued.
async fn import_paths(engine: &SyncEngine, files: &[PathBuf]) -> usize {
    let mut added = 0;
    for path in files {
        if engine.is_queue_full().await {
            warn!(path = %path.display(), "queue is full, skipping remaining files");
            break;
        }
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                engine.report_file_error(&name, &err).await;
                continue;
            }
        };
        match engine.add_file(&name, bytes).await {
            Ok(crate::sync::queue::ImportOutcome::Added(count)) => added += count,
            Ok(crate::sync::queue::ImportOutcome::Full) => {
                warn!(name = %name, "queue is full");
            }
            Ok(crate::sync::queue::ImportOutcome::Ignored) => {
                info!(name = %name, "not a disk image, ignored");
            }
            // Already surfaced as a status label.
            Err(_) => {}
        }
    }
    added
}

async fn export_target(out: &Path, default_name: &str) -> PathBuf {
    let is_dir = tokio::fs::metadata(out)
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false);
    if is_dir {
        out.join(default_name)
    } else {
        out.to_path_buf()
    }
}

async fn write_archive(target: &Path, archive: &[u8]) -> anyhow::Result<()> {
    tokio::fs::write(target, archive)
        .await
        .with_context(|| format!("failed to write {}", target.display()))?;
    info!(path = %target.display(), bytes = archive.len(), "archive written");
    Ok(())
}

/// File name for a disk pulled from the device, or `None` when the reported
/// name cannot be a plain file name.
fn download_file_name(name: &str) -> Option<String> {
    let name = sanitize_name(name.trim());
    match name.as_str() {
        "" | "." | ".." => None,
        _ => Some(name),
    }
}

async fn wait_until_ready(
    engine: &Arc<SyncEngine>,
    poll_interval: Duration,
    limit: Duration,
) -> anyhow::Result<()> {
    let wait = async {
        loop {
            engine.poll_hello().await;
            if engine.snapshot().await.is_ready() {
                return;
            }
            tokio::time::sleep(poll_interval).await;
        }
    };
    tokio::time::timeout(limit, wait)
        .await
        .with_context(|| format!("device not reachable within {}s", limit.as_secs()))
}
