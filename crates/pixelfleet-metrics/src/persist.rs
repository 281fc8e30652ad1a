//! Atomic snapshot persistence.
//!
//! The only durable state of the system: a JSON metrics snapshot written on a
//! background tick and once at shutdown. Writes go to a sibling temp file
//! first and are renamed into place, so readers never observe a torn file.

use crate::MetricsRegistry;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Writes the current snapshot to `path`, atomically.
pub async fn write_snapshot(registry: &MetricsRegistry, path: &Path) -> std::io::Result<()> {
    let snapshot = registry.snapshot();
    let body = serde_json::to_vec_pretty(&snapshot)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let tmp = sibling_temp_path(path);
    tokio::fs::write(&tmp, &body).await?;
    tokio::fs::rename(&tmp, path).await?;
    debug!(path = %path.display(), "metrics snapshot written");
    Ok(())
}

fn sibling_temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "metrics.json".into());
    name.push(".tmp");
    path.with_file_name(name)
}

/// Spawns the periodic persistence task.
///
/// The task writes on every `interval` tick and attempts one final write when
/// the token is cancelled. Write errors are logged, never fatal.
pub fn spawn(
    registry: Arc<MetricsRegistry>,
    path: PathBuf,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        // The first tick fires immediately; skip it so startup does not write
        // an empty snapshot.
        tick.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(e) = write_snapshot(&registry, &path).await {
                        warn!("periodic metrics snapshot failed: {e}");
                    }
                }
            }
        }
        if let Err(e) = write_snapshot(&registry, &path).await {
            warn!("final metrics snapshot failed: {e}");
        }
    })
}
