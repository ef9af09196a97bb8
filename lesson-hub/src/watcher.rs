//! Debounced rescans of the content tree on filesystem changes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use lesson_hub_core::index::{DocumentIndex, ScanDiff};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);

/// Restarts a short timer on every change; the scan runs once the tree
/// has been quiet for the whole delay.
pub struct Rescanner {
    index: Arc<DocumentIndex>,
    root: PathBuf,
    prefix: String,
    excluded: Vec<String>,
    delay: Duration,
    pending: AsyncMutex<Option<JoinHandle<()>>>,
}

impl Rescanner {
    pub fn new(
        index: Arc<DocumentIndex>,
        root: impl Into<PathBuf>,
        prefix: impl Into<String>,
        excluded: Vec<String>,
        delay: Duration,
    ) -> Self {
        Self {
            index,
            root: root.into(),
            prefix: prefix.into(),
            excluded,
            delay,
            pending: AsyncMutex::new(None),
        }
    }

    async fn rescan(index: Arc<DocumentIndex>, root: PathBuf, prefix: String, excluded: Vec<String>, delay: Duration) {
        sleep(delay).await;
        let scan = tokio::task::spawn_blocking(move || index.scan(&prefix, &root, false, &excluded));
        match scan.await {
            Ok(diff) => log_diff(&diff),
            Err(e) => warn!(error = %e, "rescan task failed"),
        }
    }

    pub async fn schedule(&self) {
        let mut pending = self.pending.lock().await;
        if let Some(handle) = pending.take() {
            handle.abort();
        }
        let handle = tokio::spawn(Self::rescan(
            self.index.clone(),
            self.root.clone(),
            self.prefix.clone(),
            self.excluded.clone(),
            self.delay,
        ));
        *pending = Some(handle);
    }
}

fn log_diff(diff: &ScanDiff) {
    if diff.is_empty() {
        debug!("rescan found no changes");
    } else {
        info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            modified = diff.modified.len(),
            "content tree changed"
        );
    }
}

/// Watches `root` recursively and feeds every event to `rescanner`. The
/// watch ends when the returned watcher is dropped.
pub fn watch(rescanner: Arc<Rescanner>, root: &Path) -> notify::Result<RecommendedWatcher> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
        Ok(event) => {
            let _ = tx.send(event);
        }
        Err(e) => warn!(error = %e, "content watch error"),
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            debug!(kind = ?event.kind, paths = ?event.paths, "content event");
            rescanner.schedule().await;
        }
    });
    info!(root = %root.display(), "watching content tree");
    Ok(watcher)
}
