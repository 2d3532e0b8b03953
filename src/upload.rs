//! Upload Pool - Ships Prepared Artifacts to the Archive
//!
//! A pool of workers drains PREPARED files into the remote archive.
//! Each worker claims files through the tracker's conditional update, so
//! several workers (in this process or another owning process) can sweep
//! the same candidate list and every file is still uploaded exactly once:
//! losers of the claim observe 0 rows updated and move on.
//!
//! The remote group and URI are computed by the configured
//! [`ArchiveLayout`](crate::archive::ArchiveLayout) from fields the
//! LogFile already carries, so a crashed upload resumes at the same URI
//! after restart and at worst overwrites its own partial object.

use crate::archive::{ArchiveError, ArchiveLayout, ArchiveStore};
use crate::config::UploadConfig;
use crate::logfile::{LogFile, LogFileState};
use crate::tracker::{TrackerClient, TrackerError};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::{error, info, warn};

/// Error type for the upload stage
#[derive(Debug)]
pub enum UploadError {
    /// Remote store fault
    Archive(ArchiveError),
    /// Tracker backend fault (propagates, never swallowed)
    Tracker(TrackerError),
    /// Record is missing a field a prior stage should have set
    MissingField { field: &'static str, id: String },
}

impl std::fmt::Display for UploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadError::Archive(e) => write!(f, "Upload archive error: {}", e),
            UploadError::Tracker(e) => write!(f, "Tracker error during upload: {}", e),
            UploadError::MissingField { field, id } => {
                write!(f, "LogFile {} is missing {}", id, field)
            }
        }
    }
}

impl std::error::Error for UploadError {}

impl From<ArchiveError> for UploadError {
    fn from(e: ArchiveError) -> Self {
        UploadError::Archive(e)
    }
}

impl From<TrackerError> for UploadError {
    fn from(e: TrackerError) -> Self {
        UploadError::Tracker(e)
    }
}

/// Outcome of a single claim-and-upload attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The file reached UPLOADED
    Uploaded,
    /// Another attempt already moved the file; abandoned without mutation
    Stale,
    /// The archive fault was recorded via UPLOAD_ERROR
    Faulted,
}

/// Claim one file and drive it PREPARED/UPLOAD_ERROR -> UPLOADING ->
/// UPLOADED. Archive faults are recorded via `upload_error` and reported
/// as `Faulted`; only tracker faults surface as `Err`.
pub async fn upload_one(
    tracker: &TrackerClient,
    store: &dyn ArchiveStore,
    layout: &dyn ArchiveLayout,
    remote_prefix: &str,
    file: &mut LogFile,
) -> Result<UploadOutcome, UploadError> {
    let prep_path = file
        .prep_path
        .clone()
        .ok_or_else(|| UploadError::MissingField {
            field: "prep_path",
            id: file.id().to_string(),
        })?;

    if tracker.uploading(file).await? == 0 {
        return Ok(UploadOutcome::Stale);
    }

    let group = layout.group(file.start_time);
    let uri = layout.uri(remote_prefix, &group, &prep_path);

    match store.put_file(&uri, &prep_path).await {
        Ok(stored_size) => match tracker.uploaded(file, uri.clone(), group, stored_size).await? {
            1 => {
                info!("Uploaded {} to {} ({} bytes)", file.id(), uri, stored_size);
                Ok(UploadOutcome::Uploaded)
            }
            _ => Ok(UploadOutcome::Stale),
        },
        Err(cause) => {
            warn!("Upload fault on {} to {}: {}", file.id(), uri, cause);
            match tracker.upload_error(file).await? {
                1 => Ok(UploadOutcome::Faulted),
                _ => Ok(UploadOutcome::Stale),
            }
        }
    }
}

// ============================================================================
// UploadPool - N workers sharing one candidate stream
// ============================================================================

/// Counters aggregated across all workers in the pool
#[derive(Debug, Clone, Copy, Default)]
pub struct UploadStats {
    pub uploaded: u64,
    pub faulted: u64,
    pub stale: u64,
}

/// Handle for the upload pool
pub struct UploadPoolHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    stats: Arc<Mutex<UploadStats>>,
}

impl UploadPoolHandle {
    /// Snapshot of the pool's counters
    pub fn stats(&self) -> UploadStats {
        *self.stats.lock()
    }

    /// Graceful shutdown: workers finish their current file first
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Spawn `config.workers` upload workers. Each sweeps
/// `find_mine(PREPARED)` (plus `find_mine(UPLOAD_ERROR)` when retries
/// are enabled) every poll interval and whenever `wake` is notified.
/// Claim contention between workers resolves through the tracker.
pub fn spawn_upload_pool(
    tracker: TrackerClient,
    store: Arc<dyn ArchiveStore>,
    layout: Arc<dyn ArchiveLayout>,
    config: UploadConfig,
    wake: Arc<Notify>,
) -> UploadPoolHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let stats = Arc::new(Mutex::new(UploadStats::default()));

    let workers = config.workers.max(1);
    let mut tasks = Vec::with_capacity(workers);
    for worker_id in 0..workers {
        tasks.push(tokio::spawn(upload_worker_loop(
            worker_id,
            tracker.clone(),
            Arc::clone(&store),
            Arc::clone(&layout),
            config.clone(),
            Arc::clone(&wake),
            shutdown_rx.clone(),
            Arc::clone(&stats),
        )));
    }

    UploadPoolHandle {
        shutdown_tx,
        tasks,
        stats,
    }
}

#[allow(clippy::too_many_arguments)]
async fn upload_worker_loop(
    worker_id: usize,
    tracker: TrackerClient,
    store: Arc<dyn ArchiveStore>,
    layout: Arc<dyn ArchiveLayout>,
    config: UploadConfig,
    wake: Arc<Notify>,
    mut shutdown_rx: watch::Receiver<bool>,
    stats: Arc<Mutex<UploadStats>>,
) {
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Upload worker {} shutting down", worker_id);
                    return;
                }
            }
            _ = ticker.tick() => {}
            _ = wake.notified() => {}
        }

        let mut states = vec![LogFileState::Prepared];
        if config.retry_errors {
            states.push(LogFileState::UploadError);
        }

        for state in states {
            let candidates = match tracker.find_mine(state).await {
                Ok(c) => c,
                Err(e) => {
                    // No forward progress is safe without the store;
                    // pause this pass and try again next tick.
                    error!("Upload worker {}: tracker unreachable: {}", worker_id, e);
                    break;
                }
            };

            for mut file in candidates {
                let outcome = upload_one(
                    &tracker,
                    store.as_ref(),
                    layout.as_ref(),
                    &config.remote_prefix,
                    &mut file,
                )
                .await;
                match outcome {
                    Ok(UploadOutcome::Uploaded) => stats.lock().uploaded += 1,
                    Ok(UploadOutcome::Faulted) => stats.lock().faulted += 1,
                    Ok(UploadOutcome::Stale) => stats.lock().stale += 1,
                    Err(UploadError::MissingField { field, id }) => {
                        // Should be unreachable for a PREPARED row
                        error!("Upload worker {}: {} missing {}", worker_id, id, field);
                        stats.lock().faulted += 1;
                    }
                    Err(e) => {
                        error!("Upload worker {} pausing on tracker fault: {}", worker_id, e);
                        break;
                    }
                }
            }
        }
    }
}
