//! Cleanup - Scheduled Deletion of Shipped Local Copies
//!
//! Once a file is UPLOADED the remote copy is authoritative and the
//! local raw file and prepared artifact are redundant. The cleanup sweep
//! deletes them on a schedule bounded by two retention ages:
//!
//! - files younger than `min_age` are kept, leaving a window in which an
//!   upload can still be verified against the local copy
//! - files older than `max_age` fall out of the sweep window entirely;
//!   the bound keeps each sweep's query cheap and assumes earlier sweeps
//!   already handled them
//!
//! Ages are measured from the file's window start. Deletion is
//! idempotent: a path already gone counts as cleaned, so re-sweeping
//! after a crash mid-sweep converges.

use crate::config::CleanupConfig;
use crate::logfile::{LogFile, LogFileState};
use crate::tracker::{TrackerClient, TrackerError};
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// Error type for the cleanup stage
#[derive(Debug)]
pub enum CleanupError {
    /// min_age must be strictly below max_age for the sweep window to exist
    InvalidRetention { min_age: Duration, max_age: Duration },
    /// Tracker backend fault (propagates, never swallowed)
    Tracker(TrackerError),
}

impl std::fmt::Display for CleanupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CleanupError::InvalidRetention { min_age, max_age } => write!(
                f,
                "Invalid retention: min_age {:?} must be below max_age {:?}",
                min_age, max_age
            ),
            CleanupError::Tracker(e) => write!(f, "Tracker error during cleanup: {}", e),
        }
    }
}

impl std::error::Error for CleanupError {}

impl From<TrackerError> for CleanupError {
    fn from(e: TrackerError) -> Self {
        CleanupError::Tracker(e)
    }
}

/// What one sweep pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// UPLOADED files whose local copies were removed this pass
    pub files_cleaned: u64,
    /// Individual paths actually unlinked
    pub paths_deleted: u64,
    /// Paths that could not be removed (left for the next sweep)
    pub failures: u64,
}

/// Sweeps local copies of uploaded files inside the retention window
pub struct CleanupSweep {
    tracker: TrackerClient,
    min_age: Duration,
    max_age: Duration,
}

impl CleanupSweep {
    /// Retention is validated at construction so a misconfigured sweep
    /// fails fast instead of silently deleting nothing (or everything).
    pub fn new(tracker: TrackerClient, config: &CleanupConfig) -> Result<Self, CleanupError> {
        if config.min_age >= config.max_age {
            return Err(CleanupError::InvalidRetention {
                min_age: config.min_age,
                max_age: config.max_age,
            });
        }
        Ok(CleanupSweep {
            tracker,
            min_age: config.min_age,
            max_age: config.max_age,
        })
    }

    /// One sweep pass at instant `now`. Taking the clock as an argument
    /// keeps retention behavior testable without waiting out real ages.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<CleanupReport, CleanupError> {
        let from = now
            - chrono::Duration::from_std(self.max_age)
                .expect("max_age validated against chrono range at config level");
        let to = now
            - chrono::Duration::from_std(self.min_age)
                .expect("min_age below max_age, same range");

        let candidates = self
            .tracker
            .find_mine_in_range(LogFileState::Uploaded, from, to)
            .await?;

        let mut report = CleanupReport::default();
        for file in &candidates {
            self.clean_file(file, &mut report);
        }
        if report.files_cleaned > 0 || report.failures > 0 {
            info!(
                "Cleanup sweep: {} files cleaned, {} paths deleted, {} failures",
                report.files_cleaned, report.paths_deleted, report.failures
            );
        }
        Ok(report)
    }

    fn clean_file(&self, file: &LogFile, report: &mut CleanupReport) {
        let mut failed = false;
        let mut deleted = 0;

        deleted += self.remove(&file.origin_path, file, &mut failed);
        if let Some(prep) = &file.prep_path {
            deleted += self.remove(prep, file, &mut failed);
        }

        report.paths_deleted += deleted;
        if failed {
            report.failures += 1;
        } else if deleted > 0 {
            report.files_cleaned += 1;
        }
    }

    fn remove(&self, path: &Path, file: &LogFile, failed: &mut bool) -> u64 {
        match std::fs::remove_file(path) {
            Ok(()) => 1,
            // Already gone: a previous sweep (or crash mid-sweep) got it
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => {
                warn!("Cleanup could not remove {} for {}: {}", path.display(), file.id(), e);
                *failed = true;
                0
            }
        }
    }
}

/// Handle for the cleanup worker
pub struct CleanupWorkerHandle {
    shutdown_tx: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl CleanupWorkerHandle {
    /// Graceful shutdown: the worker finishes its current sweep first
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.task.await;
    }
}

/// Spawn the scheduled cleanup worker, sweeping every
/// `config.sweep_interval`.
pub fn spawn_cleanup_worker(
    tracker: TrackerClient,
    config: CleanupConfig,
) -> Result<CleanupWorkerHandle, CleanupError> {
    let sweep = CleanupSweep::new(tracker, &config)?;
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip the immediate first tick so a freshly started process does
        // not race its own uploads.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Cleanup worker shutting down");
                    return;
                }
                _ = ticker.tick() => {}
            }
            if let Err(e) = sweep.sweep_once(Utc::now()).await {
                error!("Cleanup sweep failed: {}", e);
            }
        }
    });

    Ok(CleanupWorkerHandle { shutdown_tx, task })
}
