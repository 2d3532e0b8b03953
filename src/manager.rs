//! Cohort Manager - Routes Records and Drives Rollover
//!
//! One manager owns one cohort. It lazily opens a writer for the current
//! rolling window, routes incoming records to it, and periodically
//! evaluates the close decision. Rollover is ordered so no record ever
//! lacks a destination: the next window's writer is opened and swapped
//! in first, then the outgoing writer is drained and closed in the
//! background.
//!
//! ```text
//!            ┌────────────── check_rollover ──────────────┐
//!            │                                            ▼
//! records ──► active WriterHandle          old writer: close() -> WRITTEN
//!            ▲                                            │
//!            └── reopened on writer fault                 └─► wake prepare
//! ```
//!
//! A duplicate serial allocation during open is retried once with a
//! fresh allocation; a second duplicate means the registry sequence
//! itself is broken and the error propagates.

use crate::config::RollingConfig;
use crate::logfile::LogFile;
use crate::rolling::{RollingPaths, RollingScheme};
use crate::tracker::{TrackerClient, TrackerError};
use crate::writer::{WriteError, WriterFactory, WriterHandle};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::{error, info, warn};

/// Error type for the manager
#[derive(Debug)]
pub enum ManagerError {
    /// Writer-side fault
    Write(WriteError),
    /// Tracker backend fault
    Tracker(TrackerError),
    /// Manager is shut down
    Stopped,
}

impl std::fmt::Display for ManagerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManagerError::Write(e) => write!(f, "Manager write error: {}", e),
            ManagerError::Tracker(e) => write!(f, "Manager tracker error: {}", e),
            ManagerError::Stopped => write!(f, "Manager is stopped"),
        }
    }
}

impl std::error::Error for ManagerError {}

impl From<WriteError> for ManagerError {
    fn from(e: WriteError) -> Self {
        ManagerError::Write(e)
    }
}

impl From<TrackerError> for ManagerError {
    fn from(e: TrackerError) -> Self {
        ManagerError::Tracker(e)
    }
}

struct ActiveWriter<R> {
    window_start: DateTime<Utc>,
    handle: WriterHandle<R>,
}

/// Routes one cohort's records into rolling files
pub struct CohortManager<R> {
    cohort: String,
    tracker: TrackerClient,
    scheme: Arc<dyn RollingScheme>,
    paths: RollingPaths,
    factory: Arc<dyn WriterFactory<R>>,
    /// Notified after each window closes so the prepare worker picks the
    /// WRITTEN file up without waiting for its poll interval
    written_wake: Arc<Notify>,
    active: Mutex<Option<ActiveWriter<R>>>,
    /// Background drains of rolled-over writers; joined on shutdown so
    /// every closed window reaches WRITTEN before the process exits
    drains: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    stopped: std::sync::atomic::AtomicBool,
}

impl<R: Send + 'static> CohortManager<R> {
    pub fn new(
        cohort: impl Into<String>,
        tracker: TrackerClient,
        scheme: Arc<dyn RollingScheme>,
        paths: RollingPaths,
        factory: Arc<dyn WriterFactory<R>>,
        written_wake: Arc<Notify>,
    ) -> Self {
        CohortManager {
            cohort: cohort.into(),
            tracker,
            scheme,
            paths,
            factory,
            written_wake,
            active: Mutex::new(None),
            drains: parking_lot::Mutex::new(Vec::new()),
            stopped: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Cohort this manager owns
    pub fn cohort(&self) -> &str {
        &self.cohort
    }

    /// Route one record, stamped with the current time
    pub async fn record(&self, record: R) -> Result<(), ManagerError>
    where
        R: Clone,
    {
        self.record_at(Utc::now(), record).await
    }

    /// Route one record to the currently-active writer. The timestamp
    /// only seeds window selection when no writer is open yet; an
    /// already-active window keeps receiving records until rollover
    /// closes it. On a writer that stopped mid-window (write fault) a
    /// fresh file is opened for the same window and the record retried
    /// once.
    pub async fn record_at(&self, timestamp: DateTime<Utc>, record: R) -> Result<(), ManagerError>
    where
        R: Clone,
    {
        if self.stopped.load(std::sync::atomic::Ordering::Acquire) {
            return Err(ManagerError::Stopped);
        }
        let now = timestamp;
        let mut active = self.active.lock().await;
        let writer = self.ensure_writer(&mut active, now).await?;

        match writer.record(record.clone()).await {
            Ok(()) => Ok(()),
            Err(WriteError::Closed) => {
                // Writer died on a fault; its file is already WRITE_ERROR.
                // Open a replacement for the same window and retry once.
                warn!("Cohort {}: writer gone, opening replacement", self.cohort);
                *active = None;
                let writer = self.ensure_writer(&mut active, now).await?;
                writer.record(record).await.map_err(ManagerError::from)
            }
            Err(e) => Err(ManagerError::Write(e)),
        }
    }

    /// Evaluate the close decision at instant `now`. When the active
    /// window is past its deadline the next writer is swapped in before
    /// the old one is closed, so records always have a destination.
    pub async fn check_rollover(&self, now: DateTime<Utc>) -> Result<(), ManagerError> {
        let mut active = self.active.lock().await;
        let due = match active.as_ref() {
            Some(w) => self.scheme.is_time_to_close(w.window_start, now),
            None => return Ok(()),
        };
        if !due {
            return Ok(());
        }

        let replacement = self.open_writer(now).await?;
        let outgoing = active.replace(replacement).expect("active checked above");
        drop(active);

        info!(
            "Cohort {}: rolling over, closing window starting {}",
            self.cohort, outgoing.window_start
        );
        let wake = Arc::clone(&self.written_wake);
        let cohort = self.cohort.clone();
        let drain = tokio::spawn(async move {
            match outgoing.handle.close().await {
                Ok(file) => {
                    wake.notify_one();
                    info!("Cohort {}: window closed as {}", cohort, file.id());
                }
                Err(e) => error!("Cohort {}: window close failed: {}", cohort, e),
            }
        });
        let mut drains = self.drains.lock();
        drains.retain(|h| !h.is_finished());
        drains.push(drain);
        Ok(())
    }

    /// Close the active writer, wait out any in-flight rollover drains,
    /// and stop accepting records. Returns the finalized file, if a
    /// window was open.
    pub async fn shutdown(&self) -> Result<Option<LogFile>, ManagerError> {
        self.stopped.store(true, std::sync::atomic::Ordering::Release);

        let outgoing = self.active.lock().await.take();
        let closed = match outgoing {
            Some(w) => {
                let file = w.handle.close().await?;
                self.written_wake.notify_one();
                Some(file)
            }
            None => None,
        };

        // Rolled-over writers still draining in the background must
        // finish before the process is allowed to exit.
        let pending: Vec<_> = std::mem::take(&mut *self.drains.lock());
        for drain in pending {
            let _ = drain.await;
        }
        Ok(closed)
    }

    async fn ensure_writer<'a>(
        &self,
        active: &'a mut Option<ActiveWriter<R>>,
        now: DateTime<Utc>,
    ) -> Result<&'a WriterHandle<R>, ManagerError> {
        if active.is_none() {
            *active = Some(self.open_writer(now).await?);
        }
        Ok(&active.as_ref().expect("just ensured").handle)
    }

    async fn open_writer(&self, now: DateTime<Utc>) -> Result<ActiveWriter<R>, ManagerError> {
        let window_start = self.scheme.current_window_start(now);
        let pattern = self.paths.pattern(&self.scheme.representation(window_start));

        let file = match self.tracker.open(&self.cohort, &pattern, window_start).await {
            Ok(file) => file,
            Err(TrackerError::DuplicateAllocation { cohort, serial }) => {
                warn!(
                    "Duplicate allocation {}#{}, retrying with a fresh serial",
                    cohort, serial
                );
                self.tracker.open(&self.cohort, &pattern, window_start).await?
            }
            Err(e) => return Err(ManagerError::Tracker(e)),
        };

        info!(
            "Cohort {}: opened {} at {}",
            self.cohort,
            file.id(),
            file.origin_path.display()
        );
        Ok(ActiveWriter {
            window_start,
            handle: self.factory.spawn_writer(file),
        })
    }
}

// ============================================================================
// Rollover worker
// ============================================================================

/// Handle for the periodic rollover worker
pub struct RolloverHandle {
    shutdown_tx: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl RolloverHandle {
    /// Stop the periodic checks (the manager itself stays usable)
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.task.await;
    }
}

/// Spawn the periodic rollover check for one manager
pub fn spawn_rollover<R: Send + Clone + 'static>(
    manager: Arc<CohortManager<R>>,
    config: RollingConfig,
) -> RolloverHandle {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.rollover_check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => return,
                _ = ticker.tick() => {}
            }
            if let Err(e) = manager.check_rollover(Utc::now()).await {
                error!("Rollover check failed: {}", e);
            }
        }
    });
    RolloverHandle { shutdown_tx, task }
}
