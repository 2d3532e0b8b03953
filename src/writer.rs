//! Writer Worker - Buffered Append with Bounded Loss Window
//!
//! A writer worker owns exactly one LogFile for its whole life. It pulls
//! records off a bounded queue (blocking up to the next flush deadline,
//! the single suspension point), appends each serialized record to the
//! open file handle, and flushes at least once per interval whether the
//! queue is idle or busy, so a crash loses at most one interval's worth
//! of unflushed writes.
//!
//! ```text
//! producers ──► bounded queue ──► WriterWorker ──► BufWriter ──► origin file
//!                                     │
//!                           close: drain + flush + fsync + `written`
//! ```
//!
//! A write fault moves the file to WRITE_ERROR and stops the worker; the
//! tracker offers no retry edge for it, so the fault is surfaced for
//! operator attention and the manager allocates a fresh file.

use crate::config::WriterConfig;
use crate::logfile::{LogFile, LogFileId};
use crate::tracker::{TrackerClient, TrackerError};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Error as IoError, Write};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout_at, Instant};
use tracing::{error, info, warn};

/// Error type for the write side
#[derive(Debug)]
pub enum WriteError {
    /// Local disk fault
    Io(IoError),
    /// Record could not be serialized
    Serialize(String),
    /// Tracker backend fault (propagates, never swallowed)
    Tracker(TrackerError),
    /// Bounded queue is full and the producer chose rejection over blocking
    QueueFull,
    /// The writer has stopped accepting records
    Closed,
    /// The conditional `written` update lost: our view of the file is stale
    Stale,
}

impl std::fmt::Display for WriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteError::Io(e) => write!(f, "Write I/O error: {}", e),
            WriteError::Serialize(msg) => write!(f, "Record serialization error: {}", msg),
            WriteError::Tracker(e) => write!(f, "Tracker error during write: {}", e),
            WriteError::QueueFull => write!(f, "Writer queue full"),
            WriteError::Closed => write!(f, "Writer closed"),
            WriteError::Stale => write!(f, "Stale view: file was moved by another attempt"),
        }
    }
}

impl std::error::Error for WriteError {}

impl From<IoError> for WriteError {
    fn from(e: IoError) -> Self {
        WriteError::Io(e)
    }
}

impl From<TrackerError> for WriteError {
    fn from(e: TrackerError) -> Self {
        WriteError::Tracker(e)
    }
}

// ============================================================================
// Record serialization
// ============================================================================

/// Turns one application record into its on-disk representation
pub trait RecordSerializer<R>: Send + Sync + 'static {
    fn serialize(&self, record: &R) -> Result<Vec<u8>, WriteError>;
}

/// One JSON document per line
#[derive(Debug, Clone, Default)]
pub struct JsonLineSerializer;

impl<R: Serialize + Send + Sync + 'static> RecordSerializer<R> for JsonLineSerializer {
    fn serialize(&self, record: &R) -> Result<Vec<u8>, WriteError> {
        let mut bytes =
            serde_json::to_vec(record).map_err(|e| WriteError::Serialize(e.to_string()))?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

/// Length-prefixed bincode frames (u32 LE prefix)
#[derive(Debug, Clone, Default)]
pub struct BincodeSerializer;

impl<R: Serialize + Send + Sync + 'static> RecordSerializer<R> for BincodeSerializer {
    fn serialize(&self, record: &R) -> Result<Vec<u8>, WriteError> {
        let data =
            bincode::serialize(record).map_err(|e| WriteError::Serialize(e.to_string()))?;
        let mut framed = Vec::with_capacity(4 + data.len());
        framed.extend_from_slice(&(data.len() as u32).to_le_bytes());
        framed.extend_from_slice(&data);
        Ok(framed)
    }
}

// ============================================================================
// Worker
// ============================================================================

enum WriterMessage<R> {
    Record(R),
    Close {
        response_tx: oneshot::Sender<Result<LogFile, WriteError>>,
    },
}

/// Handle for feeding records to one writer worker
#[derive(Clone)]
pub struct WriterHandle<R> {
    tx: mpsc::Sender<WriterMessage<R>>,
    block_on_full: bool,
    id: LogFileId,
}

impl<R: Send + 'static> WriterHandle<R> {
    /// Registry key of the file this writer owns
    pub fn id(&self) -> &LogFileId {
        &self.id
    }

    /// Enqueue one record. The queue is the pipeline's only backpressure
    /// point: when full, this either waits (block_on_full) or returns
    /// `QueueFull`.
    pub async fn record(&self, record: R) -> Result<(), WriteError> {
        if self.block_on_full {
            self.tx
                .send(WriterMessage::Record(record))
                .await
                .map_err(|_| WriteError::Closed)
        } else {
            self.tx
                .try_send(WriterMessage::Record(record))
                .map_err(|e| match e {
                    mpsc::error::TrySendError::Full(_) => WriteError::QueueFull,
                    mpsc::error::TrySendError::Closed(_) => WriteError::Closed,
                })
        }
    }

    /// Tell the worker to drain, flush, fsync and record `written`.
    /// Returns the finalized LogFile (state WRITTEN, byte size set).
    pub async fn close(&self) -> Result<LogFile, WriteError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(WriterMessage::Close { response_tx })
            .await
            .map_err(|_| WriteError::Closed)?;
        response_rx.await.map_err(|_| WriteError::Closed)?
    }
}

struct WriterWorker<R, S> {
    file: LogFile,
    serializer: Arc<S>,
    tracker: TrackerClient,
    rx: mpsc::Receiver<WriterMessage<R>>,
    config: WriterConfig,
}

impl<R, S> WriterWorker<R, S>
where
    R: Send + 'static,
    S: RecordSerializer<R>,
{
    async fn run(mut self) {
        let out = match self.open_origin() {
            Ok(out) => out,
            Err(e) => {
                error!("Writer {} failed to open origin file: {}", self.file.id(), e);
                self.fail(e).await;
                return;
            }
        };
        let mut out = BufWriter::new(out);

        // The flush deadline is absolute, not reset by traffic: steady
        // sub-interval arrivals still hit the periodic flush, keeping
        // the crash-loss window bounded to one interval.
        let mut next_flush = Instant::now() + self.config.flush_interval;
        loop {
            match timeout_at(next_flush, self.rx.recv()).await {
                Ok(Some(WriterMessage::Record(record))) => {
                    if let Err(e) = self.append(&mut out, &record) {
                        self.fail(e).await;
                        return;
                    }
                }
                Ok(Some(WriterMessage::Close { response_tx })) => {
                    let result = self.finish(out).await;
                    let _ = response_tx.send(result);
                    return;
                }
                Ok(None) => {
                    // All producers gone: close without an ack target
                    if let Err(e) = self.finish(out).await {
                        warn!("Writer {} close after channel drop failed: {}", self.file.id(), e);
                    }
                    return;
                }
                Err(_elapsed) => {
                    if let Err(e) = out.flush() {
                        self.fail(WriteError::Io(e)).await;
                        return;
                    }
                    next_flush = Instant::now() + self.config.flush_interval;
                }
            }
        }
    }

    fn open_origin(&self) -> Result<File, WriteError> {
        if let Some(parent) = self.file.origin_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file.origin_path)?;
        Ok(f)
    }

    fn append(&self, out: &mut BufWriter<File>, record: &R) -> Result<(), WriteError> {
        let bytes = self.serializer.serialize(record)?;
        out.write_all(&bytes)?;
        Ok(())
    }

    /// Drain remaining queued records, flush, fsync, and transition to
    /// WRITTEN with the final byte size.
    async fn finish(&mut self, mut out: BufWriter<File>) -> Result<LogFile, WriteError> {
        while let Ok(msg) = self.rx.try_recv() {
            match msg {
                WriterMessage::Record(record) => self.append(&mut out, &record)?,
                WriterMessage::Close { response_tx } => {
                    let _ = response_tx.send(Err(WriteError::Closed));
                }
            }
        }

        out.flush()?;
        let file = out.into_inner().map_err(|e| WriteError::Io(e.into_error()))?;
        file.sync_all()?;
        let byte_size = file.metadata()?.len();
        drop(file);

        match self.tracker.written(&mut self.file, byte_size).await? {
            1 => {
                info!(
                    "Writer {} closed: {} bytes at {}",
                    self.file.id(),
                    byte_size,
                    self.file.origin_path.display()
                );
                Ok(self.file.clone())
            }
            _ => Err(WriteError::Stale),
        }
    }

    /// Record the terminal WRITE_ERROR transition and answer any queued
    /// close requests with the fault. No internal retry: the data fault
    /// is surfaced for operator attention.
    async fn fail(&mut self, cause: WriteError) {
        error!("Writer {} stopping on fault: {}", self.file.id(), cause);
        match self.tracker.write_error(&mut self.file).await {
            Ok(1) => {}
            Ok(_) => warn!("Writer {}: write_error lost to a stale view", self.file.id()),
            Err(e) => error!("Writer {}: tracker unreachable during write_error: {}", self.file.id(), e),
        }
        self.rx.close();
        while let Ok(msg) = self.rx.try_recv() {
            if let WriterMessage::Close { response_tx } = msg {
                let _ = response_tx.send(Err(WriteError::Closed));
            }
        }
    }
}

// ============================================================================
// Factory - capability the manager invokes once per window
// ============================================================================

/// Capability for constructing a writer worker around a freshly opened
/// LogFile. The rollover manager holds one and invokes it per window.
pub trait WriterFactory<R: Send + 'static>: Send + Sync + 'static {
    fn spawn_writer(&self, file: LogFile) -> WriterHandle<R>;
}

/// Writer factory backed by local files and a tracker client
pub struct FsWriterFactory<S> {
    config: WriterConfig,
    serializer: Arc<S>,
    tracker: TrackerClient,
}

impl<S> FsWriterFactory<S> {
    pub fn new(config: WriterConfig, serializer: S, tracker: TrackerClient) -> Self {
        FsWriterFactory {
            config,
            serializer: Arc::new(serializer),
            tracker,
        }
    }
}

impl<R, S> WriterFactory<R> for FsWriterFactory<S>
where
    R: Send + 'static,
    S: RecordSerializer<R>,
{
    fn spawn_writer(&self, file: LogFile) -> WriterHandle<R> {
        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        let id = file.id();
        let worker = WriterWorker {
            file,
            serializer: Arc::clone(&self.serializer),
            tracker: self.tracker.clone(),
            rx,
            config: self.config.clone(),
        };
        tokio::spawn(worker.run());
        WriterHandle {
            tx,
            block_on_full: self.config.block_on_full,
            id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logfile::LogFileState;
    use crate::tracker::InMemoryTracker;
    use chrono::Utc;
    use std::time::Duration;

    fn setup(dir: &std::path::Path) -> (TrackerClient, InMemoryTracker, FsWriterFactory<JsonLineSerializer>) {
        let backend = InMemoryTracker::new();
        let tracker = TrackerClient::new(Arc::new(backend.clone()), "owner://test");
        let factory = FsWriterFactory::new(
            WriterConfig::test(),
            JsonLineSerializer,
            tracker.clone(),
        );
        let _ = dir;
        (tracker, backend, factory)
    }

    #[tokio::test]
    async fn test_write_and_close_records_written() {
        let dir = tempfile::tempdir().unwrap();
        let (tracker, backend, factory) = setup(dir.path());

        let pattern = format!("{}/orders-%d.log", dir.path().display());
        let file = tracker.open("orders", &pattern, Utc::now()).await.unwrap();
        let handle: WriterHandle<String> = factory.spawn_writer(file);

        for i in 0..3 {
            handle.record(format!("record-{}", i)).await.unwrap();
        }
        let closed = handle.close().await.unwrap();

        assert_eq!(closed.state, LogFileState::Written);
        assert!(closed.byte_size.unwrap() > 0);

        let contents = std::fs::read_to_string(&closed.origin_path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines, vec!["\"record-0\"", "\"record-1\"", "\"record-2\""]);

        assert_eq!(
            backend.get("orders", 1).unwrap().state,
            LogFileState::Written
        );
    }

    #[tokio::test]
    async fn test_idle_writer_still_flushes_and_closes_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (tracker, _, factory) = setup(dir.path());

        let pattern = format!("{}/idle-%d.log", dir.path().display());
        let file = tracker.open("idle", &pattern, Utc::now()).await.unwrap();
        let handle: WriterHandle<String> = factory.spawn_writer(file);

        // Let a few flush intervals elapse with no records
        tokio::time::sleep(Duration::from_millis(80)).await;

        let closed = handle.close().await.unwrap();
        assert_eq!(closed.state, LogFileState::Written);
        assert_eq!(closed.byte_size, Some(0));
        assert!(closed.origin_path.exists());
    }

    #[tokio::test]
    async fn test_close_drains_queued_records() {
        let dir = tempfile::tempdir().unwrap();
        let (tracker, _, factory) = setup(dir.path());

        let pattern = format!("{}/drain-%d.log", dir.path().display());
        let file = tracker.open("drain", &pattern, Utc::now()).await.unwrap();
        let handle: WriterHandle<String> = factory.spawn_writer(file);

        for i in 0..50 {
            handle.record(format!("r{}", i)).await.unwrap();
        }
        let closed = handle.close().await.unwrap();

        let contents = std::fs::read_to_string(&closed.origin_path).unwrap();
        assert_eq!(contents.lines().count(), 50);
    }

    #[tokio::test]
    async fn test_open_fault_records_write_error() {
        let dir = tempfile::tempdir().unwrap();
        let (tracker, backend, factory) = setup(dir.path());

        // Parent "directory" is a regular file, so create_dir_all must fail
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let pattern = format!("{}/sub/broken-%d.log", blocker.display());

        let file = tracker.open("broken", &pattern, Utc::now()).await.unwrap();
        let handle: WriterHandle<String> = factory.spawn_writer(file);

        assert!(handle.close().await.is_err());
        assert_eq!(
            backend.get("broken", 1).unwrap().state,
            LogFileState::WriteError
        );
    }

    #[tokio::test]
    async fn test_flush_deadline_holds_under_steady_traffic() {
        let dir = tempfile::tempdir().unwrap();
        let (tracker, _, factory) = setup(dir.path());

        let pattern = format!("{}/busy-%d.log", dir.path().display());
        let file = tracker.open("busy", &pattern, Utc::now()).await.unwrap();
        let origin = file.origin_path.clone();
        let handle: WriterHandle<String> = factory.spawn_writer(file);

        // Records arrive faster than the 20ms flush interval for ten
        // intervals; the periodic flush must still land data on disk
        // long before close.
        let mut on_disk = 0;
        for i in 0..40 {
            handle.record(format!("r{}", i)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            on_disk = std::fs::metadata(&origin).map(|m| m.len()).unwrap_or(0);
            if i >= 20 && on_disk > 0 {
                break;
            }
        }
        assert!(on_disk > 0, "unflushed data outlived the flush interval");

        let closed = handle.close().await.unwrap();
        let contents = std::fs::read_to_string(&closed.origin_path).unwrap();
        assert!(contents.lines().count() >= 20);
    }

    #[tokio::test]
    async fn test_blocks_when_full_then_resumes_after_drain() {
        // Handle with the consuming end held by the test: the queue
        // fills and a blocking producer must wait, not error, until the
        // worker side drains a slot.
        let (tx, mut rx) = mpsc::channel(1);
        let handle = WriterHandle::<String> {
            tx,
            block_on_full: true,
            id: LogFileId {
                cohort: "full".to_string(),
                serial: 1,
            },
        };

        handle.record("first".to_string()).await.unwrap();

        let blocked = handle.clone();
        let pending =
            tokio::spawn(async move { blocked.record("second".to_string()).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished(), "producer should wait on the full queue");

        // Draining one slot unblocks the producer
        assert!(rx.recv().await.is_some());
        pending.await.unwrap().unwrap();
        assert!(matches!(rx.recv().await, Some(WriterMessage::Record(r)) if r == "second"));
    }

    #[tokio::test]
    async fn test_reject_when_full_without_blocking() {
        // Handle with no worker attached: the queue fills and try_send
        // must report QueueFull instead of waiting.
        let (tx, _rx) = mpsc::channel(1);
        let handle = WriterHandle::<String> {
            tx,
            block_on_full: false,
            id: LogFileId {
                cohort: "full".to_string(),
                serial: 1,
            },
        };

        handle.record("first".to_string()).await.unwrap();
        assert!(matches!(
            handle.record("second".to_string()).await,
            Err(WriteError::QueueFull)
        ));
    }

    #[tokio::test]
    async fn test_bincode_serializer_frames_records() {
        let s = BincodeSerializer;
        let framed = RecordSerializer::<String>::serialize(&s, &"hello".to_string()).unwrap();
        let len = u32::from_le_bytes(framed[0..4].try_into().unwrap()) as usize;
        assert_eq!(len, framed.len() - 4);
        let decoded: String = bincode::deserialize(&framed[4..]).unwrap();
        assert_eq!(decoded, "hello");
    }
}
