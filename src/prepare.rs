//! Preparation Stage - Streaming Compress + Encrypt
//!
//! Transforms a WRITTEN file into a PREPARED artifact: the raw bytes are
//! zstd-compressed, the compressed stream is encrypted with a fresh
//! random per-file key+nonce, and the key material is wrapped under the
//! master key for persistence as `archive_key`. Everything streams in
//! fixed-size chunks, so preparation is O(file size) in bounded memory.
//!
//! ## Artifact Layout
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │ Header (24 bytes, plaintext)     │
//! │ - magic: "CSAR" (4 bytes)        │
//! │ - version: u8                    │
//! │ - flags: u8                      │
//! │ - reserved: 2 bytes              │
//! │ - raw_size: u64 LE               │
//! │ - raw_crc32: u32 LE              │
//! │ - padding: 4 bytes               │
//! ├──────────────────────────────────┤
//! │ chacha20( zstd(raw bytes) )      │
//! └──────────────────────────────────┘
//! ```
//!
//! `raw_size`/`raw_crc32` cover the original bytes and are verified on
//! retrieval. The header is written as a placeholder first and patched
//! in place once the streaming pass knows the totals.

use crate::cipher::{CipherError, CipherWriter, FileCipherKey, MasterKey};
use crate::config::PrepareConfig;
use crate::logfile::{LogFile, LogFileState};
use crate::rolling::prep_path_for;
use crate::tracker::{TrackerClient, TrackerError};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufReader, BufWriter, Error as IoError, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{oneshot, Notify};
use tracing::{error, info, warn};

/// Artifact file magic number
pub const ARTIFACT_MAGIC: [u8; 4] = *b"CSAR";
/// Current artifact format version
pub const ARTIFACT_VERSION: u8 = 1;
/// Header size in bytes
pub const ARTIFACT_HEADER_SIZE: usize = 24;

/// Chunk size for the streaming copy
const COPY_CHUNK: usize = 64 * 1024;

/// Error type for the preparation stage
#[derive(Debug)]
pub enum PrepareError {
    /// Local disk fault
    Io(IoError),
    /// Bad key material; surfaced identically to an I/O fault
    Cipher(CipherError),
    /// Tracker backend fault (propagates, never swallowed)
    Tracker(TrackerError),
    /// Artifact bytes do not parse as an artifact
    Corrupt(String),
}

impl std::fmt::Display for PrepareError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrepareError::Io(e) => write!(f, "Prepare I/O error: {}", e),
            PrepareError::Cipher(e) => write!(f, "Prepare cipher error: {}", e),
            PrepareError::Tracker(e) => write!(f, "Tracker error during prepare: {}", e),
            PrepareError::Corrupt(msg) => write!(f, "Corrupt artifact: {}", msg),
        }
    }
}

impl std::error::Error for PrepareError {}

impl From<IoError> for PrepareError {
    fn from(e: IoError) -> Self {
        PrepareError::Io(e)
    }
}

impl From<CipherError> for PrepareError {
    fn from(e: CipherError) -> Self {
        PrepareError::Cipher(e)
    }
}

impl From<TrackerError> for PrepareError {
    fn from(e: TrackerError) -> Self {
        PrepareError::Tracker(e)
    }
}

/// Integrity totals over the raw (pre-compression) bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactHeader {
    pub raw_size: u64,
    pub raw_crc32: u32,
}

impl ArtifactHeader {
    /// Serialize to the fixed-size plaintext header
    pub fn to_bytes(&self) -> [u8; ARTIFACT_HEADER_SIZE] {
        let mut buf = [0u8; ARTIFACT_HEADER_SIZE];
        buf[0..4].copy_from_slice(&ARTIFACT_MAGIC);
        buf[4] = ARTIFACT_VERSION;
        buf[5] = 0; // flags
        // buf[6..8] reserved
        buf[8..16].copy_from_slice(&self.raw_size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.raw_crc32.to_le_bytes());
        // buf[20..24] padding
        buf
    }

    /// Parse and validate the fixed-size header
    pub fn from_bytes(data: &[u8]) -> Result<Self, PrepareError> {
        if data.len() < ARTIFACT_HEADER_SIZE {
            return Err(PrepareError::Corrupt(format!(
                "artifact too short for header: {} bytes",
                data.len()
            )));
        }
        if data[0..4] != ARTIFACT_MAGIC {
            return Err(PrepareError::Corrupt(format!(
                "invalid artifact magic: {:?}",
                &data[0..4]
            )));
        }
        if data[4] != ARTIFACT_VERSION {
            return Err(PrepareError::Corrupt(format!(
                "unsupported artifact version: {}",
                data[4]
            )));
        }
        let raw_size = u64::from_le_bytes(
            data[8..16]
                .try_into()
                .expect("length validated: header >= 16 bytes"),
        );
        let raw_crc32 = u32::from_le_bytes(
            data[16..20]
                .try_into()
                .expect("length validated: header >= 20 bytes"),
        );
        Ok(ArtifactHeader { raw_size, raw_crc32 })
    }
}

/// Result of preparing one artifact
#[derive(Debug, Clone, Copy)]
pub struct PreparedMeta {
    pub raw_size: u64,
    pub artifact_size: u64,
    pub raw_crc32: u32,
}

/// Compress+encrypt capability, one per process
#[derive(Clone)]
pub struct Preparer {
    master: MasterKey,
    config: PrepareConfig,
}

impl Preparer {
    pub fn new(master: MasterKey, config: PrepareConfig) -> Self {
        Preparer { master, config }
    }

    /// Wrap a freshly generated per-file key for persistence
    pub fn wrap_key(&self, file_key: &FileCipherKey) -> Result<String, CipherError> {
        self.master.wrap(file_key)
    }

    /// Artifact location for a given origin file
    pub fn prep_path(&self, origin: &Path) -> std::path::PathBuf {
        prep_path_for(origin, self.config.prep_dir.as_deref())
    }

    /// Stream `origin` through zstd and the cipher into `prep`.
    /// The header is patched in place once the totals are known.
    pub fn prepare_artifact(
        &self,
        origin: &Path,
        prep: &Path,
        file_key: &FileCipherKey,
    ) -> Result<PreparedMeta, PrepareError> {
        if let Some(parent) = prep.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut input = BufReader::new(File::open(origin)?);
        let mut out = File::create(prep)?;

        // Placeholder header; patched after the streaming pass
        out.write_all(&[0u8; ARTIFACT_HEADER_SIZE])?;

        let encrypt = CipherWriter::new(BufWriter::new(out), file_key.cipher());
        let mut compress =
            zstd::stream::write::Encoder::new(encrypt, self.config.zstd_level)?;

        let mut hasher = crc32fast::Hasher::new();
        let mut raw_size: u64 = 0;
        let mut chunk = [0u8; COPY_CHUNK];
        loop {
            let n = input.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            hasher.update(&chunk[..n]);
            raw_size += n as u64;
            compress.write_all(&chunk[..n])?;
        }

        let mut encrypt = compress.finish()?;
        encrypt.flush()?;
        let mut out = encrypt
            .into_inner()
            .into_inner()
            .map_err(|e| PrepareError::Io(e.into_error()))?;

        let header = ArtifactHeader {
            raw_size,
            raw_crc32: hasher.finalize(),
        };
        out.seek(SeekFrom::Start(0))?;
        out.write_all(&header.to_bytes())?;
        out.sync_all()?;
        let artifact_size = out.metadata()?.len();

        Ok(PreparedMeta {
            raw_size,
            artifact_size,
            raw_crc32: header.raw_crc32,
        })
    }
}

/// Outcome of a single claim-and-prepare attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// The file reached PREPARED
    Prepared,
    /// Another attempt already moved the file; abandoned without mutation
    Stale,
    /// The I/O or cipher fault was recorded via PREP_ERROR
    Faulted,
}

/// Claim one file and drive it WRITTEN/PREP_ERROR -> PREPARING -> PREPARED.
/// Per-file faults are recorded via `prep_error` and reported as
/// `Faulted`; only tracker faults surface as `Err`.
pub async fn prepare_one(
    tracker: &TrackerClient,
    preparer: &Preparer,
    file: &mut LogFile,
) -> Result<PrepareOutcome, PrepareError> {
    if tracker.preparing(file).await? == 0 {
        return Ok(PrepareOutcome::Stale);
    }

    let file_key = FileCipherKey::generate();
    let prep = preparer.prep_path(&file.origin_path);

    let attempt = preparer
        .wrap_key(&file_key)
        .map_err(PrepareError::from)
        .and_then(|wrapped| {
            preparer
                .prepare_artifact(&file.origin_path, &prep, &file_key)
                .map(|meta| (wrapped, meta))
        });

    match attempt {
        Ok((wrapped, meta)) => {
            match tracker.prepared(file, prep.clone(), wrapped).await? {
                1 => {
                    info!(
                        "Prepared {}: {} raw bytes -> {} artifact bytes",
                        file.id(),
                        meta.raw_size,
                        meta.artifact_size
                    );
                    Ok(PrepareOutcome::Prepared)
                }
                _ => {
                    // Lost the finalizing update: drop our orphan artifact
                    let _ = std::fs::remove_file(&prep);
                    Ok(PrepareOutcome::Stale)
                }
            }
        }
        Err(PrepareError::Tracker(e)) => Err(PrepareError::Tracker(e)),
        Err(cause) => {
            warn!("Prepare fault on {}: {}", file.id(), cause);
            let _ = std::fs::remove_file(&prep);
            match tracker.prep_error(file).await? {
                1 => Ok(PrepareOutcome::Faulted),
                _ => Ok(PrepareOutcome::Stale),
            }
        }
    }
}

// ============================================================================
// PrepareWorker - polls for claimable files, wakes on notification
// ============================================================================

/// Counters surfaced through the worker handle
#[derive(Debug, Clone, Copy, Default)]
pub struct PrepareStats {
    pub prepared: u64,
    pub faulted: u64,
    pub stale: u64,
}

/// Handle for the preparation worker
pub struct PrepareWorkerHandle {
    shutdown_tx: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<()>,
    stats: Arc<Mutex<PrepareStats>>,
}

impl PrepareWorkerHandle {
    /// Snapshot of the worker's counters
    pub fn stats(&self) -> PrepareStats {
        *self.stats.lock()
    }

    /// Graceful shutdown: the worker finishes its current file first
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.task.await;
    }
}

/// Spawn the preparation worker. It sweeps `find_mine(WRITTEN)` (plus
/// `find_mine(PREP_ERROR)` when retries are enabled) every poll interval
/// and whenever `wake` is notified; `done` is notified after each file
/// reaches PREPARED so the upload pool can pick it up promptly.
pub fn spawn_prepare_worker(
    tracker: TrackerClient,
    preparer: Preparer,
    config: PrepareConfig,
    wake: Arc<Notify>,
    done: Arc<Notify>,
) -> PrepareWorkerHandle {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
    let stats = Arc::new(Mutex::new(PrepareStats::default()));
    let worker_stats = Arc::clone(&stats);

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Prepare worker shutting down");
                    return;
                }
                _ = ticker.tick() => {}
                _ = wake.notified() => {}
            }

            let mut states = vec![LogFileState::Written];
            if config.retry_errors {
                states.push(LogFileState::PrepError);
            }

            for state in states {
                let candidates = match tracker.find_mine(state).await {
                    Ok(c) => c,
                    Err(e) => {
                        // No forward progress is safe without the store;
                        // pause this pass and try again next tick.
                        error!("Prepare worker: tracker unreachable: {}", e);
                        break;
                    }
                };

                for mut file in candidates {
                    match prepare_one(&tracker, &preparer, &mut file).await {
                        Ok(PrepareOutcome::Prepared) => {
                            worker_stats.lock().prepared += 1;
                            done.notify_one();
                        }
                        Ok(PrepareOutcome::Faulted) => worker_stats.lock().faulted += 1,
                        Ok(PrepareOutcome::Stale) => worker_stats.lock().stale += 1,
                        Err(e) => {
                            error!("Prepare worker pausing on tracker fault: {}", e);
                            break;
                        }
                    }
                }
            }
        }
    });

    PrepareWorkerHandle {
        shutdown_tx,
        task,
        stats,
    }
}
