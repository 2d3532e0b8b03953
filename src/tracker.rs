//! LogFile Tracker - Ownership Protocol and Registry Abstraction
//!
//! The tracker is the only shared mutable resource in the pipeline. Every
//! state transition is a single conditional update keyed on the row's
//! expected prior state and owner, which gives optimistic concurrency
//! without distributed locks: if two processes briefly believe they own
//! overlapping work, only one conditional update wins per transition.
//!
//! Backends implement the small [`Tracker`] trait (atomic allocation, one
//! conditional-update primitive, and queries). The named transition
//! operations (`written`, `preparing`, `prepared`, ...) are derived once
//! in [`TrackerClient`] so their semantics cannot drift between backends.
//!
//! Implementations:
//! - `InMemoryTracker`: for unit tests and integration tests

use crate::logfile::{is_legal_transition, LogFile, LogFileId, LogFileState};
use crate::rolling::render_serial_path;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

/// Error type for tracker operations
#[derive(Debug)]
pub enum TrackerError {
    /// A race produced two records with the same (cohort, serial).
    /// Fatal to this `open` attempt; safe to retry with a fresh allocation.
    DuplicateAllocation { cohort: String, serial: u64 },
    /// The backing store is unreachable or misbehaving. Never swallowed:
    /// the affected stage must pause, since no forward progress is safe.
    Backend(String),
}

impl std::fmt::Display for TrackerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackerError::DuplicateAllocation { cohort, serial } => {
                write!(f, "Duplicate allocation for {}#{}", cohort, serial)
            }
            TrackerError::Backend(msg) => write!(f, "Tracker backend error: {}", msg),
        }
    }
}

impl std::error::Error for TrackerError {}

/// Field updates applied together with a state transition.
///
/// Only the fields a given edge is allowed to touch are ever set; the
/// backend applies them verbatim when (and only when) the conditional
/// update matches.
#[derive(Debug, Clone, Default)]
pub struct StateChange {
    pub byte_size: Option<u64>,
    pub prep_path: Option<PathBuf>,
    pub archive_key: Option<String>,
    pub archive_group: Option<String>,
    pub archive_uri: Option<String>,
}

impl StateChange {
    fn apply_to(&self, file: &mut LogFile, new_state: LogFileState, updated_at: DateTime<Utc>) {
        if let Some(size) = self.byte_size {
            file.byte_size = Some(size);
        }
        if let Some(ref p) = self.prep_path {
            file.prep_path = Some(p.clone());
        }
        if let Some(ref k) = self.archive_key {
            file.archive_key = Some(k.clone());
        }
        if let Some(ref g) = self.archive_group {
            file.archive_group = Some(g.clone());
        }
        if let Some(ref u) = self.archive_uri {
            file.archive_uri = Some(u.clone());
        }
        file.state = new_state;
        file.updated_at = updated_at;
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Durable registry contract every backend must honor:
/// atomicity of serial allocation, atomicity of each conditional update,
/// and read-after-write visibility for the same owner's own writes.
pub trait Tracker: Send + Sync + 'static {
    /// Atomically allocate the next serial for `cohort`, render the origin
    /// path from `path_pattern` (the `%d` placeholder takes the serial),
    /// and insert a WRITING record owned by `owner_uri`.
    fn open<'a>(
        &'a self,
        cohort: &'a str,
        path_pattern: &'a str,
        start_time: DateTime<Utc>,
        owner_uri: &'a str,
    ) -> BoxFuture<'a, Result<LogFile, TrackerError>>;

    /// Conditional update: move the row to `new_state` and apply `change`
    /// iff its current state is `expected_state` and its owner is
    /// `owner_uri`. Returns the number of rows updated (0 or 1).
    ///
    /// 0 is not an error: it means the caller's in-memory view is stale
    /// (another attempt already moved the file, or it no longer exists)
    /// and the caller must abandon this attempt.
    fn update_if<'a>(
        &'a self,
        id: &'a LogFileId,
        expected_state: LogFileState,
        owner_uri: &'a str,
        new_state: LogFileState,
        change: StateChange,
    ) -> BoxFuture<'a, Result<u64, TrackerError>>;

    /// All records owned by `owner_uri` currently in `state`, ordered by
    /// (cohort, serial). This is the recovery primitive: on startup every
    /// worker pool asks for its input state(s) to resume in-flight work.
    fn find_owned<'a>(
        &'a self,
        owner_uri: &'a str,
        state: LogFileState,
    ) -> BoxFuture<'a, Result<Vec<LogFile>, TrackerError>>;

    /// Owned records in `state` with `start_time` in `[from, to]`.
    /// Reporting/maintenance query, not concurrency-critical.
    fn find_owned_in_range<'a>(
        &'a self,
        owner_uri: &'a str,
        state: LogFileState,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Vec<LogFile>, TrackerError>>;

    /// Point lookup by registry key
    fn find_by_cohort_and_serial<'a>(
        &'a self,
        cohort: &'a str,
        serial: u64,
    ) -> BoxFuture<'a, Result<Option<LogFile>, TrackerError>>;

    /// Number of records currently in `state`, across all owners
    fn count_by_state<'a>(
        &'a self,
        state: LogFileState,
    ) -> BoxFuture<'a, Result<u64, TrackerError>>;

    /// Sum of recorded byte sizes for a cohort
    fn total_size<'a>(&'a self, cohort: &'a str) -> BoxFuture<'a, Result<u64, TrackerError>>;
}

// ============================================================================
// TrackerClient - named transition operations, shared by all stages
// ============================================================================

/// Owner-scoped client over a tracker backend.
///
/// Each transition method performs the conditional update for exactly its
/// edge of the lifecycle diagram and mutates the in-memory [`LogFile`]
/// only after the update reports success. All methods return the updated
/// row count (0 or 1); 0 means "stale view, abandon this attempt".
#[derive(Clone)]
pub struct TrackerClient {
    inner: Arc<dyn Tracker>,
    owner_uri: String,
}

impl TrackerClient {
    pub fn new(inner: Arc<dyn Tracker>, owner_uri: impl Into<String>) -> Self {
        TrackerClient {
            inner,
            owner_uri: owner_uri.into(),
        }
    }

    /// The stable process identity recorded on every file this client opens
    pub fn owner_uri(&self) -> &str {
        &self.owner_uri
    }

    /// Allocate the next serial and insert a WRITING record owned by us
    pub async fn open(
        &self,
        cohort: &str,
        path_pattern: &str,
        start_time: DateTime<Utc>,
    ) -> Result<LogFile, TrackerError> {
        self.inner
            .open(cohort, path_pattern, start_time, &self.owner_uri)
            .await
    }

    async fn transition(
        &self,
        file: &mut LogFile,
        new_state: LogFileState,
        change: StateChange,
    ) -> Result<u64, TrackerError> {
        // Illegal edges never reach the backend: the conditional update
        // could not distinguish them from a legitimate claim.
        if !is_legal_transition(file.state, new_state) {
            return Ok(0);
        }
        let updated = self
            .inner
            .update_if(&file.id(), file.state, &self.owner_uri, new_state, change.clone())
            .await?;
        if updated == 1 {
            change.apply_to(file, new_state, Utc::now());
        }
        Ok(updated)
    }

    /// WRITING -> WRITTEN, recording the final byte size
    pub async fn written(&self, file: &mut LogFile, byte_size: u64) -> Result<u64, TrackerError> {
        self.transition(
            file,
            LogFileState::Written,
            StateChange {
                byte_size: Some(byte_size),
                ..StateChange::default()
            },
        )
        .await
    }

    /// WRITING -> WRITE_ERROR (terminal)
    pub async fn write_error(&self, file: &mut LogFile) -> Result<u64, TrackerError> {
        self.transition(file, LogFileState::WriteError, StateChange::default())
            .await
    }

    /// WRITTEN -> PREPARING, or the retry edge PREP_ERROR -> PREPARING
    pub async fn preparing(&self, file: &mut LogFile) -> Result<u64, TrackerError> {
        self.transition(file, LogFileState::Preparing, StateChange::default())
            .await
    }

    /// PREPARING -> PREP_ERROR (retryable)
    pub async fn prep_error(&self, file: &mut LogFile) -> Result<u64, TrackerError> {
        self.transition(file, LogFileState::PrepError, StateChange::default())
            .await
    }

    /// PREPARING -> PREPARED, recording the artifact path and wrapped key
    pub async fn prepared(
        &self,
        file: &mut LogFile,
        prep_path: PathBuf,
        archive_key: String,
    ) -> Result<u64, TrackerError> {
        self.transition(
            file,
            LogFileState::Prepared,
            StateChange {
                prep_path: Some(prep_path),
                archive_key: Some(archive_key),
                ..StateChange::default()
            },
        )
        .await
    }

    /// PREPARED -> UPLOADING, or the retry edge UPLOAD_ERROR -> UPLOADING
    pub async fn uploading(&self, file: &mut LogFile) -> Result<u64, TrackerError> {
        self.transition(file, LogFileState::Uploading, StateChange::default())
            .await
    }

    /// UPLOADING -> UPLOAD_ERROR (retryable)
    pub async fn upload_error(&self, file: &mut LogFile) -> Result<u64, TrackerError> {
        self.transition(file, LogFileState::UploadError, StateChange::default())
            .await
    }

    /// UPLOADING -> UPLOADED (terminal), recording the remote location
    pub async fn uploaded(
        &self,
        file: &mut LogFile,
        archive_uri: String,
        archive_group: String,
        byte_size: u64,
    ) -> Result<u64, TrackerError> {
        self.transition(
            file,
            LogFileState::Uploaded,
            StateChange {
                archive_uri: Some(archive_uri),
                archive_group: Some(archive_group),
                byte_size: Some(byte_size),
                ..StateChange::default()
            },
        )
        .await
    }

    /// Our records currently in `state` (the recovery primitive)
    pub async fn find_mine(&self, state: LogFileState) -> Result<Vec<LogFile>, TrackerError> {
        self.inner.find_owned(&self.owner_uri, state).await
    }

    /// Our records in `state` with start_time in `[from, to]`
    pub async fn find_mine_in_range(
        &self,
        state: LogFileState,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LogFile>, TrackerError> {
        self.inner
            .find_owned_in_range(&self.owner_uri, state, from, to)
            .await
    }

    /// Point lookup by registry key
    pub async fn find_by_cohort_and_serial(
        &self,
        cohort: &str,
        serial: u64,
    ) -> Result<Option<LogFile>, TrackerError> {
        self.inner.find_by_cohort_and_serial(cohort, serial).await
    }

    /// Per-state count across all owners (operator visibility)
    pub async fn count_by_state(&self, state: LogFileState) -> Result<u64, TrackerError> {
        self.inner.count_by_state(state).await
    }

    /// Sum of recorded byte sizes for a cohort
    pub async fn total_size(&self, cohort: &str) -> Result<u64, TrackerError> {
        self.inner.total_size(cohort).await
    }
}

// ============================================================================
// InMemoryTracker - for unit tests and integration tests
// ============================================================================

#[derive(Debug, Default)]
struct Registry {
    files: HashMap<(String, u64), LogFile>,
    serials: HashMap<String, u64>,
}

/// In-memory tracker backend. Allocation and conditional updates happen
/// under one mutex, which trivially satisfies the atomicity contract.
#[derive(Clone, Default)]
pub struct InMemoryTracker {
    registry: Arc<Mutex<Registry>>,
}

impl InMemoryTracker {
    pub fn new() -> Self {
        InMemoryTracker::default()
    }

    /// Number of records in the registry (for tests)
    pub fn len(&self) -> usize {
        self.registry.lock().files.len()
    }

    /// Check if the registry is empty (for tests)
    pub fn is_empty(&self) -> bool {
        self.registry.lock().files.is_empty()
    }

    /// Snapshot of a record (for tests)
    pub fn get(&self, cohort: &str, serial: u64) -> Option<LogFile> {
        self.registry
            .lock()
            .files
            .get(&(cohort.to_string(), serial))
            .cloned()
    }
}

impl Tracker for InMemoryTracker {
    fn open<'a>(
        &'a self,
        cohort: &'a str,
        path_pattern: &'a str,
        start_time: DateTime<Utc>,
        owner_uri: &'a str,
    ) -> BoxFuture<'a, Result<LogFile, TrackerError>> {
        Box::pin(async move {
            let mut registry = self.registry.lock();

            let serial = registry
                .serials
                .entry(cohort.to_string())
                .and_modify(|s| *s += 1)
                .or_insert(1);
            let serial = *serial;

            let key = (cohort.to_string(), serial);
            if registry.files.contains_key(&key) {
                return Err(TrackerError::DuplicateAllocation {
                    cohort: cohort.to_string(),
                    serial,
                });
            }

            let now = Utc::now();
            let file = LogFile {
                cohort: cohort.to_string(),
                serial,
                start_time,
                origin_path: render_serial_path(path_pattern, serial),
                prep_path: None,
                archive_key: None,
                archive_group: None,
                archive_uri: None,
                byte_size: None,
                state: LogFileState::Writing,
                owner_uri: owner_uri.to_string(),
                created_at: now,
                updated_at: now,
            };
            registry.files.insert(key, file.clone());
            Ok(file)
        })
    }

    fn update_if<'a>(
        &'a self,
        id: &'a LogFileId,
        expected_state: LogFileState,
        owner_uri: &'a str,
        new_state: LogFileState,
        change: StateChange,
    ) -> BoxFuture<'a, Result<u64, TrackerError>> {
        Box::pin(async move {
            let mut registry = self.registry.lock();
            let key = (id.cohort.clone(), id.serial);
            match registry.files.get_mut(&key) {
                Some(row) if row.state == expected_state && row.owner_uri == owner_uri => {
                    change.apply_to(row, new_state, Utc::now());
                    Ok(1)
                }
                _ => Ok(0),
            }
        })
    }

    fn find_owned<'a>(
        &'a self,
        owner_uri: &'a str,
        state: LogFileState,
    ) -> BoxFuture<'a, Result<Vec<LogFile>, TrackerError>> {
        Box::pin(async move {
            let registry = self.registry.lock();
            let mut files: Vec<LogFile> = registry
                .files
                .values()
                .filter(|f| f.owner_uri == owner_uri && f.state == state)
                .cloned()
                .collect();
            files.sort_by(|a, b| (&a.cohort, a.serial).cmp(&(&b.cohort, b.serial)));
            Ok(files)
        })
    }

    fn find_owned_in_range<'a>(
        &'a self,
        owner_uri: &'a str,
        state: LogFileState,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Vec<LogFile>, TrackerError>> {
        Box::pin(async move {
            let registry = self.registry.lock();
            let mut files: Vec<LogFile> = registry
                .files
                .values()
                .filter(|f| {
                    f.owner_uri == owner_uri
                        && f.state == state
                        && f.start_time >= from
                        && f.start_time <= to
                })
                .cloned()
                .collect();
            files.sort_by(|a, b| (&a.cohort, a.serial).cmp(&(&b.cohort, b.serial)));
            Ok(files)
        })
    }

    fn find_by_cohort_and_serial<'a>(
        &'a self,
        cohort: &'a str,
        serial: u64,
    ) -> BoxFuture<'a, Result<Option<LogFile>, TrackerError>> {
        Box::pin(async move {
            let registry = self.registry.lock();
            Ok(registry.files.get(&(cohort.to_string(), serial)).cloned())
        })
    }

    fn count_by_state<'a>(
        &'a self,
        state: LogFileState,
    ) -> BoxFuture<'a, Result<u64, TrackerError>> {
        Box::pin(async move {
            let registry = self.registry.lock();
            Ok(registry.files.values().filter(|f| f.state == state).count() as u64)
        })
    }

    fn total_size<'a>(&'a self, cohort: &'a str) -> BoxFuture<'a, Result<u64, TrackerError>> {
        Box::pin(async move {
            let registry = self.registry.lock();
            Ok(registry
                .files
                .values()
                .filter(|f| f.cohort == cohort)
                .filter_map(|f| f.byte_size)
                .sum())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> (TrackerClient, InMemoryTracker) {
        let backend = InMemoryTracker::new();
        let client = TrackerClient::new(Arc::new(backend.clone()), "owner://test");
        (client, backend)
    }

    #[tokio::test]
    async fn test_open_allocates_increasing_serials() {
        let (client, _) = client();

        for expected in 1..=5u64 {
            let file = client
                .open("orders", "/data/orders-%d", Utc::now())
                .await
                .unwrap();
            assert_eq!(file.serial, expected);
            assert_eq!(file.state, LogFileState::Writing);
            assert_eq!(
                file.origin_path,
                PathBuf::from(format!("/data/orders-{}", expected))
            );
        }

        // Independent sequence per cohort
        let other = client
            .open("billing", "/data/billing-%d", Utc::now())
            .await
            .unwrap();
        assert_eq!(other.serial, 1);
    }

    #[tokio::test]
    async fn test_concurrent_opens_never_share_a_serial() {
        let (client, _) = client();

        let mut handles = Vec::new();
        for _ in 0..50 {
            let c = client.clone();
            handles.push(tokio::spawn(async move {
                c.open("orders", "/data/orders-%d", Utc::now())
                    .await
                    .unwrap()
                    .serial
            }));
        }

        let mut serials = Vec::new();
        for h in handles {
            serials.push(h.await.unwrap());
        }
        serials.sort_unstable();
        let expected: Vec<u64> = (1..=50).collect();
        assert_eq!(serials, expected, "serials must be gap-free and unique");
    }

    #[tokio::test]
    async fn test_written_moves_between_find_mine_states() {
        let (client, _) = client();

        let mut file = client
            .open("orders", "/data/orders-%d", Utc::now())
            .await
            .unwrap();
        assert_eq!(client.find_mine(LogFileState::Writing).await.unwrap().len(), 1);

        assert_eq!(client.written(&mut file, 42).await.unwrap(), 1);
        assert_eq!(file.state, LogFileState::Written);
        assert_eq!(file.byte_size, Some(42));

        assert!(client.find_mine(LogFileState::Writing).await.unwrap().is_empty());
        assert_eq!(client.find_mine(LogFileState::Written).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transition_from_wrong_state_returns_zero() {
        let (client, backend) = client();

        let mut file = client
            .open("orders", "/data/orders-%d", Utc::now())
            .await
            .unwrap();

        // uploading is only legal from PREPARED / UPLOAD_ERROR
        assert_eq!(client.uploading(&mut file).await.unwrap(), 0);
        assert_eq!(file.state, LogFileState::Writing, "in-memory view untouched");
        assert_eq!(
            backend.get("orders", 1).unwrap().state,
            LogFileState::Writing,
            "persisted state untouched"
        );
    }

    #[tokio::test]
    async fn test_stale_view_returns_zero() {
        let (client, _) = client();

        let mut mine = client
            .open("orders", "/data/orders-%d", Utc::now())
            .await
            .unwrap();
        let mut stale = mine.clone();

        assert_eq!(client.written(&mut mine, 10).await.unwrap(), 1);
        // Second attempt from the stale copy loses the conditional update
        assert_eq!(client.written(&mut stale, 10).await.unwrap(), 0);
        assert_eq!(stale.state, LogFileState::Writing);
    }

    #[tokio::test]
    async fn test_other_owner_cannot_advance_my_file() {
        let backend = InMemoryTracker::new();
        let me = TrackerClient::new(Arc::new(backend.clone()), "owner://a");
        let them = TrackerClient::new(Arc::new(backend), "owner://b");

        let mut file = me
            .open("orders", "/data/orders-%d", Utc::now())
            .await
            .unwrap();
        let mut theirs = file.clone();

        assert_eq!(them.written(&mut theirs, 10).await.unwrap(), 0);
        assert_eq!(me.written(&mut file, 10).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_full_happy_path_visits_one_state_at_a_time() {
        let (client, _) = client();

        let mut file = client
            .open("orders", "/data/orders-%d", Utc::now())
            .await
            .unwrap();

        assert_eq!(client.written(&mut file, 100).await.unwrap(), 1);
        assert_eq!(client.preparing(&mut file).await.unwrap(), 1);
        assert_eq!(
            client
                .prepared(&mut file, PathBuf::from("/prep/orders-1.csa"), "aa".into())
                .await
                .unwrap(),
            1
        );
        assert_eq!(client.uploading(&mut file).await.unwrap(), 1);
        assert_eq!(
            client
                .uploaded(&mut file, "cold/20131007/orders-1.csa".into(), "20131007".into(), 80)
                .await
                .unwrap(),
            1
        );

        // The file is observable in exactly one state
        let mut populated = 0;
        for state in [
            LogFileState::Writing,
            LogFileState::Written,
            LogFileState::Preparing,
            LogFileState::Prepared,
            LogFileState::Uploading,
            LogFileState::Uploaded,
        ] {
            populated += client.find_mine(state).await.unwrap().len();
        }
        assert_eq!(populated, 1);
        assert_eq!(file.state, LogFileState::Uploaded);
        assert_eq!(file.archive_group.as_deref(), Some("20131007"));
    }

    #[tokio::test]
    async fn test_error_states_are_retryable() {
        let (client, _) = client();

        let mut file = client
            .open("orders", "/data/orders-%d", Utc::now())
            .await
            .unwrap();
        client.written(&mut file, 10).await.unwrap();

        // prepare fails, retried, succeeds
        assert_eq!(client.preparing(&mut file).await.unwrap(), 1);
        assert_eq!(client.prep_error(&mut file).await.unwrap(), 1);
        assert_eq!(client.preparing(&mut file).await.unwrap(), 1);
        assert_eq!(
            client
                .prepared(&mut file, PathBuf::from("/prep/x"), "aa".into())
                .await
                .unwrap(),
            1
        );

        // upload fails, retried, succeeds
        assert_eq!(client.uploading(&mut file).await.unwrap(), 1);
        assert_eq!(client.upload_error(&mut file).await.unwrap(), 1);
        assert_eq!(client.uploading(&mut file).await.unwrap(), 1);
        assert_eq!(
            client
                .uploaded(&mut file, "u".into(), "g".into(), 5)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_write_error_is_terminal() {
        let (client, _) = client();

        let mut file = client
            .open("orders", "/data/orders-%d", Utc::now())
            .await
            .unwrap();
        assert_eq!(client.write_error(&mut file).await.unwrap(), 1);
        assert_eq!(file.state, LogFileState::WriteError);

        // No edge leads out of WRITE_ERROR
        assert_eq!(client.written(&mut file, 1).await.unwrap(), 0);
        assert_eq!(client.preparing(&mut file).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_range_and_count_queries() {
        let (client, _) = client();
        let base = "2013-10-07T21:33:00Z".parse::<DateTime<Utc>>().unwrap();

        for hour in 0..4 {
            let start = base + chrono::Duration::hours(hour);
            let mut file = client.open("orders", "/data/orders-%d", start).await.unwrap();
            client.written(&mut file, 100).await.unwrap();
        }

        assert_eq!(client.count_by_state(LogFileState::Written).await.unwrap(), 4);
        assert_eq!(client.total_size("orders").await.unwrap(), 400);

        let subset = client
            .find_mine_in_range(
                LogFileState::Written,
                base + chrono::Duration::hours(1),
                base + chrono::Duration::hours(2),
            )
            .await
            .unwrap();
        assert_eq!(subset.len(), 2);

        let found = client.find_by_cohort_and_serial("orders", 3).await.unwrap();
        assert_eq!(found.unwrap().serial, 3);
        assert!(client
            .find_by_cohort_and_serial("orders", 99)
            .await
            .unwrap()
            .is_none());
    }
}
