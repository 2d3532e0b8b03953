//! End-to-end pipeline tests against in-memory backends: records go in
//! one end, encrypted artifacts come out the other, local copies are
//! cleaned on schedule, and retrieval recovers the original bytes.

use chrono::{DateTime, Utc};
use coldship::archive::{DateLayout, InMemoryArchiveStore};
use coldship::cipher::MasterKey;
use coldship::cleanup::CleanupSweep;
use coldship::config::{CleanupConfig, PrepareConfig, UploadConfig, WriterConfig};
use coldship::logfile::LogFileState;
use coldship::prepare::{prepare_one, PrepareOutcome, Preparer};
use coldship::retrieve::Retriever;
use coldship::tracker::{InMemoryTracker, TrackerClient};
use coldship::upload::{spawn_upload_pool, upload_one, UploadOutcome};
use coldship::writer::{FsWriterFactory, JsonLineSerializer, WriterFactory, WriterHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Pipeline {
    tracker: TrackerClient,
    backend: InMemoryTracker,
    store: InMemoryArchiveStore,
    master: MasterKey,
    preparer: Preparer,
}

impl Pipeline {
    fn new() -> Self {
        let backend = InMemoryTracker::new();
        let tracker = TrackerClient::new(Arc::new(backend.clone()), "owner://test");
        let master = MasterKey::generate();
        let preparer = Preparer::new(master.clone(), PrepareConfig::test());
        Pipeline {
            tracker,
            backend,
            store: InMemoryArchiveStore::new(),
            master,
            preparer,
        }
    }
}

/// The full lifecycle of one file, stage by stage: three records are
/// written into a fresh serial, prepared into an encrypted artifact,
/// uploaded under a date group, cleaned up locally after the retention
/// window, and finally retrieved byte-identical from the archive.
#[tokio::test]
async fn full_lifecycle_of_one_file() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let p = Pipeline::new();

    // -- write ---------------------------------------------------------
    let start: DateTime<Utc> = "2013-10-07T21:33:00Z".parse().unwrap();
    let pattern = format!("{}/orders-%d.log", dir.path().display());
    let file = p.tracker.open("orders", &pattern, start).await.unwrap();
    assert_eq!(file.serial, 1);
    assert_eq!(file.state, LogFileState::Writing);

    let factory = FsWriterFactory::new(WriterConfig::test(), JsonLineSerializer, p.tracker.clone());
    let handle: WriterHandle<String> = factory.spawn_writer(file);
    for line in ["alpha", "beta", "gamma"] {
        handle.record(line.to_string()).await.unwrap();
    }
    let mut file = handle.close().await.unwrap();
    assert_eq!(file.state, LogFileState::Written);
    assert!(file.byte_size.unwrap() > 0);
    let raw = std::fs::read(&file.origin_path).unwrap();

    // -- prepare -------------------------------------------------------
    let outcome = prepare_one(&p.tracker, &p.preparer, &mut file).await.unwrap();
    assert_eq!(outcome, PrepareOutcome::Prepared);
    assert!(file.prep_path.as_ref().unwrap().exists());
    assert!(file.archive_key.is_some());
    // Artifact on disk is not the plaintext
    let artifact = std::fs::read(file.prep_path.as_ref().unwrap()).unwrap();
    assert!(!artifact
        .windows(raw.len().min(16))
        .any(|w| w == &raw[..raw.len().min(16)]));

    // -- upload --------------------------------------------------------
    let outcome = upload_one(&p.tracker, &p.store, &DateLayout, "cold", &mut file)
        .await
        .unwrap();
    assert_eq!(outcome, UploadOutcome::Uploaded);
    assert_eq!(file.archive_group.as_deref(), Some("20131007"));
    assert!(file.archive_uri.as_ref().unwrap().starts_with("cold/20131007/"));

    // -- cleanup -------------------------------------------------------
    let sweep = CleanupSweep::new(
        p.tracker.clone(),
        &CleanupConfig {
            min_age: Duration::from_secs(3600),
            max_age: Duration::from_secs(24 * 3600),
            sweep_interval: Duration::from_millis(50),
        },
    )
    .unwrap();

    // Right after upload: inside min_age, nothing is removed
    let report = sweep.sweep_once(start).await.unwrap();
    assert_eq!(report.paths_deleted, 0);
    assert!(file.origin_path.exists());

    // Two hours later both local copies go
    let report = sweep
        .sweep_once(start + chrono::Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(report.paths_deleted, 2);
    assert!(!file.origin_path.exists());
    assert!(!file.prep_path.as_ref().unwrap().exists());

    // -- retrieve ------------------------------------------------------
    let retriever = Retriever::new(p.master.clone(), Arc::new(p.store.clone()));
    let recovered = retriever.retrieve(&file).await.unwrap();
    assert_eq!(recovered, raw);
    assert_eq!(
        String::from_utf8(recovered).unwrap(),
        "\"alpha\"\n\"beta\"\n\"gamma\"\n"
    );

    // The registry still knows everything about the shipped file
    let row = p.backend.get("orders", 1).unwrap();
    assert_eq!(row.state, LogFileState::Uploaded);
    assert_eq!(row.owner_uri, "owner://test");
}

/// Two owning processes sharing one tracker never double-process a file:
/// every conditional claim has exactly one winner.
#[tokio::test]
async fn two_owners_split_the_work_without_overlap() {
    let dir = tempfile::tempdir().unwrap();
    let backend = InMemoryTracker::new();
    let a = TrackerClient::new(Arc::new(backend.clone()), "owner://a");
    let b = TrackerClient::new(Arc::new(backend.clone()), "owner://b");

    // Each owner writes its own files
    for (client, name) in [(&a, "a"), (&b, "b")] {
        for _ in 0..3 {
            let pattern = format!("{}/{}-%d.log", dir.path().display(), name);
            let mut file = client.open("orders", &pattern, Utc::now()).await.unwrap();
            std::fs::write(&file.origin_path, b"payload").unwrap();
            client.written(&mut file, 7).await.unwrap();
        }
    }
    // Serials are allocated from one gap-free sequence across owners
    assert_eq!(backend.len(), 6);

    // Recovery query: each owner sees only its own WRITTEN files
    let mine = a.find_mine(LogFileState::Written).await.unwrap();
    assert_eq!(mine.len(), 3);
    assert!(mine.iter().all(|f| f.owner_uri == "owner://a"));

    // Owner B sweeping with a stale copy of A's file loses every claim
    let mut stolen = mine[0].clone();
    assert_eq!(b.preparing(&mut stolen).await.unwrap(), 0);
    assert_eq!(stolen.state, LogFileState::Written);
}

/// The upload pool and the prepare path compose: files prepared one by
/// one are drained to the archive concurrently, each exactly once.
#[tokio::test]
async fn prepared_files_drain_through_the_pool() {
    let dir = tempfile::tempdir().unwrap();
    let p = Pipeline::new();

    for _ in 0..4 {
        let pattern = format!("{}/orders-%d.log", dir.path().display());
        let mut file = p.tracker.open("orders", &pattern, Utc::now()).await.unwrap();
        std::fs::write(&file.origin_path, b"some records").unwrap();
        p.tracker.written(&mut file, 12).await.unwrap();
        let outcome = prepare_one(&p.tracker, &p.preparer, &mut file).await.unwrap();
        assert_eq!(outcome, PrepareOutcome::Prepared);
    }

    let wake = Arc::new(Notify::new());
    let pool = spawn_upload_pool(
        p.tracker.clone(),
        Arc::new(p.store.clone()),
        Arc::new(DateLayout),
        UploadConfig::test(),
        Arc::clone(&wake),
    );
    wake.notify_waiters();

    for _ in 0..200 {
        if pool.stats().uploaded == 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(p.tracker.count_by_state(LogFileState::Uploaded).await.unwrap(), 4);
    assert_eq!(p.store.len(), 4);
    assert_eq!(pool.stats().uploaded, 4);
    pool.shutdown().await;
}

/// A crash between stages leaves the file claimable: the restarted owner
/// finds its in-flight work by state and resumes it.
#[tokio::test]
async fn restart_resumes_in_flight_work() {
    let dir = tempfile::tempdir().unwrap();
    let backend = InMemoryTracker::new();
    let master = MasterKey::generate();

    // "First run": writes and prepares, then the process dies before upload
    {
        let tracker = TrackerClient::new(Arc::new(backend.clone()), "owner://host-1");
        let preparer = Preparer::new(master.clone(), PrepareConfig::test());
        let pattern = format!("{}/orders-%d.log", dir.path().display());
        let mut file = tracker.open("orders", &pattern, Utc::now()).await.unwrap();
        std::fs::write(&file.origin_path, b"survives the crash").unwrap();
        tracker.written(&mut file, 18).await.unwrap();
        prepare_one(&tracker, &preparer, &mut file).await.unwrap();
    }

    // "Second run": same owner identity, fresh process state
    let tracker = TrackerClient::new(Arc::new(backend.clone()), "owner://host-1");
    let store = InMemoryArchiveStore::new();

    let mut pending = tracker.find_mine(LogFileState::Prepared).await.unwrap();
    assert_eq!(pending.len(), 1);
    let outcome = upload_one(&tracker, &store, &DateLayout, "cold", &mut pending[0])
        .await
        .unwrap();
    assert_eq!(outcome, UploadOutcome::Uploaded);

    let retriever = Retriever::new(master, Arc::new(store));
    let recovered = retriever.retrieve(&pending[0]).await.unwrap();
    assert_eq!(recovered, b"survives the crash");
}
