//! Remote Archive Storage Abstraction
//!
//! Trait-based abstraction over the object store the upload pipeline
//! ships artifacts to, plus the pluggable layout that computes the
//! remote namespace. The layout must be a pure function of fields the
//! LogFile already carries so the same URI is reproducible after a
//! restart without consulting the remote side.
//!
//! Implementations:
//! - `InMemoryArchiveStore`: for unit tests and integration tests
//! - `LocalFsArchiveStore`: for development and local testing

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::io::{Cursor, Error as IoError, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

/// Sequential reader over one stored object's bytes
pub type ObjectReader = Box<dyn Read + Send>;

/// Error type for archive storage operations
#[derive(Debug)]
pub enum ArchiveError {
    /// No object at the given URI
    NotFound(String),
    /// Local I/O fault while reading/staging the artifact
    Io(IoError),
    /// Remote service fault
    Service(String),
}

impl std::fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArchiveError::NotFound(uri) => write!(f, "Archive object not found: {}", uri),
            ArchiveError::Io(e) => write!(f, "Archive I/O error: {}", e),
            ArchiveError::Service(msg) => write!(f, "Archive service error: {}", msg),
        }
    }
}

impl std::error::Error for ArchiveError {}

impl From<IoError> for ArchiveError {
    fn from(e: IoError) -> Self {
        match e.kind() {
            ErrorKind::NotFound => ArchiveError::NotFound(e.to_string()),
            _ => ArchiveError::Io(e),
        }
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object storage the upload pipeline ships to and retrieval reads from
pub trait ArchiveStore: Send + Sync + 'static {
    /// Upload a local file to `uri`. Returns the stored size in bytes.
    fn put_file<'a>(
        &'a self,
        uri: &'a str,
        local: &'a Path,
    ) -> BoxFuture<'a, Result<u64, ArchiveError>>;

    /// Open an object for sequential reading. The caller consumes the
    /// reader incrementally; an object is never required to fit in
    /// memory on the read path.
    fn get<'a>(&'a self, uri: &'a str) -> BoxFuture<'a, Result<ObjectReader, ArchiveError>>;

    /// Check whether an object exists
    fn exists<'a>(&'a self, uri: &'a str) -> BoxFuture<'a, Result<bool, ArchiveError>>;

    /// Delete an object (idempotent)
    fn delete<'a>(&'a self, uri: &'a str) -> BoxFuture<'a, Result<(), ArchiveError>>;
}

// ============================================================================
// Remote layout
// ============================================================================

/// Computes the remote grouping and URI for an artifact. Pure function
/// of the LogFile's `start_time` and `prep_path` per deployment.
pub trait ArchiveLayout: Send + Sync + 'static {
    /// Grouping label used to shard the remote namespace
    fn group(&self, start_time: DateTime<Utc>) -> String;

    /// Final remote location under the configured prefix
    fn uri(&self, remote_prefix: &str, group: &str, prep_path: &Path) -> String;
}

/// Default layout: date bucket (`yyyyMMdd` of the window start) plus the
/// artifact's file name under the remote prefix
#[derive(Debug, Clone, Default)]
pub struct DateLayout;

impl ArchiveLayout for DateLayout {
    fn group(&self, start_time: DateTime<Utc>) -> String {
        start_time.format("%Y%m%d").to_string()
    }

    fn uri(&self, remote_prefix: &str, group: &str, prep_path: &Path) -> String {
        let name = prep_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact.csa".to_string());
        format!("{}/{}/{}", remote_prefix.trim_end_matches('/'), group, name)
    }
}

// ============================================================================
// InMemoryArchiveStore - for tests
// ============================================================================

/// In-memory archive store for unit and integration tests
#[derive(Debug, Default)]
pub struct InMemoryArchiveStore {
    objects: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl InMemoryArchiveStore {
    pub fn new() -> Self {
        InMemoryArchiveStore::default()
    }

    /// Number of stored objects (for tests)
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Check if empty (for tests)
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Raw stored bytes (for tests)
    pub fn blob(&self, uri: &str) -> Option<Vec<u8>> {
        self.objects.read().get(uri).cloned()
    }
}

impl Clone for InMemoryArchiveStore {
    fn clone(&self) -> Self {
        InMemoryArchiveStore {
            objects: Arc::clone(&self.objects),
        }
    }
}

impl ArchiveStore for InMemoryArchiveStore {
    fn put_file<'a>(
        &'a self,
        uri: &'a str,
        local: &'a Path,
    ) -> BoxFuture<'a, Result<u64, ArchiveError>> {
        Box::pin(async move {
            let data = tokio::fs::read(local).await?;
            let size = data.len() as u64;
            self.objects.write().insert(uri.to_string(), data);
            Ok(size)
        })
    }

    fn get<'a>(&'a self, uri: &'a str) -> BoxFuture<'a, Result<ObjectReader, ArchiveError>> {
        Box::pin(async move {
            let data = self
                .objects
                .read()
                .get(uri)
                .cloned()
                .ok_or_else(|| ArchiveError::NotFound(uri.to_string()))?;
            Ok(Box::new(Cursor::new(data)) as ObjectReader)
        })
    }

    fn exists<'a>(&'a self, uri: &'a str) -> BoxFuture<'a, Result<bool, ArchiveError>> {
        Box::pin(async move { Ok(self.objects.read().contains_key(uri)) })
    }

    fn delete<'a>(&'a self, uri: &'a str) -> BoxFuture<'a, Result<(), ArchiveError>> {
        Box::pin(async move {
            self.objects.write().remove(uri);
            Ok(())
        })
    }
}

// ============================================================================
// LocalFsArchiveStore - for development
// ============================================================================

/// Archive store backed by a local directory; URIs are relative keys
#[derive(Debug, Clone)]
pub struct LocalFsArchiveStore {
    base: PathBuf,
}

impl LocalFsArchiveStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        LocalFsArchiveStore { base: base.into() }
    }

    /// Base directory (for tests)
    pub fn base(&self) -> &Path {
        &self.base
    }

    fn full_path(&self, uri: &str) -> PathBuf {
        self.base.join(uri)
    }
}

impl ArchiveStore for LocalFsArchiveStore {
    fn put_file<'a>(
        &'a self,
        uri: &'a str,
        local: &'a Path,
    ) -> BoxFuture<'a, Result<u64, ArchiveError>> {
        Box::pin(async move {
            let target = self.full_path(uri);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let size = tokio::fs::copy(local, &target).await?;
            Ok(size)
        })
    }

    fn get<'a>(&'a self, uri: &'a str) -> BoxFuture<'a, Result<ObjectReader, ArchiveError>> {
        Box::pin(async move {
            match tokio::fs::File::open(self.full_path(uri)).await {
                Ok(file) => Ok(Box::new(file.into_std().await) as ObjectReader),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    Err(ArchiveError::NotFound(uri.to_string()))
                }
                Err(e) => Err(ArchiveError::Io(e)),
            }
        })
    }

    fn exists<'a>(&'a self, uri: &'a str) -> BoxFuture<'a, Result<bool, ArchiveError>> {
        Box::pin(async move { Ok(self.full_path(uri).exists()) })
    }

    fn delete<'a>(&'a self, uri: &'a str) -> BoxFuture<'a, Result<(), ArchiveError>> {
        Box::pin(async move {
            match tokio::fs::remove_file(self.full_path(uri)).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()), // Already gone
                Err(e) => Err(ArchiveError::Io(e)),
            }
        })
    }
}
