//! LogFile Entity and Lifecycle State Machine
//!
//! One `LogFile` record exists per rolled file. It is created once (at
//! `open`) and only ever mutated through tracked state transitions.
//!
//! ## Lifecycle
//!
//! ```text
//! WRITING ──written──► WRITTEN ──preparing──► PREPARING ──prepared──► PREPARED
//!    │                                │                                  │
//!    └──write_error──► WRITE_ERROR    └──prep_error──► PREP_ERROR     uploading
//!                       (terminal)        (retry: preparing)             │
//!                                                                        ▼
//!                      UPLOADED ◄──uploaded── UPLOADING ──upload_error──► UPLOAD_ERROR
//!                      (terminal)                          (retry: uploading)
//! ```
//!
//! Error states are retryable by re-attempting the same edge that failed,
//! except WRITE_ERROR: a write fault is terminal for that file's data and
//! is surfaced for operator attention instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle stage of a log file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogFileState {
    /// Open for writing; owned by a live writer worker
    Writing,
    /// Write fault; terminal, needs operator attention
    WriteError,
    /// Closed and flushed; waiting for preparation
    Written,
    /// Claimed by the preparation stage
    Preparing,
    /// Preparation fault; retryable via `preparing`
    PrepError,
    /// Compressed + encrypted artifact exists at `prep_path`
    Prepared,
    /// Claimed by the upload stage
    Uploading,
    /// Upload fault; retryable via `uploading`
    UploadError,
    /// Artifact lives in remote storage; terminal
    Uploaded,
}

impl LogFileState {
    /// True for states with no outgoing edges
    pub fn is_terminal(self) -> bool {
        matches!(self, LogFileState::WriteError | LogFileState::Uploaded)
    }

    /// True for the retryable error states (and the terminal WRITE_ERROR)
    pub fn is_error(self) -> bool {
        matches!(
            self,
            LogFileState::WriteError | LogFileState::PrepError | LogFileState::UploadError
        )
    }

    /// Stable name used in logs and persisted registries
    pub fn as_str(self) -> &'static str {
        match self {
            LogFileState::Writing => "WRITING",
            LogFileState::WriteError => "WRITE_ERROR",
            LogFileState::Written => "WRITTEN",
            LogFileState::Preparing => "PREPARING",
            LogFileState::PrepError => "PREP_ERROR",
            LogFileState::Prepared => "PREPARED",
            LogFileState::Uploading => "UPLOADING",
            LogFileState::UploadError => "UPLOAD_ERROR",
            LogFileState::Uploaded => "UPLOADED",
        }
    }
}

impl std::fmt::Display for LogFileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// True when `from -> to` is a legal edge of the lifecycle diagram,
/// including the retry edges out of PREP_ERROR and UPLOAD_ERROR.
pub fn is_legal_transition(from: LogFileState, to: LogFileState) -> bool {
    use LogFileState::*;
    matches!(
        (from, to),
        (Writing, Written)
            | (Writing, WriteError)
            | (Written, Preparing)
            | (Preparing, Prepared)
            | (Preparing, PrepError)
            | (PrepError, Preparing)
            | (Prepared, Uploading)
            | (Uploading, Uploaded)
            | (Uploading, UploadError)
            | (UploadError, Uploading)
    )
}

/// Key identifying a log file: `(cohort, serial)` is globally unique
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogFileId {
    /// Logical stream with its own serial sequence
    pub cohort: String,
    /// Strictly increasing within the cohort, starting at 1
    pub serial: u64,
}

impl std::fmt::Display for LogFileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.cohort, self.serial)
    }
}

/// One persisted record per rolled file.
///
/// Field names and nullability follow the registry wire contract shared
/// by every tracker backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogFile {
    /// Logical stream this file belongs to
    pub cohort: String,
    /// Allocation order within the cohort (gap-free under normal operation)
    pub serial: u64,
    /// Window start assigned by the rolling scheme at creation; immutable
    pub start_time: DateTime<Utc>,
    /// Local raw-write location; set at creation
    pub origin_path: PathBuf,
    /// Local compressed+encrypted artifact; set by `prepared`
    pub prep_path: Option<PathBuf>,
    /// Per-file key+nonce wrapped under the master key, hex-encoded.
    /// Only the wrapped form is ever persisted.
    pub archive_key: Option<String>,
    /// Remote namespace shard (e.g. a date bucket); set by `uploaded`
    pub archive_group: Option<String>,
    /// Final remote location; set by `uploaded`
    pub archive_uri: Option<String>,
    /// Size recorded after the write phase, refreshed after upload
    pub byte_size: Option<u64>,
    /// Current lifecycle stage
    pub state: LogFileState,
    /// Process identity responsible for advancing this file.
    /// Set at creation and never reassigned: recovery means the same
    /// owner restarts and resumes, not a hand-off between owners.
    pub owner_uri: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last successful transition
    pub updated_at: DateTime<Utc>,
}

impl LogFile {
    /// Registry key for this file
    pub fn id(&self) -> LogFileId {
        LogFileId {
            cohort: self.cohort.clone(),
            serial: self.serial,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LogFileState::*;

    #[test]
    fn test_happy_path_edges_are_legal() {
        assert!(is_legal_transition(Writing, Written));
        assert!(is_legal_transition(Written, Preparing));
        assert!(is_legal_transition(Preparing, Prepared));
        assert!(is_legal_transition(Prepared, Uploading));
        assert!(is_legal_transition(Uploading, Uploaded));
    }

    #[test]
    fn test_error_and_retry_edges() {
        assert!(is_legal_transition(Writing, WriteError));
        assert!(is_legal_transition(Preparing, PrepError));
        assert!(is_legal_transition(PrepError, Preparing));
        assert!(is_legal_transition(Uploading, UploadError));
        assert!(is_legal_transition(UploadError, Uploading));

        // No retry out of WriteError
        assert!(!is_legal_transition(WriteError, Writing));
        assert!(!is_legal_transition(WriteError, Written));
    }

    #[test]
    fn test_illegal_shortcuts_rejected() {
        assert!(!is_legal_transition(Writing, Prepared));
        assert!(!is_legal_transition(Written, Uploading));
        assert!(!is_legal_transition(Prepared, Uploaded));
        assert!(!is_legal_transition(Uploaded, Uploading));
        assert!(!is_legal_transition(Written, Writing));
    }

    #[test]
    fn test_terminal_states() {
        assert!(WriteError.is_terminal());
        assert!(Uploaded.is_terminal());
        for s in [Writing, Written, Preparing, PrepError, Prepared, Uploading, UploadError] {
            assert!(!s.is_terminal(), "{} should not be terminal", s);
        }
    }

    #[test]
    fn test_state_names_match_registry_contract() {
        assert_eq!(Writing.as_str(), "WRITING");
        assert_eq!(PrepError.as_str(), "PREP_ERROR");
        assert_eq!(Uploaded.as_str(), "UPLOADED");
    }
}
