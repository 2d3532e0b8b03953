//! coldship - crash-safe log shipping to cold storage
//!
//! Records are appended to rolling local files, which are compressed and
//! encrypted into artifacts, shipped to an object archive, and finally
//! deleted locally on a retention schedule. Every file's progress is a
//! row in a shared tracker; all cross-process coordination happens
//! through the tracker's conditional updates, never through locks.
//!
//! ```text
//! records ─► manager ─► writer ─► WRITTEN ─► prepare ─► PREPARED
//!                                                          │
//!            cleanup ◄─ UPLOADED ◄─ upload pool ◄──────────┘
//! ```

pub mod archive;
pub mod cipher;
pub mod cleanup;
pub mod config;
pub mod logfile;
pub mod manager;
pub mod prepare;
pub mod retrieve;
pub mod rolling;
pub mod tracker;
pub mod upload;
pub mod writer;

pub use archive::{ArchiveLayout, ArchiveStore, DateLayout};
pub use cipher::MasterKey;
pub use config::PipelineConfig;
pub use logfile::{LogFile, LogFileId, LogFileState};
pub use manager::CohortManager;
pub use retrieve::Retriever;
pub use tracker::{Tracker, TrackerClient};
pub use writer::{JsonLineSerializer, RecordSerializer, WriterHandle};
