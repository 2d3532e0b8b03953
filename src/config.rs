//! Configuration for the Shipping Pipeline
//!
//! Defines configuration structs for every stage, with `default()` for
//! production-ish values and `test()` for short intervals and small
//! queues.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Stable process identity recorded as the owner of every file this
/// instance opens. Derived from the host so the same identity survives
/// restarts; recovery queries are scoped to it.
pub fn default_owner_uri() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("owner://{}", host)
}

/// Top-level pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Owner identity; defaults to a host-derived URI
    pub owner_uri: Option<String>,
    /// Rolling / file naming settings
    pub rolling: RollingConfig,
    /// Writer worker settings
    pub writer: WriterConfig,
    /// Preparation stage settings
    pub prepare: PrepareConfig,
    /// Upload pool settings
    pub upload: UploadConfig,
    /// Cleanup sweep settings
    pub cleanup: CleanupConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            owner_uri: None,
            rolling: RollingConfig::default(),
            writer: WriterConfig::default(),
            prepare: PrepareConfig::default(),
            upload: UploadConfig::default(),
            cleanup: CleanupConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Configuration for tests (tiny queues, fast intervals)
    pub fn test() -> Self {
        PipelineConfig {
            owner_uri: Some("owner://test".to_string()),
            rolling: RollingConfig::test(),
            writer: WriterConfig::test(),
            prepare: PrepareConfig::test(),
            upload: UploadConfig::test(),
            cleanup: CleanupConfig::test(),
        }
    }

    /// Owner identity, falling back to the host-derived default
    pub fn owner_uri(&self) -> String {
        self.owner_uri.clone().unwrap_or_else(default_owner_uri)
    }
}

/// Rolling scheme and naming configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollingConfig {
    /// Base directory for raw local files
    pub dir: PathBuf,
    /// File name prefix
    pub prefix: String,
    /// File name suffix (extension)
    pub suffix: String,
    /// Grace period past the next window start before a window closes
    #[serde(with = "duration_millis")]
    pub grace: Duration,
    /// How often the manager evaluates the close decision
    #[serde(with = "duration_millis")]
    pub rollover_check_interval: Duration,
}

impl Default for RollingConfig {
    fn default() -> Self {
        RollingConfig {
            dir: PathBuf::from("/var/spool/coldship"),
            prefix: "events".to_string(),
            suffix: ".log".to_string(),
            grace: Duration::from_secs(300),
            rollover_check_interval: Duration::from_secs(30),
        }
    }
}

impl RollingConfig {
    /// Configuration for tests
    pub fn test() -> Self {
        RollingConfig {
            dir: PathBuf::from("/tmp/coldship-test"),
            prefix: "test".to_string(),
            suffix: ".log".to_string(),
            grace: Duration::ZERO,
            rollover_check_interval: Duration::from_millis(20),
        }
    }
}

/// Writer worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Bounded queue capacity between producers and the writer
    pub queue_capacity: usize,
    /// Flush at least this often, even when idle; crash loss is bounded
    /// to one interval's worth of unflushed writes
    #[serde(with = "duration_millis")]
    pub flush_interval: Duration,
    /// Backpressure policy when the queue is full: block producers (true)
    /// or reject the record (false)
    pub block_on_full: bool,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            queue_capacity: 10_000,
            flush_interval: Duration::from_millis(500),
            block_on_full: true,
        }
    }
}

impl WriterConfig {
    /// Configuration for tests (small queue, fast flush)
    pub fn test() -> Self {
        WriterConfig {
            queue_capacity: 64,
            flush_interval: Duration::from_millis(20),
            block_on_full: true,
        }
    }
}

/// Preparation stage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareConfig {
    /// Directory for prepared artifacts; None places them next to the raw file
    pub prep_dir: Option<PathBuf>,
    /// zstd compression level
    pub zstd_level: i32,
    /// How often the worker polls for claimable files
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
    /// Also sweep PREP_ERROR files each cycle and retry them
    pub retry_errors: bool,
}

impl Default for PrepareConfig {
    fn default() -> Self {
        PrepareConfig {
            prep_dir: None,
            zstd_level: 3,
            poll_interval: Duration::from_secs(30),
            retry_errors: false,
        }
    }
}

impl PrepareConfig {
    /// Configuration for tests
    pub fn test() -> Self {
        PrepareConfig {
            prep_dir: None,
            zstd_level: 1,
            poll_interval: Duration::from_millis(25),
            retry_errors: true,
        }
    }
}

/// Upload pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Remote key prefix all archive URIs live under
    pub remote_prefix: String,
    /// Number of concurrent upload workers
    pub workers: usize,
    /// How often each worker polls for claimable files
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
    /// Also sweep UPLOAD_ERROR files each cycle and retry them
    pub retry_errors: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            remote_prefix: "coldship".to_string(),
            workers: 2,
            poll_interval: Duration::from_secs(30),
            retry_errors: false,
        }
    }
}

impl UploadConfig {
    /// Configuration for tests
    pub fn test() -> Self {
        UploadConfig {
            remote_prefix: "test".to_string(),
            workers: 2,
            poll_interval: Duration::from_millis(25),
            retry_errors: true,
        }
    }
}

/// Cleanup sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Local copies younger than this are kept so uploads can be verified
    #[serde(with = "duration_millis")]
    pub min_age: Duration,
    /// Upper bound of the sweep window, bounding local disk growth
    #[serde(with = "duration_millis")]
    pub max_age: Duration,
    /// Interval between scheduled sweeps
    #[serde(with = "duration_millis")]
    pub sweep_interval: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        CleanupConfig {
            min_age: Duration::from_secs(3600),
            max_age: Duration::from_secs(24 * 3600),
            sweep_interval: Duration::from_secs(15 * 60),
        }
    }
}

impl CleanupConfig {
    /// Configuration for tests
    pub fn test() -> Self {
        CleanupConfig {
            min_age: Duration::ZERO,
            max_age: Duration::from_secs(24 * 3600),
            sweep_interval: Duration::from_millis(50),
        }
    }
}

/// Serde helper for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert!(config.writer.block_on_full);
        assert_eq!(config.upload.workers, 2);
        assert!(config.cleanup.min_age < config.cleanup.max_age);
    }

    #[test]
    fn test_owner_uri_fallback() {
        let config = PipelineConfig::test();
        assert_eq!(config.owner_uri(), "owner://test");

        let config = PipelineConfig::default();
        assert!(config.owner_uri().starts_with("owner://"));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = PipelineConfig::default();
        let rendered = toml::to_string(&config).unwrap();
        let parsed: PipelineConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.writer.flush_interval, config.writer.flush_interval);
        assert_eq!(parsed.rolling.grace, config.rolling.grace);
        assert_eq!(parsed.upload.remote_prefix, config.upload.remote_prefix);
    }

    #[test]
    fn test_json_duration_encoding() {
        let config = WriterConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"flush_interval\":500"));
        let parsed: WriterConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.flush_interval, Duration::from_millis(500));
    }
}
