//! Rolling Scheme - Time Windows, File Naming, Close Decisions
//!
//! A rolling scheme maps "now" to a time window, renders a
//! filesystem-safe, monotonic-sortable representation for file naming,
//! and decides when a window must close. All arithmetic happens in a
//! fixed reference zone (UTC) so rollover is deterministic across hosts.
//!
//! The close decision includes a grace period past the next window start,
//! giving late records a bounded chance to land in their window. Grace
//! periods are validated at construction: a grace longer than the window,
//! or one that does not land on the scheme's sub-window granularity, is
//! rejected rather than allowed to produce ambiguous overlapping windows.

use chrono::{DateTime, Timelike, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Error type for rolling scheme construction
#[derive(Debug)]
pub enum RollingError {
    /// Grace period exceeds the window length
    GraceExceedsWindow { grace: Duration, window: Duration },
    /// Grace period is not a whole number of the scheme's granularity units
    GraceGranularity { grace: Duration, granularity: Duration },
}

impl std::fmt::Display for RollingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RollingError::GraceExceedsWindow { grace, window } => write!(
                f,
                "Grace period {:?} exceeds rolling window {:?}",
                grace, window
            ),
            RollingError::GraceGranularity { grace, granularity } => write!(
                f,
                "Grace period {:?} is not a multiple of {:?}",
                grace, granularity
            ),
        }
    }
}

impl std::error::Error for RollingError {}

/// Maps instants to rolling windows and names
pub trait RollingScheme: Send + Sync + 'static {
    /// Start of the window containing `now`
    fn current_window_start(&self, now: DateTime<Utc>) -> DateTime<Utc>;

    /// Start of the window following the one starting at `window_start`
    fn subsequent_window_start(&self, window_start: DateTime<Utc>) -> DateTime<Utc>;

    /// Filesystem-safe, monotonic-sortable name component for the window
    fn representation(&self, window_start: DateTime<Utc>) -> String;

    /// True once `now` is more than the grace period past the next
    /// window's start
    fn is_time_to_close(&self, window_start: DateTime<Utc>, now: DateTime<Utc>) -> bool;
}

/// Hourly rolling: windows are whole UTC hours
#[derive(Debug, Clone)]
pub struct HourlyScheme {
    grace: Duration,
}

/// Window length of the hourly scheme
const HOUR: Duration = Duration::from_secs(3600);
/// Sub-window granularity the grace period must land on
const MINUTE: Duration = Duration::from_secs(60);

impl HourlyScheme {
    /// Create an hourly scheme with the given grace period.
    ///
    /// The grace must be at most one hour and a whole number of minutes;
    /// anything else fails fast at construction time.
    pub fn new(grace: Duration) -> Result<Self, RollingError> {
        if grace > HOUR {
            return Err(RollingError::GraceExceedsWindow {
                grace,
                window: HOUR,
            });
        }
        if grace.as_secs() % MINUTE.as_secs() != 0 || grace.subsec_nanos() != 0 {
            return Err(RollingError::GraceGranularity {
                grace,
                granularity: MINUTE,
            });
        }
        Ok(HourlyScheme { grace })
    }

    /// Configured grace period
    pub fn grace(&self) -> Duration {
        self.grace
    }
}

impl RollingScheme for HourlyScheme {
    fn current_window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .expect("truncating to the top of the hour always yields a valid instant")
    }

    fn subsequent_window_start(&self, window_start: DateTime<Utc>) -> DateTime<Utc> {
        window_start + chrono::Duration::hours(1)
    }

    fn representation(&self, window_start: DateTime<Utc>) -> String {
        window_start.format("%Y%m%d%H").to_string()
    }

    fn is_time_to_close(&self, window_start: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let deadline = self.subsequent_window_start(window_start)
            + chrono::Duration::from_std(self.grace)
                .expect("grace validated to fit within one hour");
        now > deadline
    }
}

// ============================================================================
// Path patterns
// ============================================================================

/// Placeholder in a path pattern that the tracker replaces with the
/// allocated serial when rendering the origin path.
pub const SERIAL_PLACEHOLDER: &str = "%d";

/// Naming pieces combined with a window representation into the path
/// pattern handed to `Tracker::open`.
#[derive(Debug, Clone)]
pub struct RollingPaths {
    /// Base directory for raw local files
    pub dir: PathBuf,
    /// Name prefix, e.g. the application name
    pub prefix: String,
    /// Name suffix including any extension, e.g. ".log"
    pub suffix: String,
}

impl RollingPaths {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        RollingPaths {
            dir: dir.into(),
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }

    /// Render the pattern for one window:
    /// `<dir>/<prefix>-<representation>-%d<suffix>`.
    /// The serial placeholder keeps concurrent files within one window
    /// distinct.
    pub fn pattern(&self, representation: &str) -> String {
        format!(
            "{}/{}-{}-{}{}",
            self.dir.display(),
            self.prefix,
            representation,
            SERIAL_PLACEHOLDER,
            self.suffix
        )
    }
}

/// Substitute the allocated serial into a path pattern
pub fn render_serial_path(pattern: &str, serial: u64) -> PathBuf {
    PathBuf::from(pattern.replace(SERIAL_PLACEHOLDER, &serial.to_string()))
}

/// Artifact path for a raw origin file: same file name with `.csa`
/// appended, optionally under a dedicated directory.
pub fn prep_path_for(origin: &Path, prep_dir: Option<&Path>) -> PathBuf {
    let mut name = origin
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    name.push_str(".csa");
    match prep_dir {
        Some(dir) => dir.join(name),
        None => origin.with_file_name(name),
    }
}
