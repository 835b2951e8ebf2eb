// Recording session: output location, chunking parameters and device properties

pub mod report;
pub mod storage;

pub use report::*;
pub use storage::*;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default poll interval of the delay monitor
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Upper bound for the delay monitor poll interval
pub const MAX_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default container extension for chunk videos
pub const DEFAULT_VIDEO_EXTENSION: &str = "avi";

/// Error type for session setup
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("timeout delay must be a positive number of seconds, got {0}")]
    InvalidTimeout(f64),

    #[error("poll interval must be between 1 and {max} ms, got {got:?}", max = MAX_POLL_INTERVAL.as_millis())]
    InvalidPollInterval { got: Duration },

    #[error("output directory {dir:?} already contains {count} recording file(s)")]
    OutputNotEmpty { dir: PathBuf, count: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Value of a device property, as written in the configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(v) => write!(f, "{}", v),
            PropertyValue::Integer(v) => write!(f, "{}", v),
            PropertyValue::Float(v) => write!(f, "{}", v),
            PropertyValue::Text(v) => write!(f, "{}", v),
        }
    }
}

/// A named camera property applied when a chunk starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProperty {
    pub name: String,
    pub value: PropertyValue,
}

impl DeviceProperty {
    pub fn new(name: impl Into<String>, value: PropertyValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// One recording run.
///
/// Owned by the chunk controller; everything the controller needs to name,
/// bound and configure chunks lives here.
#[derive(Debug, Clone)]
pub struct Session {
    /// Directory receiving videos and ledgers
    pub output_dir: PathBuf,
    /// Frames expected per chunk (0 disables count-based segmentation)
    pub expected_frames: u64,
    /// Trigger inactivity after which a chunk is closed
    pub timeout_delay: Duration,
    /// Properties applied to the device at every chunk start, in order
    pub device_properties: Vec<DeviceProperty>,
    /// Container extension for chunk videos
    pub video_extension: String,
    /// Delay monitor poll interval
    pub poll_interval: Duration,
}

impl Session {
    pub fn new(
        output_dir: impl Into<PathBuf>,
        expected_frames: u64,
        timeout_delay_secs: f64,
    ) -> Result<Self, SessionError> {
        if !timeout_delay_secs.is_finite() || timeout_delay_secs <= 0.0 {
            return Err(SessionError::InvalidTimeout(timeout_delay_secs));
        }

        Ok(Self {
            output_dir: output_dir.into(),
            expected_frames,
            timeout_delay: Duration::from_secs_f64(timeout_delay_secs),
            device_properties: Vec::new(),
            video_extension: DEFAULT_VIDEO_EXTENSION.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    pub fn with_properties(mut self, properties: Vec<DeviceProperty>) -> Self {
        self.device_properties = properties;
        self
    }

    pub fn with_video_extension(mut self, extension: impl Into<String>) -> Self {
        self.video_extension = extension.into().trim_start_matches('.').to_string();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Result<Self, SessionError> {
        if interval.is_zero() || interval > MAX_POLL_INTERVAL {
            return Err(SessionError::InvalidPollInterval { got: interval });
        }
        self.poll_interval = interval;
        Ok(self)
    }

    /// Whether chunks are bounded by an expected frame count
    pub fn is_count_bounded(&self) -> bool {
        self.expected_frames > 0
    }

    /// Deterministic chunk name: the first frame's global index, zero padded
    pub fn chunk_name(global_counter: u64) -> String {
        format!("{:06}", global_counter)
    }

    pub fn video_path(&self, name: &str) -> PathBuf {
        self.output_dir
            .join(format!("{}.{}", name, self.video_extension))
    }

    pub fn ledger_path(&self, name: &str) -> PathBuf {
        self.output_dir
            .join(format!("{}.{}", name, LEDGER_EXTENSION))
    }
}

/// Make sure `dir` exists and holds no artifacts from a previous run.
///
/// Existing videos (with `video_extension`) and ledgers are deleted when
/// `overwrite` is set, otherwise `SessionError::OutputNotEmpty` is returned.
/// Returns the number of files removed.
pub fn prepare_output_dir(
    dir: &Path,
    video_extension: &str,
    overwrite: bool,
) -> Result<usize, SessionError> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
        log::info!("Created output directory ({})", dir.display());
        return Ok(0);
    }

    let video_extension = video_extension.trim_start_matches('.');
    let mut stale = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e == video_extension || e == LEDGER_EXTENSION)
            .unwrap_or(false);
        if matches {
            stale.push(path);
        }
    }

    if stale.is_empty() {
        return Ok(0);
    }

    if !overwrite {
        return Err(SessionError::OutputNotEmpty {
            dir: dir.to_path_buf(),
            count: stale.len(),
        });
    }

    for path in &stale {
        std::fs::remove_file(path)?;
    }
    log::warn!(
        "Removed {} file(s) from previous recording in {}",
        stale.len(),
        dir.display()
    );
    Ok(stale.len())
}
