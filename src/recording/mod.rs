// Chunked recording: frame ledger, delay monitor and chunk controller

pub mod controller;
pub mod ledger;
pub mod monitor;
pub mod pipeline;
pub mod simulated;
#[cfg(feature = "tcam")]
pub mod tcam;

pub use controller::{CancelHandle, ChunkController, ChunkError, RunSummary};
pub use ledger::{FrameLedger, FrameOutcome};
pub use monitor::{DelayMonitor, MonitorOutcome};
pub use pipeline::{FrameCallback, PipelineAdapter, PipelineError};
pub use simulated::{SimulatedCamera, TriggerPattern};
#[cfg(feature = "tcam")]
pub use tcam::{TcamPipeline, TcamSettings};

use serde::Serialize;
use std::path::PathBuf;

/// Chunk controller state
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChunkState {
    /// Between chunks
    Idle,
    /// Pipeline delivering into the current chunk
    Running,
    /// Stopping the pipeline and flushing timestamps
    Closing,
    /// Cancelled or failed; `run` has returned
    Stopped,
}

/// One output segment
#[derive(Debug, Clone, Serialize)]
pub struct Chunk {
    /// 0-based sequence number
    pub index: u64,
    /// Global frame index expected to be this chunk's first frame
    pub relative_zero: u64,
    pub name: String,
    pub video_path: PathBuf,
    pub ledger_path: PathBuf,
    pub closed: bool,
    /// Frames recorded, set at close
    pub frames: u64,
    /// `expected_frames - frames`, set at close
    pub loss: i64,
}
