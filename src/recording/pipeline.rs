// Boundary to the device pipeline that delivers frames into a chunk target

use std::path::Path;
use std::sync::Arc;

use crate::session::DeviceProperty;

/// Frame-arrival notification. Carries no payload: the ledger stamps the
/// arrival time itself.
pub type FrameCallback = Arc<dyn Fn() + Send + Sync>;

/// Error type for pipeline operations
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("pipeline failed to start: {0}")]
    Start(String),

    #[error("pipeline failed to stop: {0}")]
    Stop(String),

    #[error("failed to set property {name} to {value}: {reason}")]
    Property {
        name: String,
        value: String,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opens, starts and stops frame delivery into one output target per chunk
pub trait PipelineAdapter {
    /// Register the frame-arrival notification. Called once, before `start`.
    fn set_frame_callback(&mut self, callback: FrameCallback);

    /// Begin delivering frames into `target`, applying `properties` first
    fn start(&mut self, target: &Path, properties: &[DeviceProperty]) -> Result<(), PipelineError>;

    /// Stop delivery and release the output target
    fn stop(&mut self) -> Result<(), PipelineError>;
}

impl<P: PipelineAdapter + ?Sized> PipelineAdapter for Box<P> {
    fn set_frame_callback(&mut self, callback: FrameCallback) {
        (**self).set_frame_callback(callback)
    }

    fn start(&mut self, target: &Path, properties: &[DeviceProperty]) -> Result<(), PipelineError> {
        (**self).start(target, properties)
    }

    fn stop(&mut self) -> Result<(), PipelineError> {
        (**self).stop()
    }
}
