// GStreamer pipeline for The Imaging Source cameras (tcambin)
//
// One pipeline per chunk:
//   tcambin ! identity ! [capsfilter ! bayer2rgb ! videoconvert] ! capsfilter
//     ! videoconvert ! x264enc (lossless) ! avimux ! queue ! filesink
//
// The identity element must stay directly after the source: its `handoff`
// signal fires once per captured buffer and drives the frame ledger.

use std::path::Path;

use gstreamer as gst;
use gstreamer::prelude::*;

use super::pipeline::{FrameCallback, PipelineAdapter, PipelineError};
use crate::session::{DeviceProperty, PropertyValue};

/// Time allowed for the pipeline to reach PLAYING
const START_TIMEOUT_SECS: u64 = 5;

/// Camera settings taken from the `general` configuration section
#[derive(Debug, Clone, PartialEq)]
pub struct TcamSettings {
    pub serial: String,
    pub width: u32,
    pub height: u32,
    /// Maximum accepted frame rate for caps negotiation
    pub framerate: u32,
    /// Sensor delivers bayer data that needs debayering
    pub color: bool,
}

pub struct TcamPipeline {
    settings: TcamSettings,
    callback: Option<FrameCallback>,
    pipeline: Option<gst::Pipeline>,
}

impl TcamPipeline {
    pub fn new(settings: TcamSettings) -> Self {
        Self {
            settings,
            callback: None,
            pipeline: None,
        }
    }

    fn description(&self) -> String {
        let mut desc = String::from("tcambin name=source ! identity name=id");
        if self.settings.color {
            desc.push_str(" ! capsfilter name=bayercaps ! bayer2rgb ! videoconvert");
        }
        desc.push_str(" ! capsfilter name=rawcaps ! videoconvert");
        desc.push_str(" ! x264enc quantizer=0 qp-min=0 qp-max=0 qp-step=0");
        desc.push_str(" ! avimux ! queue name=queue ! filesink name=fsink");
        desc
    }

    fn caps(&self, bayer: bool) -> gst::Caps {
        let (media, format) = if bayer {
            ("video/x-bayer", "rggb")
        } else {
            ("video/x-raw", "BGRx")
        };
        gst::Caps::builder(media)
            .field("format", format)
            .field("width", self.settings.width as i32)
            .field("height", self.settings.height as i32)
            .field("framerate", gst::Fraction::new(self.settings.framerate as i32, 1))
            .build()
    }

    fn element(pipeline: &gst::Pipeline, name: &str) -> Result<gst::Element, PipelineError> {
        pipeline
            .by_name(name)
            .ok_or_else(|| PipelineError::Start(format!("element '{}' missing from pipeline", name)))
    }

    fn build(&self, target: &Path, properties: &[DeviceProperty]) -> Result<gst::Pipeline, PipelineError> {
        let desc = self.description();
        log::debug!("Gst pipeline: {}", desc);

        let pipeline = gst::parse::launch(&desc)
            .map_err(|e| PipelineError::Start(format!("failed to parse pipeline: {}", e)))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| PipelineError::Start("parsed element is not a pipeline".into()))?;

        let source = Self::element(&pipeline, "source")?;
        source.set_property("serial", self.settings.serial.as_str());
        log::debug!("Serial: {}", self.settings.serial);
        if !properties.is_empty() {
            source.set_property("tcam-properties", tcam_properties(properties));
        }

        let identity = Self::element(&pipeline, "id")?;
        if let Some(callback) = self.callback.clone() {
            identity.connect("handoff", false, move |_| {
                callback();
                None
            });
        }

        if self.settings.color {
            Self::element(&pipeline, "bayercaps")?.set_property("caps", self.caps(true));
        }
        Self::element(&pipeline, "rawcaps")?.set_property("caps", self.caps(false));

        // Unbounded in buffers and time; the encoder may lag behind bursts
        match pipeline.by_name("queue") {
            Some(queue) => {
                queue.set_property("max-size-buffers", 0u32);
                queue.set_property("max-size-bytes", 1_500_000_000u32);
                queue.set_property("max-size-time", 0u64);
            }
            None => log::warn!("No queue was found"),
        }

        Self::element(&pipeline, "fsink")?
            .set_property("location", target.to_string_lossy().to_string());

        Ok(pipeline)
    }

    /// Drain error and warning messages from the bus into one string
    fn bus_errors(pipeline: &gst::Pipeline) -> String {
        let mut details = String::new();
        if let Some(bus) = pipeline.bus() {
            while let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error, gst::MessageType::Warning]) {
                match msg.view() {
                    gst::MessageView::Error(err) => {
                        let src = err.src().map(|s| s.name().to_string()).unwrap_or_default();
                        details.push_str(&format!("ERROR from {}: {}. ", src, err.error()));
                    }
                    gst::MessageView::Warning(warn) => {
                        let src = warn.src().map(|s| s.name().to_string()).unwrap_or_default();
                        details.push_str(&format!("WARNING from {}: {}. ", src, warn.error()));
                    }
                    _ => {}
                }
            }
        }
        details
    }
}

/// Device properties as the `tcam-properties` structure of tcambin
fn tcam_properties(properties: &[DeviceProperty]) -> gst::Structure {
    let mut builder = gst::Structure::builder("tcam");
    for property in properties {
        log::debug!("Setting property {} at {}", property.name, property.value);
        let name = property.name.as_str();
        builder = match &property.value {
            PropertyValue::Bool(v) => builder.field(name, *v),
            PropertyValue::Integer(v) => builder.field(name, *v),
            PropertyValue::Float(v) => builder.field(name, *v),
            PropertyValue::Text(v) => builder.field(name, v.as_str()),
        };
    }
    builder.build()
}

impl PipelineAdapter for TcamPipeline {
    fn set_frame_callback(&mut self, callback: FrameCallback) {
        self.callback = Some(callback);
    }

    fn start(&mut self, target: &Path, properties: &[DeviceProperty]) -> Result<(), PipelineError> {
        if self.pipeline.is_some() {
            self.stop()?;
        }

        let pipeline = self.build(target, properties)?;
        log::info!("Created new pipeline");

        if let Err(e) = pipeline.set_state(gst::State::Playing) {
            let details = Self::bus_errors(&pipeline);
            let _ = pipeline.set_state(gst::State::Null);
            return Err(PipelineError::Start(format!("{} {}", e, details)));
        }

        let (result, current, pending) =
            pipeline.state(gst::ClockTime::from_seconds(START_TIMEOUT_SECS));
        if result.is_err() || current != gst::State::Playing {
            let details = Self::bus_errors(&pipeline);
            let _ = pipeline.set_state(gst::State::Null);
            return Err(PipelineError::Start(format!(
                "pipeline did not reach PLAYING within {}s (current: {:?}, pending: {:?}). {}",
                START_TIMEOUT_SECS, current, pending, details
            )));
        }

        log::info!("Started pipeline");
        self.pipeline = Some(pipeline);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), PipelineError> {
        let Some(pipeline) = self.pipeline.take() else {
            return Ok(());
        };

        for state in [gst::State::Paused, gst::State::Ready, gst::State::Null] {
            if let Err(e) = pipeline.set_state(state) {
                let details = Self::bus_errors(&pipeline);
                // Still release the device before the pipeline is dropped
                let _ = pipeline.set_state(gst::State::Null);
                return Err(PipelineError::Stop(format!("{:?}: {} {}", state, e, details)));
            }
        }
        log::debug!("Pipeline stopped");
        Ok(())
    }
}

impl Drop for TcamPipeline {
    fn drop(&mut self) {
        // Always set pipeline to NULL before dropping to avoid GStreamer warnings
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.set_state(gst::State::Null);
        }
    }
}
