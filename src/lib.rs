// chunkcam - Triggered camera chunk recorder
// Main library entry point

pub mod cli;
pub mod config;
#[cfg(feature = "tcam")]
pub mod gstreamer_init;
pub mod logging;
pub mod recording;
pub mod session;

use std::path::{Path, PathBuf};

use anyhow::Context;

use cli::{CheckArgs, RecordArgs};
use config::{Config, SAVED_CONFIG_NAME};
use recording::{ChunkController, PipelineAdapter, RunSummary, SimulatedCamera};
use session::{format_report, prepare_output_dir, timing_report, Session};

pub use logging::init_logging;

/// `recordings/<local time>` under the working directory
pub fn default_output_dir() -> PathBuf {
    PathBuf::from("recordings").join(chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string())
}

/// A recording ready to start: validated config and its session
pub struct Recording {
    pub config: Config,
    pub session: Session,
}

/// Start logging into the output directory, load the configuration, clear
/// stale artifacts and save the effective config next to the videos.
pub fn prepare_recording(args: &RecordArgs) -> anyhow::Result<Recording> {
    let output_dir = args.output_dir.clone().unwrap_or_else(default_output_dir);
    init_logging(args.log_level, Some(&output_dir))?;

    let config = Config::load(&args.config, args.camera_id, args.ignore_exposure)?;
    let session = config.to_session(&output_dir)?;
    prepare_output_dir(&output_dir, &session.video_extension, args.force)?;
    config
        .save(&output_dir.join(SAVED_CONFIG_NAME))
        .context("failed to save config next to the recordings")?;

    log::info!(
        "Recording to {} ({} frames per chunk, {:.2}s timeout)",
        output_dir.display(),
        session.expected_frames,
        session.timeout_delay.as_secs_f64()
    );
    Ok(Recording { config, session })
}

/// Simulated trigger camera with `--test`, the tcam pipeline otherwise
pub fn build_pipeline(config: &Config, args: &RecordArgs) -> anyhow::Result<Box<dyn PipelineAdapter>> {
    if args.test {
        log::info!("Test mode: using the simulated trigger camera");
        return Ok(Box::new(SimulatedCamera::new(config.trigger_pattern())));
    }
    camera_pipeline(config, args.gst_debug_level)
}

#[cfg(feature = "tcam")]
fn camera_pipeline(config: &Config, gst_debug_level: Option<u8>) -> anyhow::Result<Box<dyn PipelineAdapter>> {
    gstreamer_init::init_gstreamer_env(gst_debug_level)?;
    Ok(Box::new(recording::TcamPipeline::new(config.tcam_settings())))
}

#[cfg(not(feature = "tcam"))]
fn camera_pipeline(_config: &Config, _gst_debug_level: Option<u8>) -> anyhow::Result<Box<dyn PipelineAdapter>> {
    anyhow::bail!("camera support is not compiled in (enable the `tcam` feature) - use --test for a simulated run")
}

/// Record chunks until Ctrl-C
pub fn run_record(args: &RecordArgs) -> anyhow::Result<RunSummary> {
    let recording = prepare_recording(args)?;
    let pipeline = build_pipeline(&recording.config, args)?;
    let mut controller = ChunkController::new(recording.session, pipeline);

    let cancel = controller.cancel_handle();
    ctrlc::set_handler(move || {
        log::info!("Interrupted, closing the current chunk");
        cancel.cancel();
    })
    .context("failed to install Ctrl-C handler")?;

    log::info!("Press Ctrl-C to stop recording");
    Ok(controller.run()?)
}

/// Print the timing report of a recording directory
pub fn run_check(args: &CheckArgs) -> anyhow::Result<()> {
    let report = check_dir(&args.dir)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", format_report(&report));
    }
    Ok(())
}

fn check_dir(dir: &Path) -> anyhow::Result<Vec<session::ChunkTiming>> {
    if !dir.is_dir() {
        anyhow::bail!("{} is not a directory", dir.display());
    }
    timing_report(dir).with_context(|| format!("failed to read ledgers in {}", dir.display()))
}
