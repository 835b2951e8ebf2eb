//! GStreamer initialization
//!
//! Sets the GStreamer debug level and initializes the library once per
//! process, before the first tcam pipeline is built.

use std::env;
use std::sync::Once;

static GSTREAMER_INIT: Once = Once::new();

/// Initialize GStreamer
///
/// `debug_level` (0-9) is exported as `GST_DEBUG` unless the environment
/// already sets it.
pub fn init_gstreamer_env(debug_level: Option<u8>) -> anyhow::Result<()> {
    let mut result = Ok(());
    GSTREAMER_INIT.call_once(|| {
        if let Some(level) = debug_level {
            if env::var_os("GST_DEBUG").is_none() {
                env::set_var("GST_DEBUG", level.min(9).to_string());
            }
        }

        result = match gstreamer::init() {
            Ok(_) => {
                log::info!("GStreamer initialized successfully");
                log_gstreamer_version();
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to initialize GStreamer: {}", e);
                Err(anyhow::anyhow!("failed to initialize GStreamer: {}", e))
            }
        };
    });
    result
}

fn log_gstreamer_version() {
    let (major, minor, micro, nano) = gstreamer::version();
    let nano_str = match nano {
        0 => String::new(),
        1 => " (CVS)".to_string(),
        2 => " (prerelease)".to_string(),
        _ => format!(" (nano: {})", nano),
    };
    log::info!("GStreamer version: {}.{}.{}{}", major, minor, micro, nano_str);
}
