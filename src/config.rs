// Configuration management for chunkcam

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::recording::TriggerPattern;
use crate::session::{DeviceProperty, PropertyValue, Session, SessionError, DEFAULT_VIDEO_EXTENSION};

/// Property holding the exposure time in microseconds
pub const EXPOSURE_PROPERTY: &str = "Exposure Time (us)";

/// Property switching the camera to external trigger
pub const TRIGGER_MODE_PROPERTY: &str = "Trigger Mode";

/// File name of the configuration copy saved next to the recordings
pub const SAVED_CONFIG_NAME: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to write config {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("camera id {id} not found ({available} camera-specific section(s) defined)")]
    UnknownCamera { id: usize, available: usize },

    #[error("invalid settings for camera {id}: {source}")]
    CameraOverride { id: usize, source: toml::de::Error },

    #[error("invalid exposure time: {0}")]
    InvalidExposure(String),

    #[error("exposure time {exposure_us}us is too long for {fps}Hz (max {max_fps:.1}Hz, max exposure {max_exposure_us:.1}us)")]
    ExposureTooLong {
        exposure_us: f64,
        fps: f64,
        max_fps: f64,
        max_exposure_us: f64,
    },

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Camera and caps settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralConfig {
    pub serial: String,
    pub width: u32,
    pub height: u32,
    /// Frame rate used when the camera is free running
    pub framerate: u32,
    #[serde(default)]
    pub color: bool,
}

/// Trigger generator settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PwmConfig {
    /// Trigger frequency in Hz
    pub frequency: f64,
    /// Pulses per burst
    pub chunk_size: u64,
    /// Pause between bursts in milliseconds
    pub chunk_pause: u64,
}

/// Chunking overrides; everything defaults from `pwm`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RecordingConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_frames: Option<u64>,
    /// Seconds without frames before a chunk is closed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_delay: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
}

/// Per-camera overrides of `general` and `properties`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CamSpecific {
    #[serde(default)]
    pub general: toml::Table,
    #[serde(default)]
    pub properties: toml::Table,
}

/// Recording configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub general: GeneralConfig,
    pub pwm: PwmConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    /// Device properties, applied in file order
    #[serde(default)]
    pub properties: toml::Table,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cam_specific: Vec<CamSpecific>,
}

impl Config {
    /// Load a config file, apply the overrides of `camera_id` and check
    /// the exposure time against the frame rate.
    pub fn load(path: &Path, camera_id: Option<usize>, ignore_exposure: bool) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!("Loaded config from {}", path.display());

        if let Some(id) = camera_id {
            config.apply_camera(id)?;
        }

        match config.check_exposure_time() {
            Err(ConfigError::ExposureTooLong { .. }) if ignore_exposure => {
                log::warn!("Exposure time check ignored");
            }
            other => other?,
        }

        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Merge the `cam_specific` section `id` into `general` and `properties`
    pub fn apply_camera(&mut self, id: usize) -> Result<(), ConfigError> {
        let overrides = self
            .cam_specific
            .get(id)
            .cloned()
            .ok_or(ConfigError::UnknownCamera {
                id,
                available: self.cam_specific.len(),
            })?;

        if !overrides.general.is_empty() {
            let mut general = toml::Value::try_from(&self.general)?;
            if let toml::Value::Table(table) = &mut general {
                for (key, value) in overrides.general {
                    table.insert(key, value);
                }
            }
            self.general = general
                .try_into()
                .map_err(|source| ConfigError::CameraOverride { id, source })?;
        }

        for (key, value) in overrides.properties {
            self.properties.insert(key, value);
        }

        log::info!("Using settings of camera {} (serial {})", id, self.general.serial);
        Ok(())
    }

    /// Whether the camera runs on the external trigger
    pub fn trigger_mode(&self) -> bool {
        match self.properties.get(TRIGGER_MODE_PROPERTY) {
            Some(toml::Value::Boolean(on)) => *on,
            Some(toml::Value::String(s)) => matches!(s.to_lowercase().as_str(), "true" | "on"),
            Some(toml::Value::Integer(i)) => *i != 0,
            _ => false,
        }
    }

    /// Frames per second the sensor has to sustain
    pub fn effective_fps(&self) -> f64 {
        if self.trigger_mode() {
            self.pwm.frequency
        } else {
            self.general.framerate as f64
        }
    }

    /// Check that the exposure time is not too long for the selected framerate
    pub fn check_exposure_time(&self) -> Result<(), ConfigError> {
        let exposure_us = match self.properties.get(EXPOSURE_PROPERTY) {
            None => return Ok(()),
            Some(toml::Value::Integer(i)) => *i as f64,
            Some(toml::Value::Float(f)) => *f,
            Some(toml::Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| ConfigError::InvalidExposure(s.clone()))?,
            Some(other) => return Err(ConfigError::InvalidExposure(other.to_string())),
        };
        if exposure_us <= 0.0 {
            return Err(ConfigError::InvalidExposure(exposure_us.to_string()));
        }

        let fps = self.effective_fps();
        let max_fps = 1e6 / exposure_us;
        if fps > max_fps {
            let max_exposure_us = 1e6 / fps;
            log::error!("Exposure Time is too long for your framerate!");
            log::error!("Selected exposure: {}us -> max framerate possible: {:.1}Hz", exposure_us, max_fps);
            log::error!("Desired framerate: {}Hz -> max exposure required: {:.1}us", fps, max_exposure_us);
            return Err(ConfigError::ExposureTooLong {
                exposure_us,
                fps,
                max_fps,
                max_exposure_us,
            });
        }
        Ok(())
    }

    pub fn expected_frames(&self) -> u64 {
        self.recording.expected_frames.unwrap_or(self.pwm.chunk_size)
    }

    /// Chunk timeout in seconds, one second shorter than the trigger pause
    /// unless set explicitly
    pub fn timeout_delay(&self) -> f64 {
        self.recording
            .timeout_delay
            .unwrap_or(self.pwm.chunk_pause as f64 / 1000.0 - 1.0)
    }

    pub fn video_extension(&self) -> &str {
        self.recording.extension.as_deref().unwrap_or(DEFAULT_VIDEO_EXTENSION)
    }

    /// Properties in file order
    pub fn device_properties(&self) -> Vec<DeviceProperty> {
        self.properties
            .iter()
            .map(|(name, value)| DeviceProperty::new(name.clone(), property_value(value)))
            .collect()
    }

    pub fn to_session(&self, output_dir: &Path) -> Result<Session, ConfigError> {
        let mut session = Session::new(output_dir, self.expected_frames(), self.timeout_delay())?
            .with_properties(self.device_properties())
            .with_video_extension(self.video_extension());
        if let Some(ms) = self.recording.poll_interval_ms {
            session = session.with_poll_interval(Duration::from_millis(ms))?;
        }
        Ok(session)
    }

    /// Trigger signal for simulated runs
    pub fn trigger_pattern(&self) -> TriggerPattern {
        TriggerPattern::new(
            self.pwm.frequency,
            self.pwm.chunk_size,
            Duration::from_millis(self.pwm.chunk_pause),
        )
    }

    #[cfg(feature = "tcam")]
    pub fn tcam_settings(&self) -> crate::recording::TcamSettings {
        crate::recording::TcamSettings {
            serial: self.general.serial.clone(),
            width: self.general.width,
            height: self.general.height,
            framerate: self.general.framerate,
            color: self.general.color,
        }
    }

    /// Save config to disk
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn property_value(value: &toml::Value) -> PropertyValue {
    match value {
        toml::Value::Boolean(b) => PropertyValue::Bool(*b),
        toml::Value::Integer(i) => PropertyValue::Integer(*i),
        toml::Value::Float(f) => PropertyValue::Float(*f),
        toml::Value::String(s) => PropertyValue::Text(s.clone()),
        other => PropertyValue::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[general]
serial = "12345678"
width = 1440
height = 1080
framerate = 120

[pwm]
frequency = 15
chunk_size = 50
chunk_pause = 3000

[properties]
"Trigger Mode" = true
"Exposure Time (us)" = 4000
"Gain" = 0
"Exposure Auto" = false

[[cam_specific]]
general = { serial = "87654321", color = true }
properties = { "Gain" = 4 }
"#;

    fn sample() -> Config {
        Config::from_toml(SAMPLE).unwrap()
    }

    #[test]
    fn recording_settings_default_from_pwm() {
        let config = sample();
        assert_eq!(config.expected_frames(), 50);
        assert!((config.timeout_delay() - 2.0).abs() < 1e-9);
        assert_eq!(config.video_extension(), "avi");
        assert!(!config.general.color);
    }

    #[test]
    fn properties_keep_file_order() {
        let names: Vec<_> = sample()
            .device_properties()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, ["Trigger Mode", "Exposure Time (us)", "Gain", "Exposure Auto"]);
    }

    #[test]
    fn property_values_are_typed() {
        let props = sample().device_properties();
        assert_eq!(props[0].value, PropertyValue::Bool(true));
        assert_eq!(props[1].value, PropertyValue::Integer(4000));
    }

    #[test]
    fn camera_overrides_are_merged() {
        let mut config = sample();
        config.apply_camera(0).unwrap();
        assert_eq!(config.general.serial, "87654321");
        assert!(config.general.color);
        assert_eq!(config.general.width, 1440);
        assert_eq!(config.properties.get("Gain"), Some(&toml::Value::Integer(4)));
        // Overridden keys keep their position
        assert_eq!(config.device_properties()[2].name, "Gain");
    }

    #[test]
    fn unknown_camera_is_an_error() {
        let mut config = sample();
        assert!(matches!(
            config.apply_camera(3),
            Err(ConfigError::UnknownCamera { id: 3, available: 1 })
        ));
    }

    #[test]
    fn exposure_uses_trigger_frequency_in_trigger_mode() {
        let mut config = sample();
        // 15Hz trigger, 4000us exposure
        assert!(config.check_exposure_time().is_ok());

        config.properties.insert(TRIGGER_MODE_PROPERTY.into(), toml::Value::Boolean(false));
        // 120Hz free running needs at most 8333us
        config.properties.insert(EXPOSURE_PROPERTY.into(), toml::Value::Integer(10_000));
        assert!(matches!(
            config.check_exposure_time(),
            Err(ConfigError::ExposureTooLong { .. })
        ));
    }

    #[test]
    fn exposure_check_can_be_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cam.toml");
        std::fs::write(&path, SAMPLE.replace("= 4000", "= 100000")).unwrap();

        assert!(matches!(
            Config::load(&path, None, false),
            Err(ConfigError::ExposureTooLong { .. })
        ));
        assert!(Config::load(&path, None, true).is_ok());
    }

    #[test]
    fn session_uses_recording_overrides() {
        let mut config = sample();
        config.recording = RecordingConfig {
            expected_frames: Some(0),
            timeout_delay: Some(0.5),
            extension: Some(".mkv".into()),
            poll_interval_ms: Some(2),
        };
        let session = config.to_session(Path::new("/tmp/out")).unwrap();
        assert_eq!(session.expected_frames, 0);
        assert_eq!(session.timeout_delay, Duration::from_millis(500));
        assert_eq!(session.poll_interval, Duration::from_millis(2));
        assert_eq!(session.video_path("000000"), Path::new("/tmp/out/000000.mkv"));
        assert_eq!(session.device_properties.len(), 4);
    }

    #[test]
    fn invalid_chunking_is_rejected() {
        let mut config = sample();
        config.recording.poll_interval_ms = Some(50);
        assert!(matches!(
            config.to_session(Path::new("out")),
            Err(ConfigError::Session(SessionError::InvalidPollInterval { .. }))
        ));

        // A 1s pause leaves no room for the default timeout
        let mut config = sample();
        config.pwm.chunk_pause = 1000;
        assert!(matches!(
            config.to_session(Path::new("out")),
            Err(ConfigError::Session(SessionError::InvalidTimeout(_)))
        ));
    }

    #[test]
    fn saved_config_loads_back() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(SAVED_CONFIG_NAME);
        let config = sample();
        config.save(&path).unwrap();

        let loaded = Config::load(&path, None, false).unwrap();
        assert_eq!(loaded.general, config.general);
        assert_eq!(loaded.pwm, config.pwm);
        assert_eq!(loaded.cam_specific, config.cam_specific);
        assert_eq!(loaded.device_properties(), config.device_properties());
    }
}
