//! # Configuration Module
//!
//! Camera settings and the file helpers used to load and save them. Files are read as TOML or
//! YAML depending on their extension.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::depth::DepthRange;
use crate::error::{Error, Result};
use crate::frame::FrameSize;
use crate::logger;
use crate::remap;
use crate::stereo::StereoParams;
use crate::transport::TransmissionConfig;

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

pub const DEFAULT_FRAME_SIZE: FrameSize = FrameSize::new(1856, 800);

pub const DEFAULT_RECT_FRAME_SIZE: FrameSize = FrameSize::new(464, 400);

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// All settings of a stereo camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StereoConfig {
    /// `1` for runtime information, `2` to add debug information
    pub log_level: u8,

    /// Number `N` of the `/dev/videoN` node the camera is found at
    pub device_node: u32,

    /// Where the module is mounted, 1 face, 2 chin, 3 left, 4 right, 5 abdomen, 0 if unknown
    pub pos_number: u8,

    pub serial_number: u32,

    /// Size of the interleaved raw frame
    pub frame_size: FrameSize,

    /// Size of each rectified view
    pub rect_frame_size: FrameSize,

    /// Capture rate in frames per second
    pub frame_rate: f32,

    /// Horizontal field of view of the long-lat projection, in degrees
    pub longlat_fov: f64,

    pub stereo: StereoParams,

    pub depth_range: DepthRange,

    pub transmission: TransmissionConfig,

    /// How long a query waits for the first frame of its kind
    pub query_timeout_ms: u64,

    /// First delay between failed reads, doubled on each consecutive failure
    pub retry_backoff_ms: u64,

    pub max_retry_backoff_ms: u64,

    /// Consecutive failed reads, or failed attempts to reopen, before the device is declared lost
    pub device_loss_retries: u32
}

/// File formats understood by [`load_file`] and [`save_file`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileFormat {
    Toml,
    Yaml
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl Default for StereoConfig {
    fn default() -> Self {
        Self {
            log_level: 1,
            device_node: 0,
            pos_number: 0,
            serial_number: 0,
            frame_size: DEFAULT_FRAME_SIZE,
            rect_frame_size: DEFAULT_RECT_FRAME_SIZE,
            frame_rate: 30.0,
            longlat_fov: 180.0,
            stereo: StereoParams::default(),
            depth_range: DepthRange::default(),
            transmission: TransmissionConfig::default(),
            query_timeout_ms: 100,
            retry_backoff_ms: 5,
            max_retry_backoff_ms: 200,
            device_loss_retries: 20
        }
    }
}

impl StereoConfig {
    /// Load the configuration from a file, guessing the format from its extension.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = load_file(path)?;
        config.validate()?;

        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        save_file(self, path)
    }

    /// Check that the settings are consistent with each other.
    pub fn validate(&self) -> Result<()> {
        if logger::level_from_config(self.log_level).is_none() {
            return Err(Error::InvalidSetting(format!(
                "log_level must be 1 or 2, got {}",
                self.log_level
            )));
        }

        if self.pos_number > 5 {
            return Err(Error::InvalidSetting(format!(
                "pos_number must be between 1 and 5, got {}",
                self.pos_number
            )));
        }

        if !(self.frame_rate > 0.0) {
            return Err(Error::InvalidSetting("frame_rate must be positive".into()));
        }

        if !(self.longlat_fov > 0.0 && self.longlat_fov <= 360.0) {
            return Err(Error::InvalidSetting(format!(
                "longlat_fov must be in (0, 360], got {}",
                self.longlat_fov
            )));
        }

        if self.device_loss_retries == 0 {
            return Err(Error::InvalidSetting("device_loss_retries must be at least 1".into()));
        }

        remap::check_geometry(self.frame_size, self.rect_frame_size)?;
        self.stereo.validate()?;
        self.depth_range.validate()?;
        self.transmission.validate(self.frame_rate)?;

        Ok(())
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

impl FileFormat {
    fn from_path(path: &Path) -> Result<Self> {
        let ext = path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        match ext.as_deref() {
            Some("toml") => Ok(FileFormat::Toml),
            Some("yaml") | Some("yml") => Ok(FileFormat::Yaml),
            _ => Err(Error::UnsupportedFileFormat(path.to_path_buf()))
        }
    }
}

// -----------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// -----------------------------------------------------------------------------------------------

/// Deserialise a value from a file, the format is guessed from the file extension.
pub fn load_file<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let path = path.as_ref();

    // Check the file exists
    if !path.exists() {
        return Err(Error::FileNotFound(path.to_path_buf()));
    }

    let format = FileFormat::from_path(path)?;
    let text = fs::read_to_string(path).map_err(Error::FileIoError)?;

    match format {
        FileFormat::Toml => toml::from_str(&text)
            .map_err(|e| Error::DeserialisationError(e.to_string())),
        FileFormat::Yaml => serde_yaml::from_str(&text)
            .map_err(|e| Error::DeserialisationError(e.to_string()))
    }
}

/// Serialise a value to a file, the format is chosen from the file extension.
pub fn save_file<T: Serialize, P: AsRef<Path>>(value: &T, path: P) -> Result<()> {
    let path = path.as_ref();
    let format = FileFormat::from_path(path)?;

    let text = match format {
        FileFormat::Toml => toml::to_string_pretty(value)
            .map_err(|e| Error::SerialisationError(e.to_string()))?,
        FileFormat::Yaml => serde_yaml::to_string(value)
            .map_err(|e| Error::SerialisationError(e.to_string()))?
    };

    fs::write(path, text).map_err(Error::FileIoError)
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------
