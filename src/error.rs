//! # `cv_stereocam` Error module
//!
//! Provides abstractions over errors which can occur during this crate's use.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::path::PathBuf;

use thiserror;

// -----------------------------------------------------------------------------------------------
// ENUMERATIONS
// -----------------------------------------------------------------------------------------------

/// Result type used by faillible functions inside the `cv_stereocam` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents errors which can occur during use of the `cv_stereocam` crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Cannot find file at {0:?}")]
    FileNotFound(PathBuf),

    #[error("Cannot guess the format of {0:?}, expected a .toml, .yaml or .yml extension")]
    UnsupportedFileFormat(PathBuf),

    #[error("Error accessing file: {0}")]
    FileIoError(std::io::Error),

    #[error("Error deserialising data: {0}")]
    DeserialisationError(String),

    #[error("Error serialising data: {0}")]
    SerialisationError(String),

    #[error("Calibration parameter `{name}` should be {expected} but is {rows}x{cols}")]
    CalibDimensionError {
        name: &'static str,
        expected: &'static str,
        rows: usize,
        cols: usize
    },

    #[error("Expected 6 calibration parameters (intrinsic, distortion, xi, rotation, translation, \
        kfe), found {0}")]
    CalibParamCountError(usize),

    #[error("Invalid calibration parameters: {0}")]
    InvalidCalibration(String),

    #[error("No calibration parameters have been loaded, cannot rectify")]
    MissingCalibration,

    #[error("Invalid frame geometry: {0}")]
    InvalidGeometry(String),

    #[error("Invalid setting: {0}")]
    InvalidSetting(String),

    #[error("No frame source is available, enable the `v4l2` feature or provide a source")]
    NoFrameSource,

    #[error("Cannot open camera device: {0}")]
    DeviceOpenError(String),

    #[error("Camera device is not open")]
    DeviceNotOpen,

    #[error("Error capturing camera image: {0}")]
    CameraCaptureError(std::io::Error),

    #[error("Error occured while converting an image: {0}")]
    ImageConversionError(image::ImageError),

    #[error("The operation requires capture and stereo compute to be stopped")]
    PipelineBusy,

    #[error("Could not spawn the {0} thread: {1}")]
    ThreadSpawnError(&'static str, std::io::Error),

    #[error("The {0} thread panicked")]
    ThreadJoinError(&'static str),

    #[error("Error transmitting frame: {0}")]
    TransportError(std::io::Error),

    #[error("No hardware control is available for this camera")]
    HardwareUnavailable,

    #[error("Hardware operation failed: {0}")]
    HardwareError(String)
}
