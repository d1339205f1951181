//! # `CameraBuilder` implementation
//!
//! This module implements the builder for [`StereoCamera`] objects.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::path::Path;

use crate::calibration::StereoCalibration;
use crate::camera::{CameraParts, StereoCamera};
use crate::config::StereoConfig;
use crate::depth::DepthRange;
use crate::error::{Error, Result};
use crate::frame::FrameSize;
use crate::hardware::HardwareControl;
use crate::logger::Logger;
use crate::source::FrameSource;
use crate::stereo::StereoParams;
use crate::transport::FrameSink;

// -----------------------------------------------------------------------------------------------
// TRAITS
// -----------------------------------------------------------------------------------------------

/// Provides common methods for attaching calibration to a camera builder.
pub trait Rectifiable: Sized {
    fn calib_params(self, calibration: StereoCalibration) -> Self;

    /// Load the calibration from a file.
    ///
    /// The file type is guessed from the extension, `.toml`, `.yaml` and `.yml` are supported.
    fn calib_params_from_file<P: AsRef<Path>>(self, path: P) -> Result<Self> {
        let calib = StereoCalibration::load(path)?;

        Ok(self.calib_params(calib))
    }
}

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// Builder for a [`StereoCamera`].
///
/// ```no_run
/// use cv_stereocam::prelude::*;
///
/// let mut camera = CameraBuilder::new()
///     // Settings of the module, alternatively use .config(...)
///     .config_file("stereo_camera_config.yaml")?
///     // Path to the module's calibration, alternatively use .calib_params(...)
///     .calib_params_from_file("calib.yaml")?
///     .build()?;
///
/// camera.start_capture(false, false);
/// camera.start_stereo_compute();
/// # Ok::<(), cv_stereocam::Error>(())
/// ```
pub struct CameraBuilder {
    config: StereoConfig,

    calibration: Option<StereoCalibration>,

    source: Option<Box<dyn FrameSource>>,

    udp_sink: Option<Box<dyn FrameSink>>,
    share_sink: Option<Box<dyn FrameSink>>,

    hardware: Option<Box<dyn HardwareControl>>,

    logger: Logger
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl CameraBuilder {
    pub fn new() -> Self {
        Self {
            config: StereoConfig::default(),
            calibration: None,
            source: None,
            udp_sink: None,
            share_sink: None,
            hardware: None,
            logger: Logger::default()
        }
    }

    /// Use the given settings, replacing any set so far.
    pub fn config(mut self, config: StereoConfig) -> Self {
        self.config = config;

        self
    }

    /// Load the settings from a `.toml`, `.yaml` or `.yml` file.
    pub fn config_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        self.config = StereoConfig::load(path)?;

        Ok(self)
    }

    /// Number `N` of the `/dev/videoN` node the module is found at.
    ///
    /// Only used when no source is given and the `v4l2` feature is enabled.
    pub fn device_node(mut self, device_node: u32) -> Self {
        self.config.device_node = device_node;

        self
    }

    /// Read frames from `source` instead of a device node.
    pub fn source<S: FrameSource + 'static>(mut self, source: S) -> Self {
        self.source = Some(Box::new(source));

        self
    }

    /// Firmware and flash access for the module.
    pub fn hardware<H: HardwareControl + 'static>(mut self, hardware: H) -> Self {
        self.hardware = Some(Box::new(hardware));

        self
    }

    /// Sink used when capture is started with `transmit`, replacing the default UDP sink.
    pub fn udp_sink<S: FrameSink + 'static>(mut self, sink: S) -> Self {
        self.udp_sink = Some(Box::new(sink));

        self
    }

    /// Shared memory sink used when capture is started with `share`.
    pub fn share_sink<S: FrameSink + 'static>(mut self, sink: S) -> Self {
        self.share_sink = Some(Box::new(sink));

        self
    }

    pub fn logger(mut self, logger: Logger) -> Self {
        self.logger = logger;

        self
    }

    pub fn frame_size(mut self, size: FrameSize) -> Self {
        self.config.frame_size = size;

        self
    }

    pub fn frame_rate(mut self, rate: f32) -> Self {
        self.config.frame_rate = rate;

        self
    }

    pub fn rect_frame_size(mut self, size: FrameSize) -> Self {
        self.config.rect_frame_size = size;

        self
    }

    pub fn pos_number(mut self, pos_number: u8) -> Self {
        self.config.pos_number = pos_number;

        self
    }

    pub fn serial_number(mut self, serial_number: u32) -> Self {
        self.config.serial_number = serial_number;

        self
    }

    pub fn log_level(mut self, level: u8) -> Self {
        self.config.log_level = level;

        self
    }

    pub fn stereo_params(mut self, params: StereoParams) -> Self {
        self.config.stereo = params;

        self
    }

    pub fn depth_range(mut self, range: DepthRange) -> Self {
        self.config.depth_range = range;

        self
    }

    /// Build the camera and open its device.
    ///
    /// Invalid settings or the lack of any frame source are errors. A device that fails to open
    /// is not, the camera is returned with [`StereoCamera::is_opened`] false so that it can be
    /// opened later.
    pub fn build(mut self) -> Result<StereoCamera> {
        self.config.validate()?;

        let mut source = match self.source.take() {
            Some(s) => s,
            None => default_source(&self.config)?
        };

        if source.frame_size() != self.config.frame_size
            || source.frame_rate() != self.config.frame_rate
        {
            source.configure(self.config.frame_size, self.config.frame_rate)?;
        }

        if let Some(ref calib) = self.calibration {
            calib.validate()?;
        } else if let Some(ref mut hw) = self.hardware {
            match hw.read_calibration().and_then(|c| c.validate().map(|_| c)) {
                Ok(c) => self.calibration = Some(c),
                Err(e) => self.logger.warn(format!("no calibration from the module: {}", e))
            }
        }

        let mut camera = StereoCamera::from_parts(CameraParts {
            config: self.config,
            calibration: self.calibration,
            source: Some(source),
            udp_sink: self.udp_sink,
            share_sink: self.share_sink,
            hardware: self.hardware,
            logger: self.logger
        });

        if camera.calibration().is_none() {
            camera.logger().warn("no calibration loaded, rectification is unavailable");
        }

        camera.open();

        Ok(camera)
    }
}

impl Default for CameraBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Rectifiable for CameraBuilder {
    fn calib_params(mut self, calibration: StereoCalibration) -> Self {
        self.calibration = Some(calibration);

        self
    }
}

// -----------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// -----------------------------------------------------------------------------------------------

#[cfg(feature = "v4l2")]
fn default_source(config: &StereoConfig) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(crate::source::V4l2Source::new(
        config.device_node,
        config.frame_size,
        config.frame_rate
    )))
}

#[cfg(not(feature = "v4l2"))]
fn default_source(_config: &StereoConfig) -> Result<Box<dyn FrameSource>> {
    Err(Error::NoFrameSource)
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {

    use super::*;
    use crate::source::SyntheticSource;

    const RAW: FrameSize = FrameSize::new(320, 120);

    struct FlashOnly(StereoCalibration);

    impl HardwareControl for FlashOnly {
        fn firmware_version(&mut self) -> Result<String> {
            Ok("1.0.0".into())
        }

        fn update_firmware(&mut self, _: &Path) -> Result<()> {
            Err(Error::HardwareError("read only".into()))
        }

        fn flash_calibration(&mut self, _: &StereoCalibration) -> Result<()> {
            Err(Error::HardwareError("read only".into()))
        }

        fn read_calibration(&mut self) -> Result<StereoCalibration> {
            Ok(self.0.clone())
        }
    }

    fn builder() -> CameraBuilder {
        CameraBuilder::new()
            .frame_size(RAW)
            .rect_frame_size(FrameSize::new(80, 60))
            .source(SyntheticSource::textured(FrameSize::new(64, 16), 30.0, 16))
    }

    #[test]
    fn builds_and_opens_with_synthetic_source() {
        let cam = builder()
            .pos_number(2)
            .calib_params(StereoCalibration::ideal(RAW.single_lens(), 100.0, 0.08))
            .build()
            .unwrap();

        assert!(cam.is_opened());
        assert_eq!(cam.pos_number(), 2);
        assert_eq!(cam.raw_frame_size(), RAW);
        assert!(cam.calibration().is_some());
    }

    #[test]
    fn invalid_settings_fail_the_build() {
        let result = builder().rect_frame_size(FrameSize::new(160, 120)).build();
        assert!(matches!(result, Err(Error::InvalidGeometry(_))));

        let result = builder().log_level(0).build();
        assert!(matches!(result, Err(Error::InvalidSetting(_))));
    }

    #[test]
    fn missing_source_without_device_support() {
        if cfg!(feature = "v4l2") {
            return;
        }

        assert!(matches!(CameraBuilder::new().build(), Err(Error::NoFrameSource)));
    }

    #[test]
    fn calibration_is_read_from_the_module() {
        let calib = StereoCalibration::ideal(RAW.single_lens(), 100.0, 0.08);
        let cam = builder().hardware(FlashOnly(calib.clone())).build().unwrap();

        assert_eq!(cam.calibration(), Some(&calib));
        assert_eq!(cam.firmware_version().unwrap(), "1.0.0");
    }

    #[test]
    fn missing_calibration_file() {
        assert!(matches!(
            builder().calib_params_from_file("no_such_calib.yaml"),
            Err(Error::FileNotFound(_))
        ));
    }
}
