//! # Stereo Camera Module
//!
//! [`StereoCamera`] is the public face of the pipeline. It owns the frame source, the two
//! background loops and the two mailboxes connecting them:
//!
//! ```text
//! FrameSource -> capture loop -> [raw mailbox] -> stereo compute loop -> [disparity mailbox]
//!                     |                |                                        |
//!                   sinks        raw/rectified queries                depth/point cloud queries
//! ```
//!
//! Lifecycle operations report success as a `bool` and log the reason for a refusal. Queries
//! return `None` when no frame of the requested kind exists yet, waiting at most the configured
//! query timeout for a first one while the producing loop is running. Queries never block either
//! loop, they only clone the latest value out of a mailbox.
//!
//! Settings, including calibration, can only be changed while both loops are idle.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use derive_more::Display;
use nalgebra::{DMatrix, Point3};
use parking_lot::Mutex;

use crate::builder::CameraBuilder;
use crate::calibration::{CalibrationParameters, Lens, StereoCalibration};
use crate::capture::{Backoff, CaptureContext, CaptureOutput};
use crate::config::StereoConfig;
use crate::depth::{DepthConverter, DepthRange};
use crate::error::{Error, Result};
use crate::frame::{
    ColoredPoint, DepthFrame, DisparityFrame, FrameSize, PointCloud, RawFrame,
    RectifiedFramePair, StereoFrame
};
use crate::hardware::HardwareControl;
use crate::logger::{self, Logger};
use crate::mailbox::Mailbox;
use crate::remap::{ProjectionKind, Rectifier};
use crate::source::FrameSource;
use crate::stereo::{BlockMatcher, ComputeContext, StereoParams};
use crate::transport::{shm_key, FrameSink, UdpFrameSink};
use crate::worker::Worker;

// -----------------------------------------------------------------------------------------------
// ENUMERATIONS
// -----------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum CaptureState {
    Idle,
    Running,
    Stopping
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ComputeState {
    Idle,
    Computing,
    Stopping
}

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// Identity of a camera module, fixed at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraIdentity {
    pub serial_number: u32,

    /// 1 face, 2 chin, 3 left, 4 right, 5 abdomen, 0 if unknown
    pub pos_number: u8,

    pub device_node: u32
}

/// Everything a camera is assembled from.
pub(crate) struct CameraParts {
    pub config: StereoConfig,
    pub calibration: Option<StereoCalibration>,
    pub source: Option<Box<dyn FrameSource>>,
    pub udp_sink: Option<Box<dyn FrameSink>>,
    pub share_sink: Option<Box<dyn FrameSink>>,
    pub hardware: Option<Box<dyn HardwareControl>>,
    pub logger: Logger
}

/// Resources owned by the camera while the capture loop is not using them.
struct Parked {
    source: Option<Box<dyn FrameSource>>,
    udp: Option<Box<dyn FrameSink>>,
    share: Option<Box<dyn FrameSink>>
}

/// Which parked sinks were handed to the capture loop, in the order they were handed over.
#[derive(Debug, Clone, Copy, Default)]
struct SinksInUse {
    udp: bool,
    share: bool
}

/// A stereo camera module and its capture and stereo compute pipeline.
pub struct StereoCamera {
    config: StereoConfig,

    calibration: Option<Arc<StereoCalibration>>,
    rectifier: Option<Arc<Rectifier>>,

    parked: Mutex<Parked>,
    sinks_in_use: SinksInUse,

    hardware: Mutex<Option<Box<dyn HardwareControl>>>,

    raw: Arc<Mailbox<RawFrame>>,
    disparity: Arc<Mailbox<DisparityFrame>>,

    device_ok: Arc<AtomicBool>,

    capture: Option<Worker<CaptureOutput>>,
    compute: Option<Worker<()>>,

    logger: Logger
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl StereoCamera {
    pub fn builder() -> CameraBuilder {
        CameraBuilder::new()
    }

    pub(crate) fn from_parts(parts: CameraParts) -> Self {
        let mut logger = parts.logger;
        if let Some(level) = logger::level_from_config(parts.config.log_level) {
            logger.set_max_level(level);
        }

        let mut cam = Self {
            config: parts.config,
            calibration: None,
            rectifier: None,
            parked: Mutex::new(Parked {
                source: parts.source,
                udp: parts.udp_sink,
                share: parts.share_sink
            }),
            sinks_in_use: SinksInUse::default(),
            hardware: Mutex::new(parts.hardware),
            raw: Arc::new(Mailbox::new()),
            disparity: Arc::new(Mailbox::new()),
            device_ok: Arc::new(AtomicBool::new(false)),
            capture: None,
            compute: None,
            logger
        };

        if let Some(calib) = parts.calibration {
            cam.install_calibration(calib);
        }

        cam
    }

    // ---- Device ----

    /// Returns true if the device is open and has not been lost.
    pub fn is_opened(&self) -> bool {
        if self.capture.is_some() {
            return self.device_ok.load(Ordering::SeqCst);
        }

        match self.parked.lock().source {
            Some(ref source) => source.is_opened(),
            None => false
        }
    }

    /// Open the frame source.
    pub fn open(&mut self) -> bool {
        if self.capture.is_some() {
            return self.is_opened();
        }

        let mut parked = self.parked.lock();
        let source = match parked.source {
            Some(ref mut s) => s,
            None => {
                self.logger.error(Error::NoFrameSource.to_string());
                return false;
            }
        };

        if source.is_opened() {
            return true;
        }

        match source.open() {
            Ok(()) => {
                self.logger.info(format!("opened {}", source.describe()));
                self.device_ok.store(true, Ordering::SeqCst);
                true
            },
            Err(e) => {
                self.logger.error(format!("cannot open {}: {}", source.describe(), e));
                false
            }
        }
    }

    /// Stop both loops and release the device.
    ///
    /// Returns false if the device was not open.
    pub fn close(&mut self) -> bool {
        self.stop_capture();

        let mut parked = self.parked.lock();
        match parked.source {
            Some(ref mut source) if source.is_opened() => {
                source.close();
                self.device_ok.store(false, Ordering::SeqCst);
                self.logger.info(format!("closed {}", source.describe()));
                true
            },
            _ => false
        }
    }

    // ---- Settings ----

    pub fn config(&self) -> &StereoConfig {
        &self.config
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn identity(&self) -> CameraIdentity {
        CameraIdentity {
            serial_number: self.config.serial_number,
            pos_number: self.config.pos_number,
            device_node: self.config.device_node
        }
    }

    pub fn serial_number(&self) -> u32 {
        self.config.serial_number
    }

    pub fn pos_number(&self) -> u8 {
        self.config.pos_number
    }

    pub fn device_node(&self) -> u32 {
        self.config.device_node
    }

    pub fn log_level(&self) -> u8 {
        self.config.log_level
    }

    pub fn raw_frame_size(&self) -> FrameSize {
        self.config.frame_size
    }

    pub fn raw_frame_rate(&self) -> f32 {
        self.config.frame_rate
    }

    pub fn rect_frame_size(&self) -> FrameSize {
        self.config.rect_frame_size
    }

    pub fn stereo_params(&self) -> StereoParams {
        self.config.stereo
    }

    pub fn depth_range(&self) -> DepthRange {
        self.config.depth_range
    }

    /// Shared memory key frames are shared under when capture is started with `share`.
    pub fn shm_key(&self) -> i32 {
        shm_key(self.config.pos_number)
    }

    /// Set the log level, `1` for runtime information, `2` to add debug information.
    pub fn set_log_level(&mut self, level: u8) -> bool {
        self.update_config("log level", |c| c.log_level = level)
    }

    /// Set where the module is mounted, between 1 and 5.
    pub fn set_pos_number(&mut self, pos_number: u8) -> bool {
        if !(1..=5).contains(&pos_number) {
            self.logger.warn(format!("position number must be 1 to 5, got {}", pos_number));
            return false;
        }

        self.update_config("position number", |c| c.pos_number = pos_number)
    }

    pub fn set_serial_number(&mut self, serial_number: u32) -> bool {
        self.update_config("serial number", |c| c.serial_number = serial_number)
    }

    pub fn set_raw_frame_size(&mut self, size: FrameSize) -> bool {
        self.update_config("raw frame size", |c| c.frame_size = size)
    }

    pub fn set_raw_frame_rate(&mut self, rate: f32) -> bool {
        self.update_config("raw frame rate", |c| c.frame_rate = rate)
    }

    pub fn set_rect_frame_size(&mut self, size: FrameSize) -> bool {
        self.update_config("rectified frame size", |c| c.rect_frame_size = size)
    }

    pub fn set_stereo_params(&mut self, params: StereoParams) -> bool {
        self.update_config("stereo parameters", |c| c.stereo = params)
    }

    pub fn set_depth_range(&mut self, range: DepthRange) -> bool {
        self.update_config("depth range", |c| c.depth_range = range)
    }

    /// Replace the whole configuration, rejected if it is invalid or a loop is running.
    pub fn set_config(&mut self, config: StereoConfig) -> bool {
        self.update_config("configuration", |c| *c = config)
    }

    pub fn load_config<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.ensure_idle()?;

        let config = StereoConfig::load(path.as_ref())?;
        self.apply_config(config)?;
        self.logger.info(format!("loaded configuration from {:?}", path.as_ref()));

        Ok(())
    }

    pub fn save_config<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.config.save(path)
    }

    // ---- Calibration ----

    pub fn calibration(&self) -> Option<&StereoCalibration> {
        self.calibration.as_deref()
    }

    /// Parameters of one lens in the positional array form, see
    /// [`CalibrationParameters::to_matrices`].
    pub fn calib_params(&self, lens: Lens) -> Option<Vec<DMatrix<f64>>> {
        self.calibration.as_ref().map(|c| c.lens(lens).to_matrices())
    }

    /// Set the parameters of one lens from the positional array form.
    ///
    /// Malformed parameters are rejected and leave the current calibration in place.
    pub fn set_calib_params(&mut self, lens: Lens, params: &[DMatrix<f64>]) -> bool {
        if let Err(e) = self.ensure_idle() {
            self.logger.warn(format!("cannot set calibration: {}", e));
            return false;
        }

        let mut calib = match self.calibration {
            Some(ref c) => (**c).clone(),
            None => {
                self.logger.warn(format!("cannot set calibration: {}", Error::MissingCalibration));
                return false;
            }
        };

        let result = CalibrationParameters::from_matrices(params).and_then(|p| {
            *calib.lens_mut(lens) = p;
            calib.validate()
        });

        match result {
            Ok(()) => {
                self.install_calibration(calib);
                true
            },
            Err(e) => {
                self.logger.error(format!("rejected {:?} lens calibration: {}", lens, e));
                false
            }
        }
    }

    /// Replace the calibration of both lenses.
    pub fn set_calibration(&mut self, calibration: StereoCalibration) -> bool {
        if let Err(e) = self.ensure_idle().and_then(|_| calibration.validate()) {
            self.logger.error(format!("rejected calibration: {}", e));
            return false;
        }

        self.install_calibration(calibration);
        true
    }

    pub fn load_calib_params<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.ensure_idle()?;

        let calib = StereoCalibration::load(path.as_ref())?;
        self.install_calibration(calib);
        self.logger.info(format!("loaded calibration from {:?}", path.as_ref()));

        Ok(())
    }

    pub fn save_calib_params<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.calibration.as_ref()
            .ok_or(Error::MissingCalibration)?
            .save(path)
    }

    // ---- Lifecycle ----

    /// Start the capture loop.
    ///
    /// With `transmit` frames are also sent over UDP, with `share` they are handed to the shared
    /// memory sink given at construction. Fails if capture is already running or the device is
    /// not open.
    pub fn start_capture(&mut self, transmit: bool, share: bool) -> bool {
        if self.capture.is_some() {
            self.logger.warn("capture is already running");
            return false;
        }

        let mut parked = self.parked.lock();

        match parked.source {
            Some(ref s) if s.is_opened() => (),
            Some(_) => {
                self.logger.error(format!("cannot start capture: {}", Error::DeviceNotOpen));
                return false;
            },
            None => {
                self.logger.error(format!("cannot start capture: {}", Error::NoFrameSource));
                return false;
            }
        }

        let mut sinks: Vec<Box<dyn FrameSink>> = Vec::new();
        let mut in_use = SinksInUse::default();

        if transmit {
            let sink = match parked.udp.take() {
                Some(s) => Ok(s),
                None => self.default_udp_sink()
            };

            match sink {
                Ok(s) => {
                    sinks.push(s);
                    in_use.udp = true;
                },
                Err(e) => {
                    self.logger.error(format!("cannot start capture, no UDP sink: {}", e));
                    return false;
                }
            }
        }

        if share {
            match parked.share.take() {
                Some(s) => {
                    sinks.push(s);
                    in_use.share = true;
                },
                None => self.logger.warn(format!(
                    "no shared memory sink for key {}, sharing disabled",
                    self.shm_key()
                ))
            }
        }

        let source = match parked.source.take() {
            Some(s) => s,
            None => return false
        };
        drop(parked);

        let ctx = CaptureContext {
            source,
            sinks,
            raw: self.raw.clone(),
            device_ok: self.device_ok.clone(),
            backoff: Backoff::new(
                Duration::from_millis(self.config.retry_backoff_ms),
                Duration::from_millis(self.config.max_retry_backoff_ms)
            ),
            device_loss_retries: self.config.device_loss_retries,
            logger: self.logger.child("capture")
        };

        self.device_ok.store(true, Ordering::SeqCst);

        match Worker::spawn("capture", move |stop| ctx.run(stop)) {
            Ok(w) => {
                self.capture = Some(w);
                self.sinks_in_use = in_use;
                true
            },
            Err(e) => {
                // The source went down with the closure
                self.logger.error(format!("cannot start capture: {}", e));
                self.device_ok.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// Stop the capture loop, stopping stereo compute first if it is running.
    ///
    /// Returns false if capture was not running.
    pub fn stop_capture(&mut self) -> bool {
        let worker = match self.capture.take() {
            Some(w) => w,
            None => return false
        };

        self.stop_stereo_compute();

        match worker.join() {
            Ok(output) => {
                let mut parked = self.parked.lock();
                let mut sinks = output.sinks.into_iter();

                if self.sinks_in_use.udp {
                    parked.udp = sinks.next();
                }
                if self.sinks_in_use.share {
                    parked.share = sinks.next();
                }
                parked.source = Some(output.source);
            },
            Err(e) => {
                self.logger.error(format!("capture loop failed: {}", e));
                self.device_ok.store(false, Ordering::SeqCst);
            }
        }

        self.sinks_in_use = SinksInUse::default();

        true
    }

    /// Start the stereo compute loop.
    ///
    /// Fails if capture is not running, compute is already running or no calibration is loaded.
    pub fn start_stereo_compute(&mut self) -> bool {
        // A loop that ended on device loss is reaped here
        if self.compute.as_ref().map_or(false, |w| w.is_finished()) {
            self.stop_stereo_compute();
        }

        if self.compute.is_some() {
            self.logger.warn("stereo compute is already running");
            return false;
        }

        if self.capture.is_none() {
            self.logger.warn("cannot start stereo compute before capture");
            return false;
        }

        if !self.device_ok.load(Ordering::SeqCst) {
            self.logger.error(format!("cannot start stereo compute: {}", Error::DeviceNotOpen));
            return false;
        }

        let rectifier = match self.rectifier {
            Some(ref r) => r.clone(),
            None => {
                self.logger.error(format!(
                    "cannot start stereo compute: {}",
                    Error::MissingCalibration
                ));
                return false;
            }
        };

        let matcher = match BlockMatcher::new(self.config.stereo) {
            Ok(m) => m,
            Err(e) => {
                self.logger.error(format!("cannot start stereo compute: {}", e));
                return false;
            }
        };

        let ctx = ComputeContext {
            rectifier,
            matcher,
            rect_size: self.config.rect_frame_size,
            depth_range: self.config.depth_range,
            raw: self.raw.clone(),
            disparity: self.disparity.clone(),
            device_ok: self.device_ok.clone(),
            wait_timeout: self.config.query_timeout(),
            logger: self.logger.child("stereo")
        };

        match Worker::spawn("stereo", move |stop| ctx.run(stop)) {
            Ok(w) => {
                self.compute = Some(w);
                true
            },
            Err(e) => {
                self.logger.error(format!("cannot start stereo compute: {}", e));
                false
            }
        }
    }

    /// Stop the stereo compute loop, returns false if it was not running.
    ///
    /// The loop also ends by itself when the device is lost.
    pub fn stop_stereo_compute(&mut self) -> bool {
        let worker = match self.compute.take() {
            Some(w) => w,
            None => return false
        };
        let was_running = !worker.is_finished();

        worker.request_stop();
        self.raw.wake_all();

        if let Err(e) = worker.join() {
            self.logger.error(format!("stereo compute loop failed: {}", e));
        }

        was_running
    }

    pub fn capture_state(&self) -> CaptureState {
        match self.capture {
            Some(ref w) if w.stop_requested() => CaptureState::Stopping,
            Some(_) => CaptureState::Running,
            None => CaptureState::Idle
        }
    }

    pub fn compute_state(&self) -> ComputeState {
        match self.compute {
            Some(ref w) if w.is_finished() => ComputeState::Idle,
            Some(ref w) if w.stop_requested() => ComputeState::Stopping,
            Some(_) => ComputeState::Computing,
            None => ComputeState::Idle
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.capture_state() == CaptureState::Running
    }

    pub fn is_computing(&self) -> bool {
        self.compute_state() == ComputeState::Computing
    }

    // ---- Queries ----

    /// The latest raw frame.
    pub fn get_raw_frame(&self) -> Option<RawFrame> {
        self.latest(&self.raw, self.capture.is_some())
    }

    /// Unrectified left and right views of the latest raw frame.
    pub fn get_stereo_frame(&self) -> Option<StereoFrame> {
        self.get_raw_frame().map(|f| f.to_stereo_frame())
    }

    /// Rectified views of the latest raw frame in the given projection.
    pub fn get_rect_stereo_frame(&self, kind: ProjectionKind) -> Option<RectifiedFramePair> {
        let rectifier = self.query_rectifier()?;
        let raw = self.get_raw_frame()?;

        self.log_query_error(
            "rectified frame",
            rectifier.rectify(&raw, kind, self.config.rect_frame_size)
        )
    }

    /// Long-lat views of the latest raw frame plus the left view in perspective projection.
    pub fn get_rect_stereo_frame_with_perspective(&self) -> Option<RectifiedFramePair> {
        let rectifier = self.query_rectifier()?;
        let raw = self.get_raw_frame()?;

        self.log_query_error(
            "rectified frame",
            rectifier.rectify_with_perspective(&raw, self.config.rect_frame_size)
        )
    }

    /// The latest disparity frame, empty if its cycle found no reliable match.
    pub fn get_disparity_frame(&self) -> Option<DisparityFrame> {
        self.latest(&self.disparity, self.compute.is_some())
    }

    /// Depth image of the latest disparity frame, colourised with `colorize`.
    pub fn get_depth_frame(&self, colorize: bool) -> Option<DepthFrame> {
        let frame = self.get_disparity_frame()?;

        Some(self.converter_for(&frame)?.to_depth(&frame, colorize))
    }

    /// Point cloud of the latest disparity frame, points outside the depth range are dropped.
    pub fn get_point_cloud(&self) -> Option<PointCloud<Point3<f32>>> {
        let frame = self.get_disparity_frame()?;

        Some(self.converter_for(&frame)?.to_point_cloud(&frame))
    }

    /// As [`StereoCamera::get_point_cloud`] with the colour of each point.
    pub fn get_colored_point_cloud(&self) -> Option<PointCloud<ColoredPoint>> {
        let frame = self.get_disparity_frame()?;

        Some(self.converter_for(&frame)?.to_colored_point_cloud(&frame))
    }

    // ---- Hardware ----

    pub fn firmware_version(&self) -> Result<String> {
        self.with_hardware(|hw| hw.firmware_version())
    }

    /// Flash a new firmware image, only while both loops are idle.
    pub fn update_firmware<P: AsRef<Path>>(&self, image: P) -> Result<()> {
        self.ensure_idle()?;

        self.with_hardware(|hw| hw.update_firmware(image.as_ref()))?;
        self.logger.info(format!("firmware updated from {:?}", image.as_ref()));

        Ok(())
    }

    /// Write the current calibration to the module's flash.
    pub fn update_calib_params_to_flash(&self) -> Result<()> {
        let calib = self.calibration.as_ref().ok_or(Error::MissingCalibration)?.clone();

        self.with_hardware(|hw| hw.flash_calibration(&calib))
    }

    /// Replace the calibration with the one stored in the module's flash.
    pub fn load_calib_params_from_flash(&mut self) -> Result<()> {
        self.ensure_idle()?;

        let calib = self.with_hardware(|hw| hw.read_calibration())?;
        calib.validate()?;
        self.install_calibration(calib);

        Ok(())
    }

    // ---- Private ----

    fn ensure_idle(&self) -> Result<()> {
        if self.capture.is_some() || self.compute.is_some() {
            return Err(Error::PipelineBusy);
        }

        Ok(())
    }

    fn update_config<F: FnOnce(&mut StereoConfig)>(&mut self, what: &str, f: F) -> bool {
        if let Err(e) = self.ensure_idle() {
            self.logger.warn(format!("cannot set {}: {}", what, e));
            return false;
        }

        let mut config = self.config.clone();
        f(&mut config);

        match config.validate().and_then(|_| self.apply_config(config)) {
            Ok(()) => true,
            Err(e) => {
                self.logger.warn(format!("cannot set {}: {}", what, e));
                false
            }
        }
    }

    /// Apply an already validated configuration.
    fn apply_config(&mut self, config: StereoConfig) -> Result<()> {
        let source_changed = config.frame_size != self.config.frame_size
            || config.frame_rate != self.config.frame_rate;

        if source_changed {
            if let Some(ref mut source) = self.parked.lock().source {
                source.configure(config.frame_size, config.frame_rate)?;
            }
        }

        if let Some(level) = logger::level_from_config(config.log_level) {
            self.logger.set_max_level(level);
        }

        let fov_changed = config.longlat_fov != self.config.longlat_fov;
        self.config = config;

        if fov_changed {
            if let Some(calib) = self.calibration.clone() {
                self.rectifier = Some(Arc::new(Rectifier::new(calib, self.config.longlat_fov)));
            }
        }

        Ok(())
    }

    fn install_calibration(&mut self, calibration: StereoCalibration) {
        let calib = Arc::new(calibration);

        self.rectifier = Some(Arc::new(Rectifier::new(calib.clone(), self.config.longlat_fov)));
        self.calibration = Some(calib);
    }

    fn default_udp_sink(&self) -> Result<Box<dyn FrameSink>> {
        let mut sink = UdpFrameSink::new(
            &self.config.transmission,
            self.config.pos_number,
            self.logger.child("udp")
        )?;

        if let Some(ref r) = self.rectifier {
            sink = sink.with_rectifier(r.clone(), self.config.rect_frame_size);
        }

        self.logger.info(format!("transmitting frames to {}", sink.target()));

        Ok(Box::new(sink))
    }

    fn latest<T: Clone>(&self, mailbox: &Mailbox<T>, producing: bool) -> Option<T> {
        if producing {
            mailbox.latest_or_wait(self.config.query_timeout())
        } else {
            mailbox.latest()
        }
    }

    fn query_rectifier(&self) -> Option<&Arc<Rectifier>> {
        if self.rectifier.is_none() {
            self.logger.debug(format!("cannot rectify: {}", Error::MissingCalibration));
        }

        self.rectifier.as_ref()
    }

    fn converter_for(&self, frame: &DisparityFrame) -> Option<DepthConverter> {
        let calib = self.calibration.as_ref()?;
        let rect_size = if frame.is_empty() {
            self.config.rect_frame_size
        } else {
            frame.size()
        };

        Some(DepthConverter::new(
            calib.rect_geometry(self.config.frame_size.single_lens(), rect_size)
        ))
    }

    fn log_query_error<T>(&self, what: &str, result: Result<T>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                self.logger.warn(format!("cannot get {}: {}", what, e));
                None
            }
        }
    }

    fn with_hardware<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn HardwareControl) -> Result<T>
    {
        match *self.hardware.lock() {
            Some(ref mut hw) => f(hw.as_mut()),
            None => Err(Error::HardwareUnavailable)
        }
    }
}

impl Drop for StereoCamera {
    fn drop(&mut self) {
        self.close();
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------
