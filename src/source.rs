//! # Frame Source Module
//!
//! Abstraction over the device raw frames are pulled from. The capture loop owns exactly one
//! [`FrameSource`] and only ever talks to the device through it, so the pipeline does not care
//! whether frames come from a V4L2 node or are generated in memory.
//!
//! Two sources ship with the crate:
//!
//! - [`SyntheticSource`], a deterministic textured scene with a known constant disparity, used to
//!   run the pipeline without hardware.
//! - `V4l2Source`, available with the `v4l2` feature, which reads MJPG frames from a
//!   `/dev/videoN` node using [`rscam`](https://github.com/loyd/rscam).

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::io;
use std::thread;
use std::time::{Duration, Instant};

use image::{Rgb, RgbImage};

use crate::error::{Error, Result};
use crate::frame::{FrameSize, RawFrame, Timestamp};

// -----------------------------------------------------------------------------------------------
// TRAITS
// -----------------------------------------------------------------------------------------------

/// A device producing interleaved stereo frames at a fixed size and rate.
///
/// `read` must return within a bounded time, failing rather than blocking on a dead device.
pub trait FrameSource: Send {
    /// Open the underlying device.
    fn open(&mut self) -> Result<()>;

    fn is_opened(&self) -> bool;

    /// Read the next raw frame.
    fn read(&mut self) -> Result<RgbImage>;

    /// Release the underlying device, does nothing if it is not open.
    fn close(&mut self);

    fn frame_size(&self) -> FrameSize;

    fn frame_rate(&self) -> f32;

    /// Change the size and rate frames are produced at.
    ///
    /// An open source is restarted with the new settings.
    fn configure(&mut self, size: FrameSize, rate: f32) -> Result<()>;

    /// Human readable name of the device, used in log messages.
    fn describe(&self) -> String;
}

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// In-memory source rendering a random-dot scene seen by both lenses.
///
/// The right view is the left view shifted by a fixed number of raw pixels, so the true
/// disparity of every pixel is known.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    size: FrameSize,
    rate: f32,

    disparity: u32,

    frame: Option<RgbImage>,

    last_read: Option<Instant>,
    reads: u64,

    dropout_every: Option<u64>,
    disconnect_after: Option<u64>
}

/// Source reading MJPG frames from a V4L2 device node.
#[cfg(feature = "v4l2")]
pub struct V4l2Source {
    device_node: u32,

    size: FrameSize,
    rate: f32,

    camera: Option<rscam::Camera>
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl SyntheticSource {
    /// A textured scene at `size` and `rate`, with the right view shifted by `disparity` raw
    /// pixels.
    pub fn textured(size: FrameSize, rate: f32, disparity: u32) -> Self {
        Self {
            size,
            rate,
            disparity,
            frame: None,
            last_read: None,
            reads: 0,
            dropout_every: None,
            disconnect_after: None
        }
    }

    /// Fail every `every`th read, as a device occasionally timing out would.
    pub fn with_dropouts(mut self, every: u64) -> Self {
        self.dropout_every = Some(every.max(1));

        self
    }

    /// Behave as an unplugged device once `reads` frames have been read: reads and reopens
    /// fail from then on.
    pub fn disconnect_after(mut self, reads: u64) -> Self {
        self.disconnect_after = Some(reads);

        self
    }

    pub fn disparity(&self) -> u32 {
        self.disparity
    }

    /// Number of read attempts since the source was created.
    pub fn reads(&self) -> u64 {
        self.reads
    }

    /// Render the raw frame this source produces.
    pub fn render(&self) -> RgbImage {
        let lens = self.size.single_lens();
        let d = self.disparity;

        let left = RgbImage::from_fn(lens.width, lens.height, |x, y| texture(x, y));
        let right = RgbImage::from_fn(lens.width, lens.height, |x, y| texture(x + d, y));

        RawFrame::from_views(&left, &right, Timestamp::default()).image
    }

    fn disconnected(&self) -> bool {
        match self.disconnect_after {
            Some(n) => self.reads >= n,
            None => false
        }
    }

    fn pace(&mut self) {
        if self.rate > 0.0 {
            let period = Duration::from_secs_f32(1.0 / self.rate);
            if let Some(last) = self.last_read {
                let elapsed = last.elapsed();
                if elapsed < period {
                    thread::sleep(period - elapsed);
                }
            }
        }

        self.last_read = Some(Instant::now());
    }
}

impl FrameSource for SyntheticSource {
    fn open(&mut self) -> Result<()> {
        if self.disconnected() {
            return Err(Error::DeviceOpenError(format!("{} is disconnected", self.describe())));
        }

        if self.frame.is_none() {
            self.frame = Some(self.render());
        }

        Ok(())
    }

    fn is_opened(&self) -> bool {
        self.frame.is_some()
    }

    fn read(&mut self) -> Result<RgbImage> {
        if self.frame.is_none() {
            return Err(Error::DeviceNotOpen);
        }

        self.pace();
        self.reads += 1;

        if self.disconnected() {
            self.frame = None;
            return Err(Error::CameraCaptureError(io::Error::new(
                io::ErrorKind::NotConnected,
                "device disconnected"
            )));
        }

        if let Some(every) = self.dropout_every {
            if self.reads % every == 0 {
                return Err(Error::CameraCaptureError(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "read timed out"
                )));
            }
        }

        self.frame.clone().ok_or(Error::DeviceNotOpen)
    }

    fn close(&mut self) {
        self.frame = None;
        self.last_read = None;
    }

    fn frame_size(&self) -> FrameSize {
        self.size
    }

    fn frame_rate(&self) -> f32 {
        self.rate
    }

    fn configure(&mut self, size: FrameSize, rate: f32) -> Result<()> {
        self.size = size;
        self.rate = rate;

        if self.is_opened() {
            self.frame = Some(self.render());
        }

        Ok(())
    }

    fn describe(&self) -> String {
        format!("synthetic source {}@{}fps", self.size, self.rate)
    }
}

#[cfg(feature = "v4l2")]
impl V4l2Source {
    pub fn new(device_node: u32, size: FrameSize, rate: f32) -> Self {
        Self {
            device_node,
            size,
            rate,
            camera: None
        }
    }

    pub fn path(&self) -> String {
        format!("/dev/video{}", self.device_node)
    }
}

#[cfg(feature = "v4l2")]
impl FrameSource for V4l2Source {
    fn open(&mut self) -> Result<()> {
        if self.camera.is_some() {
            return Ok(());
        }

        let mut camera = rscam::Camera::new(&self.path())
            .map_err(|e| Error::DeviceOpenError(format!("{}: {}", self.path(), e)))?;

        camera.start(&rscam::Config {
            interval: (1, self.rate.round().max(1.0) as u32),
            resolution: (self.size.width, self.size.height),
            format: b"MJPG",
            ..Default::default()
        }).map_err(|e| Error::DeviceOpenError(format!("{}: {}", self.path(), e)))?;

        self.camera = Some(camera);

        Ok(())
    }

    fn is_opened(&self) -> bool {
        self.camera.is_some()
    }

    fn read(&mut self) -> Result<RgbImage> {
        let camera = self.camera.as_ref().ok_or(Error::DeviceNotOpen)?;

        let frame = camera.capture().map_err(Error::CameraCaptureError)?;

        let img = image::load_from_memory_with_format(&frame[..], image::ImageFormat::Jpeg)
            .map_err(Error::ImageConversionError)?;

        Ok(img.to_rgb8())
    }

    fn close(&mut self) {
        if let Some(mut camera) = self.camera.take() {
            camera.stop().ok();
        }
    }

    fn frame_size(&self) -> FrameSize {
        self.size
    }

    fn frame_rate(&self) -> f32 {
        self.rate
    }

    fn configure(&mut self, size: FrameSize, rate: f32) -> Result<()> {
        self.size = size;
        self.rate = rate;

        if self.is_opened() {
            self.close();
            self.open()?;
        }

        Ok(())
    }

    fn describe(&self) -> String {
        format!("{} {}@{}fps", self.path(), self.size, self.rate)
    }
}

// -----------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// -----------------------------------------------------------------------------------------------

/// Grey random-dot texture, constant across the three channels.
fn texture(x: u32, y: u32) -> Rgb<u8> {
    let mut h = (x as u64) << 32 | y as u64;
    h = h.wrapping_add(0x9E37_79B9_7F4A_7C15);
    h = (h ^ (h >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    h = (h ^ (h >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    h ^= h >> 31;

    let v = (h & 0xff) as u8;
    Rgb([v, v, v])
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------
