//! # Frame Module
//!
//! Data types passed between the capture loop, the stereo compute loop and callers. Every derived
//! frame carries the [`Timestamp`] of the raw frame it was computed from.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use derive_more::{Deref, Display, From, Into};
use image::{imageops, GrayImage, Rgb, RgbImage};
use nalgebra::Point3;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::depth::DepthRange;
use crate::remap::ProjectionKind;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// Width and height of an image in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display(fmt = "{}x{}", width, height)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32
}

/// Capture time in microseconds since the UNIX epoch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, From, Into, Display
)]
#[display(fmt = "{}us", _0)]
pub struct Timestamp(u64);

/// One interleaved left+right image straight from the capture device.
///
/// The device places the right lens in the left half of the image and the left lens in the right
/// half, use [`RawFrame::split`] to get the views the right way round.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub image: RgbImage,

    pub timestamp: Timestamp
}

/// Unrectified left and right views of a raw frame.
#[derive(Debug, Clone)]
pub struct StereoFrame {
    /// The left image
    pub left: RgbImage,

    /// The right image
    pub right: RgbImage,

    /// The timestamp of the raw frame both images were cut from
    pub timestamp: Timestamp
}

/// Geometrically corrected left and right views.
#[derive(Debug, Clone)]
pub struct RectifiedFramePair {
    pub left: RgbImage,

    pub right: RgbImage,

    /// Left view in perspective projection, only present when `left` and `right` use the
    /// long-lat projection and the perspective view was requested alongside.
    pub perspective: Option<RgbImage>,

    /// Projection used for `left` and `right`.
    pub projection: ProjectionKind,

    pub timestamp: Timestamp
}

/// Disparity map computed from one rectified perspective pair.
///
/// Pixels with no reliable match, or whose depth falls outside `depth_range`, hold
/// [`INVALID_DISPARITY`]. A frame with no valid pixel at all is published with an empty map.
#[derive(Debug, Clone)]
pub struct DisparityFrame {
    pub disparity: Array2<f32>,

    /// Left rectified view the disparity is registered to, used to colour point clouds.
    pub reference: RgbImage,

    pub depth_range: DepthRange,

    pub timestamp: Timestamp
}

/// Depth image, either metric or colourised for display.
#[derive(Debug, Clone)]
pub enum DepthImage {
    /// Depth in meters, `0.0` where there is no valid depth.
    Metric(Array2<f32>),

    /// Depth mapped onto a colour gradient between the near and far bound, invalid pixels black.
    Colored(RgbImage)
}

#[derive(Debug, Clone)]
pub struct DepthFrame {
    pub image: DepthImage,

    pub timestamp: Timestamp
}

/// A 3D point with the colour of the pixel it was reconstructed from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColoredPoint {
    pub position: Point3<f32>,

    pub color: Rgb<u8>
}

/// Points in camera-centered meters, x right, y down, z forward.
#[derive(Debug, Clone, Deref)]
pub struct PointCloud<P> {
    #[deref]
    pub points: Vec<P>,

    pub timestamp: Timestamp
}

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

/// Value marking a pixel without a usable disparity.
pub const INVALID_DISPARITY: f32 = 0.0;

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl FrameSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Size of one lens' view inside an interleaved raw frame of this size.
    pub fn single_lens(&self) -> Self {
        Self::new(self.width / 2, self.height)
    }

    pub fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl Timestamp {
    /// The current wall-clock time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);

        Self(micros)
    }

    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    pub fn as_micros(self) -> u64 {
        self.0
    }

    /// Time elapsed between this timestamp and now, zero if this timestamp is in the future.
    pub fn age(self) -> Duration {
        Duration::from_micros(Self::now().0.saturating_sub(self.0))
    }
}

impl RawFrame {
    pub fn size(&self) -> FrameSize {
        FrameSize::new(self.image.width(), self.image.height())
    }

    pub fn is_empty(&self) -> bool {
        self.size().is_empty()
    }

    /// Cut the raw frame into its `(left, right)` lens views.
    pub fn split(&self) -> (RgbImage, RgbImage) {
        let lens = self.size().single_lens();

        let right = imageops::crop_imm(&self.image, 0, 0, lens.width, lens.height).to_image();
        let left = imageops::crop_imm(&self.image, lens.width, 0, lens.width, lens.height)
            .to_image();

        (left, right)
    }

    /// Build a raw frame from separate lens views, placing them the way the device does.
    pub fn from_views(left: &RgbImage, right: &RgbImage, timestamp: Timestamp) -> Self {
        Self {
            image: hconcat(right, left),
            timestamp
        }
    }

    pub fn to_stereo_frame(&self) -> StereoFrame {
        let (left, right) = self.split();

        StereoFrame {
            left,
            right,
            timestamp: self.timestamp
        }
    }
}

impl RectifiedFramePair {
    pub fn size(&self) -> FrameSize {
        FrameSize::new(self.left.width(), self.left.height())
    }

    /// Convert the pair into luma images, as consumed by the block matcher.
    pub fn to_luma8_pair(&self) -> (GrayImage, GrayImage) {
        (imageops::grayscale(&self.left), imageops::grayscale(&self.right))
    }
}

impl DisparityFrame {
    /// A frame for a cycle that produced no reliable matches.
    pub fn empty(timestamp: Timestamp, depth_range: DepthRange) -> Self {
        Self {
            disparity: Array2::zeros((0, 0)),
            reference: RgbImage::new(0, 0),
            depth_range,
            timestamp
        }
    }

    pub fn is_empty(&self) -> bool {
        self.disparity.is_empty()
    }

    pub fn size(&self) -> FrameSize {
        let (rows, cols) = self.disparity.dim();
        FrameSize::new(cols as u32, rows as u32)
    }

    /// Number of pixels holding a valid disparity.
    pub fn valid_count(&self) -> usize {
        self.disparity.iter().filter(|d| is_valid_disparity(**d)).count()
    }
}

impl DepthFrame {
    pub fn is_empty(&self) -> bool {
        match self.image {
            DepthImage::Metric(ref m) => m.is_empty(),
            DepthImage::Colored(ref c) => c.width() == 0 || c.height() == 0
        }
    }
}

impl<P> PointCloud<P> {
    pub fn empty(timestamp: Timestamp) -> Self {
        Self {
            points: Vec::new(),
            timestamp
        }
    }
}

// -----------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// -----------------------------------------------------------------------------------------------

pub fn is_valid_disparity(d: f32) -> bool {
    d.is_finite() && d > INVALID_DISPARITY
}

/// Place `left` and `right` side by side in a new image.
pub fn hconcat(left: &RgbImage, right: &RgbImage) -> RgbImage {
    let mut out = RgbImage::new(
        left.width() + right.width(),
        left.height().max(right.height())
    );

    imageops::replace(&mut out, left, 0, 0);
    imageops::replace(&mut out, right, left.width() as i64, 0);

    out
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------
