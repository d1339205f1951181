//! # Depth Module
//!
//! Conversion of disparity frames into metric depth images and point clouds.
//!
//! With a rectified perspective pair of focal length `fx` and baseline `B`, a pixel with
//! disparity `d` lies at depth `Z = fx * B / d`. The point is then unprojected through the
//! rectified pinhole:
//!
//! ```text
//! X = (u - cx) * Z / fx
//! Y = (v - cy) * Z / fy
//! ```

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use image::{Rgb, RgbImage};
use nalgebra::Point3;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::calibration::RectGeometry;
use crate::error::{Error, Result};
use crate::frame::{
    is_valid_disparity, ColoredPoint, DepthFrame, DepthImage, DisparityFrame, PointCloud
};

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// Near and far bound of the depths reported by the camera, in meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DepthRange {
    pub min: f32,
    pub max: f32
}

/// Converts disparities measured in a rectified perspective view into metric quantities.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthConverter {
    geometry: RectGeometry
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl Default for DepthRange {
    fn default() -> Self {
        Self {
            min: 0.05,
            max: 1.0
        }
    }
}

impl DepthRange {
    pub fn new(min: f32, max: f32) -> Result<Self> {
        let range = Self { min, max };
        range.validate()?;

        Ok(range)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.min > 0.0) || !(self.max > self.min) || !self.max.is_finite() {
            return Err(Error::InvalidSetting(format!(
                "depth range must satisfy 0 < min < max, got [{}, {}]",
                self.min, self.max
            )));
        }

        Ok(())
    }

    /// Returns true if `depth` lies within the range, bounds included.
    pub fn contains(&self, depth: f32) -> bool {
        depth >= self.min && depth <= self.max
    }
}

impl DepthConverter {
    pub fn new(geometry: RectGeometry) -> Self {
        Self { geometry }
    }

    pub fn geometry(&self) -> &RectGeometry {
        &self.geometry
    }

    /// Depth in meters of a disparity in pixels, `None` for invalid disparities.
    pub fn depth_at(&self, disparity: f32) -> Option<f32> {
        if !is_valid_disparity(disparity) {
            return None;
        }

        Some((self.geometry.fx * self.geometry.baseline / disparity as f64) as f32)
    }

    /// Disparity in pixels at which a point `depth` meters away is seen.
    pub fn disparity_at(&self, depth: f32) -> f32 {
        (self.geometry.fx * self.geometry.baseline / depth as f64) as f32
    }

    /// `(min, max)` disparities of points within `range`.
    pub fn disparity_limits(&self, range: &DepthRange) -> (f32, f32) {
        (self.disparity_at(range.max), self.disparity_at(range.min))
    }

    /// Camera-frame position of pixel `(u, v)` seen at `depth`.
    pub fn unproject(&self, u: f32, v: f32, depth: f32) -> Point3<f32> {
        let g = &self.geometry;
        let z = depth as f64;

        Point3::new(
            ((u as f64 - g.cx) * z / g.fx) as f32,
            ((v as f64 - g.cy) * z / g.fy) as f32,
            depth
        )
    }

    /// Depth image of a disparity frame.
    ///
    /// Pixels without a valid depth within the frame's range are `0.0` in a metric image and
    /// black in a coloured one.
    pub fn to_depth(&self, frame: &DisparityFrame, colorize: bool) -> DepthFrame {
        let (rows, cols) = frame.disparity.dim();
        let range = frame.depth_range;

        let metric = Array2::from_shape_fn((rows, cols), |idx| {
            match self.depth_at(frame.disparity[idx]) {
                Some(z) if range.contains(z) => z,
                _ => 0.0
            }
        });

        let image = if colorize {
            DepthImage::Colored(RgbImage::from_fn(cols as u32, rows as u32, |x, y| {
                let z = metric[[y as usize, x as usize]];
                if z > 0.0 {
                    jet((z - range.min) / (range.max - range.min))
                } else {
                    Rgb([0, 0, 0])
                }
            }))
        } else {
            DepthImage::Metric(metric)
        };

        DepthFrame {
            image,
            timestamp: frame.timestamp
        }
    }

    /// Points of every pixel with a valid depth inside the frame's range.
    pub fn to_point_cloud(&self, frame: &DisparityFrame) -> PointCloud<Point3<f32>> {
        PointCloud {
            points: self.points(frame).map(|(p, _, _)| p).collect(),
            timestamp: frame.timestamp
        }
    }

    /// As [`DepthConverter::to_point_cloud`], each point carrying the colour of its pixel in the
    /// frame's reference view.
    pub fn to_colored_point_cloud(&self, frame: &DisparityFrame) -> PointCloud<ColoredPoint> {
        let (ref_w, ref_h) = frame.reference.dimensions();

        let points = self.points(frame)
            .map(|(position, u, v)| {
                let color = if u < ref_w && v < ref_h {
                    *frame.reference.get_pixel(u, v)
                } else {
                    Rgb([0, 0, 0])
                };

                ColoredPoint { position, color }
            })
            .collect();

        PointCloud {
            points,
            timestamp: frame.timestamp
        }
    }

    fn points<'a>(
        &'a self,
        frame: &'a DisparityFrame
    ) -> impl Iterator<Item = (Point3<f32>, u32, u32)> + 'a {
        let range = frame.depth_range;

        frame.disparity.indexed_iter().filter_map(move |((row, col), d)| {
            let z = self.depth_at(*d).filter(|z| range.contains(*z))?;

            Some((self.unproject(col as f32, row as f32, z), col as u32, row as u32))
        })
    }
}

// -----------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// -----------------------------------------------------------------------------------------------

/// Jet colour map, `t` in `[0, 1]` from blue (near) to red (far).
fn jet(t: f32) -> Rgb<u8> {
    let t = t.max(0.0).min(1.0);
    let channel = |offset: f32| {
        let v = 1.5 - (4.0 * t - offset).abs();
        (v.max(0.0).min(1.0) * 255.0).round() as u8
    };

    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------
