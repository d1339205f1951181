//! # Image Rectification Module
//!
//! This module provides rectification of raw stereo frames. For each lens and projection a
//! [`RemapTable`] stores, for every output pixel, the raw pixel it samples. Tables are derived
//! once from the calibration and cached by the [`Rectifier`] until the frame geometry changes,
//! so rectifying a frame only costs one bilinear lookup per pixel.
//!
//! Two projections are supported:
//!
//! - [`ProjectionKind::Perspective`], a linear pinhole view used for disparity matching. Both
//!   lenses share the rectified intrinsic of [`StereoCalibration::rect_intrinsic`].
//! - [`ProjectionKind::LongLat`], a longitude/latitude view covering a wide horizontal field of
//!   view, used for situational views.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::collections::HashMap;
use std::sync::Arc;

use image::{Rgb, RgbImage};
use nalgebra::{Matrix3, Vector3};
use ndarray::Array2;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::calibration::{CalibrationParameters, StereoCalibration};
use crate::error::{Error, Result};
use crate::frame::{FrameSize, RawFrame, RectifiedFramePair};

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

/// Map entry for output pixels with no source pixel.
const NO_SOURCE: f32 = -1.0;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// Output geometry of a rectified view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProjectionKind {
    LongLat,
    Perspective
}

/// Per-pixel source coordinates for one lens and projection.
///
/// Both maps are indexed `[row, col]` in output pixels and hold raw single-lens pixel
/// coordinates.
#[derive(Debug, Clone)]
pub struct RemapTable {
    pub map_x: Array2<f32>,
    pub map_y: Array2<f32>
}

/// Tables for both lenses.
#[derive(Debug, Clone)]
pub struct LensTables {
    pub left: RemapTable,
    pub right: RemapTable
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TableKey {
    kind: ProjectionKind,
    lens_size: FrameSize,
    rect_size: FrameSize
}

/// Rectifies raw frames, building and caching remap tables on demand.
///
/// A rectifier is bound to one calibration. It is shared between the stereo compute loop and
/// query callers. Tables are built outside the cache lock, so a lookup never waits on a build.
pub struct Rectifier {
    calibration: Arc<StereoCalibration>,

    longlat_fov: f64,

    cache: Mutex<HashMap<TableKey, Arc<LensTables>>>
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl RemapTable {
    /// Build the table for one lens.
    ///
    /// `rect_k` is the rectified perspective intrinsic in raw single-lens pixels, `lens_size`
    /// the size of the lens' view in the raw frame, `rect_size` the output size, and
    /// `longlat_fov` the horizontal field of view in degrees of the long-lat projection.
    pub fn build(
        params: &CalibrationParameters,
        rect_k: &Matrix3<f64>,
        kind: ProjectionKind,
        lens_size: FrameSize,
        rect_size: FrameSize,
        longlat_fov: f64
    ) -> Self {
        let rows = rect_size.height as usize;
        let cols = rect_size.width as usize;

        let mut map_x = Array2::from_elem((rows, cols), NO_SOURCE);
        let mut map_y = Array2::from_elem((rows, cols), NO_SOURCE);

        // Rays are generated in the rectified frame, bring them back into the lens frame
        let r_inv = params.rotation.transpose();
        let ray_at = ray_generator(rect_k, kind, lens_size, rect_size, longlat_fov);

        for row in 0..rows {
            for col in 0..cols {
                let ray = r_inv * ray_at(col as f64, row as f64);

                if let Some((u, v)) = project_mei(params, &ray) {
                    map_x[[row, col]] = u as f32;
                    map_y[[row, col]] = v as f32;
                }
            }
        }

        Self { map_x, map_y }
    }

    pub fn size(&self) -> FrameSize {
        let (rows, cols) = self.map_x.dim();
        FrameSize::new(cols as u32, rows as u32)
    }

    /// Resample `src` through the table with bilinear interpolation.
    ///
    /// Output pixels that map outside `src` are black.
    pub fn apply(&self, src: &RgbImage) -> RgbImage {
        let size = self.size();

        RgbImage::from_fn(size.width, size.height, |col, row| {
            let idx = [row as usize, col as usize];
            sample_bilinear(src, self.map_x[idx], self.map_y[idx])
        })
    }
}

impl Rectifier {
    pub fn new(calibration: Arc<StereoCalibration>, longlat_fov: f64) -> Self {
        Self {
            calibration,
            longlat_fov,
            cache: Mutex::new(HashMap::new())
        }
    }

    pub fn calibration(&self) -> &StereoCalibration {
        &self.calibration
    }

    /// Tables for `kind` at the given geometry, built on first use.
    ///
    /// Requesting a new geometry evicts the tables of any other geometry. When two callers
    /// build the same tables at once, both get the ones inserted first.
    pub fn tables(
        &self,
        kind: ProjectionKind,
        lens_size: FrameSize,
        rect_size: FrameSize
    ) -> Arc<LensTables> {
        let key = TableKey { kind, lens_size, rect_size };

        if let Some(tables) = self.cache.lock().get(&key) {
            return tables.clone();
        }

        let rect_k = self.calibration.rect_intrinsic();
        let build = |params: &CalibrationParameters| RemapTable::build(
            params, rect_k, kind, lens_size, rect_size, self.longlat_fov
        );
        let built = Arc::new(LensTables {
            left: build(&self.calibration.left),
            right: build(&self.calibration.right)
        });

        let mut cache = self.cache.lock();
        if let Some(tables) = cache.get(&key) {
            return tables.clone();
        }

        cache.retain(|k, _| k.lens_size == lens_size && k.rect_size == rect_size);
        cache.insert(key, built.clone());

        built
    }

    /// Rectify both views of `frame` with the given projection.
    ///
    /// Fails if `rect_size` is not compatible with the frame's size.
    pub fn rectify(
        &self,
        frame: &RawFrame,
        kind: ProjectionKind,
        rect_size: FrameSize
    ) -> Result<RectifiedFramePair> {
        check_geometry(frame.size(), rect_size)?;

        let lens_size = frame.size().single_lens();
        let tables = self.tables(kind, lens_size, rect_size);
        let (left, right) = frame.split();

        Ok(RectifiedFramePair {
            left: tables.left.apply(&left),
            right: tables.right.apply(&right),
            perspective: None,
            projection: kind,
            timestamp: frame.timestamp
        })
    }

    /// Rectify both views in long-lat projection and the left view in perspective projection,
    /// all from the same raw frame.
    pub fn rectify_with_perspective(
        &self,
        frame: &RawFrame,
        rect_size: FrameSize
    ) -> Result<RectifiedFramePair> {
        let mut pair = self.rectify(frame, ProjectionKind::LongLat, rect_size)?;

        let lens_size = frame.size().single_lens();
        let tables = self.tables(ProjectionKind::Perspective, lens_size, rect_size);
        let (left, _) = frame.split();
        pair.perspective = Some(tables.left.apply(&left));

        Ok(pair)
    }
}

// -----------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// -----------------------------------------------------------------------------------------------

/// Check that rectified views of `rect_size` can be produced from raw frames of `raw_size`.
///
/// The rectified size must be strictly smaller than one lens' view in both dimensions and keep
/// its aspect ratio.
pub fn check_geometry(raw_size: FrameSize, rect_size: FrameSize) -> Result<()> {
    let lens = raw_size.single_lens();

    if lens.is_empty() || rect_size.is_empty() {
        return Err(Error::InvalidGeometry(format!(
            "empty frame size, raw {} rect {}",
            raw_size, rect_size
        )));
    }

    if rect_size.width >= lens.width || rect_size.height >= lens.height {
        return Err(Error::InvalidGeometry(format!(
            "rectified size {} must be smaller than the single lens size {}",
            rect_size, lens
        )));
    }

    let lhs = rect_size.width as u64 * lens.height as u64;
    let rhs = rect_size.height as u64 * lens.width as u64;
    if lhs != rhs {
        return Err(Error::InvalidGeometry(format!(
            "rectified size {} does not keep the aspect ratio of the single lens size {}",
            rect_size, lens
        )));
    }

    Ok(())
}

// -----------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// -----------------------------------------------------------------------------------------------

/// Returns a closure mapping an output pixel to a viewing ray in the rectified frame.
fn ray_generator(
    rect_k: &Matrix3<f64>,
    kind: ProjectionKind,
    lens_size: FrameSize,
    rect_size: FrameSize,
    longlat_fov: f64
) -> Box<dyn Fn(f64, f64) -> Vector3<f64>> {
    match kind {
        ProjectionKind::Perspective => {
            let sx = rect_size.width as f64 / lens_size.width as f64;
            let sy = rect_size.height as f64 / lens_size.height as f64;
            let k_new = Matrix3::new(
                rect_k[(0, 0)] * sx, rect_k[(0, 1)] * sx, rect_k[(0, 2)] * sx,
                0.0, rect_k[(1, 1)] * sy, rect_k[(1, 2)] * sy,
                0.0, 0.0, 1.0
            );
            // Focal lengths are validated positive, so this is invertible
            let k_inv = k_new.try_inverse().unwrap_or_else(Matrix3::identity);

            Box::new(move |u, v| k_inv * Vector3::new(u, v, 1.0))
        },
        ProjectionKind::LongLat => {
            let hfov = longlat_fov.to_radians();
            // Keep square pixels in angle
            let vfov = hfov * rect_size.height as f64 / rect_size.width as f64;
            let w = rect_size.width as f64;
            let h = rect_size.height as f64;

            Box::new(move |u, v| {
                let lon = (u + 0.5) / w * hfov - hfov / 2.0;
                let lat = (v + 0.5) / h * vfov - vfov / 2.0;
                Vector3::new(lon.sin() * lat.cos(), lat.sin(), lon.cos() * lat.cos())
            })
        }
    }
}

/// Project a ray in the lens frame to raw pixel coordinates with the Mei model.
fn project_mei(params: &CalibrationParameters, ray: &Vector3<f64>) -> Option<(f64, f64)> {
    let norm = ray.norm();
    if norm <= f64::EPSILON {
        return None;
    }
    let xs = ray / norm;

    let denom = xs.z + params.xi;
    if denom <= 1e-9 {
        return None;
    }

    let xu = xs.x / denom;
    let yu = xs.y / denom;

    let (k1, k2, p1, p2) = (
        params.distortion[0],
        params.distortion[1],
        params.distortion[2],
        params.distortion[3]
    );
    let r2 = xu * xu + yu * yu;
    let radial = 1.0 + k1 * r2 + k2 * r2 * r2;
    let xd = xu * radial + 2.0 * p1 * xu * yu + p2 * (r2 + 2.0 * xu * xu);
    let yd = yu * radial + p1 * (r2 + 2.0 * yu * yu) + 2.0 * p2 * xu * yu;

    let k = &params.intrinsic;
    let u = k[(0, 0)] * xd + k[(0, 1)] * yd + k[(0, 2)];
    let v = k[(1, 1)] * yd + k[(1, 2)];

    if u.is_finite() && v.is_finite() {
        Some((u, v))
    } else {
        None
    }
}

fn sample_bilinear(src: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (w, h) = src.dimensions();

    if x < 0.0 || y < 0.0 || x > (w - 1) as f32 || y > (h - 1) as f32 {
        return Rgb([0, 0, 0]);
    }

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = src.get_pixel(x0, y0);
    let p10 = src.get_pixel(x1, y0);
    let p01 = src.get_pixel(x0, y1);
    let p11 = src.get_pixel(x1, y1);

    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round().min(255.0) as u8;
    }

    Rgb(out)
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {

    use super::*;
    use crate::frame::Timestamp;
    use approx::assert_relative_eq;

    const RAW: FrameSize = FrameSize::new(320, 120);
    const RECT: FrameSize = FrameSize::new(80, 60);

    fn rectifier() -> Rectifier {
        let calib = StereoCalibration::ideal(RAW.single_lens(), 100.0, 0.08);
        Rectifier::new(Arc::new(calib), 180.0)
    }

    fn gradient_frame() -> RawFrame {
        let lens = RAW.single_lens();
        let view = RgbImage::from_fn(lens.width, lens.height, |x, y| {
            Rgb([x as u8, y as u8, 128])
        });

        RawFrame::from_views(&view, &view, Timestamp::from_micros(77))
    }

    #[test]
    fn output_has_configured_size_for_both_projections() {
        let rect = rectifier();
        let frame = gradient_frame();

        for kind in [ProjectionKind::Perspective, ProjectionKind::LongLat].iter() {
            let pair = rect.rectify(&frame, *kind, RECT).unwrap();
            assert_eq!(pair.size(), RECT);
            assert_eq!(pair.right.dimensions(), (RECT.width, RECT.height));
            assert_eq!(pair.projection, *kind);
            assert_eq!(pair.timestamp, frame.timestamp);
        }

        let pair = rect.rectify_with_perspective(&frame, RECT).unwrap();
        assert_eq!(pair.projection, ProjectionKind::LongLat);
        let persp = pair.perspective.unwrap();
        assert_eq!(persp.dimensions(), (RECT.width, RECT.height));
    }

    #[test]
    fn ideal_perspective_is_a_downscale() {
        let calib = StereoCalibration::ideal(RAW.single_lens(), 100.0, 0.08);
        let table = RemapTable::build(
            &calib.left,
            calib.rect_intrinsic(),
            ProjectionKind::Perspective,
            RAW.single_lens(),
            RECT,
            180.0
        );

        // Half resolution output samples every other raw pixel
        assert_relative_eq!(table.map_x[[10, 7]], 14.0, epsilon = 1e-3);
        assert_relative_eq!(table.map_y[[10, 7]], 20.0, epsilon = 1e-3);

        let pair = rectifier()
            .rectify(&gradient_frame(), ProjectionKind::Perspective, RECT)
            .unwrap();
        assert_eq!(pair.left.get_pixel(7, 10), &Rgb([14, 20, 128]));
    }

    #[test]
    fn tables_are_cached_per_geometry() {
        let rect = rectifier();
        let a = rect.tables(ProjectionKind::Perspective, RAW.single_lens(), RECT);
        let b = rect.tables(ProjectionKind::Perspective, RAW.single_lens(), RECT);
        assert!(Arc::ptr_eq(&a, &b));

        let smaller = FrameSize::new(40, 30);
        let c = rect.tables(ProjectionKind::Perspective, RAW.single_lens(), smaller);
        assert_eq!(c.left.size(), smaller);
        assert_eq!(rect.cache.lock().len(), 1);
    }

    #[test]
    fn incompatible_geometry_fails_closed() {
        let rect = rectifier();
        let frame = gradient_frame();

        // Not smaller than the lens view
        assert!(rect.rectify(&frame, ProjectionKind::Perspective, RAW.single_lens()).is_err());
        // Aspect ratio differs
        assert!(rect.rectify(&frame, ProjectionKind::Perspective, FrameSize::new(80, 50)).is_err());
        assert!(check_geometry(RAW, FrameSize::new(0, 0)).is_err());
        assert!(check_geometry(FrameSize::new(1856, 800), FrameSize::new(464, 400)).is_ok());
    }

    #[test]
    fn longlat_centre_looks_down_the_optical_axis() {
        let calib = StereoCalibration::ideal(RAW.single_lens(), 100.0, 0.08);
        let table = RemapTable::build(
            &calib.left,
            calib.rect_intrinsic(),
            ProjectionKind::LongLat,
            RAW.single_lens(),
            FrameSize::new(81, 61),
            90.0
        );

        assert_relative_eq!(table.map_x[[30, 40]], 80.0, epsilon = 1e-3);
        assert_relative_eq!(table.map_y[[30, 40]], 60.0, epsilon = 1e-3);
    }

    #[test]
    fn both_lenses_share_the_rectified_intrinsic() {
        let mut calib = StereoCalibration::ideal(RAW.single_lens(), 100.0, 0.08);
        calib.right.kfe[(0, 0)] = 130.0;
        calib.right.kfe[(1, 1)] = 130.0;
        let rect = Rectifier::new(Arc::new(calib), 180.0);

        let tables = rect.tables(ProjectionKind::Perspective, RAW.single_lens(), RECT);
        for (l, r) in tables.left.map_x.iter().zip(tables.right.map_x.iter()) {
            assert_relative_eq!(*l, *r, epsilon = 1e-4);
        }
        for (l, r) in tables.left.map_y.iter().zip(tables.right.map_y.iter()) {
            assert_relative_eq!(*l, *r, epsilon = 1e-4);
        }
    }

    #[test]
    fn concurrent_builds_agree_on_one_table() {
        let rect = Arc::new(rectifier());
        let big = FrameSize::new(1856, 800);
        let rect_size = FrameSize::new(464, 400);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let rect = rect.clone();
                std::thread::spawn(move || {
                    rect.tables(ProjectionKind::LongLat, big.single_lens(), rect_size)
                })
            })
            .collect();
        let tables: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(tables.iter().all(|t| Arc::ptr_eq(t, &tables[0])));
        let cached = rect.tables(ProjectionKind::LongLat, big.single_lens(), rect_size);
        assert!(Arc::ptr_eq(&cached, &tables[0]));
        assert_eq!(rect.cache.lock().len(), 1);
    }
}
