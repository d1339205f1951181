//! # Calibration Module
//!
//! Per-lens calibration of the stereo module: a Mei (unified omnidirectional) intrinsic model with
//! radial-tangential distortion, the rectifying rotation, the stereo translation and the
//! intrinsic matrix of the rectified perspective view (`kfe`).
//!
//! Calibration is validated when it enters the crate, so the rest of the pipeline can assume
//! well-formed parameters. Malformed input is rejected and leaves the camera without
//! rectification.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::path::Path;

use nalgebra::{DMatrix, Matrix3, Vector3, Vector4};
use serde::{Deserialize, Serialize};

use crate::config::{load_file, save_file};
use crate::error::{Error, Result};
use crate::frame::FrameSize;

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

/// Number of entries in the positional parameter array form.
pub const NUM_CALIB_PARAMS: usize = 6;

/// Tolerance used when checking that a rotation is orthonormal.
const ROTATION_TOLERANCE: f64 = 1e-3;

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// Calibration of a single lens.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationParameters {
    /// Camera intrinsic matrix, in raw single-lens pixels
    pub intrinsic: Matrix3<f64>,

    /// Distortion coefficients `[k1, k2, p1, p2]`
    pub distortion: Vector4<f64>,

    /// Mei model mirror parameter, `0.0` reduces the model to a pinhole
    pub xi: f64,

    /// Rectifying rotation from the lens frame into the rectified frame
    pub rotation: Matrix3<f64>,

    /// Translation between the two lenses, in meters
    pub translation: Vector3<f64>,

    /// Intrinsic matrix of the rectified perspective view, in raw single-lens pixels
    ///
    /// Both perspective views are rendered with the left lens' `kfe`, see
    /// [`StereoCalibration::rect_intrinsic`].
    pub kfe: Matrix3<f64>
}

/// Calibration of both lenses of the module.
#[derive(Debug, Clone, PartialEq)]
pub struct StereoCalibration {
    pub left: CalibrationParameters,

    pub right: CalibrationParameters
}

/// Pinhole geometry of the rectified perspective view at a given output size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RectGeometry {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,

    /// Distance between the two lens centres in meters
    pub baseline: f64
}

/// Which lens of the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lens {
    Left,
    Right
}

/// On-disk form of the calibration, as written by the calibration tooling.
///
/// Matrices are stored as rows so that malformed files deserialise and can be rejected with a
/// useful message instead of a parser error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationFile {
    pub left: LensEntry,

    pub right: LensEntry
}

/// Every parameter of one lens, see [`CalibrationParameters`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LensEntry {
    pub intrinsic: Vec<Vec<f64>>,

    pub distortion: Vec<f64>,

    pub xi: f64,

    pub rotation: Vec<Vec<f64>>,

    /// 3x1
    pub translation: Vec<f64>,

    /// 3x3
    pub kfe: Vec<Vec<f64>>
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl CalibrationParameters {
    /// Parameters for an ideal distortion-free pinhole lens.
    pub fn ideal(focal: f64, principal_point: [f64; 2], translation: Vector3<f64>) -> Self {
        let k = Matrix3::new(
            focal, 0.0, principal_point[0],
            0.0, focal, principal_point[1],
            0.0, 0.0, 1.0
        );

        Self {
            intrinsic: k,
            distortion: Vector4::zeros(),
            xi: 0.0,
            rotation: Matrix3::identity(),
            translation,
            kfe: k
        }
    }

    /// Build the parameters from the positional array
    /// `[intrinsic, distortion, xi, rotation, translation, kfe]`.
    ///
    /// Each entry is checked for its expected shape, vectors may be given as rows or columns.
    pub fn from_matrices(params: &[DMatrix<f64>]) -> Result<Self> {
        if params.len() != NUM_CALIB_PARAMS {
            return Err(Error::CalibParamCountError(params.len()));
        }

        let intrinsic = matrix3_from_dmatrix("intrinsic", &params[0])?;
        let distortion = vector_from_dmatrix("distortion", "1x4 or 4x1", 4, &params[1])?;
        let xi = vector_from_dmatrix("xi", "1x1", 1, &params[2])?[0];
        let rotation = matrix3_from_dmatrix("rotation", &params[3])?;
        let translation = vector_from_dmatrix("translation", "1x3 or 3x1", 3, &params[4])?;
        let kfe = matrix3_from_dmatrix("kfe", &params[5])?;

        let calib = Self {
            intrinsic,
            distortion: Vector4::from_iterator(distortion),
            xi,
            rotation,
            translation: Vector3::from_iterator(translation),
            kfe
        };

        calib.validate()?;

        Ok(calib)
    }

    /// Convert into the positional array form, see [`CalibrationParameters::from_matrices`].
    pub fn to_matrices(&self) -> Vec<DMatrix<f64>> {
        vec![
            DMatrix::from_fn(3, 3, |r, c| self.intrinsic[(r, c)]),
            DMatrix::from_row_slice(1, 4, self.distortion.as_slice()),
            DMatrix::from_element(1, 1, self.xi),
            DMatrix::from_fn(3, 3, |r, c| self.rotation[(r, c)]),
            DMatrix::from_column_slice(3, 1, self.translation.as_slice()),
            DMatrix::from_fn(3, 3, |r, c| self.kfe[(r, c)])
        ]
    }

    /// Check the parameters describe a usable lens.
    pub fn validate(&self) -> Result<()> {
        let finite = self.intrinsic.iter()
            .chain(self.distortion.iter())
            .chain(self.rotation.iter())
            .chain(self.translation.iter())
            .chain(self.kfe.iter())
            .all(|v| v.is_finite());

        if !finite || !self.xi.is_finite() {
            return Err(Error::InvalidCalibration("non-finite value".into()));
        }

        for (name, k) in [("intrinsic", &self.intrinsic), ("kfe", &self.kfe)].iter() {
            if k[(0, 0)] <= 0.0 || k[(1, 1)] <= 0.0 {
                return Err(Error::InvalidCalibration(format!(
                    "{} focal lengths must be positive",
                    name
                )));
            }
        }

        if self.xi < 0.0 {
            return Err(Error::InvalidCalibration(format!("xi must be >= 0, got {}", self.xi)));
        }

        let rtr = self.rotation.transpose() * self.rotation;
        if (rtr - Matrix3::identity()).abs().max() > ROTATION_TOLERANCE {
            return Err(Error::InvalidCalibration("rotation is not orthonormal".into()));
        }

        Ok(())
    }
}

impl StereoCalibration {
    pub fn new(left: CalibrationParameters, right: CalibrationParameters) -> Result<Self> {
        let calib = Self { left, right };
        calib.validate()?;

        Ok(calib)
    }

    /// An ideal rectified rig: identical distortion-free pinhole lenses, centred principal
    /// points, and the right lens `baseline` meters along +x.
    pub fn ideal(lens_size: FrameSize, focal: f64, baseline: f64) -> Self {
        let pp = [lens_size.width as f64 / 2.0, lens_size.height as f64 / 2.0];
        let t = Vector3::new(-baseline, 0.0, 0.0);

        Self {
            left: CalibrationParameters::ideal(focal, pp, t),
            right: CalibrationParameters::ideal(focal, pp, t)
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.left.validate()?;
        self.right.validate()?;

        if self.baseline() <= 0.0 {
            return Err(Error::InvalidCalibration("baseline must be non-zero".into()));
        }

        Ok(())
    }

    pub fn lens(&self, lens: Lens) -> &CalibrationParameters {
        match lens {
            Lens::Left => &self.left,
            Lens::Right => &self.right
        }
    }

    pub fn lens_mut(&mut self, lens: Lens) -> &mut CalibrationParameters {
        match lens {
            Lens::Left => &mut self.left,
            Lens::Right => &mut self.right
        }
    }

    /// Length of the translation between the lenses, in meters.
    pub fn baseline(&self) -> f64 {
        self.right.translation.norm()
    }

    /// Intrinsic of the rectified perspective view, shared by both lenses so that matched rows
    /// and the disparity to depth conversion use one camera model.
    pub fn rect_intrinsic(&self) -> &Matrix3<f64> {
        &self.left.kfe
    }

    /// Geometry of the rectified perspective view when the single-lens raw image of
    /// `lens_size` is rectified to `rect_size`.
    pub fn rect_geometry(&self, lens_size: FrameSize, rect_size: FrameSize) -> RectGeometry {
        let sx = rect_size.width as f64 / lens_size.width as f64;
        let sy = rect_size.height as f64 / lens_size.height as f64;
        let kfe = self.rect_intrinsic();

        RectGeometry {
            fx: kfe[(0, 0)] * sx,
            fy: kfe[(1, 1)] * sy,
            cx: kfe[(0, 2)] * sx,
            cy: kfe[(1, 2)] * sy,
            baseline: self.baseline()
        }
    }

    /// Load calibration from a `.yaml`, `.yml` or `.toml` file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file: CalibrationFile = load_file(path)?;

        Self::from_file_repr(&file)
    }

    /// Save calibration, the format is chosen from the file extension.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        save_file(&self.to_file_repr(), path)
    }

    pub fn from_file_repr(file: &CalibrationFile) -> Result<Self> {
        let lens = |entry: &LensEntry| -> Result<CalibrationParameters> {
            if entry.distortion.len() != 4 {
                return Err(Error::CalibDimensionError {
                    name: "distortion",
                    expected: "1x4",
                    rows: 1,
                    cols: entry.distortion.len()
                });
            }

            Ok(CalibrationParameters {
                intrinsic: matrix3_from_rows("intrinsic", &entry.intrinsic)?,
                distortion: Vector4::from_column_slice(&entry.distortion),
                xi: entry.xi,
                rotation: matrix3_from_rows("rotation", &entry.rotation)?,
                translation: vector3_from_slice("translation", &entry.translation)?,
                kfe: matrix3_from_rows("kfe", &entry.kfe)?
            })
        };

        Self::new(lens(&file.left)?, lens(&file.right)?)
    }

    pub fn to_file_repr(&self) -> CalibrationFile {
        let entry = |p: &CalibrationParameters| LensEntry {
            intrinsic: rows_from_matrix3(&p.intrinsic),
            distortion: p.distortion.iter().cloned().collect(),
            xi: p.xi,
            rotation: rows_from_matrix3(&p.rotation),
            translation: p.translation.iter().cloned().collect(),
            kfe: rows_from_matrix3(&p.kfe)
        };

        CalibrationFile {
            left: entry(&self.left),
            right: entry(&self.right)
        }
    }
}

// -----------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// -----------------------------------------------------------------------------------------------

fn matrix3_from_dmatrix(name: &'static str, m: &DMatrix<f64>) -> Result<Matrix3<f64>> {
    if m.nrows() != 3 || m.ncols() != 3 {
        return Err(Error::CalibDimensionError {
            name,
            expected: "3x3",
            rows: m.nrows(),
            cols: m.ncols()
        });
    }

    Ok(Matrix3::from_fn(|r, c| m[(r, c)]))
}

fn vector_from_dmatrix(
    name: &'static str,
    expected: &'static str,
    len: usize,
    m: &DMatrix<f64>
) -> Result<Vec<f64>> {
    let is_vector = m.nrows() == 1 || m.ncols() == 1;

    if !is_vector || m.len() != len {
        return Err(Error::CalibDimensionError {
            name,
            expected,
            rows: m.nrows(),
            cols: m.ncols()
        });
    }

    Ok(m.iter().cloned().collect())
}

fn matrix3_from_rows(name: &'static str, rows: &[Vec<f64>]) -> Result<Matrix3<f64>> {
    if rows.len() != 3 || rows.iter().any(|r| r.len() != 3) {
        return Err(Error::CalibDimensionError {
            name,
            expected: "3x3",
            rows: rows.len(),
            cols: rows.iter().map(|r| r.len()).max().unwrap_or(0)
        });
    }

    Ok(Matrix3::from_fn(|r, c| rows[r][c]))
}

fn vector3_from_slice(name: &'static str, v: &[f64]) -> Result<Vector3<f64>> {
    if v.len() != 3 {
        return Err(Error::CalibDimensionError {
            name,
            expected: "3x1",
            rows: v.len(),
            cols: 1
        });
    }

    Ok(Vector3::from_column_slice(v))
}

fn rows_from_matrix3(m: &Matrix3<f64>) -> Vec<Vec<f64>> {
    (0..3).map(|r| (0..3).map(|c| m[(r, c)]).collect()).collect()
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------
