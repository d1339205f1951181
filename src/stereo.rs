//! # Stereo Matching Module
//!
//! Dense disparity estimation on rectified perspective pairs, and the stereo compute loop that
//! turns each new raw frame into a published [`DisparityFrame`].
//!
//! Matching is a sum-of-absolute-differences block matcher searching along the rows of the left
//! view. A match is kept only if the block carries enough texture and if no other disparity, apart
//! from the immediate neighbours of the best one, scores nearly as well. Kept matches are refined
//! to subpixel precision by fitting a parabola through the costs around the minimum.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::GrayImage;
use ndarray::Array2;
#[cfg(feature = "rayon")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::depth::{DepthConverter, DepthRange};
use crate::error::{Error, Result};
use crate::frame::{DisparityFrame, FrameSize, RawFrame, INVALID_DISPARITY};
use crate::logger::Logger;
use crate::mailbox::Mailbox;
use crate::remap::{ProjectionKind, Rectifier};

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// Parameters of the block matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StereoParams {
    /// Number of disparities searched, `0..search_radius` pixels
    pub search_radius: u32,

    /// Side of the square matching window, odd
    pub block_size: u32,

    /// Margin in percent by which the best cost must beat every non-adjacent disparity
    pub uniqueness_ratio: u32,

    /// Minimum sum of absolute horizontal gradients inside the window
    pub texture_threshold: u32
}

/// Sum-of-absolute-differences block matcher.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockMatcher {
    params: StereoParams
}

/// Everything the stereo compute loop needs, moved onto its thread.
pub(crate) struct ComputeContext {
    pub rectifier: Arc<Rectifier>,
    pub matcher: BlockMatcher,

    pub rect_size: FrameSize,
    pub depth_range: DepthRange,

    pub raw: Arc<Mailbox<RawFrame>>,
    pub disparity: Arc<Mailbox<DisparityFrame>>,

    /// Cleared by the capture loop when the device is lost, which ends this loop
    pub device_ok: Arc<AtomicBool>,

    pub wait_timeout: Duration,

    pub logger: Logger
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl Default for StereoParams {
    fn default() -> Self {
        Self {
            search_radius: 64,
            block_size: 9,
            uniqueness_ratio: 10,
            texture_threshold: 120
        }
    }
}

impl StereoParams {
    pub fn validate(&self) -> Result<()> {
        if self.search_radius < 2 {
            return Err(Error::InvalidSetting(format!(
                "search_radius must be at least 2, got {}",
                self.search_radius
            )));
        }

        if self.block_size < 3 || self.block_size % 2 == 0 {
            return Err(Error::InvalidSetting(format!(
                "block_size must be odd and at least 3, got {}",
                self.block_size
            )));
        }

        if self.uniqueness_ratio >= 100 {
            return Err(Error::InvalidSetting(format!(
                "uniqueness_ratio must be below 100, got {}",
                self.uniqueness_ratio
            )));
        }

        Ok(())
    }
}

impl BlockMatcher {
    pub fn new(params: StereoParams) -> Result<Self> {
        params.validate()?;

        Ok(Self { params })
    }

    pub fn params(&self) -> &StereoParams {
        &self.params
    }

    /// Disparity of every pixel of `left`, [`INVALID_DISPARITY`] where no reliable match is
    /// found.
    ///
    /// Both images must have the same size.
    pub fn compute(&self, left: &GrayImage, right: &GrayImage) -> Result<Array2<f32>> {
        if left.dimensions() != right.dimensions() {
            return Err(Error::InvalidGeometry(format!(
                "left view is {:?} but right view is {:?}",
                left.dimensions(),
                right.dimensions()
            )));
        }

        let (w, h) = (left.width() as usize, left.height() as usize);

        #[cfg(feature = "rayon")]
        let rows: Vec<Vec<f32>> = (0..h)
            .into_par_iter()
            .map(|y| self.match_row(left, right, y))
            .collect();

        #[cfg(not(feature = "rayon"))]
        let rows: Vec<Vec<f32>> = (0..h)
            .map(|y| self.match_row(left, right, y))
            .collect();

        let data = rows.into_iter().flatten().collect();

        Array2::from_shape_vec((h, w), data)
            .map_err(|e| Error::InvalidGeometry(e.to_string()))
    }

    fn match_row(&self, left: &GrayImage, right: &GrayImage, y: usize) -> Vec<f32> {
        let (w, h) = (left.width() as usize, left.height() as usize);
        let half = (self.params.block_size / 2) as usize;
        let num_disp = self.params.search_radius as usize;

        let mut out = vec![INVALID_DISPARITY; w];

        if y < half || y + half >= h || w < 2 * half + 2 {
            return out;
        }

        let l = left.as_raw();
        let r = right.as_raw();
        let px = |img: &[u8], x: usize, yy: usize| img[yy * w + x] as i32;

        // Texture of every window centred on this row
        let mut grad_cols = vec![0u32; w];
        for x in 1..w - 1 {
            grad_cols[x] = (y - half..=y + half)
                .map(|yy| (px(l, x + 1, yy) - px(l, x - 1, yy)).abs() as u32)
                .sum();
        }
        let texture = window_sums(&grad_cols, half);

        // costs[d][x] is the SAD of the window centred on x against x - d, u32::MAX where
        // the window would leave the right view
        let mut costs = vec![vec![u32::MAX; w]; num_disp];
        let mut cols = vec![0u32; w];
        for (d, cost) in costs.iter_mut().enumerate() {
            if d + 2 * half >= w {
                break;
            }

            for x in d..w {
                cols[x] = (y - half..=y + half)
                    .map(|yy| (px(l, x, yy) - px(r, x - d, yy)).abs() as u32)
                    .sum();
            }

            let sums = window_sums(&cols[d..], half);
            for (i, s) in sums.into_iter().enumerate() {
                if let Some(s) = s {
                    cost[d + i] = s;
                }
            }
        }

        let ratio = self.params.uniqueness_ratio as u64;

        // Left border where the full search range would leave the right view stays invalid
        for x in (half + num_disp - 1)..w.saturating_sub(half) {
            match texture[x] {
                Some(t) if t >= self.params.texture_threshold => (),
                _ => continue
            }

            let candidates = costs_at(&costs, x);

            let (best, best_cost) = match candidates.iter()
                .enumerate()
                .min_by_key(|(_, c)| **c)
            {
                Some((d, c)) => (d, *c),
                None => continue
            };

            if best == 0 {
                continue;
            }

            let threshold = best_cost as u64 * (100 + ratio);
            let ambiguous = candidates.iter()
                .enumerate()
                .any(|(d, c)| (d + 1 < best || d > best + 1) && (*c as u64) * 100 <= threshold);
            if ambiguous {
                continue;
            }

            let mut disp = best as f32;
            if best + 1 < num_disp {
                let c0 = best_cost as f32;
                let cm = candidates[best - 1] as f32;
                let cp = candidates[best + 1] as f32;
                let denom = cm + cp - 2.0 * c0;
                if denom > 0.0 {
                    disp += (cm - cp) / (2.0 * denom);
                }
            }

            out[x] = disp;
        }

        out
    }
}

impl ComputeContext {
    /// Run the compute loop until `stop` is set.
    pub fn run(self, stop: Arc<AtomicBool>) {
        self.logger.info(format!(
            "stereo compute started, rect size {}, search radius {}",
            self.rect_size, self.matcher.params.search_radius
        ));

        let mut seen = self.raw.version();

        while !stop.load(Ordering::SeqCst) {
            if !self.device_ok.load(Ordering::SeqCst) {
                self.logger.error("device lost, stereo compute stopping");
                return;
            }

            let (version, raw) = match self.raw.wait_newer(seen, self.wait_timeout, &stop) {
                Some(v) => v,
                None => continue
            };
            seen = version;

            let frame = match compute_disparity_frame(
                &self.rectifier,
                &self.matcher,
                &raw,
                self.rect_size,
                self.depth_range
            ) {
                Ok(f) => f,
                Err(e) => {
                    self.logger.error(format!(
                        "disparity failed for frame {}: {}",
                        raw.timestamp, e
                    ));
                    DisparityFrame::empty(raw.timestamp, self.depth_range)
                }
            };

            if frame.is_empty() {
                self.logger.debug(format!("no reliable matches in frame {}", raw.timestamp));
            }

            self.disparity.publish(frame);
        }

        self.logger.info("stereo compute stopped");
    }
}

// -----------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// -----------------------------------------------------------------------------------------------

/// Rectify `raw` in perspective projection, match it and reject disparities outside
/// `depth_range`.
///
/// Returns an empty frame if no pixel has a valid disparity.
pub fn compute_disparity_frame(
    rectifier: &Rectifier,
    matcher: &BlockMatcher,
    raw: &RawFrame,
    rect_size: FrameSize,
    depth_range: DepthRange
) -> Result<DisparityFrame> {
    let rect = rectifier.rectify(raw, ProjectionKind::Perspective, rect_size)?;
    let (left, right) = rect.to_luma8_pair();

    let mut disparity = matcher.compute(&left, &right)?;

    let geometry = rectifier.calibration().rect_geometry(raw.size().single_lens(), rect_size);
    let (lo, hi) = DepthConverter::new(geometry).disparity_limits(&depth_range);
    disparity.mapv_inplace(|d| if d >= lo && d <= hi { d } else { INVALID_DISPARITY });

    let frame = DisparityFrame {
        disparity,
        reference: rect.left,
        depth_range,
        timestamp: raw.timestamp
    };

    if frame.valid_count() == 0 {
        return Ok(DisparityFrame::empty(raw.timestamp, depth_range));
    }

    Ok(frame)
}

// -----------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// -----------------------------------------------------------------------------------------------

/// Sums of `2 * half + 1` consecutive values centred on each index, `None` where the window
/// does not fit.
fn window_sums(values: &[u32], half: usize) -> Vec<Option<u32>> {
    let n = values.len();
    let mut out = vec![None; n];
    let win = 2 * half + 1;

    if n < win {
        return out;
    }

    let mut sum: u32 = values[..win].iter().sum();
    out[half] = Some(sum);

    for centre in half + 1..n - half {
        sum = sum + values[centre + half] - values[centre - half - 1];
        out[centre] = Some(sum);
    }

    out
}

fn costs_at(costs: &[Vec<u32>], x: usize) -> Vec<u32> {
    costs.iter().map(|c| c[x]).collect()
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------
