//! # Stereo Pipeline Test
//!
//! Runs capture and stereo compute on a synthetic scene of known depth and checks the rectified,
//! disparity, depth and point cloud outputs against it.

use std::thread;
use std::time::{Duration, Instant};

use approx::assert_relative_eq;
use cv_stereocam::prelude::*;
use cv_stereocam::{DepthConverter, DepthRange, DisparityFrame, StereoParams};

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

const RAW: FrameSize = FrameSize::new(320, 120);
const RECT: FrameSize = FrameSize::new(80, 60);

const FOCAL: f64 = 100.0;
const BASELINE: f64 = 0.08;

/// Shift between the views in raw pixels, 8 rectified pixels or 0.5 m
const RAW_DISPARITY: u32 = 16;
const DEPTH: f32 = 0.5;

// -----------------------------------------------------------------------------------------------
// HELPERS
// -----------------------------------------------------------------------------------------------

fn camera() -> StereoCamera {
    let _ = env_logger::builder().is_test(true).try_init();

    CameraBuilder::new()
        .frame_size(RAW)
        .rect_frame_size(RECT)
        .frame_rate(60.0)
        .stereo_params(StereoParams {
            search_radius: 16,
            block_size: 7,
            ..Default::default()
        })
        .source(SyntheticSource::textured(RAW, 60.0, RAW_DISPARITY))
        .calib_params(StereoCalibration::ideal(RAW.single_lens(), FOCAL, BASELINE))
        .build()
        .unwrap()
}

fn wait_for_disparity(camera: &StereoCamera) -> DisparityFrame {
    let deadline = Instant::now() + Duration::from_secs(5);

    loop {
        if let Some(frame) = camera.get_disparity_frame() {
            if !frame.is_empty() {
                return frame;
            }
        }

        assert!(Instant::now() < deadline, "no disparity frame within 5 s");
        thread::sleep(Duration::from_millis(10));
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[test]
fn rectified_views_have_configured_size() {
    let mut camera = camera();
    assert!(camera.start_capture(false, false));

    for kind in [ProjectionKind::LongLat, ProjectionKind::Perspective].iter() {
        let pair = camera.get_rect_stereo_frame(*kind).unwrap();
        assert_eq!(pair.size(), RECT);
        assert_eq!(pair.right.dimensions(), (RECT.width, RECT.height));
        assert!(pair.perspective.is_none());
    }

    let pair = camera.get_rect_stereo_frame_with_perspective().unwrap();
    assert_eq!(pair.perspective.unwrap().dimensions(), (RECT.width, RECT.height));

    assert!(camera.stop_capture());
}

#[test]
fn synthetic_scene_depth() {
    let mut camera = camera();

    assert!(camera.start_capture(false, false));
    assert!(camera.start_stereo_compute());

    let frame = wait_for_disparity(&camera);
    assert_eq!(frame.size(), RECT);
    assert!(frame.valid_count() > 100);

    assert!(camera.stop_capture());

    // Once stopped, every query derives from the last disparity frame
    let last = camera.get_disparity_frame().unwrap();
    assert!(last.timestamp >= frame.timestamp);
    assert!(!last.is_empty());

    let depth = camera.get_depth_frame(false).unwrap();
    let cloud = camera.get_point_cloud().unwrap();
    let colored = camera.get_colored_point_cloud().unwrap();

    assert_eq!(depth.timestamp, last.timestamp);
    assert_eq!(cloud.timestamp, last.timestamp);
    assert_eq!(cloud.timestamp, colored.timestamp);
    assert_eq!(cloud.len(), colored.len());

    // Points lie on the synthetic plane and inside the depth range
    let range = DepthRange::default();
    assert!(cloud.iter().all(|p| range.contains(p.z)));
    let mut zs: Vec<f32> = cloud.iter().map(|p| p.z).collect();
    zs.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_relative_eq!(zs[zs.len() / 2], DEPTH, max_relative = 0.05);

    match depth.image {
        DepthImage::Metric(m) => {
            assert_eq!(m.dim(), (RECT.height as usize, RECT.width as usize));
            let valid = m.iter().filter(|z| **z > 0.0).count();
            assert!(valid > 100);
        },
        DepthImage::Colored(_) => panic!("asked for a metric depth image")
    }

    assert_eq!(camera.get_disparity_frame().unwrap().timestamp, last.timestamp);
    assert!(!camera.get_depth_frame(true).unwrap().is_empty());
}

#[test]
fn depth_reprojects_to_disparity() {
    let mut camera = camera();

    assert!(camera.start_capture(false, false));
    assert!(camera.start_stereo_compute());
    let frame = wait_for_disparity(&camera);
    assert!(camera.stop_capture());

    let geometry = camera.calibration().unwrap().rect_geometry(RAW.single_lens(), RECT);
    let conv = DepthConverter::new(geometry);

    for d in frame.disparity.iter().filter(|d| **d > 0.0) {
        let z = conv.depth_at(*d).unwrap();
        assert_relative_eq!(conv.disparity_at(z), *d, max_relative = 1e-4);
    }
}

#[test]
fn depth_range_excluding_scene_gives_empty_results() {
    let mut camera = camera();
    assert!(camera.set_depth_range(DepthRange::new(2.0, 4.0).unwrap()));

    assert!(camera.start_capture(false, false));
    assert!(camera.start_stereo_compute());

    let deadline = Instant::now() + Duration::from_secs(5);
    let frame = loop {
        if let Some(f) = camera.get_disparity_frame() {
            break f;
        }
        assert!(Instant::now() < deadline, "no disparity frame within 5 s");
        thread::sleep(Duration::from_millis(10));
    };
    assert!(camera.stop_capture());

    assert!(frame.is_empty());
    assert!(camera.get_point_cloud().unwrap().is_empty());
    assert!(camera.get_depth_frame(false).unwrap().is_empty());
}
