//! # Capture Pipeline Test
//!
//! Lifecycle, freshness and sink hand-off of the capture loop, using synthetic sources.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cv_stereocam::prelude::*;
use cv_stereocam::{
    CaptureState, ComputeState, Error, FrameSink, HardwareControl, RawFrame, Result,
    StereoConfig
};
use parking_lot::Mutex;

// -----------------------------------------------------------------------------------------------
// HELPERS
// -----------------------------------------------------------------------------------------------

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn small_camera(rate: f32) -> StereoCamera {
    let raw = FrameSize::new(128, 48);

    CameraBuilder::new()
        .frame_size(raw)
        .rect_frame_size(FrameSize::new(32, 24))
        .frame_rate(rate)
        .source(SyntheticSource::textured(raw, rate, 4))
        .calib_params(StereoCalibration::ideal(raw.single_lens(), 40.0, 0.05))
        .build()
        .unwrap()
}

#[derive(Clone, Default)]
struct CountingSink {
    frames: Arc<Mutex<Vec<RawFrame>>>
}

impl FrameSink for CountingSink {
    fn name(&self) -> &str {
        "counting"
    }

    fn forward(&mut self, frame: &RawFrame) -> Result<()> {
        self.frames.lock().push(frame.clone());
        Ok(())
    }
}

/// Open source whose every read fails with ENODEV, as an unplugged V4L2 node behaves.
struct UnpluggedSource {
    size: FrameSize,
    rate: f32
}

impl FrameSource for UnpluggedSource {
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_opened(&self) -> bool {
        true
    }

    fn read(&mut self) -> Result<image::RgbImage> {
        thread::sleep(Duration::from_millis(2));
        Err(Error::CameraCaptureError(std::io::Error::from_raw_os_error(19)))
    }

    fn close(&mut self) {}

    fn frame_size(&self) -> FrameSize {
        self.size
    }

    fn frame_rate(&self) -> f32 {
        self.rate
    }

    fn configure(&mut self, size: FrameSize, rate: f32) -> Result<()> {
        self.size = size;
        self.rate = rate;
        Ok(())
    }

    fn describe(&self) -> String {
        "unplugged source".into()
    }
}

fn unplugged_camera(device_loss_retries: u32, query_timeout_ms: u64) -> StereoCamera {
    let raw = FrameSize::new(128, 48);
    let mut config = StereoConfig::default();
    config.frame_size = raw;
    config.rect_frame_size = FrameSize::new(32, 24);
    config.retry_backoff_ms = 1;
    config.max_retry_backoff_ms = 4;
    config.device_loss_retries = device_loss_retries;
    config.query_timeout_ms = query_timeout_ms;

    CameraBuilder::new()
        .config(config)
        .source(UnpluggedSource { size: raw, rate: 30.0 })
        .calib_params(StereoCalibration::ideal(raw.single_lens(), 40.0, 0.05))
        .build()
        .unwrap()
}

#[derive(Clone, Default)]
struct MockHardware {
    flashed: Arc<Mutex<Option<StereoCalibration>>>
}

impl HardwareControl for MockHardware {
    fn firmware_version(&mut self) -> Result<String> {
        Ok("2.1.0".into())
    }

    fn update_firmware(&mut self, _: &Path) -> Result<()> {
        Ok(())
    }

    fn flash_calibration(&mut self, calibration: &StereoCalibration) -> Result<()> {
        *self.flashed.lock() = Some(calibration.clone());
        Ok(())
    }

    fn read_calibration(&mut self) -> Result<StereoCalibration> {
        self.flashed.lock().clone().ok_or(Error::MissingCalibration)
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[test]
fn full_size_capture_keeps_last_frame() {
    init_logging();

    let size = FrameSize::new(1856, 800);
    let mut camera = CameraBuilder::new()
        .source(SyntheticSource::textured(size, 30.0, 32))
        .build()
        .unwrap();

    assert!(camera.is_opened());
    assert!(camera.start_capture(false, false));
    assert_eq!(camera.capture_state(), CaptureState::Running);

    thread::sleep(Duration::from_millis(200));

    let frame = camera.get_raw_frame().expect("no raw frame after 200 ms");
    assert!(!frame.is_empty());
    assert_eq!(frame.size(), size);
    assert!(frame.timestamp.age() < Duration::from_millis(200));

    assert!(camera.stop_capture());
    assert_eq!(camera.capture_state(), CaptureState::Idle);
    assert!(!camera.is_capturing());

    let after = camera.get_raw_frame().expect("last frame was not retained");
    assert!(after.timestamp >= frame.timestamp);
    assert_eq!(camera.get_raw_frame().unwrap().timestamp, after.timestamp);

    let stereo = camera.get_stereo_frame().unwrap();
    assert_eq!(stereo.timestamp, after.timestamp);
    assert_eq!(stereo.left.dimensions(), (928, 800));
}

#[test]
fn lifecycle_preconditions() {
    init_logging();

    let mut camera = small_camera(100.0);

    assert!(!camera.stop_capture());
    assert_eq!(camera.capture_state(), CaptureState::Idle);
    assert!(!camera.start_stereo_compute());
    assert_eq!(camera.compute_state(), ComputeState::Idle);
    assert!(!camera.stop_stereo_compute());

    assert!(camera.start_capture(false, false));
    assert!(!camera.start_capture(false, false));
    assert!(camera.start_stereo_compute());
    assert!(!camera.start_stereo_compute());
    assert!(camera.is_computing());

    // Stopping capture takes stereo compute down with it
    assert!(camera.stop_capture());
    assert_eq!(camera.compute_state(), ComputeState::Idle);
    assert!(!camera.stop_capture());

    // Closed devices cannot capture
    assert!(camera.close());
    assert!(!camera.is_opened());
    assert!(!camera.start_capture(false, false));
    assert!(camera.open());
    assert!(camera.start_capture(false, false));
}

#[test]
fn queries_are_idempotent_and_fresh() {
    init_logging();

    let mut camera = small_camera(200.0);
    let mut previous = None;

    for _ in 0..5 {
        assert!(camera.start_capture(false, false));
        thread::sleep(Duration::from_millis(20));

        let first = camera.get_raw_frame().unwrap().timestamp;
        if let Some(prev) = previous {
            assert!(first > prev, "stale frame after restart");
        }

        {
            let camera = &camera;
            thread::scope(|s| {
                for _ in 0..4 {
                    s.spawn(move || {
                        let mut last = camera.get_raw_frame().unwrap().timestamp;
                        for _ in 0..50 {
                            let ts = camera.get_raw_frame().unwrap().timestamp;
                            assert!(ts >= last, "timestamps went backwards");
                            last = ts;
                        }
                    });
                }
            });
        }

        assert!(camera.stop_capture());

        let a = camera.get_raw_frame().unwrap();
        let b = camera.get_raw_frame().unwrap();
        assert_eq!(a.timestamp, b.timestamp);
        assert_eq!(a.image, b.image);

        previous = Some(a.timestamp);
    }
}

#[test]
fn transmit_and_share_sinks_receive_frames() {
    init_logging();

    let raw = FrameSize::new(128, 48);
    let udp = CountingSink::default();
    let shm = CountingSink::default();

    let mut camera = CameraBuilder::new()
        .frame_size(raw)
        .rect_frame_size(FrameSize::new(32, 24))
        .pos_number(3)
        .source(SyntheticSource::textured(raw, 100.0, 4))
        .udp_sink(udp.clone())
        .share_sink(shm.clone())
        .build()
        .unwrap();

    assert_eq!(camera.shm_key(), 9003);

    assert!(camera.start_capture(true, false));
    thread::sleep(Duration::from_millis(60));
    assert!(camera.stop_capture());

    let sent = udp.frames.lock().len();
    assert!(sent > 0);
    assert!(shm.frames.lock().is_empty());
    assert_eq!(
        udp.frames.lock().last().unwrap().timestamp,
        camera.get_raw_frame().unwrap().timestamp
    );

    // Sinks are handed back when capture stops and reused on the next start
    assert!(camera.start_capture(true, true));
    thread::sleep(Duration::from_millis(60));
    assert!(camera.stop_capture());

    assert!(udp.frames.lock().len() > sent);
    assert!(!shm.frames.lock().is_empty());
}

#[test]
fn lost_device_is_reported_and_last_frame_kept() {
    init_logging();

    let raw = FrameSize::new(128, 48);
    let mut config = StereoConfig::default();
    config.frame_size = raw;
    config.rect_frame_size = FrameSize::new(32, 24);
    config.frame_rate = 200.0;
    config.retry_backoff_ms = 1;
    config.max_retry_backoff_ms = 2;
    config.device_loss_retries = 2;

    let mut camera = CameraBuilder::new()
        .config(config)
        .source(SyntheticSource::textured(raw, 200.0, 4).disconnect_after(5))
        .build()
        .unwrap();

    assert!(camera.start_capture(false, false));

    let deadline = Instant::now() + Duration::from_secs(2);
    while camera.is_opened() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }

    assert!(!camera.is_opened());
    // The loop keeps running, waiting for the device to come back
    assert!(camera.is_capturing());
    assert!(camera.get_raw_frame().is_some());

    assert!(camera.stop_capture());
    assert!(!camera.is_opened());
    assert!(camera.get_raw_frame().is_some());
}

#[test]
fn failing_reads_on_an_open_device_report_loss() {
    init_logging();

    let mut camera = unplugged_camera(10, 100);
    assert!(camera.is_opened());
    assert!(camera.start_capture(false, false));
    assert!(camera.start_stereo_compute());

    let deadline = Instant::now() + Duration::from_secs(2);
    while camera.is_opened() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(!camera.is_opened());
    assert!(camera.is_capturing());

    // Device loss ends stereo compute
    let deadline = Instant::now() + Duration::from_secs(2);
    while camera.compute_state() != ComputeState::Idle && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(camera.compute_state(), ComputeState::Idle);
    assert!(!camera.start_stereo_compute());
    assert!(camera.get_raw_frame().is_none());

    assert!(camera.stop_capture());
}

#[test]
fn stop_wakes_loops_waiting_for_frames() {
    init_logging();

    // Frames never arrive and the device is never declared lost
    let mut camera = unplugged_camera(u32::MAX, 10_000);
    assert!(camera.start_capture(false, false));
    assert!(camera.start_stereo_compute());
    thread::sleep(Duration::from_millis(50));

    let start = Instant::now();
    assert!(camera.stop_stereo_compute());
    assert!(start.elapsed() < Duration::from_millis(500), "took {:?}", start.elapsed());
    assert_eq!(camera.compute_state(), ComputeState::Idle);

    let start = Instant::now();
    assert!(camera.stop_capture());
    assert!(start.elapsed() < Duration::from_millis(500), "took {:?}", start.elapsed());
}

#[test]
fn settings_and_files() {
    init_logging();

    let dir = tempfile::tempdir().unwrap();
    let calib_path = dir.path().join("calib.yaml");
    let config_path = dir.path().join("config.toml");

    let mut camera = small_camera(100.0);
    assert!(camera.set_pos_number(5));
    assert!(camera.set_serial_number(4242));
    assert!(!camera.set_raw_frame_rate(-1.0));

    camera.save_calib_params(&calib_path).unwrap();
    camera.save_config(&config_path).unwrap();

    let other = CameraBuilder::new()
        .config_file(&config_path)
        .unwrap()
        .calib_params_from_file(&calib_path)
        .unwrap()
        .source(SyntheticSource::textured(FrameSize::new(128, 48), 100.0, 4))
        .build()
        .unwrap();

    assert_eq!(other.calibration(), camera.calibration());
    assert_eq!(other.identity(), camera.identity());
    assert_eq!(other.raw_frame_size(), FrameSize::new(128, 48));
    assert_eq!(other.calib_params(Lens::Left).unwrap().len(), 6);
}

#[test]
fn hardware_capability() {
    init_logging();

    let raw = FrameSize::new(128, 48);
    let hw = MockHardware::default();
    let mut camera = CameraBuilder::new()
        .frame_size(raw)
        .rect_frame_size(FrameSize::new(32, 24))
        .source(SyntheticSource::textured(raw, 100.0, 4))
        .calib_params(StereoCalibration::ideal(raw.single_lens(), 40.0, 0.05))
        .hardware(hw.clone())
        .build()
        .unwrap();

    assert_eq!(camera.firmware_version().unwrap(), "2.1.0");

    camera.update_calib_params_to_flash().unwrap();
    assert_eq!(hw.flashed.lock().as_ref(), camera.calibration());

    assert!(camera.start_capture(false, false));
    assert!(matches!(camera.update_firmware("fw.bin"), Err(Error::PipelineBusy)));
    assert!(camera.stop_capture());
    camera.update_firmware("fw.bin").unwrap();
    camera.load_calib_params_from_flash().unwrap();
}
