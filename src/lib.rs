//! # Stereo camera pipeline for use in the CV system
//!
//! This crate drives a dual-lens stereo camera module: it pulls raw interleaved frames from the
//! capture device, rectifies the two views, computes dense disparity, and turns it into depth
//! images and point clouds, keeping every derived frame tied to the timestamp of the raw frame it
//! came from.
//!
//! Capture and stereo compute each run on their own thread and hand frames over through
//! single-slot mailboxes, so callers always get the newest frame and a slow caller never holds
//! up the camera.
//!
//! ## Installation
//!
//! Add the following to your project's `Cargo.toml`
//!
//! ```toml
//! [dependencies]
//! cv_stereocam = "0.1"
//! ```
//!
//! To read from a V4L2 device node enable the `v4l2` feature, which uses
//! [`rscam`](https://github.com/loyd/rscam) and therefore only supports Linux:
//!
//! ```shell
//! sudo apt install v4l-utils libv4l-dev
//! ```
//!
//! The `rayon` feature matches image rows in parallel.
//!
//! ## Usage
//!
//! ```no_run
//! use cv_stereocam::prelude::*;
//!
//! let mut camera = CameraBuilder::new()
//!     // The module is found at /dev/video1
//!     .device_node(1)
//!     // Path to the module's calibration, alternatively use .calib_params(...)
//!     .calib_params_from_file("calib.yaml")?
//!     .build()?;
//!
//! if camera.start_capture(false, false) && camera.start_stereo_compute() {
//!     if let Some(cloud) = camera.get_point_cloud() {
//!         println!("{} points at {}", cloud.len(), cloud.timestamp);
//!     }
//! }
//! # Ok::<(), cv_stereocam::Error>(())
//! ```
//!
//! Frames can also come from any [`FrameSource`], such as the [`SyntheticSource`] used to run
//! the pipeline without hardware.

// -----------------------------------------------------------------------------------------------
// EXPORTS
// -----------------------------------------------------------------------------------------------

pub use builder::{CameraBuilder, Rectifiable};
pub use calibration::{CalibrationParameters, Lens, RectGeometry, StereoCalibration};
pub use camera::{CameraIdentity, CaptureState, ComputeState, StereoCamera};
pub use config::StereoConfig;
pub use depth::{DepthConverter, DepthRange};
pub use error::{Error, Result};
pub use frame::{
    ColoredPoint, DepthFrame, DepthImage, DisparityFrame, FrameSize, PointCloud, RawFrame,
    RectifiedFramePair, StereoFrame, Timestamp
};
pub use hardware::HardwareControl;
pub use logger::Logger;
pub use mailbox::Mailbox;
pub use remap::{ProjectionKind, Rectifier};
#[cfg(feature = "v4l2")]
pub use source::V4l2Source;
pub use source::{FrameSource, SyntheticSource};
pub use stereo::{BlockMatcher, StereoParams};
pub use transport::{FrameSink, TransMode, TransmissionConfig, UdpFrameSink};

// -----------------------------------------------------------------------------------------------
// MODULES
// -----------------------------------------------------------------------------------------------

mod builder;
pub mod calibration;
mod camera;
mod capture;
pub mod config;
pub mod depth;
mod error;
pub mod frame;
mod hardware;
pub mod logger;
mod mailbox;
pub mod remap;
mod source;
pub mod stereo;
pub mod transport;
mod worker;

pub mod prelude {
    pub use crate::{CameraBuilder, Rectifiable, StereoCamera};
    pub use crate::{DepthImage, FrameSize, Lens, ProjectionKind, StereoCalibration};
    pub use crate::{FrameSource, SyntheticSource};
}
