//! # Hardware Control Module
//!
//! Device-family specific operations that sit outside the frame pipeline: querying and updating
//! the module firmware, and reading or writing the calibration stored in the module's flash.
//!
//! Implementations are provided by the integrator for their device family and injected through
//! the [`CameraBuilder`](crate::builder::CameraBuilder). A camera without one reports
//! [`Error::HardwareUnavailable`](crate::error::Error::HardwareUnavailable) for these operations.

use std::path::Path;

use crate::calibration::StereoCalibration;
use crate::error::Result;

/// Firmware and flash access for one camera module.
pub trait HardwareControl: Send {
    /// Version string reported by the module firmware.
    fn firmware_version(&mut self) -> Result<String>;

    /// Flash the firmware image at `image` onto the module.
    fn update_firmware(&mut self, image: &Path) -> Result<()>;

    /// Write `calibration` to the module's flash so it survives power cycles.
    fn flash_calibration(&mut self, calibration: &StereoCalibration) -> Result<()>;

    /// Read the calibration stored in the module's flash.
    fn read_calibration(&mut self) -> Result<StereoCalibration>;
}
