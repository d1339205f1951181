//! # Transport Module
//!
//! Sinks the capture loop hands each new raw frame to, so that other processes can see the camera
//! without going through this crate's query API.
//!
//! The crate ships a UDP sink which JPEG-encodes frames and sends them to the robot's internal
//! network. Shared-memory sinks are device specific and are injected by the caller, this module
//! only fixes the key they use.
//!
//! ## UDP datagrams
//!
//! An encoded frame is split into datagrams of at most [`MAX_PAYLOAD`] bytes, each starting with a
//! big-endian header:
//!
//! | bytes  | field                              |
//! |--------|------------------------------------|
//! | 0..4   | frame id, wrapping                 |
//! | 4..6   | chunk index                        |
//! | 6..8   | chunk count                        |
//! | 8..16  | capture timestamp in microseconds  |

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::convert::TryInto;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, RgbImage};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::frame::{hconcat, FrameSize, RawFrame, Timestamp};
use crate::logger::Logger;
use crate::remap::{ProjectionKind, Rectifier};

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

/// UDP port of the camera at position `N` is `UDP_BASE_PORT + N`.
pub const UDP_BASE_PORT: u16 = 9200;

/// Shared memory key of the camera at position `N` is `SHM_BASE_KEY + N`.
pub const SHM_BASE_KEY: i32 = 9000;

/// First three octets of the robot's internal network.
pub const NETWORK_PREFIX: [u8; 3] = [192, 168, 123];

pub const HEADER_LEN: usize = 16;

pub const MAX_PAYLOAD: usize = 1400;

const JPEG_QUALITY: u8 = 80;

// -----------------------------------------------------------------------------------------------
// TRAITS
// -----------------------------------------------------------------------------------------------

/// Destination for raw frames, fed by the capture loop.
///
/// An error from `forward` is logged by the capture loop and never stops it.
pub trait FrameSink: Send {
    fn name(&self) -> &str;

    fn forward(&mut self, frame: &RawFrame) -> Result<()>;
}

// -----------------------------------------------------------------------------------------------
// ENUMERATIONS
// -----------------------------------------------------------------------------------------------

/// Which image is transmitted for each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransMode {
    RawLeft,
    RawStereo,
    RectLeft,
    RectStereo
}

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransmissionConfig {
    /// Last octet of the receiver's address on the internal network
    pub ip_last_segment: u8,

    pub mode: TransMode,

    /// Maximum frames per second sent, `0.0` to send every captured frame
    pub rate: f32
}

/// Header found at the start of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramHeader {
    pub frame_id: u32,
    pub chunk: u16,
    pub chunk_count: u16,
    pub timestamp: Timestamp
}

/// Sends JPEG-encoded frames over UDP.
pub struct UdpFrameSink {
    socket: UdpSocket,
    target: SocketAddr,

    mode: TransMode,

    min_interval: Option<Duration>,
    last_sent: Option<Instant>,

    rectifier: Option<(Arc<Rectifier>, FrameSize)>,

    frame_id: u32,

    logger: Logger
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl Default for TransmissionConfig {
    fn default() -> Self {
        Self {
            ip_last_segment: 15,
            mode: TransMode::RawStereo,
            rate: 0.0
        }
    }
}

impl TransmissionConfig {
    /// Check the settings against the camera's capture rate.
    pub fn validate(&self, frame_rate: f32) -> Result<()> {
        if self.ip_last_segment == 0 || self.ip_last_segment == 255 {
            return Err(Error::InvalidSetting(format!(
                "ip_last_segment must be a host address, got {}",
                self.ip_last_segment
            )));
        }

        if !(self.rate >= 0.0) || (self.rate > 0.0 && self.rate >= frame_rate) {
            return Err(Error::InvalidSetting(format!(
                "transmission rate must be below the frame rate ({}), got {}",
                frame_rate, self.rate
            )));
        }

        Ok(())
    }

    /// Address frames of the camera at `pos_number` are sent to.
    pub fn target(&self, pos_number: u8) -> SocketAddr {
        let [a, b, c] = NETWORK_PREFIX;

        SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::new(a, b, c, self.ip_last_segment),
            udp_port(pos_number)
        ))
    }
}

impl DatagramHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.frame_id.to_be_bytes());
        out[4..6].copy_from_slice(&self.chunk.to_be_bytes());
        out[6..8].copy_from_slice(&self.chunk_count.to_be_bytes());
        out[8..16].copy_from_slice(&self.timestamp.as_micros().to_be_bytes());
        out
    }

    /// Parse the header of a datagram, `None` if it is too short.
    pub fn parse(datagram: &[u8]) -> Option<Self> {
        let bytes: &[u8; HEADER_LEN] = datagram.get(..HEADER_LEN)?.try_into().ok()?;

        Some(Self {
            frame_id: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            chunk: u16::from_be_bytes([bytes[4], bytes[5]]),
            chunk_count: u16::from_be_bytes([bytes[6], bytes[7]]),
            timestamp: Timestamp::from_micros(u64::from_be_bytes(
                bytes[8..16].try_into().ok()?
            ))
        })
    }
}

impl UdpFrameSink {
    /// Sink for the camera at `pos_number`, sending to the address given by `config`.
    pub fn new(config: &TransmissionConfig, pos_number: u8, logger: Logger) -> Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0)))
            .map_err(Error::TransportError)?;

        let min_interval = if config.rate > 0.0 {
            Some(Duration::from_secs_f32(1.0 / config.rate))
        } else {
            None
        };

        Ok(Self {
            socket,
            target: config.target(pos_number),
            mode: config.mode,
            min_interval,
            last_sent: None,
            rectifier: None,
            frame_id: 0,
            logger
        })
    }

    /// Send to `target` instead of the address on the internal network.
    pub fn with_target(mut self, target: SocketAddr) -> Self {
        self.target = target;

        self
    }

    pub fn with_mode(mut self, mode: TransMode) -> Self {
        self.mode = mode;

        self
    }

    /// Rectifier used by the rectified transmission modes.
    pub fn with_rectifier(mut self, rectifier: Arc<Rectifier>, rect_size: FrameSize) -> Self {
        self.rectifier = Some((rectifier, rect_size));

        self
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    fn image_for(&self, frame: &RawFrame) -> Result<RgbImage> {
        match self.mode {
            TransMode::RawLeft => Ok(frame.split().0),
            TransMode::RawStereo => {
                let (left, right) = frame.split();
                Ok(hconcat(&left, &right))
            },
            TransMode::RectLeft | TransMode::RectStereo => {
                let (rectifier, rect_size) = self.rectifier.as_ref()
                    .ok_or(Error::MissingCalibration)?;
                let pair = rectifier.rectify(frame, ProjectionKind::LongLat, *rect_size)?;

                if self.mode == TransMode::RectLeft {
                    Ok(pair.left)
                } else {
                    Ok(hconcat(&pair.left, &pair.right))
                }
            }
        }
    }

    fn due(&self) -> bool {
        match (self.min_interval, self.last_sent) {
            (Some(interval), Some(last)) => last.elapsed() >= interval,
            _ => true
        }
    }
}

impl FrameSink for UdpFrameSink {
    fn name(&self) -> &str {
        "udp"
    }

    fn forward(&mut self, frame: &RawFrame) -> Result<()> {
        if !self.due() {
            return Ok(());
        }
        self.last_sent = Some(Instant::now());

        let img = self.image_for(frame)?;
        let jpeg = encode_jpeg(&img)?;

        let chunks: Vec<&[u8]> = jpeg.chunks(MAX_PAYLOAD).collect();
        let chunk_count = chunks.len() as u16;
        let mut datagram = Vec::with_capacity(HEADER_LEN + MAX_PAYLOAD);

        for (i, chunk) in chunks.into_iter().enumerate() {
            let header = DatagramHeader {
                frame_id: self.frame_id,
                chunk: i as u16,
                chunk_count,
                timestamp: frame.timestamp
            };

            datagram.clear();
            datagram.extend_from_slice(&header.to_bytes());
            datagram.extend_from_slice(chunk);

            self.socket.send_to(&datagram, self.target).map_err(Error::TransportError)?;
        }

        self.logger.debug(format!(
            "sent frame {} ({} bytes in {} datagrams) to {}",
            self.frame_id,
            jpeg.len(),
            chunk_count,
            self.target
        ));

        self.frame_id = self.frame_id.wrapping_add(1);

        Ok(())
    }
}

// -----------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// -----------------------------------------------------------------------------------------------

pub fn udp_port(pos_number: u8) -> u16 {
    UDP_BASE_PORT + pos_number as u16
}

pub fn shm_key(pos_number: u8) -> i32 {
    SHM_BASE_KEY + pos_number as i32
}

/// Encode an image as a JPEG.
pub fn encode_jpeg(img: &RgbImage) -> Result<Vec<u8>> {
    let mut buf = Vec::new();

    JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY)
        .encode(img.as_raw(), img.width(), img.height(), ColorType::Rgb8)
        .map_err(Error::ImageConversionError)?;

    Ok(buf)
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------
