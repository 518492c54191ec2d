//! Fundamental data types shared across the engine.
//!
//! This module defines the `Frame` type that moves through the shared-memory
//! channels, the four sweep `Direction`s of a retinotopy run, and the event
//! types emitted by the capture and playback loops toward the timestamp
//! synchronization tracker.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::{IsiError, IsiResult};

/// Sweep direction of the periodic stimulus.
///
/// Opposing pairs (LR/RL and TB/BT) are combined during analysis to cancel
/// the hemodynamic delay term common to both sweeps of an axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Left-to-right azimuth sweep.
    LR,
    /// Right-to-left azimuth sweep.
    RL,
    /// Top-to-bottom elevation sweep.
    TB,
    /// Bottom-to-top elevation sweep.
    BT,
}

impl Direction {
    /// All four directions in the default presentation ordering.
    pub const ALL: [Direction; 4] = [Direction::LR, Direction::RL, Direction::TB, Direction::BT];

    /// The opposing sweep of the same axis.
    pub fn opposite(&self) -> Direction {
        match self {
            Direction::LR => Direction::RL,
            Direction::RL => Direction::LR,
            Direction::TB => Direction::BT,
            Direction::BT => Direction::TB,
        }
    }

    /// Whether this direction sweeps the azimuth (horizontal) axis.
    pub fn is_azimuth(&self) -> bool {
        matches!(self, Direction::LR | Direction::RL)
    }

    /// Stable lowercase token used in persisted layouts and wire payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::LR => "lr",
            Direction::RL => "rl",
            Direction::TB => "tb",
            Direction::BT => "bt",
        }
    }

    /// Parse the persisted token back into a direction.
    pub fn parse(token: &str) -> IsiResult<Direction> {
        match token {
            "lr" => Ok(Direction::LR),
            "rl" => Ok(Direction::RL),
            "tb" => Ok(Direction::TB),
            "bt" => Ok(Direction::BT),
            other => Err(IsiError::Configuration(format!(
                "unknown direction token '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single image frame moving through the system.
///
/// Frames are produced by a capture source or the stimulus renderer and are
/// never mutated after publication; the pixel buffer is reference-counted so
/// the capture loop, the shared-memory writer and the session recorder can
/// hold the same bytes without copies.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonically increasing per-producer sequence number.
    pub sequence_id: u64,
    /// Capture or presentation timestamp in microseconds.
    pub timestamp_us: i64,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Bytes per pixel (1 for 8-bit mono, 2 for 16-bit little-endian mono).
    pub channel_depth: u8,
    /// Raw pixel bytes, `width * height * channel_depth` long.
    pub pixel_buffer: Arc<[u8]>,
}

impl Frame {
    /// Build a frame, validating that the buffer matches the geometry.
    pub fn new(
        sequence_id: u64,
        timestamp_us: i64,
        width: u32,
        height: u32,
        channel_depth: u8,
        pixel_buffer: Arc<[u8]>,
    ) -> IsiResult<Self> {
        let expected = width as usize * height as usize * channel_depth as usize;
        if pixel_buffer.len() != expected {
            return Err(IsiError::Configuration(format!(
                "pixel buffer length {} does not match {}x{}x{}",
                pixel_buffer.len(),
                width,
                height,
                channel_depth
            )));
        }
        if !matches!(channel_depth, 1 | 2) {
            return Err(IsiError::Configuration(format!(
                "unsupported channel depth {channel_depth}"
            )));
        }
        Ok(Self {
            sequence_id,
            timestamp_us,
            width,
            height,
            channel_depth,
            pixel_buffer,
        })
    }

    /// Total pixel payload size in bytes.
    pub fn byte_len(&self) -> usize {
        self.pixel_buffer.len()
    }

    /// Number of pixels per frame.
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Convert the pixel payload to single-channel `f32` intensity.
    ///
    /// 16-bit frames are decoded little-endian. Analysis operates on this
    /// representation exclusively.
    pub fn intensity(&self) -> Vec<f32> {
        match self.channel_depth {
            2 => self
                .pixel_buffer
                .chunks_exact(2)
                .map(|b| u16::from_le_bytes([b[0], b[1]]) as f32)
                .collect(),
            _ => self.pixel_buffer.iter().map(|&b| b as f32).collect(),
        }
    }
}

/// Stimulus presentation event, emitted by the playback loop once per
/// presented frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StimulusEvent {
    /// Sequence id of the presented stimulus frame.
    pub frame_id: u64,
    /// Presentation timestamp in microseconds.
    pub timestamp_us: i64,
    /// Direction being swept when the frame was presented.
    pub direction: Direction,
    /// Zero-based repetition index within the direction.
    pub cycle_index: u32,
}

/// Camera capture event, emitted by the capture loop once per frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraEvent {
    /// Sequence id of the captured camera frame.
    pub frame_id: u64,
    /// Capture timestamp in microseconds.
    pub timestamp_us: i64,
}

/// Current wall-clock time in microseconds since the Unix epoch.
pub fn now_us() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_opposites_pair_by_axis() {
        for d in Direction::ALL {
            assert_eq!(d.opposite().opposite(), d);
            assert_eq!(d.is_azimuth(), d.opposite().is_azimuth());
        }
    }

    #[test]
    fn direction_tokens_round_trip() {
        for d in Direction::ALL {
            assert_eq!(Direction::parse(d.as_str()).ok(), Some(d));
        }
        assert!(Direction::parse("diagonal").is_err());
    }

    #[test]
    fn frame_rejects_geometry_mismatch() {
        let buf: Arc<[u8]> = vec![0u8; 10].into();
        assert!(Frame::new(0, 0, 4, 4, 1, buf).is_err());
    }

    #[test]
    fn intensity_decodes_16bit_little_endian() {
        let buf: Arc<[u8]> = vec![0x34, 0x12, 0xff, 0x00].into();
        let frame = Frame::new(0, 0, 2, 1, 2, buf).ok();
        let frame = frame.as_ref().map(Frame::intensity);
        assert_eq!(frame, Some(vec![0x1234 as f32, 0x00ff as f32]));
    }
}
