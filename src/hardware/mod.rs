//! Hardware contracts.
//!
//! The engine never talks to camera or display drivers directly: the capture
//! loop consumes a [`FrameSource`] and the playback loop consumes a
//! [`FrameSink`]. Physical drivers and the simulated devices in
//! [`mock`](crate::hardware::mock) implement the same small capability
//! traits, so orchestration code is hardware-agnostic.
//!
//! # Contract
//!
//! - All methods are async and take `&self`; implementations use interior
//!   mutability for device state.
//! - `next_frame` must respect its deadline and return
//!   [`FrameSourceOutcome::Timeout`] instead of hanging.
//! - `ready()` is the readiness gate consulted by the coordinator before a
//!   run may leave `Idle`.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

use crate::core::Frame;

pub mod mock;

/// Outcome of a single capture attempt.
#[derive(Debug)]
pub enum FrameSourceOutcome {
    /// A frame was captured.
    Frame(Frame),
    /// No frame arrived within the deadline.
    Timeout,
}

/// Capability: frame production (a camera or a simulated source).
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Wait for the next frame, up to `deadline`.
    async fn next_frame(&self, deadline: Duration) -> Result<FrameSourceOutcome>;

    /// Whether the device is connected and able to produce frames.
    async fn ready(&self) -> bool;

    /// Frame geometry as `(width, height, channel_depth)`.
    fn geometry(&self) -> (u32, u32, u8);
}

/// Capability: frame presentation (a display or a simulated sink).
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Present one stimulus frame. Returns once the sink has accepted it.
    async fn present(&self, frame: &Frame) -> Result<()>;

    /// Whether the device is connected and able to present frames.
    async fn ready(&self) -> bool;
}
