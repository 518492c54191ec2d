//! Simulated hardware implementations.
//!
//! Provides a camera and a display that satisfy the [`FrameSource`] and
//! [`FrameSink`] contracts without physical hardware, so the whole rig can
//! run headless. All simulated devices use async-safe timing
//! (`tokio::time::sleep`, never `std::thread::sleep`).
//!
//! # Timing model
//!
//! - `SimulatedCamera`: frames are paced on an absolute schedule derived
//!   from the configured rate, so timestamps do not accumulate drift even
//!   when the consumer is slow. Optional Gaussian jitter perturbs the
//!   reported capture timestamps (not the pacing) to exercise the sync
//!   tracker.
//! - `SimulatedDisplay`: `present` models a fixed sub-millisecond scanout
//!   latency.

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, sleep_until, Instant};

use super::{FrameSink, FrameSource, FrameSourceOutcome};
use crate::core::{now_us, Frame};

struct CameraState {
    next_sequence: u64,
    next_due: Option<Instant>,
    /// Nominal-schedule anchor, fixed at the first capture so reported
    /// timestamps track the pacing schedule, not construction time.
    base_timestamp_us: Option<i64>,
}

/// Simulated camera producing paced frames with a synthetic scene.
pub struct SimulatedCamera {
    width: u32,
    height: u32,
    channel_depth: u8,
    interval: Duration,
    jitter_std: Option<Duration>,
    /// When set, the camera stops producing frames after this sequence id,
    /// simulating hardware silence for watchdog tests.
    silent_after: Option<u64>,
    state: Mutex<CameraState>,
    connected: AtomicBool,
}

impl SimulatedCamera {
    /// Create a camera with the given geometry and rate.
    pub fn new(width: u32, height: u32, channel_depth: u8, fps: f64) -> Self {
        Self {
            width,
            height,
            channel_depth,
            interval: Duration::from_secs_f64(1.0 / fps),
            jitter_std: None,
            silent_after: None,
            state: Mutex::new(CameraState {
                next_sequence: 0,
                next_due: None,
                base_timestamp_us: None,
            }),
            connected: AtomicBool::new(true),
        }
    }

    /// Add Gaussian timestamp jitter with the given standard deviation.
    pub fn with_jitter(mut self, std: Duration) -> Self {
        self.jitter_std = Some(std);
        self
    }

    /// Stop producing frames after `frames` captures (silence injection).
    pub fn with_silence_after(mut self, frames: u64) -> Self {
        self.silent_after = Some(frames);
        self
    }

    /// Mark the camera as disconnected; `ready()` reports false afterwards.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }

    fn render_scene(&self, sequence: u64) -> Vec<u8> {
        // Static horizontal luminance ramp plus low-amplitude shot noise.
        let mut rng = rand::thread_rng();
        let pixels = self.width as usize * self.height as usize;
        let mut out = Vec::with_capacity(pixels * self.channel_depth as usize);
        for _row in 0..self.height {
            for x in 0..self.width {
                let ramp = (x as f64 / self.width.max(1) as f64) * 0.25 + 0.5;
                let noise: f64 = rng.gen_range(-0.01..0.01);
                let flicker = ((sequence % 7) as f64) * 1e-3;
                let value = (ramp + noise + flicker).clamp(0.0, 1.0);
                match self.channel_depth {
                    2 => {
                        let v = (value * u16::MAX as f64) as u16;
                        out.extend_from_slice(&v.to_le_bytes());
                    }
                    _ => out.push((value * u8::MAX as f64) as u8),
                }
            }
        }
        out
    }

    fn jittered(&self, timestamp_us: i64) -> i64 {
        match self.jitter_std {
            Some(std) if !std.is_zero() => {
                // Box-Muller transform; rand's small API surface is enough here.
                let mut rng = rand::thread_rng();
                let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
                let u2: f64 = rng.gen_range(0.0..1.0);
                let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
                timestamp_us + (z * std.as_micros() as f64) as i64
            }
            _ => timestamp_us,
        }
    }
}

#[async_trait]
impl FrameSource for SimulatedCamera {
    async fn next_frame(&self, deadline: Duration) -> Result<FrameSourceOutcome> {
        let mut state = self.state.lock().await;

        if let Some(limit) = self.silent_after {
            if state.next_sequence >= limit {
                drop(state);
                sleep(deadline).await;
                return Ok(FrameSourceOutcome::Timeout);
            }
        }

        let now = Instant::now();
        let due = state.next_due.unwrap_or(now);
        if due > now + deadline {
            drop(state);
            sleep(deadline).await;
            return Ok(FrameSourceOutcome::Timeout);
        }
        sleep_until(due).await;

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.next_due = Some(due + self.interval);

        let base = *state.base_timestamp_us.get_or_insert_with(now_us);
        let nominal_us = base + (sequence as i64) * self.interval.as_micros() as i64;
        let pixels: Arc<[u8]> = self.render_scene(sequence).into();
        let frame = Frame::new(
            sequence,
            self.jittered(nominal_us),
            self.width,
            self.height,
            self.channel_depth,
            pixels,
        )?;
        Ok(FrameSourceOutcome::Frame(frame))
    }

    async fn ready(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn geometry(&self) -> (u32, u32, u8) {
        (self.width, self.height, self.channel_depth)
    }
}

/// Simulated display with a fixed scanout latency.
pub struct SimulatedDisplay {
    scanout: Duration,
    presented: AtomicU64,
    connected: AtomicBool,
}

impl SimulatedDisplay {
    /// Create a display with the default 500us scanout latency.
    pub fn new() -> Self {
        Self {
            scanout: Duration::from_micros(500),
            presented: AtomicU64::new(0),
            connected: AtomicBool::new(true),
        }
    }

    /// Number of frames presented so far.
    pub fn presented_count(&self) -> u64 {
        self.presented.load(Ordering::Acquire)
    }

    /// Mark the display as disconnected.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }
}

impl Default for SimulatedDisplay {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FrameSink for SimulatedDisplay {
    async fn present(&self, _frame: &Frame) -> Result<()> {
        if !self.connected.load(Ordering::Acquire) {
            anyhow::bail!("display disconnected");
        }
        sleep(self.scanout).await;
        self.presented.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn ready(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn camera_produces_monotonic_sequence() {
        let camera = SimulatedCamera::new(8, 8, 2, 1000.0);
        let mut last = None;
        for _ in 0..5 {
            match camera.next_frame(Duration::from_millis(50)).await.unwrap() {
                FrameSourceOutcome::Frame(frame) => {
                    if let Some(prev) = last {
                        assert_eq!(frame.sequence_id, prev + 1);
                    }
                    last = Some(frame.sequence_id);
                    assert_eq!(frame.byte_len(), 8 * 8 * 2);
                }
                FrameSourceOutcome::Timeout => panic!("unexpected timeout"),
            }
        }
    }

    #[tokio::test]
    async fn jitter_free_timestamps_are_evenly_spaced() {
        let camera = SimulatedCamera::new(4, 4, 1, 500.0);
        let mut stamps = Vec::new();
        for _ in 0..4 {
            if let FrameSourceOutcome::Frame(f) =
                camera.next_frame(Duration::from_millis(50)).await.unwrap()
            {
                stamps.push(f.timestamp_us);
            }
        }
        let deltas: Vec<i64> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(deltas.iter().all(|&d| d == 2_000));
    }

    #[tokio::test]
    async fn silence_injection_times_out() {
        let camera = SimulatedCamera::new(4, 4, 1, 1000.0).with_silence_after(2);
        for _ in 0..2 {
            let outcome = camera.next_frame(Duration::from_millis(20)).await.unwrap();
            assert!(matches!(outcome, FrameSourceOutcome::Frame(_)));
        }
        let outcome = camera.next_frame(Duration::from_millis(20)).await.unwrap();
        assert!(matches!(outcome, FrameSourceOutcome::Timeout));
    }

    #[tokio::test]
    async fn display_counts_presented_frames() {
        let display = SimulatedDisplay::new();
        let frame = Frame::new(0, 0, 2, 2, 1, vec![0u8; 4].into()).unwrap();
        display.present(&frame).await.unwrap();
        display.present(&frame).await.unwrap();
        assert_eq!(display.presented_count(), 2);
        display.disconnect();
        assert!(display.present(&frame).await.is_err());
    }
}
