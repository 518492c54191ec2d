//! Timestamp synchronization tracking.
//!
//! The tracker pairs stimulus-presentation events with camera-capture events
//! and bounds the drift between the two clocks. Each accepted pair becomes an
//! immutable [`SyncRecord`] on the per-session log; offsets beyond the
//! configured tolerance flag the record `desynchronized` (advisory, never
//! fatal by itself), and events with no counterpart within the grace period
//! are counted as unmatched.
//!
//! Rolling per-direction statistics feed `drift_exceeded()`, which the
//! health publisher samples through a cheap atomic probe. Whether the
//! coordinator aborts on drift is its policy, not the tracker's.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::SyncSettings;
use crate::core::{CameraEvent, Direction, StimulusEvent};
use serde::{Deserialize, Serialize};

/// Rolling window length for jitter statistics.
const JITTER_WINDOW: usize = 64;

/// One matched stimulus/camera event pair. Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    /// Sequence id of the stimulus frame.
    pub stimulus_frame_id: u64,
    /// Presentation timestamp of the stimulus frame, microseconds.
    pub stimulus_timestamp_us: i64,
    /// Sequence id of the paired camera frame.
    pub camera_frame_id: u64,
    /// Capture timestamp of the paired camera frame, microseconds.
    pub camera_timestamp_us: i64,
    /// Sweep direction active when the pair was made.
    pub direction: Direction,
    /// Zero-based repetition index within the direction.
    pub cycle_index: u32,
    /// True when the offset exceeded the tolerance window.
    pub desynchronized: bool,
}

impl SyncRecord {
    /// Signed camera-minus-stimulus offset in microseconds.
    pub fn offset_us(&self) -> i64 {
        self.camera_timestamp_us - self.stimulus_timestamp_us
    }
}

/// Rolling jitter statistics for one direction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectionStats {
    /// Number of pairs recorded.
    pub pairs: u64,
    /// Mean absolute offset over the rolling window, microseconds.
    pub mean_abs_offset_us: f64,
    /// Largest absolute offset seen, microseconds.
    pub max_abs_offset_us: i64,
}

#[derive(Default)]
struct DirectionWindow {
    pairs: u64,
    window: VecDeque<i64>,
    max_abs: i64,
}

impl DirectionWindow {
    fn push(&mut self, offset_us: i64) {
        self.pairs += 1;
        self.max_abs = self.max_abs.max(offset_us.abs());
        if self.window.len() == JITTER_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(offset_us);
    }

    fn mean_abs(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.window.iter().map(|o| o.abs() as f64).sum();
        sum / self.window.len() as f64
    }

    fn stats(&self) -> DirectionStats {
        DirectionStats {
            pairs: self.pairs,
            mean_abs_offset_us: self.mean_abs(),
            max_abs_offset_us: self.max_abs,
        }
    }
}

/// Pairs stimulus and camera timestamps and tracks drift.
pub struct SyncTracker {
    tolerance_us: i64,
    grace_us: i64,
    jitter_bound_us: i64,
    pending_stimulus: VecDeque<StimulusEvent>,
    pending_camera: VecDeque<CameraEvent>,
    records: Vec<SyncRecord>,
    stats: HashMap<Direction, DirectionWindow>,
    unmatched_stimulus: u64,
    unmatched_camera: u64,
    desynchronized: u64,
    drift_flag: Arc<AtomicBool>,
}

impl SyncTracker {
    /// Build a tracker from the sync configuration.
    pub fn new(settings: &SyncSettings) -> Self {
        Self {
            tolerance_us: settings.tolerance.as_micros() as i64,
            grace_us: settings.grace.as_micros() as i64,
            jitter_bound_us: settings.jitter_bound.as_micros() as i64,
            pending_stimulus: VecDeque::new(),
            pending_camera: VecDeque::new(),
            records: Vec::new(),
            stats: HashMap::new(),
            unmatched_stimulus: 0,
            unmatched_camera: 0,
            desynchronized: 0,
            drift_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Record a stimulus presentation event; returns the pair if one formed.
    pub fn record_stimulus(&mut self, event: StimulusEvent) -> Option<SyncRecord> {
        self.pending_stimulus.push_back(event);
        let record = self.try_pair();
        self.expire(event.timestamp_us);
        record
    }

    /// Record a camera capture event; returns the pair if one formed.
    pub fn record_camera(&mut self, event: CameraEvent) -> Option<SyncRecord> {
        self.pending_camera.push_back(event);
        let record = self.try_pair();
        self.expire(event.timestamp_us);
        record
    }

    /// Advisory flag: rolling jitter exceeded the configured bound.
    pub fn drift_exceeded(&self) -> bool {
        self.drift_flag.load(Ordering::Acquire)
    }

    /// Cheap probe handle for the health publisher.
    pub fn drift_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.drift_flag)
    }

    /// Rolling statistics for one direction, if any pairs were recorded.
    pub fn direction_stats(&self, direction: Direction) -> Option<DirectionStats> {
        self.stats.get(&direction).map(DirectionWindow::stats)
    }

    /// Records accumulated since the last drain, in pairing order.
    pub fn drain_records(&mut self) -> Vec<SyncRecord> {
        std::mem::take(&mut self.records)
    }

    /// Number of records flagged desynchronized so far.
    pub fn desynchronized_count(&self) -> u64 {
        self.desynchronized
    }

    /// Stimulus/camera events that aged out of the grace period unpaired.
    pub fn unmatched_counts(&self) -> (u64, u64) {
        (self.unmatched_stimulus, self.unmatched_camera)
    }

    /// Clear all pending events, records and statistics for a new run.
    pub fn reset(&mut self) {
        self.pending_stimulus.clear();
        self.pending_camera.clear();
        self.records.clear();
        self.stats.clear();
        self.unmatched_stimulus = 0;
        self.unmatched_camera = 0;
        self.desynchronized = 0;
        self.drift_flag.store(false, Ordering::Release);
    }

    /// Pair the oldest pending stimulus event with the nearest pending
    /// camera event inside the grace window.
    fn try_pair(&mut self) -> Option<SyncRecord> {
        let stimulus = *self.pending_stimulus.front()?;

        let (index, offset) = self
            .pending_camera
            .iter()
            .enumerate()
            .map(|(i, cam)| (i, cam.timestamp_us - stimulus.timestamp_us))
            .min_by_key(|(_, offset)| offset.abs())?;

        if offset.abs() > self.grace_us {
            // Nothing close enough yet; wait for more camera events.
            return None;
        }

        self.pending_stimulus.pop_front();
        let camera = self.pending_camera.remove(index)?;

        let desynchronized = offset.abs() > self.tolerance_us;
        if desynchronized {
            self.desynchronized += 1;
            warn!(
                offset_us = offset,
                tolerance_us = self.tolerance_us,
                direction = %stimulus.direction,
                "stimulus/camera pair outside tolerance window"
            );
        }

        let record = SyncRecord {
            stimulus_frame_id: stimulus.frame_id,
            stimulus_timestamp_us: stimulus.timestamp_us,
            camera_frame_id: camera.frame_id,
            camera_timestamp_us: camera.timestamp_us,
            direction: stimulus.direction,
            cycle_index: stimulus.cycle_index,
            desynchronized,
        };
        self.records.push(record);

        let window = self.stats.entry(stimulus.direction).or_default();
        window.push(offset);
        let drift = window.mean_abs() > self.jitter_bound_us as f64;
        self.drift_flag.store(drift, Ordering::Release);

        Some(record)
    }

    /// Drop events that aged past the grace period without a counterpart.
    fn expire(&mut self, now_us: i64) {
        while let Some(front) = self.pending_stimulus.front() {
            if now_us - front.timestamp_us > self.grace_us {
                debug!(frame_id = front.frame_id, "stimulus event unmatched past grace period");
                self.unmatched_stimulus += 1;
                self.pending_stimulus.pop_front();
            } else {
                break;
            }
        }
        while let Some(front) = self.pending_camera.front() {
            if now_us - front.timestamp_us > self.grace_us {
                debug!(frame_id = front.frame_id, "camera event unmatched past grace period");
                self.unmatched_camera += 1;
                self.pending_camera.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tracker_with(tolerance_ms: u64, grace_ms: u64, bound_ms: u64) -> SyncTracker {
        SyncTracker::new(&SyncSettings {
            tolerance: Duration::from_millis(tolerance_ms),
            grace: Duration::from_millis(grace_ms),
            jitter_bound: Duration::from_millis(bound_ms),
            abort_on_drift: false,
        })
    }

    fn stim(id: u64, t_us: i64) -> StimulusEvent {
        StimulusEvent {
            frame_id: id,
            timestamp_us: t_us,
            direction: Direction::LR,
            cycle_index: 0,
        }
    }

    fn cam(id: u64, t_us: i64) -> CameraEvent {
        CameraEvent {
            frame_id: id,
            timestamp_us: t_us,
        }
    }

    #[test]
    fn constant_offset_within_tolerance_pairs_everything() {
        // Stimulus at t, t+delta, ...; camera offset by epsilon < tolerance.
        let mut tracker = tracker_with(5, 200, 2);
        let delta = 33_333i64;
        let epsilon = 1_200i64;

        let mut pairs = 0;
        for i in 0..30 {
            let t = i * delta;
            assert!(tracker.record_stimulus(stim(i as u64, t)).is_none());
            let record = tracker.record_camera(cam(i as u64, t + epsilon));
            let record = record.unwrap();
            assert!(!record.desynchronized);
            assert_eq!(record.offset_us(), epsilon);
            pairs += 1;
        }
        assert_eq!(pairs, 30);
        assert_eq!(tracker.desynchronized_count(), 0);
        assert_eq!(tracker.unmatched_counts(), (0, 0));

        let stats = tracker.direction_stats(Direction::LR).unwrap();
        assert_eq!(stats.pairs, 30);
        // Reported jitter approximates the injected epsilon.
        assert!((stats.mean_abs_offset_us - epsilon as f64).abs() < 1.0);
        assert_eq!(stats.max_abs_offset_us, epsilon);
        assert!(!tracker.drift_exceeded());
    }

    #[test]
    fn offset_beyond_tolerance_is_flagged_not_dropped() {
        let mut tracker = tracker_with(5, 200, 2);
        tracker.record_stimulus(stim(0, 0));
        let record = tracker.record_camera(cam(0, 8_000)).unwrap();
        assert!(record.desynchronized);
        assert_eq!(tracker.desynchronized_count(), 1);
    }

    #[test]
    fn events_past_grace_become_unmatched() {
        let mut tracker = tracker_with(5, 50, 2);
        tracker.record_stimulus(stim(0, 0));
        // Next stimulus arrives long after; the first ages out unpaired.
        tracker.record_stimulus(stim(1, 1_000_000));
        assert_eq!(tracker.unmatched_counts().0, 1);
    }

    #[test]
    fn nearest_camera_event_wins() {
        let mut tracker = tracker_with(5, 100, 2);
        tracker.record_camera(cam(0, -40_000));
        tracker.record_camera(cam(1, 900));
        let record = tracker.record_stimulus(stim(0, 0)).unwrap();
        assert_eq!(record.camera_frame_id, 1);
        assert_eq!(record.offset_us(), 900);
    }

    #[test]
    fn drift_flag_follows_rolling_jitter() {
        let mut tracker = tracker_with(50, 200, 2);
        for i in 0..10 {
            let t = i * 33_333;
            tracker.record_stimulus(stim(i as u64, t));
            // 10ms offset: inside tolerance is irrelevant here, the jitter
            // bound of 2ms is what trips.
            tracker.record_camera(cam(i as u64, t + 10_000));
        }
        assert!(tracker.drift_exceeded());

        tracker.reset();
        assert!(!tracker.drift_exceeded());
        assert_eq!(tracker.desynchronized_count(), 0);
    }

    #[test]
    fn drained_records_preserve_order() {
        let mut tracker = tracker_with(5, 200, 2);
        for i in 0..4 {
            let t = i * 33_333;
            tracker.record_stimulus(stim(i as u64, t));
            tracker.record_camera(cam(i as u64, t + 500));
        }
        let records = tracker.drain_records();
        assert_eq!(records.len(), 4);
        assert!(records.windows(2).all(|w| w[0].stimulus_frame_id < w[1].stimulus_frame_id));
        assert!(tracker.drain_records().is_empty());
    }
}
