//! Acquisition session aggregates.
//!
//! An [`AcquisitionSession`] collects everything one run produces: per
//! direction, `cycles` repetitions of ordered camera frames plus the sync
//! records matched against them. The session is mutated only by the
//! coordinator thread and becomes immutable once persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::config::Settings;
use crate::core::{Direction, Frame};
use crate::sync::SyncRecord;
use crate::transport::protocol::StartAcquisitionParams;

/// Resolved parameters of one acquisition run.
///
/// Built from the engine configuration with optional per-command overrides;
/// persisted verbatim in the session manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionParams {
    /// Presentation order of sweep directions.
    pub directions: Vec<Direction>,
    /// Sweep repetitions per direction.
    pub cycles: u32,
    /// Stimulus frames composing one full sweep cycle.
    pub frames_per_cycle: u32,
    /// Nominal camera rate in frames per second.
    pub camera_fps: f64,
    /// Baseline recording duration before the first direction.
    #[serde(with = "humantime_serde")]
    pub baseline: Duration,
    /// Pause between directions.
    #[serde(with = "humantime_serde")]
    pub inter_direction: Duration,
    /// Watchdog deadline for frame-source silence.
    #[serde(with = "humantime_serde")]
    pub frame_timeout: Duration,
}

impl AcquisitionParams {
    /// Resolve parameters from configuration plus command overrides.
    pub fn resolve(settings: &Settings, overrides: &StartAcquisitionParams) -> Self {
        let acq = &settings.acquisition;
        Self {
            directions: overrides
                .directions
                .clone()
                .unwrap_or_else(|| acq.directions.clone()),
            cycles: overrides.cycles.unwrap_or(acq.cycles),
            frames_per_cycle: acq.frames_per_cycle,
            camera_fps: settings.camera.fps,
            baseline: acq.baseline,
            inter_direction: acq.inter_direction,
            frame_timeout: acq.frame_timeout,
        }
    }

    /// Stimulus temporal frequency implied by camera-clocked playback.
    pub fn stimulus_frequency_hz(&self) -> f64 {
        self.camera_fps / self.frames_per_cycle as f64
    }

    /// Total camera frames expected per direction.
    pub fn frames_per_direction(&self) -> u64 {
        self.cycles as u64 * self.frames_per_cycle as u64
    }
}

/// One sweep repetition: ordered frames plus their sync records.
#[derive(Debug, Clone, Default)]
pub struct CycleData {
    /// Camera frames captured during the repetition, in capture order.
    pub frames: Vec<Frame>,
    /// Sync records matched during the repetition.
    pub sync_records: Vec<SyncRecord>,
}

/// All repetitions recorded for one sweep direction.
#[derive(Debug, Clone)]
pub struct DirectionDataset {
    /// The direction this dataset belongs to.
    pub direction: Direction,
    /// Completed (and, on abort, one possibly partial) repetitions.
    pub cycles: Vec<CycleData>,
}

impl DirectionDataset {
    /// Create an empty dataset for `direction`.
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            cycles: Vec::new(),
        }
    }

    /// All frames across cycles in recording order.
    pub fn all_frames(&self) -> impl Iterator<Item = &Frame> {
        self.cycles.iter().flat_map(|c| c.frames.iter())
    }

    /// Total frame count across cycles.
    pub fn frame_count(&self) -> usize {
        self.cycles.iter().map(|c| c.frames.len()).sum()
    }

    /// All sync records across cycles in recording order.
    pub fn all_sync_records(&self) -> impl Iterator<Item = &SyncRecord> {
        self.cycles.iter().flat_map(|c| c.sync_records.iter())
    }
}

/// Terminal disposition of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum SessionOutcome {
    /// All directions completed and the session was persisted.
    Complete,
    /// The run was aborted; partial data is preserved for diagnostics.
    Aborted(String),
}

/// Aggregate state of one acquisition run.
///
/// Owned and mutated exclusively by the coordinator; everything else sees it
/// only after finalization.
#[derive(Debug)]
pub struct AcquisitionSession {
    /// Unique session identifier (directory name on disk).
    pub id: String,
    /// Resolved run parameters.
    pub params: AcquisitionParams,
    /// Run start stamp.
    pub started_at: DateTime<Utc>,
    /// Run end stamp, set at finalization or abort.
    pub ended_at: Option<DateTime<Utc>>,
    /// Frames recorded during the baseline phase.
    pub baseline_frames: Vec<Frame>,
    /// Per-direction datasets in presentation order.
    pub datasets: Vec<DirectionDataset>,
    /// Transient single-frame drops observed during the run.
    pub dropped_frames: u64,
    /// Terminal disposition, set at finalization or abort.
    pub outcome: Option<SessionOutcome>,
}

impl AcquisitionSession {
    /// Start a new session with a fresh identifier.
    pub fn new(params: AcquisitionParams) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            params,
            started_at: Utc::now(),
            ended_at: None,
            baseline_frames: Vec::new(),
            datasets: Vec::new(),
            dropped_frames: 0,
            outcome: None,
        }
    }

    /// Open a dataset for `direction` and make it current.
    pub fn begin_direction(&mut self, direction: Direction) {
        self.datasets.push(DirectionDataset::new(direction));
    }

    /// Open a new cycle on the current direction.
    pub fn begin_cycle(&mut self) {
        if let Some(dataset) = self.datasets.last_mut() {
            dataset.cycles.push(CycleData::default());
        }
    }

    /// Append a frame to the current cycle.
    pub fn push_frame(&mut self, frame: Frame) {
        if let Some(cycle) = self.datasets.last_mut().and_then(|d| d.cycles.last_mut()) {
            cycle.frames.push(frame);
        }
    }

    /// Append sync records to the current cycle.
    pub fn push_sync_records(&mut self, records: Vec<SyncRecord>) {
        if let Some(cycle) = self.datasets.last_mut().and_then(|d| d.cycles.last_mut()) {
            cycle.sync_records.extend(records);
        }
    }

    /// Count of sync records flagged desynchronized across the session.
    pub fn desynchronized_count(&self) -> u64 {
        self.datasets
            .iter()
            .flat_map(DirectionDataset::all_sync_records)
            .filter(|r| r.desynchronized)
            .count() as u64
    }

    /// Mark the session complete.
    pub fn finalize(&mut self) {
        self.ended_at = Some(Utc::now());
        self.outcome = Some(SessionOutcome::Complete);
    }

    /// Mark the session aborted, preserving partial data.
    pub fn abort(&mut self, reason: String) {
        self.ended_at = Some(Utc::now());
        self.outcome = Some(SessionOutcome::Aborted(reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn params() -> AcquisitionParams {
        AcquisitionParams {
            directions: Direction::ALL.to_vec(),
            cycles: 2,
            frames_per_cycle: 30,
            camera_fps: 30.0,
            baseline: Duration::from_secs(1),
            inter_direction: Duration::from_millis(100),
            frame_timeout: Duration::from_millis(500),
        }
    }

    fn frame(seq: u64) -> Frame {
        Frame::new(seq, seq as i64, 2, 2, 1, Arc::from(vec![0u8; 4])).unwrap()
    }

    #[test]
    fn camera_clocked_stimulus_frequency() {
        let p = params();
        assert!((p.stimulus_frequency_hz() - 1.0).abs() < f64::EPSILON);
        assert_eq!(p.frames_per_direction(), 60);
    }

    #[test]
    fn frames_accumulate_into_current_cycle() {
        let mut session = AcquisitionSession::new(params());
        session.begin_direction(Direction::LR);
        session.begin_cycle();
        session.push_frame(frame(0));
        session.push_frame(frame(1));
        session.begin_cycle();
        session.push_frame(frame(2));

        let dataset = &session.datasets[0];
        assert_eq!(dataset.cycles.len(), 2);
        assert_eq!(dataset.cycles[0].frames.len(), 2);
        assert_eq!(dataset.cycles[1].frames.len(), 1);
        assert_eq!(dataset.frame_count(), 3);
    }

    #[test]
    fn abort_preserves_partial_data() {
        let mut session = AcquisitionSession::new(params());
        session.begin_direction(Direction::LR);
        session.begin_cycle();
        session.push_frame(frame(0));
        session.abort("frame source silent".into());

        assert_eq!(
            session.outcome,
            Some(SessionOutcome::Aborted("frame source silent".into()))
        );
        assert_eq!(session.datasets[0].frame_count(), 1);
        assert!(session.ended_at.is_some());
    }

    #[test]
    fn overrides_take_precedence() {
        let settings = Settings::default();
        let overrides = StartAcquisitionParams {
            cycles: Some(3),
            directions: Some(vec![Direction::TB, Direction::BT]),
        };
        let resolved = AcquisitionParams::resolve(&settings, &overrides);
        assert_eq!(resolved.cycles, 3);
        assert_eq!(resolved.directions, vec![Direction::TB, Direction::BT]);
        assert_eq!(resolved.frames_per_cycle, settings.acquisition.frames_per_cycle);
    }
}
