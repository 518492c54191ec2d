//! Acquisition workflow state machine.
//!
//! The coordinator owns the [`AcquisitionSession`] and sequences
//!
//! ```text
//! Idle -> Baseline -> StimulusDirection(d) -> InterDirection -> ...
//!      -> Finalizing -> Complete
//! ```
//!
//! with `Aborted` reachable from every non-terminal state and terminal once
//! entered. Control intents (start/abort) arrive over an mpsc queue and are
//! polled only at frame and phase boundaries: an abort is cooperative and
//! never tears a cycle mid-frame. Hardware faults reach this loop through
//! frame-bus silence (wall-clock watchdog) rather than being thrown across
//! thread boundaries.
//!
//! On every abort the partial session is persisted for diagnostic replay;
//! only `Finalizing` performs the atomic manifest commit that makes a
//! session valid for analysis.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::acquisition::session::{AcquisitionParams, AcquisitionSession};
use crate::acquisition::stimulus::{PlaybackMode, StimulusCommand};
use crate::core::{Direction, Frame};
use crate::error::{IsiError, IsiResult};
use crate::hardware::{FrameSink, FrameSource};
use crate::storage;
use crate::sync::SyncTracker;
use crate::transport::broadcast::{HealthMonitor, SubsystemHealth};

/// Workflow state of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", content = "direction", rename_all = "snake_case")]
pub enum AcqState {
    /// No acquisition active.
    Idle,
    /// Recording pre-stimulus baseline frames.
    Baseline,
    /// Presenting and recording one sweep direction.
    StimulusDirection(Direction),
    /// Pause between directions.
    InterDirection,
    /// Persisting the session (atomic manifest commit).
    Finalizing,
    /// Run finished and persisted.
    Complete,
    /// Run aborted; partial data preserved. Terminal.
    Aborted,
}

impl AcqState {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AcqState::Complete | AcqState::Aborted)
    }

    /// Whether a new run may begin from this state.
    pub fn can_start(&self) -> bool {
        matches!(self, AcqState::Idle | AcqState::Complete | AcqState::Aborted)
    }

    /// Legal transition table of a single run.
    ///
    /// `Aborted` is reachable from every non-terminal state; terminal states
    /// have no outgoing edges (a new run starts a fresh machine).
    pub fn can_transition_to(&self, next: &AcqState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if matches!(next, AcqState::Aborted) {
            return true;
        }
        matches!(
            (self, next),
            (AcqState::Idle, AcqState::Baseline)
                | (AcqState::Baseline, AcqState::StimulusDirection(_))
                | (AcqState::StimulusDirection(_), AcqState::InterDirection)
                | (AcqState::StimulusDirection(_), AcqState::Finalizing)
                | (AcqState::InterDirection, AcqState::StimulusDirection(_))
                | (AcqState::Finalizing, AcqState::Complete)
        )
    }
}

/// Last-value-wins status snapshot published on the sync broadcast channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Current workflow state.
    pub state: AcqState,
    /// Active (or last) session id.
    pub session_id: Option<String>,
    /// Zero-based repetition index within the current direction.
    pub cycle_index: u32,
    /// Configured repetitions per direction.
    pub total_cycles: u32,
    /// Fraction of expected stimulus frames recorded, 0..=1.
    pub progress: f64,
    /// Transient frame drops counted so far.
    pub dropped_frames: u64,
    /// Sync records flagged desynchronized so far.
    pub desynchronized_records: u64,
    /// Stimulus+camera events unmatched past the grace period.
    pub unmatched_events: u64,
    /// Structured reason of the last abort, if any.
    pub last_error: Option<String>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            state: AcqState::Idle,
            session_id: None,
            cycle_index: 0,
            total_cycles: 0,
            progress: 0.0,
            dropped_frames: 0,
            desynchronized_records: 0,
            unmatched_events: 0,
            last_error: None,
        }
    }
}

/// Intents enqueued by the control channel and polled at boundaries.
#[derive(Debug)]
pub enum ControlIntent {
    /// Begin a run with resolved parameters.
    Start {
        /// Resolved acquisition parameters.
        params: AcquisitionParams,
        /// Replies with the new session id.
        reply: oneshot::Sender<IsiResult<String>>,
    },
    /// Abort the active run at the next frame boundary.
    Abort {
        /// Replies once the abort has been accepted.
        reply: oneshot::Sender<IsiResult<()>>,
    },
}

enum RunEnd {
    Completed,
    Aborted(String),
}

/// The acquisition orchestration loop.
///
/// All collaborators are passed in at construction; nothing is looked up
/// through globals.
pub struct AcquisitionCoordinator {
    state: AcqState,
    storage_root: std::path::PathBuf,
    abort_on_drift: bool,
    source: Arc<dyn FrameSource>,
    sink: Arc<dyn FrameSink>,
    stimulus_tx: mpsc::Sender<StimulusCommand>,
    tracker: Arc<Mutex<SyncTracker>>,
    status_tx: watch::Sender<StatusSnapshot>,
    health: HealthMonitor,
    session: Option<AcquisitionSession>,
    frames_recorded: u64,
    cycle_index: u32,
    last_error: Option<String>,
}

impl AcquisitionCoordinator {
    /// Construct the coordinator and its status watch channel.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage_root: std::path::PathBuf,
        abort_on_drift: bool,
        source: Arc<dyn FrameSource>,
        sink: Arc<dyn FrameSink>,
        stimulus_tx: mpsc::Sender<StimulusCommand>,
        tracker: Arc<Mutex<SyncTracker>>,
        health: HealthMonitor,
    ) -> (Self, watch::Receiver<StatusSnapshot>) {
        let (status_tx, status_rx) = watch::channel(StatusSnapshot::default());
        (
            Self {
                state: AcqState::Idle,
                storage_root,
                abort_on_drift,
                source,
                sink,
                stimulus_tx,
                tracker,
                status_tx,
                health,
                session: None,
                frames_recorded: 0,
                cycle_index: 0,
                last_error: None,
            },
            status_rx,
        )
    }

    /// Spawn the orchestration loop.
    pub fn spawn(
        self,
        intents: mpsc::Receiver<ControlIntent>,
        frames: broadcast::Receiver<Arc<Frame>>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(intents, frames))
    }

    async fn run(
        mut self,
        mut intents: mpsc::Receiver<ControlIntent>,
        mut frames: broadcast::Receiver<Arc<Frame>>,
    ) {
        self.health.set("orchestrator", SubsystemHealth::Online);
        loop {
            let Some(intent) = intents.recv().await else {
                break;
            };
            match intent {
                ControlIntent::Abort { reply } => {
                    // Nothing active; abort is a reported no-op error.
                    let _ = reply.send(Err(IsiError::Configuration(
                        "no acquisition active".into(),
                    )));
                }
                ControlIntent::Start { params, reply } => {
                    if !self.state.can_start() {
                        let _ = reply.send(Err(IsiError::Configuration(
                            "acquisition already active".into(),
                        )));
                        continue;
                    }
                    if !self.source.ready().await {
                        let _ = reply.send(Err(IsiError::HardwareUnavailable {
                            subsystem: "camera".into(),
                            reason: "frame source not ready".into(),
                        }));
                        continue;
                    }
                    if !self.sink.ready().await {
                        let _ = reply.send(Err(IsiError::HardwareUnavailable {
                            subsystem: "display".into(),
                            reason: "frame sink not ready".into(),
                        }));
                        continue;
                    }

                    let session = AcquisitionSession::new(params);
                    let _ = reply.send(Ok(session.id.clone()));
                    info!(session_id = %session.id, "acquisition starting");

                    if let Ok(mut tracker) = self.tracker.lock() {
                        tracker.reset();
                    }
                    self.session = Some(session);
                    self.frames_recorded = 0;
                    self.cycle_index = 0;
                    self.last_error = None;
                    self.state = AcqState::Idle;

                    // Drop frames buffered while idle.
                    frames = frames.resubscribe();
                    let end = self.run_session(&mut intents, &mut frames).await;
                    self.conclude(end).await;
                }
            }
        }
        self.health.set("orchestrator", SubsystemHealth::Offline);
        info!("acquisition coordinator stopped");
    }

    /// Drive one session from Baseline to Finalizing.
    async fn run_session(
        &mut self,
        intents: &mut mpsc::Receiver<ControlIntent>,
        frames: &mut broadcast::Receiver<Arc<Frame>>,
    ) -> RunEnd {
        let params = match &self.session {
            Some(session) => session.params.clone(),
            None => return RunEnd::Aborted("no session".into()),
        };

        let _ = self
            .stimulus_tx
            .send(StimulusCommand::SetMode(PlaybackMode::Record))
            .await;

        // Baseline phase: gap-free recording for the configured duration.
        self.transition(AcqState::Baseline);
        let deadline = Instant::now() + params.baseline;
        while Instant::now() < deadline {
            match self.recv_frame(frames, params.frame_timeout).await {
                Ok(frame) => {
                    if let Some(session) = self.session.as_mut() {
                        session.baseline_frames.push((*frame).clone());
                    }
                }
                Err(reason) => return RunEnd::Aborted(reason),
            }
            if let Some(reason) = self.poll_intents(intents) {
                return RunEnd::Aborted(reason);
            }
        }

        // One dataset per configured direction, `cycles` repetitions each.
        let directions = params.directions.clone();
        for (position, &direction) in directions.iter().enumerate() {
            self.transition(AcqState::StimulusDirection(direction));
            if let Some(session) = self.session.as_mut() {
                session.begin_direction(direction);
            }

            for cycle in 0..params.cycles {
                self.cycle_index = cycle;
                if let Some(session) = self.session.as_mut() {
                    session.begin_cycle();
                }
                let _ = self
                    .stimulus_tx
                    .send(StimulusCommand::BeginSweep {
                        direction,
                        cycle_index: cycle,
                    })
                    .await;

                for _ in 0..params.frames_per_cycle {
                    match self.recv_frame(frames, params.frame_timeout).await {
                        Ok(frame) => {
                            self.frames_recorded += 1;
                            if let Some(session) = self.session.as_mut() {
                                session.push_frame((*frame).clone());
                            }
                        }
                        Err(reason) => return RunEnd::Aborted(reason),
                    }
                    if let Some(reason) = self.poll_intents(intents) {
                        return RunEnd::Aborted(reason);
                    }
                }

                // Cycle boundary: collect the sync records it produced.
                let records = self
                    .tracker
                    .lock()
                    .map(|mut t| t.drain_records())
                    .unwrap_or_default();
                if let Some(session) = self.session.as_mut() {
                    session.push_sync_records(records);
                }

                if self.abort_on_drift {
                    let drifted = self
                        .tracker
                        .lock()
                        .map(|t| t.drift_exceeded())
                        .unwrap_or(false);
                    if drifted {
                        return RunEnd::Aborted("sync drift exceeded configured bound".into());
                    }
                }
                self.publish_status();
            }

            let _ = self.stimulus_tx.send(StimulusCommand::EndSweep).await;

            if position + 1 < directions.len() {
                self.transition(AcqState::InterDirection);
                let pause = tokio::time::sleep(params.inter_direction);
                tokio::pin!(pause);
                loop {
                    tokio::select! {
                        _ = &mut pause => break,
                        intent = intents.recv() => {
                            if let Some(reason) = self.handle_intent_while_running(intent) {
                                return RunEnd::Aborted(reason);
                            }
                        }
                    }
                }
                // Discard frames captured during the pause.
                *frames = frames.resubscribe();
            }
        }

        self.transition(AcqState::Finalizing);
        RunEnd::Completed
    }

    /// Finalize or abort the session, persisting in both cases.
    async fn conclude(&mut self, end: RunEnd) {
        let _ = self.stimulus_tx.send(StimulusCommand::EndSweep).await;
        let _ = self
            .stimulus_tx
            .send(StimulusCommand::SetMode(PlaybackMode::Preview))
            .await;

        if self.session.is_none() {
            return;
        }

        match end {
            RunEnd::Completed => {
                if let Some(session) = self.session.as_mut() {
                    session.finalize();
                }
                let persisted = self
                    .session
                    .as_ref()
                    .map(|s| storage::persist_session(s, &self.storage_root));
                match persisted {
                    Some(Ok(dir)) => {
                        info!(dir = %dir.display(), "acquisition complete");
                        self.transition(AcqState::Complete);
                    }
                    Some(Err(e)) => {
                        error!(%e, "session persist failed");
                        self.last_error = Some(e.to_string());
                        self.transition(AcqState::Aborted);
                    }
                    None => {}
                }
            }
            RunEnd::Aborted(reason) => {
                warn!(%reason, "acquisition aborted; preserving partial dataset");
                if let Some(session) = self.session.as_mut() {
                    session.abort(reason.clone());
                }
                if let Some(Err(e)) = self
                    .session
                    .as_ref()
                    .map(|s| storage::persist_session(s, &self.storage_root))
                {
                    error!(%e, "failed to persist partial session after abort");
                }
                self.last_error = Some(reason);
                self.transition(AcqState::Aborted);
            }
        }
        self.session = None;
    }

    /// Receive one camera frame with the silence watchdog applied.
    async fn recv_frame(
        &mut self,
        frames: &mut broadcast::Receiver<Arc<Frame>>,
        deadline: Duration,
    ) -> Result<Arc<Frame>, String> {
        loop {
            match tokio::time::timeout(deadline, frames.recv()).await {
                Ok(Ok(frame)) => return Ok(frame),
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    // Transient: count and continue.
                    if let Some(session) = self.session.as_mut() {
                        session.dropped_frames += skipped;
                    }
                    warn!(skipped, "coordinator lagged behind camera frames");
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err("camera frame bus closed".into());
                }
                Err(_) => {
                    let err = IsiError::FrameSourceSilent {
                        timeout_ms: deadline.as_millis() as u64,
                    };
                    self.health
                        .set("camera", SubsystemHealth::Error(err.to_string()));
                    return Err(err.to_string());
                }
            }
        }
    }

    /// Drain pending intents at a frame boundary; returns an abort reason if
    /// one was requested.
    fn poll_intents(&mut self, intents: &mut mpsc::Receiver<ControlIntent>) -> Option<String> {
        loop {
            match intents.try_recv() {
                Ok(intent) => {
                    if let Some(reason) = self.handle_intent_while_running(Some(intent)) {
                        return Some(reason);
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => return None,
                Err(mpsc::error::TryRecvError::Disconnected) => return None,
            }
        }
    }

    fn handle_intent_while_running(&mut self, intent: Option<ControlIntent>) -> Option<String> {
        match intent {
            Some(ControlIntent::Start { reply, .. }) => {
                let _ = reply.send(Err(IsiError::Configuration(
                    "acquisition already active".into(),
                )));
                None
            }
            Some(ControlIntent::Abort { reply }) => {
                let _ = reply.send(Ok(()));
                Some("operator abort".into())
            }
            None => Some("control intent channel closed".into()),
        }
    }

    fn transition(&mut self, next: AcqState) {
        debug_assert!(
            self.state.can_transition_to(&next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
        self.publish_status();
    }

    fn publish_status(&self) {
        let (desynchronized, unmatched) = self
            .tracker
            .lock()
            .map(|t| {
                let (s, c) = t.unmatched_counts();
                (t.desynchronized_count(), s + c)
            })
            .unwrap_or((0, 0));

        let (session_id, total_cycles, expected, dropped, last_error) = match &self.session {
            Some(session) => (
                Some(session.id.clone()),
                session.params.cycles,
                session.params.frames_per_direction() * session.params.directions.len() as u64,
                session.dropped_frames,
                self.last_error.clone(),
            ),
            None => (None, 0, 0, 0, self.last_error.clone()),
        };

        let snapshot = StatusSnapshot {
            state: self.state,
            session_id,
            cycle_index: self.cycle_index,
            total_cycles,
            progress: if expected > 0 {
                (self.frames_recorded as f64 / expected as f64).min(1.0)
            } else {
                0.0
            },
            dropped_frames: dropped,
            desynchronized_records: desynchronized,
            unmatched_events: unmatched,
            last_error,
        };
        let _ = self.status_tx.send(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_states() -> Vec<AcqState> {
        vec![
            AcqState::Idle,
            AcqState::Baseline,
            AcqState::StimulusDirection(Direction::LR),
            AcqState::StimulusDirection(Direction::BT),
            AcqState::InterDirection,
            AcqState::Finalizing,
            AcqState::Complete,
            AcqState::Aborted,
        ]
    }

    #[test]
    fn stimulus_is_only_reachable_through_baseline() {
        // The only legal edge into StimulusDirection from outside a sweep
        // sequence is Baseline -> StimulusDirection.
        for state in all_states() {
            let reaches = state.can_transition_to(&AcqState::StimulusDirection(Direction::LR));
            let legal = matches!(
                state,
                AcqState::Baseline | AcqState::InterDirection
            );
            assert_eq!(reaches, legal, "from {state:?}");
        }
        // And InterDirection itself is only reachable from a stimulus phase,
        // so every path from Idle passes Baseline first.
        assert!(!AcqState::Idle.can_transition_to(&AcqState::InterDirection));
        assert!(!AcqState::Idle.can_transition_to(&AcqState::StimulusDirection(Direction::LR)));
        assert!(AcqState::Idle.can_transition_to(&AcqState::Baseline));
    }

    #[test]
    fn aborted_is_reachable_from_every_non_terminal_state_and_terminal() {
        for state in all_states() {
            if state.is_terminal() {
                // No outgoing edges at all.
                for next in all_states() {
                    assert!(!state.can_transition_to(&next), "{state:?} -> {next:?}");
                }
            } else {
                assert!(state.can_transition_to(&AcqState::Aborted), "from {state:?}");
            }
        }
    }

    #[test]
    fn complete_only_follows_finalizing() {
        for state in all_states() {
            let legal = matches!(state, AcqState::Finalizing);
            assert_eq!(state.can_transition_to(&AcqState::Complete), legal);
        }
    }

    #[test]
    fn state_serializes_with_direction_payload() {
        let json = serde_json::to_string(&AcqState::StimulusDirection(Direction::RL)).unwrap();
        assert!(json.contains("stimulus_direction"));
        assert!(json.contains("rl"));
        let back: AcqState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, AcqState::StimulusDirection(Direction::RL));
    }
}
