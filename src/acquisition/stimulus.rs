//! Camera-triggered stimulus playback.
//!
//! One controller serves both playback paths behind a mode switch:
//!
//! - **Record**: each accepted camera trigger advances the stimulus by
//!   exactly one pre-rendered frame and presents it. Stimulus cadence is
//!   camera-clocked, not wall-clock timed, so no drift accumulates over a
//!   cycle.
//! - **Preview**: free-running playback on a fixed frame interval with no
//!   camera coupling.
//!
//! Mode switching is only legal while no acquisition is active; that rule is
//! enforced by the coordinator, which owns the command channel, not here.
//!
//! Sweep tables are rendered up front so the trigger path never renders.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::{now_us, CameraEvent, Direction, Frame, StimulusEvent};
use crate::hardware::FrameSink;
use crate::sync::SyncTracker;
use crate::transport::broadcast::{HealthMonitor, SubsystemHealth};
use crate::transport::shm::FrameChannel;

/// Playback mode of the stimulus controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackMode {
    /// Free-running playback decoupled from the camera.
    Preview,
    /// Camera-clocked playback: one stimulus frame per camera trigger.
    Record,
}

/// Commands the coordinator sends to the playback task.
#[derive(Debug)]
pub enum StimulusCommand {
    /// Switch playback mode. The coordinator only sends this while idle.
    SetMode(PlaybackMode),
    /// Begin presenting a sweep for `direction`, repetition `cycle_index`.
    BeginSweep {
        /// Direction to sweep.
        direction: Direction,
        /// Zero-based repetition index.
        cycle_index: u32,
    },
    /// Stop presenting; triggers are ignored until the next sweep.
    EndSweep,
}

/// Pre-rendered stimulus frames, one table per direction.
pub struct SweepTables {
    width: u32,
    height: u32,
    channel_depth: u8,
    frames: HashMap<Direction, Vec<Arc<[u8]>>>,
}

impl SweepTables {
    /// Render a drifting-bar sweep table for every direction.
    ///
    /// The bar occupies a fixed fraction of the swept axis and advances one
    /// step per frame, wrapping after `frames_per_cycle` frames.
    pub fn render(width: u32, height: u32, channel_depth: u8, frames_per_cycle: u32) -> Self {
        let mut frames = HashMap::new();
        for direction in Direction::ALL {
            let mut table = Vec::with_capacity(frames_per_cycle as usize);
            for index in 0..frames_per_cycle {
                table.push(Self::render_bar(
                    width,
                    height,
                    channel_depth,
                    direction,
                    index as f64 / frames_per_cycle as f64,
                ));
            }
            frames.insert(direction, table);
        }
        Self {
            width,
            height,
            channel_depth,
            frames,
        }
    }

    fn render_bar(
        width: u32,
        height: u32,
        channel_depth: u8,
        direction: Direction,
        phase: f64,
    ) -> Arc<[u8]> {
        // Bar width is 10% of the swept extent.
        const BAR_FRACTION: f64 = 0.1;
        let mut out = Vec::with_capacity(width as usize * height as usize * channel_depth as usize);
        for y in 0..height {
            for x in 0..width {
                let pos = match direction {
                    Direction::LR => x as f64 / width as f64,
                    Direction::RL => 1.0 - x as f64 / width as f64,
                    Direction::TB => y as f64 / height as f64,
                    Direction::BT => 1.0 - y as f64 / height as f64,
                };
                let dist = (pos - phase).rem_euclid(1.0);
                let lit = dist < BAR_FRACTION;
                match channel_depth {
                    2 => {
                        let v: u16 = if lit { u16::MAX } else { 0 };
                        out.extend_from_slice(&v.to_le_bytes());
                    }
                    _ => out.push(if lit { u8::MAX } else { 0 }),
                }
            }
        }
        out.into()
    }

    /// Fetch the pre-rendered frame for one sweep position.
    pub fn frame(&self, direction: Direction, index: u32) -> Option<&Arc<[u8]>> {
        self.frames
            .get(&direction)
            .and_then(|t| t.get(index as usize))
    }

    /// Frames per sweep cycle.
    pub fn frames_per_cycle(&self) -> u32 {
        self.frames
            .values()
            .next()
            .map(|t| t.len() as u32)
            .unwrap_or(0)
    }
}

/// The stimulus playback controller.
///
/// Owns the display sink for its whole lifetime and never blocks on the
/// orchestration thread: triggers arrive over the camera frame bus and
/// commands over a dedicated channel.
pub struct StimulusController {
    mode: PlaybackMode,
    active_sweep: Option<(Direction, u32)>,
    preview_direction: Direction,
    frame_index: u32,
    sequence: u64,
    tables: SweepTables,
    sink: Arc<dyn FrameSink>,
    channel: Arc<FrameChannel>,
    tracker: Arc<Mutex<SyncTracker>>,
    preview_interval: Duration,
    health: HealthMonitor,
}

impl StimulusController {
    /// Construct a controller with explicit collaborators.
    pub fn new(
        tables: SweepTables,
        sink: Arc<dyn FrameSink>,
        channel: Arc<FrameChannel>,
        tracker: Arc<Mutex<SyncTracker>>,
        preview_interval: Duration,
        health: HealthMonitor,
    ) -> Self {
        Self {
            mode: PlaybackMode::Preview,
            active_sweep: None,
            preview_direction: Direction::LR,
            frame_index: 0,
            sequence: 0,
            tables,
            sink,
            channel,
            tracker,
            preview_interval,
            health,
        }
    }

    /// Current playback mode.
    pub fn mode(&self) -> PlaybackMode {
        self.mode
    }

    /// Spawn the playback loop.
    ///
    /// `triggers` is the camera frame bus; it is only consumed in Record
    /// mode with an active sweep.
    pub fn spawn(
        mut self,
        mut commands: mpsc::Receiver<StimulusCommand>,
        mut triggers: broadcast::Receiver<Arc<Frame>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.preview_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            self.health.set("display", SubsystemHealth::Online);

            loop {
                tokio::select! {
                    command = commands.recv() => {
                        match command {
                            Some(command) => self.handle_command(command),
                            None => break,
                        }
                    }
                    trigger = triggers.recv() => {
                        match trigger {
                            Ok(frame) => {
                                if self.mode == PlaybackMode::Record {
                                    self.on_trigger(&frame).await;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "stimulus loop lagged behind camera triggers");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = ticker.tick(), if self.mode == PlaybackMode::Preview => {
                        self.present_preview().await;
                    }
                }
            }
            self.health.set("display", SubsystemHealth::Offline);
            info!("stimulus playback loop stopped");
        })
    }

    fn handle_command(&mut self, command: StimulusCommand) {
        match command {
            StimulusCommand::SetMode(mode) => {
                debug!(?mode, "stimulus mode switched");
                self.mode = mode;
                self.frame_index = 0;
            }
            StimulusCommand::BeginSweep {
                direction,
                cycle_index,
            } => {
                debug!(%direction, cycle_index, "sweep started");
                self.active_sweep = Some((direction, cycle_index));
                self.frame_index = 0;
            }
            StimulusCommand::EndSweep => {
                self.active_sweep = None;
            }
        }
    }

    /// Record-mode trigger path: one camera frame, one stimulus frame.
    async fn on_trigger(&mut self, camera_frame: &Frame) {
        let Some((direction, cycle_index)) = self.active_sweep else {
            return;
        };

        let camera_event = CameraEvent {
            frame_id: camera_frame.sequence_id,
            timestamp_us: camera_frame.timestamp_us,
        };
        if let Ok(mut tracker) = self.tracker.lock() {
            tracker.record_camera(camera_event);
        }

        let index = self.frame_index % self.tables.frames_per_cycle().max(1);
        self.frame_index = self.frame_index.wrapping_add(1);

        if let Some(event) = self.present(direction, index, cycle_index).await {
            if let Ok(mut tracker) = self.tracker.lock() {
                tracker.record_stimulus(event);
            }
        }
    }

    /// Preview-mode free-run path; no tracker involvement.
    async fn present_preview(&mut self) {
        let direction = self
            .active_sweep
            .map(|(d, _)| d)
            .unwrap_or(self.preview_direction);
        let index = self.frame_index % self.tables.frames_per_cycle().max(1);
        self.frame_index = self.frame_index.wrapping_add(1);
        let _ = self.present(direction, index, 0).await;
    }

    /// Present one pre-rendered frame and publish it on the stimulus
    /// channel. Returns the presentation event on success.
    async fn present(
        &mut self,
        direction: Direction,
        index: u32,
        cycle_index: u32,
    ) -> Option<StimulusEvent> {
        let pixels = Arc::clone(self.tables.frame(direction, index)?);
        let sequence = self.sequence;
        self.sequence += 1;

        let frame = Frame::new(
            sequence,
            now_us(),
            self.tables.width,
            self.tables.height,
            self.tables.channel_depth,
            pixels,
        )
        .ok()?;

        if let Err(error) = self.sink.present(&frame).await {
            self.health
                .set("display", SubsystemHealth::Error(error.to_string()));
            warn!(%error, "stimulus presentation failed");
            return None;
        }
        self.health.set("display", SubsystemHealth::Online);

        if let Err(error) = self.channel.publish(&frame) {
            warn!(%error, "stimulus frame publish failed");
        }

        Some(StimulusEvent {
            frame_id: sequence,
            timestamp_us: frame.timestamp_us,
            direction,
            cycle_index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncSettings;
    use crate::hardware::mock::SimulatedDisplay;

    fn controller(dir: &std::path::Path) -> (StimulusController, Arc<SimulatedDisplay>) {
        let tables = SweepTables::render(16, 16, 2, 10);
        let sink = Arc::new(SimulatedDisplay::new());
        let channel =
            Arc::new(FrameChannel::create(&dir.join("stim.ring"), 4, 16, 16, 2).unwrap());
        let tracker = Arc::new(Mutex::new(SyncTracker::new(&SyncSettings::default())));
        (
            StimulusController::new(
                tables,
                Arc::clone(&sink) as Arc<dyn FrameSink>,
                channel,
                tracker,
                Duration::from_millis(10),
                HealthMonitor::new(),
            ),
            sink,
        )
    }

    #[test]
    fn sweep_tables_cover_every_direction_and_index() {
        let tables = SweepTables::render(32, 24, 1, 12);
        assert_eq!(tables.frames_per_cycle(), 12);
        for direction in Direction::ALL {
            for index in 0..12 {
                let frame = tables.frame(direction, index).unwrap();
                assert_eq!(frame.len(), 32 * 24);
                // The bar lights some pixels but never all of them.
                let lit = frame.iter().filter(|&&b| b > 0).count();
                assert!(lit > 0 && lit < 32 * 24);
            }
        }
        assert!(tables.frame(Direction::LR, 12).is_none());
    }

    #[test]
    fn opposing_sweeps_mirror_each_other() {
        let tables = SweepTables::render(20, 20, 1, 10);
        let lr = tables.frame(Direction::LR, 0).unwrap();
        let rl = tables.frame(Direction::RL, 0).unwrap();
        // The RL bar at phase zero sits at the mirrored position of LR.
        for y in 0..20usize {
            for x in 0..20usize {
                assert_eq!(lr[y * 20 + x], rl[y * 20 + (19 - x)]);
            }
        }
    }

    #[tokio::test]
    async fn record_mode_advances_one_frame_per_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, display) = controller(dir.path());
        let tracker = Arc::clone(&controller.tracker);
        let channel = Arc::clone(&controller.channel);

        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (trig_tx, trig_rx) = broadcast::channel(32);
        let handle = controller.spawn(cmd_rx, trig_rx);

        cmd_tx
            .send(StimulusCommand::SetMode(PlaybackMode::Record))
            .await
            .unwrap();
        cmd_tx
            .send(StimulusCommand::BeginSweep {
                direction: Direction::TB,
                cycle_index: 0,
            })
            .await
            .unwrap();
        // Give the task a moment to apply the commands.
        tokio::time::sleep(Duration::from_millis(20)).await;

        for i in 0..5u64 {
            let frame =
                Frame::new(i, now_us(), 16, 16, 2, Arc::from(vec![0u8; 16 * 16 * 2])).unwrap();
            trig_tx.send(Arc::new(frame)).unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Exactly one stimulus frame presented and published per trigger.
        assert_eq!(display.presented_count(), 5);
        assert_eq!(channel.published(), 5);

        let records = tracker.lock().unwrap().drain_records();
        assert_eq!(records.len(), 5);
        assert!(records.iter().all(|r| r.direction == Direction::TB));

        drop(cmd_tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn triggers_without_active_sweep_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, display) = controller(dir.path());

        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (trig_tx, trig_rx) = broadcast::channel(32);
        let handle = controller.spawn(cmd_rx, trig_rx);

        cmd_tx
            .send(StimulusCommand::SetMode(PlaybackMode::Record))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let frame = Frame::new(0, now_us(), 16, 16, 2, Arc::from(vec![0u8; 16 * 16 * 2])).unwrap();
        trig_tx.send(Arc::new(frame)).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(display.presented_count(), 0);

        drop(cmd_tx);
        handle.await.unwrap();
    }
}
