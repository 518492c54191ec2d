//! Rig assembly.
//!
//! Builds and wires every component of a running engine with explicit
//! construction: each collaborator is created here and passed down as a
//! constructor argument; there is no global registry to look anything up
//! in. The result is a handle bundle that owns all spawned loops:
//!
//! - capture loop (owns the frame source)
//! - stimulus playback loop (owns the frame sink)
//! - acquisition orchestration loop (owns the session)
//! - analysis worker (offloaded per job)
//! - control server and periodic health publisher

use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::acquisition::coordinator::{AcquisitionCoordinator, StatusSnapshot};
use crate::acquisition::stimulus::{StimulusController, SweepTables};
use crate::analysis::backend;
use crate::analysis::renderer::AnalysisRenderer;
use crate::analysis::worker::{AnalysisStatus, AnalysisWorker};
use crate::config::Settings;
use crate::core::Frame;
use crate::hardware::{FrameSink, FrameSource, FrameSourceOutcome};
use crate::sync::SyncTracker;
use crate::transport::broadcast::{
    health_bus, spawn_health_publisher, HealthMonitor, SubsystemHealth,
};
use crate::transport::control::{CommandRouter, ControlServer};
use crate::transport::shm::FrameChannels;

/// Capacity of the in-process camera frame bus.
const FRAME_BUS_CAPACITY: usize = 64;

/// A fully wired, running engine.
pub struct Rig {
    /// Address the control server is bound to.
    pub control_addr: std::net::SocketAddr,
    /// Status sync watch (last-value-wins).
    pub status_rx: watch::Receiver<StatusSnapshot>,
    /// Analysis status watch.
    pub analysis_status_rx: watch::Receiver<AnalysisStatus>,
    /// Per-subsystem health registry.
    pub health: HealthMonitor,
    handles: Vec<JoinHandle<()>>,
}

impl Rig {
    /// Construct and start the whole engine against the given hardware.
    pub async fn start(
        settings: Arc<Settings>,
        source: Arc<dyn FrameSource>,
        sink: Arc<dyn FrameSink>,
    ) -> Result<Rig> {
        settings.validate().context("configuration invalid")?;

        let (width, height, channel_depth) = source.geometry();
        let channels = FrameChannels::create(
            &settings.transport.shm_dir,
            settings.transport.camera_slots,
            settings.transport.stimulus_slots,
            settings.transport.analysis_slots,
            width,
            height,
            channel_depth,
        )
        .context("failed to create shared-memory frame channels")?;

        let health = HealthMonitor::new();
        let tracker = Arc::new(Mutex::new(SyncTracker::new(&settings.sync)));
        let drift_flag = tracker
            .lock()
            .map(|t| t.drift_flag())
            .map_err(|_| anyhow::anyhow!("sync tracker poisoned at startup"))?;

        let (frame_bus, _) = broadcast::channel::<Arc<Frame>>(FRAME_BUS_CAPACITY);

        // Stimulus playback loop.
        let tables = SweepTables::render(
            width,
            height,
            channel_depth,
            settings.acquisition.frames_per_cycle,
        );
        let (stimulus_tx, stimulus_rx) = mpsc::channel(16);
        let stimulus = StimulusController::new(
            tables,
            Arc::clone(&sink),
            Arc::clone(&channels.stimulus),
            Arc::clone(&tracker),
            settings.acquisition.preview_interval,
            health.clone(),
        );
        let stimulus_handle = stimulus.spawn(stimulus_rx, frame_bus.subscribe());

        // Acquisition orchestration loop.
        let (intent_tx, intent_rx) = mpsc::channel(16);
        let (coordinator, status_rx) = AcquisitionCoordinator::new(
            settings.storage.root.clone(),
            settings.sync.abort_on_drift,
            Arc::clone(&source),
            Arc::clone(&sink),
            stimulus_tx,
            Arc::clone(&tracker),
            health.clone(),
        );
        let coordinator_handle = coordinator.spawn(intent_rx, frame_bus.subscribe());

        // Analysis worker.
        let compute = backend::from_name(&settings.analysis.backend)
            .context("analysis backend configuration")?;
        let renderer = Arc::new(AnalysisRenderer::new(Arc::clone(&channels.analysis)));
        let (analysis, analysis_status_rx) = AnalysisWorker::new(
            settings.storage.root.clone(),
            settings.analysis.clone(),
            compute,
            renderer,
            health.clone(),
        );

        // Broadcast surfaces.
        let bus = health_bus();
        let probe_flag = Arc::clone(&drift_flag);
        let health_handle = spawn_health_publisher(
            health.clone(),
            Arc::new(move || probe_flag.load(std::sync::atomic::Ordering::Acquire)),
            settings.transport.health_interval,
            bus.clone(),
        );

        // Control surface.
        let router = Arc::new(CommandRouter::new(
            Arc::clone(&settings),
            intent_tx,
            status_rx.clone(),
            Arc::clone(&analysis),
            analysis_status_rx.clone(),
        ));
        let server = ControlServer::new(
            router,
            status_rx.clone(),
            bus,
            settings.transport.status_interval,
            settings.transport.control_timeout,
        );
        let (server_handle, control_addr) = server
            .spawn(&settings.transport.control_bind)
            .await
            .context("failed to start control server")?;
        health.set("transport", SubsystemHealth::Online);

        // Capture loop, last: frames start flowing once everyone listens.
        let capture_handle = spawn_capture_loop(
            Arc::clone(&source),
            Arc::clone(&channels.camera),
            frame_bus,
            health.clone(),
            settings.acquisition.frame_timeout,
        );

        info!(%control_addr, "rig started");
        Ok(Rig {
            control_addr,
            status_rx,
            analysis_status_rx,
            health,
            handles: vec![
                capture_handle,
                stimulus_handle,
                coordinator_handle,
                health_handle,
                server_handle,
            ],
        })
    }

    /// Stop every loop. Pending acquisition state is abandoned, not torn:
    /// sessions are only ever committed by the coordinator's finalize path.
    pub async fn shutdown(self) {
        for handle in &self.handles {
            handle.abort();
        }
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("rig stopped");
    }
}

/// The capture loop: pull frames from the source, publish to shared memory
/// and onto the in-process bus. Never blocks on any consumer.
fn spawn_capture_loop(
    source: Arc<dyn FrameSource>,
    channel: Arc<crate::transport::shm::FrameChannel>,
    bus: broadcast::Sender<Arc<Frame>>,
    health: HealthMonitor,
    timeout: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        health.set("camera", SubsystemHealth::Online);
        loop {
            match source.next_frame(timeout).await {
                Ok(FrameSourceOutcome::Frame(frame)) => {
                    if let Err(e) = channel.publish(&frame) {
                        warn!(%e, "camera frame publish failed");
                    }
                    // No subscribers is fine; the bus exists for whoever
                    // cares right now.
                    let _ = bus.send(Arc::new(frame));
                    health.set("camera", SubsystemHealth::Online);
                }
                Ok(FrameSourceOutcome::Timeout) => {
                    health.set(
                        "camera",
                        SubsystemHealth::Error("frame source silent".into()),
                    );
                }
                Err(e) => {
                    health.set("camera", SubsystemHealth::Error(e.to_string()));
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
            }
        }
    })
}
