//! Analysis worker task.
//!
//! Wraps [`run_pipeline`](crate::analysis::run_pipeline) in a job that loads
//! a persisted session, offloads the compute to a blocking thread, publishes
//! visualization layers, and mirrors its progress on a watch channel the
//! control router and broadcast surface both read. One job runs at a time; a
//! second `start` while busy is a reported configuration error, never a
//! queue.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use crate::analysis::backend::ComputeBackend;
use crate::analysis::renderer::AnalysisRenderer;
use crate::config::AnalysisSettings;
use crate::error::{IsiError, IsiResult};
use crate::storage;
use crate::transport::broadcast::{HealthMonitor, SubsystemHealth};
use serde::{Deserialize, Serialize};

/// Externally visible state of the analysis worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AnalysisStatus {
    /// No job running.
    Idle,
    /// A job is in flight.
    Running {
        /// Session being analyzed.
        session_id: String,
        /// Short name of the current stage.
        stage: String,
    },
    /// Last job finished.
    Complete {
        /// Session analyzed.
        session_id: String,
        /// Labeled regions in the segmentation.
        regions: usize,
        /// Detected sign-reversal boundaries.
        boundaries: usize,
    },
    /// Last job failed.
    Failed {
        /// Session the job was for.
        session_id: String,
        /// Structured reason.
        error: String,
    },
}

/// Runs analysis jobs against persisted sessions.
pub struct AnalysisWorker {
    storage_root: PathBuf,
    settings: AnalysisSettings,
    backend: Arc<dyn ComputeBackend>,
    renderer: Arc<AnalysisRenderer>,
    status_tx: watch::Sender<AnalysisStatus>,
    health: HealthMonitor,
    busy: AtomicBool,
}

impl AnalysisWorker {
    /// Construct the worker and its status watch channel.
    pub fn new(
        storage_root: PathBuf,
        settings: AnalysisSettings,
        backend: Arc<dyn ComputeBackend>,
        renderer: Arc<AnalysisRenderer>,
        health: HealthMonitor,
    ) -> (Arc<Self>, watch::Receiver<AnalysisStatus>) {
        let (status_tx, status_rx) = watch::channel(AnalysisStatus::Idle);
        (
            Arc::new(Self {
                storage_root,
                settings,
                backend,
                renderer,
                status_tx,
                health,
                busy: AtomicBool::new(false),
            }),
            status_rx,
        )
    }

    /// Current status snapshot.
    pub fn status(&self) -> AnalysisStatus {
        self.status_tx.borrow().clone()
    }

    /// Start analyzing `session_id` in the background.
    pub fn start(self: &Arc<Self>, session_id: String) -> IsiResult<()> {
        if self.busy.swap(true, Ordering::AcqRel) {
            return Err(IsiError::Configuration(
                "an analysis job is already running".into(),
            ));
        }

        let worker = Arc::clone(self);
        tokio::spawn(async move {
            worker.health.set("analysis", SubsystemHealth::Online);
            let job_worker = Arc::clone(&worker);
            let job_session = session_id.clone();
            let result = tokio::task::spawn_blocking(move || job_worker.run_job(&job_session)).await;

            let status = match result {
                Ok(Ok((regions, boundaries))) => {
                    info!(%session_id, regions, "analysis complete");
                    AnalysisStatus::Complete {
                        session_id,
                        regions,
                        boundaries,
                    }
                }
                Ok(Err(e)) => {
                    error!(%session_id, %e, "analysis failed");
                    worker
                        .health
                        .set("analysis", SubsystemHealth::Error(e.to_string()));
                    AnalysisStatus::Failed {
                        session_id,
                        error: e.to_string(),
                    }
                }
                Err(join_error) => {
                    error!(%session_id, %join_error, "analysis task panicked");
                    AnalysisStatus::Failed {
                        session_id,
                        error: join_error.to_string(),
                    }
                }
            };
            worker.busy.store(false, Ordering::Release);
            let _ = worker.status_tx.send(status);
        });
        Ok(())
    }

    /// Blocking pipeline body; returns `(regions, boundaries)` counts.
    fn run_job(&self, session_id: &str) -> IsiResult<(usize, usize)> {
        self.stage(session_id, "load");
        let loaded = storage::load_session(&self.storage_root, session_id)?;

        let stimulus_hz = loaded.manifest.params.stimulus_frequency_hz();
        let sample_hz = loaded.manifest.params.camera_fps;

        let status_tx = self.status_tx.clone();
        let id = session_id.to_string();
        let mut progress = move |stage: &str| {
            let _ = status_tx.send(AnalysisStatus::Running {
                session_id: id.clone(),
                stage: stage.to_string(),
            });
        };

        let products = crate::analysis::run_pipeline(
            &loaded.datasets,
            stimulus_hz,
            sample_hz,
            &self.settings,
            self.backend.as_ref(),
            &mut progress,
        )?;

        self.stage(session_id, "render");
        self.renderer.publish(&products)?;

        Ok((
            products.segmentation.regions.len(),
            products.boundaries.len(),
        ))
    }

    fn stage(&self, session_id: &str, stage: &str) {
        let _ = self.status_tx.send(AnalysisStatus::Running {
            session_id: session_id.to_string(),
            stage: stage.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::backend::ScalarBackend;
    use crate::transport::shm::FrameChannel;

    fn worker(root: PathBuf) -> (Arc<AnalysisWorker>, watch::Receiver<AnalysisStatus>) {
        let dir = tempfile::tempdir().unwrap();
        let channel = Arc::new(
            FrameChannel::create(&dir.path().join("analysis.ring"), 2, 8, 32, 1).unwrap(),
        );
        // Leak the tempdir so the channel file outlives the test body.
        std::mem::forget(dir);
        AnalysisWorker::new(
            root,
            AnalysisSettings::default(),
            Arc::new(ScalarBackend),
            Arc::new(AnalysisRenderer::new(channel)),
            HealthMonitor::new(),
        )
    }

    #[tokio::test]
    async fn missing_session_reports_failure() {
        let root = tempfile::tempdir().unwrap();
        let (worker, mut status_rx) = worker(root.path().to_path_buf());

        worker.start("no-such-session".into()).unwrap();
        loop {
            status_rx.changed().await.unwrap();
            let status = status_rx.borrow().clone();
            if let AnalysisStatus::Failed { error, .. } = status {
                assert!(error.contains("not a finalized session"));
                break;
            }
        }
        // The worker is free again after a failure.
        assert!(!worker.busy.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn second_start_while_busy_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let (worker, _status_rx) = worker(root.path().to_path_buf());

        worker.busy.store(true, Ordering::Release);
        let err = worker.start("whatever".into());
        assert!(matches!(err, Err(IsiError::Configuration(_))));
        worker.busy.store(false, Ordering::Release);
    }
}
