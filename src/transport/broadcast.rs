//! Status and health broadcast buses.
//!
//! Two independent publish/subscribe surfaces, deliberately separated from
//! the synchronous control channel and from each other:
//!
//! - **Status sync**: workflow-state snapshots on a `tokio::sync::watch`
//!   channel. Watch semantics give exactly the last-value-wins, no-delivery-
//!   guarantee contract the frontend needs for state sync.
//! - **Health telemetry**: periodic per-subsystem liveness reports on a
//!   `tokio::sync::broadcast` channel, published on a fixed interval by
//!   [`spawn_health_publisher`] so a stalled control path never masks a
//!   healthy data path (or vice versa).
//!
//! Transport loss on either bus is a reported condition, never a reason to
//! stall acquisition timing.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Liveness classification of one subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum SubsystemHealth {
    /// Operating normally.
    Online,
    /// Not currently connected/running.
    Offline,
    /// Faulted; the string is a structured reason.
    Error(String),
}

/// One periodic health telemetry message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Wall-clock stamp in milliseconds.
    pub timestamp_ms: u64,
    /// Per-subsystem health keyed by subsystem name.
    pub subsystems: BTreeMap<String, SubsystemHealth>,
    /// Advisory flag from the sync tracker's jitter bound.
    pub drift_exceeded: bool,
}

/// Shared registry the hardware and worker loops report their health into.
///
/// Writers hold the mutex only long enough to update one entry; no I/O ever
/// happens under it.
#[derive(Clone, Default)]
pub struct HealthMonitor {
    inner: Arc<Mutex<BTreeMap<String, SubsystemHealth>>>,
}

impl HealthMonitor {
    /// Create an empty monitor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the health of one subsystem.
    pub fn set(&self, subsystem: &str, health: SubsystemHealth) {
        if let Ok(mut map) = self.inner.lock() {
            map.insert(subsystem.to_string(), health);
        }
    }

    /// Snapshot the current per-subsystem health.
    pub fn snapshot(&self) -> BTreeMap<String, SubsystemHealth> {
        self.inner.lock().map(|map| map.clone()).unwrap_or_default()
    }
}

/// Capacity of the health broadcast bus; slow subscribers drop old reports
/// rather than applying backpressure to the publisher.
const HEALTH_BUS_CAPACITY: usize = 16;

/// Create the health broadcast bus.
pub fn health_bus() -> broadcast::Sender<HealthReport> {
    broadcast::channel(HEALTH_BUS_CAPACITY).0
}

/// Spawn the periodic health publisher task.
///
/// `drift_probe` is sampled on every tick; it is expected to be cheap (the
/// sync tracker exposes an atomic flag behind it).
pub fn spawn_health_publisher(
    monitor: HealthMonitor,
    drift_probe: Arc<dyn Fn() -> bool + Send + Sync>,
    interval: Duration,
    bus: broadcast::Sender<HealthReport>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let report = HealthReport {
                timestamp_ms: Utc::now().timestamp_millis() as u64,
                subsystems: monitor.snapshot(),
                drift_exceeded: drift_probe(),
            };
            // A send error only means nobody is subscribed right now.
            if bus.send(report).is_err() {
                debug!("health report dropped: no subscribers");
            }
        }
    })
}

/// Log a lagged broadcast subscription; used by forwarding sessions.
pub fn note_lagged(channel: &str, skipped: u64) {
    warn!(channel, skipped, "broadcast subscriber lagged, messages skipped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_snapshot_reflects_updates() {
        let monitor = HealthMonitor::new();
        monitor.set("camera", SubsystemHealth::Online);
        monitor.set("display", SubsystemHealth::Error("no ack".into()));

        let snap = monitor.snapshot();
        assert_eq!(snap.get("camera"), Some(&SubsystemHealth::Online));
        assert_eq!(
            snap.get("display"),
            Some(&SubsystemHealth::Error("no ack".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn publisher_emits_on_interval() {
        let monitor = HealthMonitor::new();
        monitor.set("orchestrator", SubsystemHealth::Online);
        let bus = health_bus();
        let mut rx = bus.subscribe();

        let handle = spawn_health_publisher(
            monitor,
            Arc::new(|| false),
            Duration::from_millis(100),
            bus,
        );

        let report = rx.recv().await.unwrap();
        assert!(!report.drift_exceeded);
        assert_eq!(
            report.subsystems.get("orchestrator"),
            Some(&SubsystemHealth::Online)
        );
        handle.abort();
    }

    #[test]
    fn health_serializes_with_reason() {
        let json = serde_json::to_string(&SubsystemHealth::Error("gone".into())).unwrap();
        assert!(json.contains("error"));
        assert!(json.contains("gone"));
        let back: SubsystemHealth = serde_json::from_str(&json).unwrap();
        assert_eq!(back, SubsystemHealth::Error("gone".into()));
    }
}
