//! Configuration system using Figment.
//!
//! Strongly-typed configuration loading for the engine. Configuration is
//! loaded from:
//! 1. a TOML file (`config/default.toml` unless overridden on the CLI)
//! 2. environment variables prefixed with `ISI_DAQ_`
//!
//! All durations accept humantime strings ("5ms", "2s", "1m 30s"). Semantic
//! validation beyond parsing lives in [`Settings::validate`]; the tolerance
//! window and the drift policy are deliberately configuration inputs, not
//! constants.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::Direction;
use crate::error::{IsiError, IsiResult};

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application-level settings.
    #[serde(default)]
    pub application: ApplicationSettings,
    /// Transport (control/broadcast/shared-memory) settings.
    #[serde(default)]
    pub transport: TransportSettings,
    /// Camera geometry and rate (used by simulation and channel sizing).
    #[serde(default)]
    pub camera: CameraSettings,
    /// Acquisition sequencing settings.
    #[serde(default)]
    pub acquisition: AcquisitionSettings,
    /// Timestamp synchronization settings.
    #[serde(default)]
    pub sync: SyncSettings,
    /// Analysis pipeline settings.
    #[serde(default)]
    pub analysis: AnalysisSettings,
    /// Session persistence settings.
    #[serde(default)]
    pub storage: StorageSettings,
}

/// Application-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// Application name used in logs and manifests.
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format ("pretty", "compact" or "json").
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Control and broadcast transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    /// Bind address of the TCP control listener.
    #[serde(default = "default_control_bind")]
    pub control_bind: String,
    /// Deadline for answering a single control request.
    #[serde(with = "humantime_serde", default = "default_control_timeout")]
    pub control_timeout: Duration,
    /// Interval between periodic status broadcasts.
    #[serde(with = "humantime_serde", default = "default_status_interval")]
    pub status_interval: Duration,
    /// Interval between periodic health broadcasts.
    #[serde(with = "humantime_serde", default = "default_health_interval")]
    pub health_interval: Duration,
    /// Directory holding the shared-memory channel files.
    #[serde(default = "default_shm_dir")]
    pub shm_dir: PathBuf,
    /// Ring slots in the camera frame channel.
    #[serde(default = "default_camera_slots")]
    pub camera_slots: usize,
    /// Ring slots in the stimulus frame channel.
    #[serde(default = "default_stimulus_slots")]
    pub stimulus_slots: usize,
    /// Ring slots in the analysis visualization channel.
    #[serde(default = "default_analysis_slots")]
    pub analysis_slots: usize,
}

/// Camera geometry and nominal rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraSettings {
    /// Frame width in pixels.
    #[serde(default = "default_width")]
    pub width: u32,
    /// Frame height in pixels.
    #[serde(default = "default_height")]
    pub height: u32,
    /// Bytes per pixel (1 or 2).
    #[serde(default = "default_channel_depth")]
    pub channel_depth: u8,
    /// Nominal capture rate in frames per second.
    #[serde(default = "default_fps")]
    pub fps: f64,
}

/// Acquisition sequencing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionSettings {
    /// Presentation order of sweep directions.
    #[serde(default = "default_directions")]
    pub directions: Vec<Direction>,
    /// Sweep repetitions per direction.
    #[serde(default = "default_cycles")]
    pub cycles: u32,
    /// Stimulus frames composing one full sweep cycle.
    #[serde(default = "default_frames_per_cycle")]
    pub frames_per_cycle: u32,
    /// Baseline recording duration before the first direction.
    #[serde(with = "humantime_serde", default = "default_baseline")]
    pub baseline: Duration,
    /// Pause between directions.
    #[serde(with = "humantime_serde", default = "default_inter_direction")]
    pub inter_direction: Duration,
    /// Watchdog deadline for frame-source silence.
    #[serde(with = "humantime_serde", default = "default_frame_timeout")]
    pub frame_timeout: Duration,
    /// Free-run frame interval used by Preview mode.
    #[serde(with = "humantime_serde", default = "default_preview_interval")]
    pub preview_interval: Duration,
}

/// Timestamp synchronization configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Trigger-to-capture pairing tolerance window.
    #[serde(with = "humantime_serde", default = "default_tolerance")]
    pub tolerance: Duration,
    /// Grace period after which unmatched events are logged and dropped.
    #[serde(with = "humantime_serde", default = "default_grace")]
    pub grace: Duration,
    /// Jitter bound above which `drift_exceeded()` reports true.
    #[serde(with = "humantime_serde", default = "default_jitter_bound")]
    pub jitter_bound: Duration,
    /// Whether the coordinator aborts a run on sustained drift. Default is
    /// advisory-only reporting.
    #[serde(default)]
    pub abort_on_drift: bool,
}

/// Analysis pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSettings {
    /// Gradient-magnitude product threshold suppressing sign-map noise.
    #[serde(default = "default_vfs_threshold")]
    pub vfs_threshold: f32,
    /// Minimum region area (pixels) kept by segmentation.
    #[serde(default = "default_min_area")]
    pub min_area_px: usize,
    /// Compute backend: "parallel" (default) or "scalar".
    #[serde(default = "default_backend")]
    pub backend: String,
}

/// Session persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Root directory receiving one subdirectory per session.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

// Default value functions

fn default_app_name() -> String {
    "isi_daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_control_bind() -> String {
    "127.0.0.1:7801".to_string()
}

fn default_control_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_status_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_health_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_shm_dir() -> PathBuf {
    PathBuf::from("/dev/shm/isi_daq")
}

fn default_camera_slots() -> usize {
    4
}

fn default_stimulus_slots() -> usize {
    4
}

fn default_analysis_slots() -> usize {
    2
}

fn default_width() -> u32 {
    512
}

fn default_height() -> u32 {
    512
}

fn default_channel_depth() -> u8 {
    2
}

fn default_fps() -> f64 {
    30.0
}

fn default_directions() -> Vec<Direction> {
    Direction::ALL.to_vec()
}

fn default_cycles() -> u32 {
    10
}

fn default_frames_per_cycle() -> u32 {
    30
}

fn default_baseline() -> Duration {
    Duration::from_secs(5)
}

fn default_inter_direction() -> Duration {
    Duration::from_secs(2)
}

fn default_frame_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_preview_interval() -> Duration {
    Duration::from_millis(33)
}

fn default_tolerance() -> Duration {
    Duration::from_millis(5)
}

fn default_grace() -> Duration {
    Duration::from_millis(200)
}

fn default_jitter_bound() -> Duration {
    Duration::from_millis(2)
}

fn default_vfs_threshold() -> f32 {
    1e-3
}

fn default_min_area() -> usize {
    64
}

fn default_backend() -> String {
    "parallel".to_string()
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./sessions")
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            control_bind: default_control_bind(),
            control_timeout: default_control_timeout(),
            status_interval: default_status_interval(),
            health_interval: default_health_interval(),
            shm_dir: default_shm_dir(),
            camera_slots: default_camera_slots(),
            stimulus_slots: default_stimulus_slots(),
            analysis_slots: default_analysis_slots(),
        }
    }
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            channel_depth: default_channel_depth(),
            fps: default_fps(),
        }
    }
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            directions: default_directions(),
            cycles: default_cycles(),
            frames_per_cycle: default_frames_per_cycle(),
            baseline: default_baseline(),
            inter_direction: default_inter_direction(),
            frame_timeout: default_frame_timeout(),
            preview_interval: default_preview_interval(),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            tolerance: default_tolerance(),
            grace: default_grace(),
            jitter_bound: default_jitter_bound(),
            abort_on_drift: false,
        }
    }
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            vfs_threshold: default_vfs_threshold(),
            min_area_px: default_min_area(),
            backend: default_backend(),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            application: ApplicationSettings::default(),
            transport: TransportSettings::default(),
            camera: CameraSettings::default(),
            acquisition: AcquisitionSettings::default(),
            sync: SyncSettings::default(),
            analysis: AnalysisSettings::default(),
            storage: StorageSettings::default(),
        }
    }
}

impl Settings {
    /// Load configuration from the default path and environment variables.
    ///
    /// Environment variables override file values with prefix `ISI_DAQ_`,
    /// e.g. `ISI_DAQ_APPLICATION_LOG_LEVEL=debug`.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from("config/default.toml")
    }

    /// Load configuration from a specific TOML file path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("ISI_DAQ_").split("_"))
            .extract()
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> IsiResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(IsiError::Configuration(format!(
                "invalid log_level '{}', must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if !matches!(self.camera.channel_depth, 1 | 2) {
            return Err(IsiError::Configuration(format!(
                "channel_depth must be 1 or 2, got {}",
                self.camera.channel_depth
            )));
        }
        if self.camera.fps <= 0.0 {
            return Err(IsiError::Configuration("camera fps must be positive".into()));
        }

        for slots in [
            self.transport.camera_slots,
            self.transport.stimulus_slots,
            self.transport.analysis_slots,
        ] {
            if slots < 2 {
                return Err(IsiError::Configuration(format!(
                    "shared-memory channels need at least 2 slots, got {slots}"
                )));
            }
        }

        if self.acquisition.cycles == 0 {
            return Err(IsiError::Configuration("cycles must be at least 1".into()));
        }
        if self.acquisition.frames_per_cycle == 0 {
            return Err(IsiError::Configuration(
                "frames_per_cycle must be at least 1".into(),
            ));
        }
        if self.acquisition.directions.is_empty() {
            return Err(IsiError::Configuration(
                "at least one sweep direction must be configured".into(),
            ));
        }

        if self.sync.tolerance.is_zero() {
            return Err(IsiError::Configuration(
                "sync tolerance window must be positive".into(),
            ));
        }
        if self.sync.grace < self.sync.tolerance {
            return Err(IsiError::Configuration(
                "sync grace period must not be shorter than the tolerance window".into(),
            ));
        }

        if !matches!(self.analysis.backend.as_str(), "parallel" | "scalar") {
            return Err(IsiError::Configuration(format!(
                "unknown analysis backend '{}', expected 'parallel' or 'scalar'",
                self.analysis.backend
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn rejects_single_slot_channel() {
        let mut settings = Settings::default();
        settings.transport.camera_slots = 1;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_grace_shorter_than_tolerance() {
        let mut settings = Settings::default();
        settings.sync.grace = Duration::from_millis(1);
        settings.sync.tolerance = Duration::from_millis(5);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn parses_humantime_durations() {
        let toml = r#"
            [sync]
            tolerance = "5ms"
            grace = "250ms"

            [acquisition]
            baseline = "10s"
            cycles = 2
        "#;
        let settings: Settings = Figment::new().merge(Toml::string(toml)).extract().unwrap();
        assert_eq!(settings.sync.tolerance, Duration::from_millis(5));
        assert_eq!(settings.acquisition.baseline, Duration::from_secs(10));
        assert_eq!(settings.acquisition.cycles, 2);
    }
}
