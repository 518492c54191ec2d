//! Session persistence.
//!
//! One directory per session under the configured storage root:
//!
//! ```text
//! <root>/<session_id>/
//!   baseline/frames.bin       raw frame series (header + records)
//!   baseline/timestamps.json  frame stamps, cycle structure, sync records
//!   lr/frames.bin             one subdirectory per recorded direction
//!   lr/timestamps.json
//!   ...
//!   manifest.json             written last, atomically
//! ```
//!
//! The manifest is written to a temporary file, flushed, and renamed into
//! place only after every series file is durably on disk; a directory
//! without a valid manifest is not a session. Each series file's SHA-256
//! digest is recorded in the manifest and re-verified on load, so analysis
//! never runs on silently truncated data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::acquisition::session::{
    AcquisitionParams, AcquisitionSession, CycleData, DirectionDataset, SessionOutcome,
};
use crate::core::{Direction, Frame};
use crate::error::{IsiError, IsiResult};
use crate::sync::SyncRecord;

/// Magic number identifying a frame series file.
const SERIES_MAGIC: u64 = 0x1511_5E21_E500_0001;

/// Frame series layout version.
const SERIES_VERSION: u32 = 1;

/// Per-frame stamp stored in the JSON index.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FrameStamp {
    /// Producer sequence id.
    pub sequence_id: u64,
    /// Capture timestamp in microseconds.
    pub timestamp_us: i64,
}

/// Cycle structure of a persisted series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleIndex {
    /// Zero-based repetition index.
    pub cycle_index: u32,
    /// Stamps of the frames recorded in this cycle, in capture order.
    pub frames: Vec<FrameStamp>,
    /// Sync records matched during this cycle.
    pub sync_records: Vec<SyncRecord>,
}

/// JSON index accompanying one frame series file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesIndex {
    /// Direction of the series; `None` for the baseline.
    pub direction: Option<Direction>,
    /// Cycle structure in recording order.
    pub cycles: Vec<CycleIndex>,
}

/// Manifest entry describing one persisted series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesEntry {
    /// Subdirectory name ("baseline", "lr", ...).
    pub name: String,
    /// Direction, `None` for the baseline series.
    pub direction: Option<Direction>,
    /// Total frames in the series file.
    pub frame_count: u64,
    /// SHA-256 of `frames.bin`, lowercase hex.
    pub frames_sha256: String,
    /// SHA-256 of `timestamps.json`, lowercase hex.
    pub index_sha256: String,
}

/// System provenance block of the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    /// Host the session was recorded on.
    pub hostname: String,
    /// Engine package version.
    pub software_version: String,
}

/// The finalized session manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionManifest {
    /// Session identifier (equals the directory name).
    pub session_id: String,
    /// Resolved acquisition parameters.
    pub params: AcquisitionParams,
    /// Terminal disposition of the run.
    pub outcome: SessionOutcome,
    /// Run start stamp.
    pub started_at: DateTime<Utc>,
    /// Run end stamp.
    pub ended_at: Option<DateTime<Utc>>,
    /// Transient frame drops counted during the run.
    pub dropped_frames: u64,
    /// Sync records flagged desynchronized.
    pub desynchronized_records: u64,
    /// Persisted series, baseline first, then presentation order.
    pub series: Vec<SeriesEntry>,
    /// Provenance.
    pub system: SystemInfo,
}

/// A session re-read from disk for analysis.
#[derive(Debug)]
pub struct LoadedSession {
    /// The verified manifest.
    pub manifest: SessionManifest,
    /// Per-direction datasets rebuilt from the series files.
    pub datasets: Vec<DirectionDataset>,
}

/// Persist a finalized (or aborted) session under `root`.
///
/// Returns the session directory. The manifest rename is the commit point:
/// a crash before it leaves no valid session behind.
pub fn persist_session(session: &AcquisitionSession, root: &Path) -> IsiResult<PathBuf> {
    let outcome = session
        .outcome
        .clone()
        .ok_or_else(|| IsiError::Configuration("session has no outcome yet".into()))?;

    let dir = root.join(&session.id);
    fs::create_dir_all(&dir)?;

    let mut series = Vec::new();

    if !session.baseline_frames.is_empty() {
        let index = SeriesIndex {
            direction: None,
            cycles: vec![CycleIndex {
                cycle_index: 0,
                frames: stamps_of(&session.baseline_frames),
                sync_records: Vec::new(),
            }],
        };
        let frames: Vec<&Frame> = session.baseline_frames.iter().collect();
        series.push(write_series(&dir, "baseline", None, &frames, &index)?);
    }

    for dataset in &session.datasets {
        let index = SeriesIndex {
            direction: Some(dataset.direction),
            cycles: dataset
                .cycles
                .iter()
                .enumerate()
                .map(|(i, cycle)| CycleIndex {
                    cycle_index: i as u32,
                    frames: stamps_of(&cycle.frames),
                    sync_records: cycle.sync_records.clone(),
                })
                .collect(),
        };
        let frames: Vec<&Frame> = dataset.all_frames().collect();
        series.push(write_series(
            &dir,
            dataset.direction.as_str(),
            Some(dataset.direction),
            &frames,
            &index,
        )?);
    }

    let manifest = SessionManifest {
        session_id: session.id.clone(),
        params: session.params.clone(),
        outcome,
        started_at: session.started_at,
        ended_at: session.ended_at,
        dropped_frames: session.dropped_frames,
        desynchronized_records: session.desynchronized_count(),
        series,
        system: SystemInfo {
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
        },
    };

    // Commit point: temp write, flush, rename.
    let tmp = dir.join("manifest.json.tmp");
    let body = serde_json::to_vec_pretty(&manifest)?;
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&body)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, dir.join("manifest.json"))?;

    info!(
        session_id = %session.id,
        series = manifest.series.len(),
        "session persisted"
    );
    Ok(dir)
}

/// Load and verify a persisted session for analysis.
pub fn load_session(root: &Path, session_id: &str) -> IsiResult<LoadedSession> {
    let dir = root.join(session_id);
    let manifest_path = dir.join("manifest.json");
    if !manifest_path.exists() {
        return Err(IsiError::Configuration(format!(
            "'{session_id}' is not a finalized session (no manifest)"
        )));
    }

    let manifest: SessionManifest = serde_json::from_reader(BufReader::new(File::open(
        &manifest_path,
    )?))?;

    let mut datasets = Vec::new();
    for entry in &manifest.series {
        let series_dir = dir.join(&entry.name);
        let frames_path = series_dir.join("frames.bin");
        let index_path = series_dir.join("timestamps.json");

        verify_digest(&frames_path, &entry.frames_sha256)?;
        verify_digest(&index_path, &entry.index_sha256)?;

        let Some(direction) = entry.direction else {
            // Baseline series is not analyzed.
            continue;
        };

        let frames = read_series(&frames_path)?;
        let index: SeriesIndex =
            serde_json::from_reader(BufReader::new(File::open(&index_path)?))?;

        let mut cycles = Vec::new();
        let mut offset = 0usize;
        for cycle in &index.cycles {
            let count = cycle.frames.len();
            if offset + count > frames.len() {
                return Err(IsiError::Configuration(format!(
                    "series '{}' index references {} frames but file holds {}",
                    entry.name,
                    offset + count,
                    frames.len()
                )));
            }
            cycles.push(CycleData {
                frames: frames[offset..offset + count].to_vec(),
                sync_records: cycle.sync_records.clone(),
            });
            offset += count;
        }

        datasets.push(DirectionDataset { direction, cycles });
    }

    Ok(LoadedSession { manifest, datasets })
}

fn stamps_of(frames: &[Frame]) -> Vec<FrameStamp> {
    frames
        .iter()
        .map(|f| FrameStamp {
            sequence_id: f.sequence_id,
            timestamp_us: f.timestamp_us,
        })
        .collect()
}

/// Write one series (frames.bin + timestamps.json), returning its manifest
/// entry with digests. Both files are fsynced before returning.
fn write_series(
    dir: &Path,
    name: &str,
    direction: Option<Direction>,
    frames: &[&Frame],
    index: &SeriesIndex,
) -> IsiResult<SeriesEntry> {
    let series_dir = dir.join(name);
    fs::create_dir_all(&series_dir)?;

    let (width, height, depth) = frames
        .first()
        .map(|f| (f.width, f.height, f.channel_depth))
        .unwrap_or((0, 0, 1));

    let frames_path = series_dir.join("frames.bin");
    let mut hasher = Sha256::new();
    {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&frames_path)?;
        let mut writer = BufWriter::new(file);

        // Layout: magic(8) version(4) width(4) height(4) depth(4) count(8).
        let mut header = Vec::with_capacity(32);
        header.extend_from_slice(&SERIES_MAGIC.to_le_bytes());
        header.extend_from_slice(&SERIES_VERSION.to_le_bytes());
        header.extend_from_slice(&width.to_le_bytes());
        header.extend_from_slice(&height.to_le_bytes());
        header.extend_from_slice(&(depth as u32).to_le_bytes());
        header.extend_from_slice(&(frames.len() as u64).to_le_bytes());
        writer.write_all(&header)?;
        hasher.update(&header);

        for frame in frames {
            let mut record = Vec::with_capacity(16);
            record.extend_from_slice(&frame.sequence_id.to_le_bytes());
            record.extend_from_slice(&frame.timestamp_us.to_le_bytes());
            writer.write_all(&record)?;
            hasher.update(&record);
            writer.write_all(&frame.pixel_buffer)?;
            hasher.update(&frame.pixel_buffer);
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    let frames_sha256 = format!("{:x}", hasher.finalize());

    let index_path = series_dir.join("timestamps.json");
    let index_body = serde_json::to_vec_pretty(index)?;
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&index_path)?;
        file.write_all(&index_body)?;
        file.sync_all()?;
    }
    let index_sha256 = format!("{:x}", Sha256::digest(&index_body));

    Ok(SeriesEntry {
        name: name.to_string(),
        direction,
        frame_count: frames.len() as u64,
        frames_sha256,
        index_sha256,
    })
}

/// Read every frame in a series file.
fn read_series(path: &Path) -> IsiResult<Vec<Frame>> {
    let mut reader = BufReader::new(File::open(path)?);

    // Layout: magic(8) version(4) width(4) height(4) depth(4) count(8).
    let mut header = [0u8; 32];
    reader.read_exact(&mut header)?;

    let magic = u64::from_le_bytes(header[0..8].try_into().unwrap_or_default());
    if magic != SERIES_MAGIC {
        return Err(IsiError::Configuration(format!(
            "not a frame series file: {}",
            path.display()
        )));
    }
    let version = u32::from_le_bytes(header[8..12].try_into().unwrap_or_default());
    if version != SERIES_VERSION {
        return Err(IsiError::Configuration(format!(
            "unsupported frame series version {version}"
        )));
    }
    let width = u32::from_le_bytes(header[12..16].try_into().unwrap_or_default());
    let height = u32::from_le_bytes(header[16..20].try_into().unwrap_or_default());
    let depth = u32::from_le_bytes(header[20..24].try_into().unwrap_or_default()) as u8;
    let frame_count = u64::from_le_bytes(header[24..32].try_into().unwrap_or_default());

    let payload_len = width as usize * height as usize * depth as usize;
    let mut frames = Vec::with_capacity(frame_count as usize);
    for _ in 0..frame_count {
        let mut meta = [0u8; 16];
        reader.read_exact(&mut meta)?;
        let sequence_id = u64::from_le_bytes(meta[0..8].try_into().unwrap_or_default());
        let timestamp_us = i64::from_le_bytes(meta[8..16].try_into().unwrap_or_default());

        let mut payload = vec![0u8; payload_len];
        reader.read_exact(&mut payload)?;
        let pixels: Arc<[u8]> = payload.into();
        frames.push(Frame::new(
            sequence_id,
            timestamp_us,
            width,
            height,
            depth,
            pixels,
        )?);
    }
    Ok(frames)
}

fn verify_digest(path: &Path, expected: &str) -> IsiResult<()> {
    let mut hasher = Sha256::new();
    let mut reader = BufReader::new(File::open(path)?);
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let actual = format!("{:x}", hasher.finalize());
    if actual != expected {
        return Err(IsiError::Configuration(format!(
            "digest mismatch for {}: manifest {}, file {}",
            path.display(),
            expected,
            actual
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::protocol::StartAcquisitionParams;
    use crate::config::Settings;

    fn test_session() -> AcquisitionSession {
        let params = AcquisitionParams::resolve(&Settings::default(), &StartAcquisitionParams {
            cycles: Some(2),
            directions: Some(vec![Direction::LR, Direction::RL]),
        });
        let mut session = AcquisitionSession::new(params);
        for direction in [Direction::LR, Direction::RL] {
            session.begin_direction(direction);
            for cycle in 0..2u32 {
                session.begin_cycle();
                for i in 0..3u64 {
                    let seq = cycle as u64 * 3 + i;
                    let pixels: Arc<[u8]> = vec![(seq % 251) as u8; 4 * 4 * 2].into();
                    let frame = Frame::new(seq, seq as i64 * 33_333, 4, 4, 2, pixels).unwrap();
                    session.push_frame(frame);
                }
                session.push_sync_records(vec![SyncRecord {
                    stimulus_frame_id: cycle as u64,
                    stimulus_timestamp_us: 0,
                    camera_frame_id: cycle as u64,
                    camera_timestamp_us: 1_000,
                    direction,
                    cycle_index: cycle,
                    desynchronized: false,
                }]);
            }
        }
        session.finalize();
        session
    }

    #[test]
    fn persist_then_load_round_trips() {
        let root = tempfile::tempdir().unwrap();
        let session = test_session();
        let id = session.id.clone();

        persist_session(&session, root.path()).unwrap();
        let loaded = load_session(root.path(), &id).unwrap();

        assert_eq!(loaded.manifest.session_id, id);
        assert_eq!(loaded.manifest.outcome, SessionOutcome::Complete);
        assert_eq!(loaded.datasets.len(), 2);

        let lr = &loaded.datasets[0];
        assert_eq!(lr.direction, Direction::LR);
        assert_eq!(lr.cycles.len(), 2);
        assert_eq!(lr.cycles[0].frames.len(), 3);
        assert_eq!(lr.cycles[0].sync_records.len(), 1);

        // Pixel bytes survive the round trip exactly.
        let original: Vec<&Frame> = session.datasets[0].all_frames().collect();
        let reloaded: Vec<&Frame> = lr.all_frames().collect();
        for (a, b) in original.iter().zip(reloaded.iter()) {
            assert_eq!(a.sequence_id, b.sequence_id);
            assert_eq!(a.timestamp_us, b.timestamp_us);
            assert_eq!(&a.pixel_buffer[..], &b.pixel_buffer[..]);
        }
    }

    #[test]
    fn unfinalized_session_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let mut session = test_session();
        session.outcome = None;
        assert!(persist_session(&session, root.path()).is_err());
    }

    #[test]
    fn missing_manifest_is_not_a_session() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("half-written")).unwrap();
        let err = load_session(root.path(), "half-written");
        assert!(matches!(err, Err(IsiError::Configuration(_))));
    }

    #[test]
    fn tampered_series_fails_digest_check() {
        let root = tempfile::tempdir().unwrap();
        let session = test_session();
        let id = session.id.clone();
        let dir = persist_session(&session, root.path()).unwrap();

        // Flip one byte in a series file.
        let path = dir.join("lr").join("frames.bin");
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        assert!(load_session(root.path(), &id).is_err());
    }

    #[test]
    fn aborted_session_preserves_partial_data() {
        let root = tempfile::tempdir().unwrap();
        let params = AcquisitionParams::resolve(&Settings::default(), &Default::default());
        let mut session = AcquisitionSession::new(params);
        session.begin_direction(Direction::TB);
        session.begin_cycle();
        let pixels: Arc<[u8]> = vec![7u8; 4 * 4 * 2].into();
        session.push_frame(Frame::new(0, 0, 4, 4, 2, pixels).unwrap());
        session.abort("frame source silent".into());
        let id = session.id.clone();

        persist_session(&session, root.path()).unwrap();
        let loaded = load_session(root.path(), &id).unwrap();
        assert!(matches!(loaded.manifest.outcome, SessionOutcome::Aborted(_)));
        assert_eq!(loaded.datasets[0].frame_count(), 1);
    }
}
