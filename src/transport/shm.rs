//! Memory-mapped frame channels for lock-free, zero-copy frame transfer.
//!
//! This module implements the shared-memory half of the transport layer: a
//! fixed-size ring of frame slots backed by a memory-mapped file, written by
//! exactly one producer and read by any number of consumers (typically the
//! display client in another process).
//!
//! # Features
//! - Lock-free slot protocol using atomic generation counters
//! - Torn-read detection: readers retry instead of observing partial frames
//! - Cross-process compatibility with #[repr(C)] layout
//! - A monotonic publish counter so consumers can detect dropped frames
//!
//! # Memory Layout
//! ```text
//! [128-byte channel header] [slot 0] [slot 1] ... [slot N-1]
//!
//! Channel header (cache-line aligned):
//!   magic: u64              (0x15_1D_AQ.. channel magic)
//!   layout_version: u32
//!   slot_count: u32
//!   slot_capacity: u64      (pixel bytes per slot)
//!   width/height/depth: u32 (frame geometry for foreign readers)
//!   sequence: AtomicU64     (total frames published)
//!
//! Slot = [64-byte slot header][pixel payload]
//!   generation: AtomicU64   (odd while a write is in progress)
//!   sequence_id / timestamp_us / geometry / payload_len
//! ```
//!
//! # Generation protocol
//!
//! The writer bumps a slot's generation to an odd value before touching the
//! slot, writes header and payload, then bumps it to the next even value. A
//! reader loads the generation, copies the slot, and loads the generation
//! again: any mismatch or odd value is a torn read and the reader must
//! retry. No cross-process lock exists anywhere on this path.

use anyhow::{anyhow, Context, Result};
use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::Frame;
use crate::error::{IsiError, IsiResult};

/// Magic number identifying a frame channel file.
const MAGIC: u64 = 0x1511_DA9F_0000_0001;

/// On-disk layout version; bumped on any incompatible change.
const LAYOUT_VERSION: u32 = 1;

/// Channel header size (two cache lines on most systems).
const HEADER_SIZE: usize = 128;

/// Per-slot header size.
const SLOT_HEADER_SIZE: usize = 64;

/// Consecutive read attempts before a torn read is reported to the caller.
const TORN_READ_RETRIES: usize = 3;

/// Channel header with cache-line alignment.
///
/// #[repr(C)] keeps the layout predictable for readers in other languages.
#[repr(C)]
struct ChannelHeader {
    magic: u64,
    layout_version: u32,
    slot_count: u32,
    slot_capacity: u64,
    width: u32,
    height: u32,
    channel_depth: u32,
    _reserved: u32,
    /// Total frames published on this channel (gap detection).
    sequence: AtomicU64,
    _padding: [u8; 80],
}

/// Per-slot header preceding the pixel payload.
#[repr(C)]
struct SlotHeader {
    /// Odd while a write is in progress, even and stable otherwise.
    generation: AtomicU64,
    sequence_id: u64,
    timestamp_us: i64,
    width: u32,
    height: u32,
    channel_depth: u32,
    payload_len: u32,
    _padding: [u8; 24],
}

/// A shared-memory frame ring with one writer and tear-detecting readers.
///
/// # Safety
/// This structure contains raw pointers into a memory-mapped region. It is
/// safe to use as long as:
/// - The backing file remains valid for the lifetime of the channel
/// - Only one writer publishes to a given channel at a time
/// - Readers follow the generation protocol (enforced by `try_read`)
pub struct FrameChannel {
    mmap: MmapMut,
    /// SAFETY: points to the start of mmap, valid as long as mmap exists.
    header: *mut ChannelHeader,
    /// SAFETY: points HEADER_SIZE bytes into mmap.
    slots: *mut u8,
    slot_count: usize,
    slot_capacity: usize,
}

// SAFETY: slot access is synchronized by the generation protocol and the
// publish counter; raw pointers are only dereferenced with proper ordering.
unsafe impl Send for FrameChannel {}

// SAFETY: readers and the writer coordinate exclusively through atomics.
unsafe impl Sync for FrameChannel {}

impl FrameChannel {
    /// Create a new channel backed by a memory-mapped file.
    ///
    /// # Arguments
    /// * `path` - Backing file (typically under /dev/shm)
    /// * `slots` - Ring size; must be >= 2 so the writer can stay one slot
    ///   ahead of readers without blocking
    /// * `width`/`height`/`channel_depth` - Frame geometry for this channel
    pub fn create(path: &Path, slots: usize, width: u32, height: u32, channel_depth: u8) -> Result<Self> {
        if slots < 2 {
            return Err(anyhow!("frame channel needs at least 2 slots, got {slots}"));
        }
        let slot_capacity = width as usize * height as usize * channel_depth as usize;
        let total_size = HEADER_SIZE + slots * (SLOT_HEADER_SIZE + slot_capacity);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create channel directory {:?}", parent))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to create frame channel file: {:?}", path))?;

        file.set_len(total_size as u64)
            .context("Failed to set frame channel file size")?;

        // SAFETY: we just created the file and set its size, mapping is safe
        let mut mmap = unsafe {
            MmapOptions::new()
                .map_mut(&file)
                .context("Failed to map frame channel file")?
        };

        // SAFETY: mmap is at least HEADER_SIZE bytes
        let header = mmap.as_mut_ptr() as *mut ChannelHeader;
        unsafe {
            (*header).magic = MAGIC;
            (*header).layout_version = LAYOUT_VERSION;
            (*header).slot_count = slots as u32;
            (*header).slot_capacity = slot_capacity as u64;
            (*header).width = width;
            (*header).height = height;
            (*header).channel_depth = channel_depth as u32;
            (*header)._reserved = 0;
            (*header).sequence = AtomicU64::new(0);
            (*header)._padding.fill(0);
        }

        // SAFETY: total_size includes HEADER_SIZE, so the offset is in bounds
        let slots_ptr = unsafe { mmap.as_mut_ptr().add(HEADER_SIZE) };

        // Zero slot headers so generation counters start even and stable.
        // SAFETY: the slot region is total_size - HEADER_SIZE bytes long
        unsafe {
            std::ptr::write_bytes(slots_ptr, 0, slots * (SLOT_HEADER_SIZE + slot_capacity));
        }

        Ok(Self {
            mmap,
            header,
            slots: slots_ptr,
            slot_count: slots,
            slot_capacity,
        })
    }

    /// Attach to an existing channel created by `create()`.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open frame channel file: {:?}", path))?;

        // SAFETY: opening a file produced by create()
        let mut mmap = unsafe {
            MmapOptions::new()
                .map_mut(&file)
                .context("Failed to map frame channel file")?
        };

        if mmap.len() < HEADER_SIZE {
            return Err(anyhow!("frame channel file too small: {} bytes", mmap.len()));
        }

        // SAFETY: length validated above
        let header = mmap.as_mut_ptr() as *mut ChannelHeader;
        let (magic, version, slot_count, slot_capacity) = unsafe {
            (
                (*header).magic,
                (*header).layout_version,
                (*header).slot_count as usize,
                (*header).slot_capacity as usize,
            )
        };

        if magic != MAGIC {
            return Err(anyhow!(
                "Invalid frame channel magic: expected 0x{:016X}, got 0x{:016X}",
                MAGIC,
                magic
            ));
        }
        if version != LAYOUT_VERSION {
            return Err(anyhow!(
                "Unsupported frame channel layout version {version} (expected {LAYOUT_VERSION})"
            ));
        }

        let expected = HEADER_SIZE + slot_count * (SLOT_HEADER_SIZE + slot_capacity);
        if mmap.len() < expected {
            return Err(anyhow!(
                "frame channel file truncated: {} bytes, layout needs {}",
                mmap.len(),
                expected
            ));
        }

        // SAFETY: bounds validated against the declared layout
        let slots_ptr = unsafe { mmap.as_mut_ptr().add(HEADER_SIZE) };

        Ok(Self {
            mmap,
            header,
            slots: slots_ptr,
            slot_count,
            slot_capacity,
        })
    }

    /// Geometry declared by the channel header.
    pub fn geometry(&self) -> (u32, u32, u8) {
        // SAFETY: header is valid for the lifetime of self
        unsafe {
            (
                (*self.header).width,
                (*self.header).height,
                (*self.header).channel_depth as u8,
            )
        }
    }

    /// Number of ring slots.
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Total frames published on this channel.
    pub fn published(&self) -> u64 {
        // SAFETY: header is valid for the lifetime of self
        unsafe { (*self.header).sequence.load(Ordering::Acquire) }
    }

    fn slot_ptr(&self, slot: usize) -> *mut u8 {
        debug_assert!(slot < self.slot_count);
        // SAFETY: slot bounds are checked by callers; the region was sized
        // for slot_count slots at construction
        unsafe { self.slots.add(slot * (SLOT_HEADER_SIZE + self.slot_capacity)) }
    }

    /// Publish a frame into the next round-robin slot.
    ///
    /// Never blocks on readers: a reader overlapping this write observes a
    /// generation mismatch and retries. Returns the publish sequence number
    /// assigned to the frame.
    pub fn publish(&self, frame: &Frame) -> IsiResult<u64> {
        if frame.byte_len() > self.slot_capacity {
            return Err(IsiError::Configuration(format!(
                "frame payload {} bytes exceeds slot capacity {}",
                frame.byte_len(),
                self.slot_capacity
            )));
        }

        // SAFETY: header valid for the lifetime of self; slot pointer within
        // the mapped region; generation protocol orders the payload copy
        unsafe {
            let publish_seq = (*self.header).sequence.load(Ordering::Acquire);
            let slot = (publish_seq % self.slot_count as u64) as usize;
            let base = self.slot_ptr(slot);
            let slot_header = base as *mut SlotHeader;

            // Mark write-in-progress (odd generation).
            (*slot_header).generation.fetch_add(1, Ordering::AcqRel);

            (*slot_header).sequence_id = frame.sequence_id;
            (*slot_header).timestamp_us = frame.timestamp_us;
            (*slot_header).width = frame.width;
            (*slot_header).height = frame.height;
            (*slot_header).channel_depth = frame.channel_depth as u32;
            (*slot_header).payload_len = frame.byte_len() as u32;

            std::ptr::copy_nonoverlapping(
                frame.pixel_buffer.as_ptr(),
                base.add(SLOT_HEADER_SIZE),
                frame.byte_len(),
            );

            // Publish the slot (even generation) and then the channel counter.
            (*slot_header).generation.fetch_add(1, Ordering::AcqRel);
            (*self.header)
                .sequence
                .store(publish_seq + 1, Ordering::Release);
            Ok(publish_seq)
        }
    }

    /// Read one slot, retrying on torn reads.
    ///
    /// Returns the frame stored in the slot, or `IsiError::TornRead` if the
    /// writer kept overlapping all retry attempts. An untouched slot (no
    /// frame ever published there) yields `Ok(None)`.
    pub fn try_read(&self, slot: usize) -> IsiResult<Option<Frame>> {
        if slot >= self.slot_count {
            return Err(IsiError::Configuration(format!(
                "slot {slot} out of range (channel has {} slots)",
                self.slot_count
            )));
        }

        for _ in 0..TORN_READ_RETRIES {
            match self.read_once(slot) {
                ReadOutcome::Stable(frame) => return Ok(frame),
                ReadOutcome::Torn => continue,
            }
        }
        Err(IsiError::TornRead {
            slot,
            retries: TORN_READ_RETRIES,
        })
    }

    /// Read the most recently published frame, if any.
    pub fn read_latest(&self) -> IsiResult<Option<Frame>> {
        let published = self.published();
        if published == 0 {
            return Ok(None);
        }
        let slot = ((published - 1) % self.slot_count as u64) as usize;
        self.try_read(slot)
    }

    fn read_once(&self, slot: usize) -> ReadOutcome {
        let base = self.slot_ptr(slot);
        let slot_header = base as *const SlotHeader;

        // SAFETY: slot pointer bounds established at construction; the
        // generation protocol detects concurrent writer activity
        unsafe {
            let gen_before = (*slot_header).generation.load(Ordering::Acquire);
            if gen_before == 0 {
                // Slot never written.
                return ReadOutcome::Stable(None);
            }
            if gen_before % 2 == 1 {
                return ReadOutcome::Torn;
            }

            let sequence_id = (*slot_header).sequence_id;
            let timestamp_us = (*slot_header).timestamp_us;
            let width = (*slot_header).width;
            let height = (*slot_header).height;
            let channel_depth = (*slot_header).channel_depth as u8;
            let payload_len = (*slot_header).payload_len as usize;
            if payload_len > self.slot_capacity {
                return ReadOutcome::Torn;
            }

            let mut payload = vec![0u8; payload_len];
            std::ptr::copy_nonoverlapping(
                base.add(SLOT_HEADER_SIZE),
                payload.as_mut_ptr(),
                payload_len,
            );

            // Order the payload copy before the generation re-check.
            fence(Ordering::Acquire);
            let gen_after = (*slot_header).generation.load(Ordering::Acquire);
            if gen_after != gen_before {
                return ReadOutcome::Torn;
            }

            let pixels: Arc<[u8]> = payload.into();
            match Frame::new(sequence_id, timestamp_us, width, height, channel_depth, pixels) {
                Ok(frame) => ReadOutcome::Stable(Some(frame)),
                // Header fields changed under us in a way that kept the
                // generation stable reads as torn, not as corruption.
                Err(_) => ReadOutcome::Torn,
            }
        }
    }
}

enum ReadOutcome {
    Stable(Option<Frame>),
    Torn,
}

/// The three independently sized channels of a running rig.
pub struct FrameChannels {
    /// Camera frames, capture loop -> consumers.
    pub camera: Arc<FrameChannel>,
    /// Stimulus frames, playback loop -> consumers.
    pub stimulus: Arc<FrameChannel>,
    /// Analysis visualization layers, analysis worker -> consumers.
    pub analysis: Arc<FrameChannel>,
}

impl FrameChannels {
    /// Create the camera/stimulus/analysis channels under `dir`.
    ///
    /// Each modality gets its own ring so producers never contend across
    /// channels.
    pub fn create(
        dir: &Path,
        camera_slots: usize,
        stimulus_slots: usize,
        analysis_slots: usize,
        width: u32,
        height: u32,
        channel_depth: u8,
    ) -> Result<Self> {
        Ok(Self {
            camera: Arc::new(FrameChannel::create(
                &dir.join("camera.ring"),
                camera_slots,
                width,
                height,
                channel_depth,
            )?),
            stimulus: Arc::new(FrameChannel::create(
                &dir.join("stimulus.ring"),
                stimulus_slots,
                width,
                height,
                channel_depth,
            )?),
            // Visualization layers are float planes.
            analysis: Arc::new(FrameChannel::create(
                &dir.join("analysis.ring"),
                analysis_slots,
                width,
                height * 4,
                1,
            )?),
        })
    }
}
