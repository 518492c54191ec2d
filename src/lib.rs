//! # ISI DAQ Engine
//!
//! Acquisition synchronization and retinotopic analysis engine for
//! intrinsic-signal-imaging experiments. The crate presents a periodic
//! visual stimulus synchronized to camera capture, records the resulting
//! frame/timestamp streams, and computes retinotopic maps, visual-field-sign
//! maps and cortical area segmentations by temporal Fourier analysis.
//!
//! ## Crate Structure
//!
//! - **`core`**: fundamental types (`Frame`, `Direction`, capture events).
//! - **`config`**: figment-based typed configuration with semantic
//!   validation. Tolerance windows and drift policy are configuration
//!   inputs, not constants.
//! - **`error`**: the central `IsiError` taxonomy.
//! - **`logging`**: tracing subscriber setup.
//! - **`hardware`**: the frame-source/frame-sink contracts and simulated
//!   devices for headless operation.
//! - **`transport`**: shared-memory frame rings, the TCP control channel
//!   and the status/health broadcast buses.
//! - **`sync`**: the stimulus/camera timestamp synchronization tracker.
//! - **`acquisition`**: the workflow state machine, the camera-triggered
//!   stimulus controller and the session aggregates.
//! - **`storage`**: per-session persistence with an atomic manifest commit.
//! - **`analysis`**: the Fourier pipeline (phase/amplitude, bidirectional
//!   combination, gradients, field sign, boundaries, segmentation) plus the
//!   thin visualization renderer and the worker task.
//! - **`rig`**: explicit construction and wiring of a running engine.

pub mod acquisition;
pub mod analysis;
pub mod config;
pub mod core;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod rig;
pub mod storage;
pub mod sync;
pub mod transport;

pub use error::{IsiError, IsiResult};
