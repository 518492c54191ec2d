//! Acquisition orchestration.
//!
//! - [`session`]: the session/dataset aggregates one run produces
//! - [`stimulus`]: camera-triggered stimulus playback (Preview/Record)
//! - [`coordinator`]: the workflow state machine owning the session

pub mod coordinator;
pub mod session;
pub mod stimulus;

pub use coordinator::{AcqState, AcquisitionCoordinator, ControlIntent, StatusSnapshot};
pub use session::{AcquisitionParams, AcquisitionSession, CycleData, DirectionDataset};
pub use stimulus::{PlaybackMode, StimulusCommand, StimulusController, SweepTables};
