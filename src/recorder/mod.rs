//! Recording session
//!
//! Capture and writer workers joined by a bounded frame queue, driven by
//! the `ScreenRecorder` state machine.

pub mod coordinator;
pub mod queue;
pub mod reconcile;
pub mod scheduler;
pub mod state;
pub mod verify;
pub mod worker;

pub use coordinator::ScreenRecorder;
pub use state::{
    RecordingConfig, RecordingError, RecordingEvent, RecordingOutput, RecordingResult,
    RecordingState, SessionInfo,
    SessionPaths,
};
pub use verify::{inspect, verify_and_repair, Container, VerifyReport};
