//! Keyboard and mouse event capture
//!
//! Platform listeners feed an `EventSink`; the session's `EventLogger`
//! collects the events and writes the event log at stop.

pub mod listener;
pub mod logger;
pub mod types;

#[cfg(target_os = "macos")]
pub mod macos;

#[cfg(target_os = "windows")]
pub mod windows;

pub use listener::{platform_input_listener, InputCapabilities, InputListener, ListenerError};
pub use logger::{EventLogger, EventSink};
pub use types::{InputEvent, InputEventKind, MouseButton};
