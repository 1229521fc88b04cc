//! Input listener contract
//!
//! Listeners are optional. A missing or failed listener degrades the session
//! to video-only with an empty event log.

use super::logger::EventSink;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Listener errors; never fatal to a recording
#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("Input listener unavailable: {0}")]
    Unavailable(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}

/// Which input streams the host allows the session to observe
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InputCapabilities {
    /// Log key presses and releases
    pub keyboard: bool,

    /// Log mouse moves, clicks and scrolls
    pub mouse: bool,

    /// Minimum spacing between logged mouse moves
    pub mouse_move_interval_ms: u64,
}

impl Default for InputCapabilities {
    fn default() -> Self {
        Self {
            keyboard: true,
            mouse: true,
            mouse_move_interval_ms: 100,
        }
    }
}

impl InputCapabilities {
    /// Whether any input stream is enabled
    pub fn any(&self) -> bool {
        self.keyboard || self.mouse
    }
}

/// Platform hook feeding an `EventSink`
pub trait InputListener: Send {
    /// Listener name for logs
    fn name(&self) -> &str;

    /// Install hooks and begin delivering events to `sink`
    fn start(&mut self, sink: EventSink) -> Result<(), ListenerError>;

    /// Remove hooks; idempotent
    fn stop(&mut self);

    /// Whether hooks are currently installed
    fn is_active(&self) -> bool;
}

/// Resolve the platform listener for the given capabilities
///
/// Returns `None` when no input stream is enabled or the platform has no
/// listener implementation.
pub fn platform_input_listener(capabilities: &InputCapabilities) -> Option<Box<dyn InputListener>> {
    if !capabilities.any() {
        return None;
    }

    #[cfg(target_os = "windows")]
    {
        Some(Box::new(super::windows::HookListener::new()))
    }

    #[cfg(target_os = "macos")]
    {
        Some(Box::new(super::macos::EventTapListener::new()))
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        tracing::debug!("No input listener on this platform");
        None
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::capture::input::types::MouseButton;

    /// Listener that emits a fixed burst of events on start
    pub struct ScriptedListener {
        active: bool,
        pub fail: bool,
    }

    impl ScriptedListener {
        pub fn new() -> Self {
            Self { active: false, fail: false }
        }

        pub fn failing() -> Self {
            Self { active: false, fail: true }
        }
    }

    impl InputListener for ScriptedListener {
        fn name(&self) -> &str {
            "scripted"
        }

        fn start(&mut self, sink: EventSink) -> Result<(), ListenerError> {
            if self.fail {
                return Err(ListenerError::Unavailable("scripted failure".to_string()));
            }

            // Emit from another thread, out of order with the caller's clock
            let handle = std::thread::spawn(move || {
                sink.key_press("a");
                sink.mouse_click(10, 10, MouseButton::Left, true);
                sink.mouse_click(10, 10, MouseButton::Left, false);
                sink.key_release("a");
            });
            let _ = handle.join();

            self.active = true;
            Ok(())
        }

        fn stop(&mut self) {
            self.active = false;
        }

        fn is_active(&self) -> bool {
            self.active
        }
    }
}
