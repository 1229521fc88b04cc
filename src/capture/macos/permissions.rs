//! macOS privacy gates
//!
//! Screen Recording gates the CoreGraphics source; Accessibility gates the
//! input event tap.

use crate::capture::CaptureError;
use core_graphics::access::ScreenCaptureAccess;

#[link(name = "ApplicationServices", kind = "framework")]
extern "C" {
    fn AXIsProcessTrusted() -> bool;
}

/// Fail unless Screen Recording is granted; first failure triggers the system prompt
pub fn ensure_screen_capture_access() -> Result<(), CaptureError> {
    if ScreenCaptureAccess::preflight() {
        return Ok(());
    }

    let granted = ScreenCaptureAccess::request();
    if granted {
        return Ok(());
    }
    tracing::warn!("Screen Recording permission missing");
    Err(CaptureError::Unavailable(
        "Screen recording permission not granted. Please allow in System Settings.".to_string(),
    ))
}

/// Whether the process may observe global input events
pub fn has_accessibility_permission() -> bool {
    unsafe { AXIsProcessTrusted() }
}
