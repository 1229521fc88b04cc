//! Capture trait definitions
//!
//! Platform-agnostic traits for frame sources.

use super::frame::RawFrame;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by capture backends
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Capture backend unavailable: {0}")]
    Unavailable(String),

    #[error("Display not found: {0}")]
    DisplayNotFound(u32),

    #[error("Grab failed: {0}")]
    GrabFailed(String),
}

/// Result type for capture operations
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Information about a display/screen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayInfo {
    /// Display index as used by `SourceOpener::open`
    pub id: u32,

    /// Display name
    pub name: String,

    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    /// Whether this is the primary display
    pub is_primary: bool,
}

/// An open capture handle
///
/// Handles are created inside the worker that uses them and are not `Send`:
/// some backends bind their device context to the creating thread. Dropping
/// the handle closes it.
pub trait FrameSource {
    /// Native pixel size, queried once at open time
    fn native_size(&self) -> (u32, u32);

    /// Grab one frame as packed RGB24
    ///
    /// `Ok(None)` means no new frame is ready yet; callers skip and retry.
    fn grab(&mut self) -> CaptureResult<Option<RawFrame>>;
}

/// Factory for capture handles, shared across threads
pub trait SourceOpener: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Open a capture handle for a display
    fn open(&self, display_index: u32) -> CaptureResult<Box<dyn FrameSource>>;
}

/// Which capture backend the session should use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CaptureBackend {
    /// Accelerated capture first, then generic
    #[default]
    Auto,
    /// Platform-native capture only
    Accelerated,
    /// Cross-platform capture only
    Generic,
    /// Solid colour frames (headless runs)
    Synthetic,
}

/// Build the ordered opener list for a backend choice
pub fn openers_for(backend: CaptureBackend) -> Vec<Arc<dyn SourceOpener>> {
    let mut openers: Vec<Arc<dyn SourceOpener>> = Vec::new();

    if matches!(backend, CaptureBackend::Auto | CaptureBackend::Accelerated) {
        if let Some(opener) = accelerated_opener() {
            openers.push(opener);
        }
    }

    if matches!(backend, CaptureBackend::Auto | CaptureBackend::Generic) {
        openers.push(Arc::new(super::screen::GenericOpener::default()));
    }

    if backend == CaptureBackend::Synthetic {
        openers.push(Arc::new(super::synthetic::SolidColorOpener::default()));
    }

    openers
}

fn accelerated_opener() -> Option<Arc<dyn SourceOpener>> {
    #[cfg(target_os = "windows")]
    {
        Some(Arc::new(super::windows::GdiOpener))
    }

    #[cfg(target_os = "macos")]
    {
        Some(Arc::new(super::macos::CoreGraphicsOpener))
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        None
    }
}

/// A frame source that opened successfully during the start-up probe
pub struct ResolvedSource {
    /// Opener to use again inside the capture worker
    pub opener: Arc<dyn SourceOpener>,

    /// Native size reported by the probe
    pub native_width: u32,

    /// Native size reported by the probe
    pub native_height: u32,
}

/// Probe openers in order and keep the first that opens
///
/// The probe handle is closed before returning; the capture worker opens its
/// own handle on its own thread.
pub fn resolve_source(
    openers: &[Arc<dyn SourceOpener>],
    display_index: u32,
) -> CaptureResult<ResolvedSource> {
    let mut failures = Vec::new();

    for opener in openers {
        match opener.open(display_index) {
            Ok(source) => {
                let (native_width, native_height) = source.native_size();
                drop(source);

                if native_width == 0 || native_height == 0 {
                    tracing::warn!("Capture backend {} reported an empty display", opener.name());
                    failures.push(format!("{}: empty display", opener.name()));
                    continue;
                }

                tracing::info!(
                    "Capture backend {} ready for display {} ({}x{})",
                    opener.name(),
                    display_index,
                    native_width,
                    native_height
                );
                return Ok(ResolvedSource {
                    opener: Arc::clone(opener),
                    native_width,
                    native_height,
                });
            }
            Err(e) => {
                tracing::warn!("Capture backend {} unavailable: {}", opener.name(), e);
                failures.push(format!("{}: {}", opener.name(), e));
            }
        }
    }

    if failures.is_empty() {
        failures.push("no capture backend configured".to_string());
    }

    Err(CaptureError::Unavailable(failures.join("; ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::synthetic::SolidColorOpener;

    #[test]
    fn test_resolve_falls_through_to_working_opener() {
        let failing: Arc<dyn SourceOpener> = Arc::new(SolidColorOpener::failing());
        let working: Arc<dyn SourceOpener> = Arc::new(SolidColorOpener::new(64, 48, [1, 2, 3]));

        let resolved = resolve_source(&[failing, working], 0).unwrap();
        assert_eq!((resolved.native_width, resolved.native_height), (64, 48));
    }

    #[test]
    fn test_resolve_reports_all_failures() {
        let failing: Arc<dyn SourceOpener> = Arc::new(SolidColorOpener::failing());
        let err = resolve_source(&[failing], 0).err().unwrap();
        assert!(matches!(err, CaptureError::Unavailable(_)));

        let err = resolve_source(&[], 0).err().unwrap();
        assert!(err.to_string().contains("no capture backend"));
    }

    #[test]
    fn test_generic_capture_in_default_build() {
        assert!(cfg!(feature = "generic-capture"));

        let openers = openers_for(CaptureBackend::Generic);
        assert_eq!(openers.len(), 1);
        assert_eq!(openers[0].name(), "xcap");

        // Auto always ends with the generic fallback
        let auto = openers_for(CaptureBackend::Auto);
        assert_eq!(auto.last().map(|o| o.name().to_string()), Some("xcap".to_string()));
    }

    #[test]
    fn test_synthetic_backend_has_one_opener() {
        let openers = openers_for(CaptureBackend::Synthetic);
        assert_eq!(openers.len(), 1);
        assert_eq!(openers[0].name(), "synthetic");
    }
}
