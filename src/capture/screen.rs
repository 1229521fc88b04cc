//! Generic cross-platform screen capture
//!
//! CPU capture through `xcap`, compiled in with the default
//! `generic-capture` feature. Builds with `--no-default-features` keep the
//! opener but it reports itself unavailable.

use super::traits::{CaptureResult, FrameSource, SourceOpener};

#[cfg(feature = "generic-capture")]
use super::frame::{rgba_to_rgb, RawFrame};
#[cfg(feature = "generic-capture")]
use super::traits::CaptureError;

/// Opener for generic capture handles
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericOpener;

#[cfg(feature = "generic-capture")]
impl SourceOpener for GenericOpener {
    fn name(&self) -> &str {
        "xcap"
    }

    fn open(&self, display_index: u32) -> CaptureResult<Box<dyn FrameSource>> {
        let mut monitors =
            xcap::Monitor::all().map_err(|e| CaptureError::Unavailable(e.to_string()))?;

        // Primary first so display index 0 is always the main screen
        monitors.sort_by_key(|m| !m.is_primary());

        let monitor = monitors
            .into_iter()
            .nth(display_index as usize)
            .ok_or(CaptureError::DisplayNotFound(display_index))?;

        // Pixel dimensions come from a real capture, not the logical size
        let probe = monitor
            .capture_image()
            .map_err(|e| CaptureError::Unavailable(e.to_string()))?;

        Ok(Box::new(GenericSource {
            width: probe.width(),
            height: probe.height(),
            monitor,
        }))
    }
}

#[cfg(not(feature = "generic-capture"))]
impl SourceOpener for GenericOpener {
    fn name(&self) -> &str {
        "xcap"
    }

    fn open(&self, _display_index: u32) -> CaptureResult<Box<dyn FrameSource>> {
        Err(super::traits::CaptureError::Unavailable(
            "built without the generic-capture feature".to_string(),
        ))
    }
}

/// Open generic capture handle
#[cfg(feature = "generic-capture")]
pub struct GenericSource {
    monitor: xcap::Monitor,
    width: u32,
    height: u32,
}

#[cfg(feature = "generic-capture")]
impl FrameSource for GenericSource {
    fn native_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn grab(&mut self) -> CaptureResult<Option<RawFrame>> {
        let image = self
            .monitor
            .capture_image()
            .map_err(|e| CaptureError::GrabFailed(e.to_string()))?;

        let width = image.width();
        let height = image.height();
        let data = rgba_to_rgb(&image.into_raw());

        Ok(Some(RawFrame { data, width, height }))
    }
}
