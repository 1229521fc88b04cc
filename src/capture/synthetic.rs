//! Synthetic frame source
//!
//! Produces solid colour frames with no display attached. Used by headless
//! runs of the CLI and by pipeline tests.

use super::frame::{solid_rgb, RawFrame};
use super::traits::{CaptureError, CaptureResult, FrameSource, SourceOpener};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Opener for solid colour sources
#[derive(Debug, Clone)]
pub struct SolidColorOpener {
    /// Frame width in pixels
    pub width: u32,

    /// Frame height in pixels
    pub height: u32,

    /// Fill colour (RGB)
    pub color: [u8; 3],

    /// Fail every `open()` call
    pub fail_open: bool,

    /// Artificial delay per grab, to simulate a slow backend
    pub grab_delay: Option<Duration>,

    /// Opens left before `open()` starts failing; shared between clones
    pub open_budget: Option<Arc<AtomicU32>>,
}

impl SolidColorOpener {
    pub fn new(width: u32, height: u32, color: [u8; 3]) -> Self {
        Self {
            width,
            height,
            color,
            fail_open: false,
            grab_delay: None,
            open_budget: None,
        }
    }

    /// Opener whose `open()` always fails
    pub fn failing() -> Self {
        Self {
            fail_open: true,
            ..Self::default()
        }
    }

    /// Allow `opens` successful opens, then fail
    pub fn failing_after(mut self, opens: u32) -> Self {
        self.open_budget = Some(Arc::new(AtomicU32::new(opens)));
        self
    }

    /// Add a fixed delay to every grab
    pub fn with_grab_delay(mut self, delay: Duration) -> Self {
        self.grab_delay = Some(delay);
        self
    }
}

impl Default for SolidColorOpener {
    fn default() -> Self {
        Self::new(1280, 720, [32, 96, 160])
    }
}

impl SourceOpener for SolidColorOpener {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn open(&self, _display_index: u32) -> CaptureResult<Box<dyn FrameSource>> {
        if self.fail_open {
            return Err(CaptureError::Unavailable(
                "synthetic source configured to fail".to_string(),
            ));
        }
        if let Some(budget) = &self.open_budget {
            let spent = budget.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(1)
            });
            if spent.is_err() {
                return Err(CaptureError::Unavailable("synthetic source went away".to_string()));
            }
        }
        if self.width == 0 || self.height == 0 {
            return Err(CaptureError::Unavailable("synthetic source has zero size".to_string()));
        }

        Ok(Box::new(SolidColorSource {
            width: self.width,
            height: self.height,
            frame: solid_rgb(self.width, self.height, self.color),
            grab_delay: self.grab_delay,
        }))
    }
}

/// Open solid colour handle
pub struct SolidColorSource {
    width: u32,
    height: u32,
    frame: Vec<u8>,
    grab_delay: Option<Duration>,
}

impl FrameSource for SolidColorSource {
    fn native_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn grab(&mut self) -> CaptureResult<Option<RawFrame>> {
        if let Some(delay) = self.grab_delay {
            std::thread::sleep(delay);
        }

        Ok(Some(RawFrame {
            data: self.frame.clone(),
            width: self.width,
            height: self.height,
        }))
    }
}
