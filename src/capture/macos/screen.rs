//! macOS screen capture using CoreGraphics display images
//!
//! Each grab takes a `CGDisplay::image()` snapshot. Pixel rows are BGRA with
//! a stride that may exceed `width * 4`.

use super::permissions::ensure_screen_capture_access;
use crate::capture::frame::{bgra_rows_to_rgb, RawFrame};
use crate::capture::traits::{CaptureError, CaptureResult, DisplayInfo, FrameSource, SourceOpener};
use core_graphics::display::{CGDirectDisplayID, CGDisplay};

/// Active display ids, main display first
fn ordered_display_ids() -> Vec<CGDirectDisplayID> {
    let mut ids = CGDisplay::active_displays().unwrap_or_default();
    ids.sort_by_key(|&id| !CGDisplay::new(id).is_main());
    ids
}

/// Get list of available displays
pub fn get_displays() -> Vec<DisplayInfo> {
    ordered_display_ids()
        .iter()
        .enumerate()
        .map(|(index, &id)| {
            let display = CGDisplay::new(id);
            let is_main = display.is_main();

            DisplayInfo {
                id: index as u32,
                name: if is_main {
                    "Main Display".to_string()
                } else {
                    format!("Display {}", index + 1)
                },
                width: display.pixels_wide() as u32,
                height: display.pixels_high() as u32,
                is_primary: is_main,
            }
        })
        .collect()
}

/// Opener for CoreGraphics capture handles
#[derive(Debug, Default, Clone, Copy)]
pub struct CoreGraphicsOpener;

impl SourceOpener for CoreGraphicsOpener {
    fn name(&self) -> &str {
        "coregraphics"
    }

    fn open(&self, display_index: u32) -> CaptureResult<Box<dyn FrameSource>> {
        ensure_screen_capture_access()?;

        let id = ordered_display_ids()
            .into_iter()
            .nth(display_index as usize)
            .ok_or(CaptureError::DisplayNotFound(display_index))?;

        let display = CGDisplay::new(id);

        // Size comes from an actual image, which reflects Retina backing scale
        let image = display
            .image()
            .ok_or_else(|| {
                CaptureError::Unavailable("CGDisplayCreateImage returned nothing".to_string())
            })?;

        Ok(Box::new(CoreGraphicsSource {
            display,
            width: image.width() as u32,
            height: image.height() as u32,
        }))
    }
}

/// Open CoreGraphics capture handle
pub struct CoreGraphicsSource {
    display: CGDisplay,
    width: u32,
    height: u32,
}

impl FrameSource for CoreGraphicsSource {
    fn native_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn grab(&mut self) -> CaptureResult<Option<RawFrame>> {
        let Some(image) = self.display.image() else {
            return Ok(None);
        };

        if image.bits_per_pixel() != 32 {
            return Err(CaptureError::GrabFailed(format!(
                "unsupported pixel layout: {} bits per pixel",
                image.bits_per_pixel()
            )));
        }

        let width = image.width() as u32;
        let height = image.height() as u32;
        let data = image.data();

        Ok(Some(RawFrame {
            data: bgra_rows_to_rgb(data.bytes(), width, height, image.bytes_per_row()),
            width,
            height,
        }))
    }
}
