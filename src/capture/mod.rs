//! Screen and input capture
//!
//! Frame sources for each platform plus the keyboard/mouse event pipeline.

pub mod frame;
pub mod input;
pub mod screen;
pub mod synthetic;
pub mod traits;

#[cfg(target_os = "macos")]
pub mod macos;

#[cfg(target_os = "windows")]
pub mod windows;

pub use frame::{logical_resolution, Frame, RawFrame};
pub use synthetic::SolidColorOpener;
pub use traits::{
    openers_for, resolve_source, CaptureBackend, CaptureError, CaptureResult, DisplayInfo,
    FrameSource,
    ResolvedSource, SourceOpener,
};

/// List the displays of the accelerated backend
pub fn get_displays() -> Vec<DisplayInfo> {
    #[cfg(target_os = "macos")]
    {
        macos::get_displays()
    }

    #[cfg(target_os = "windows")]
    {
        windows::get_displays()
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        Vec::new()
    }
}
