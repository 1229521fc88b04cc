//! macOS capture implementations
//!
//! CoreGraphics display images for the screen, a CGEventTap for input (see
//! `capture::input`).

pub mod permissions;
pub mod screen;

pub use screen::{get_displays, CoreGraphicsOpener, CoreGraphicsSource};
