//! Windows capture implementations
//!
//! GDI BitBlt for the screen, low-level hooks for input (see `capture::input`).

pub mod screen;

pub use screen::{get_displays, GdiOpener, GdiSource};
