//! screentrace - screen video plus a synchronized keyboard/mouse event log.
//!
//! The library exposes `ScreenRecorder`, which paces frame capture, feeds an
//! encoder chosen from a tiered fallback list and writes the event log when
//! the recording stops.

pub mod capture;
pub mod encoder;
pub mod recorder;
pub mod utils;

pub use recorder::{RecordingConfig, RecordingOutput, RecordingState, ScreenRecorder};

use std::sync::Once;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

static TRACING: Once = Once::new();

/// Install the tracing subscriber; later calls are no-ops
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "screentrace=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init();
    });
}
