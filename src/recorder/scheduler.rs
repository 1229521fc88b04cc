//! Frame scheduler
//!
//! The capture loop paces grabs against a deadline and pushes frames into
//! the bounded queue without blocking. The writer loop is the queue's only
//! consumer and does all of the encoder I/O.

use super::queue::{FrameReceiver, FrameSender, Next, Offer};
use super::state::RecordingEvent;
use crate::capture::frame::Frame;
use crate::capture::SourceOpener;
use crate::encoder::{EncoderBackend, EncoderResult, EncoderState};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Frames between progress log lines (~10 s at 30 fps)
pub const PROGRESS_INTERVAL: u64 = 300;

const WRITER_POLL: Duration = Duration::from_millis(50);
const WRITE_WARN_EVERY: u64 = 100;

/// Capture loop telemetry
#[derive(Debug, Clone, Default)]
pub struct CaptureStats {
    pub captured: u64,
    pub dropped: u64,
    pub empty_polls: u64,
    pub grab_errors: u64,
    /// Wall-clock time from loop start to loop exit
    pub duration: Duration,
    /// Why the worker could not open its source
    pub open_error: Option<String>,
}

/// Writer loop telemetry
#[derive(Debug, Clone, Default)]
pub struct WriterStats {
    pub written: u64,
    pub failures: u64,
    /// Frames left in the queue when the writer was abandoned
    pub abandoned: u64,
}

/// Measured frame rate from frames written over capture time
pub fn actual_fps(frames: u64, duration: Duration) -> f64 {
    let secs = duration.as_secs_f64();
    if secs > 0.0 {
        frames as f64 / secs
    } else {
        0.0
    }
}

/// Capture loop parameters
pub struct CaptureLoop {
    pub opener: Arc<dyn SourceOpener>,
    pub display_index: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub stop: Arc<AtomicBool>,
    pub events: Option<broadcast::Sender<RecordingEvent>>,
}

impl CaptureLoop {
    /// Run until `stop` is set; consumes the queue sender
    pub fn run(self, sender: FrameSender) -> CaptureStats {
        let started = Instant::now();
        let mut stats = CaptureStats::default();

        // Opened here: capture handles stay on the thread that created them
        let mut source = match self.opener.open(self.display_index) {
            Ok(source) => source,
            Err(e) => {
                let message =
                    format!("capture worker could not open {}: {}", self.opener.name(), e);
                tracing::error!("{}", message);
                if let Some(events) = &self.events {
                    let _ = events.send(RecordingEvent::Error(message.clone()));
                }
                stats.open_error = Some(message);
                stats.duration = started.elapsed();
                return stats;
            }
        };

        let interval = Duration::from_secs_f64(1.0 / self.fps.max(1) as f64);
        let mut deadline = started;
        let mut seq = 0u64;

        tracing::info!(
            "Capture loop started: {} -> {}x{} @ {}fps",
            self.opener.name(),
            self.width,
            self.height,
            self.fps
        );

        while !self.stop.load(Ordering::Relaxed) {
            let now = Instant::now();
            if now < deadline {
                std::thread::sleep(deadline - now);
                if self.stop.load(Ordering::Relaxed) {
                    break;
                }
            }

            match source.grab() {
                Ok(Some(raw)) => {
                    let frame = Frame::from_raw(seq, raw, self.width, self.height);
                    seq += 1;
                    stats.captured += 1;

                    match sender.offer(frame) {
                        Offer::Queued => {}
                        Offer::Dropped => {
                            if sender.dropped() == 1 || sender.dropped() % PROGRESS_INTERVAL == 0 {
                                tracing::warn!(
                                    "Frame queue full; {} frames dropped so far",
                                    sender.dropped()
                                );
                            }
                        }
                        Offer::Closed => {
                            tracing::warn!("Frame writer gone; stopping capture");
                            break;
                        }
                    }

                    if stats.captured % PROGRESS_INTERVAL == 0 {
                        let elapsed = started.elapsed();
                        tracing::debug!(
                            "Captured {} frames in {:.1}s ({:.1} fps, {} dropped, queue {})",
                            stats.captured,
                            elapsed.as_secs_f64(),
                            actual_fps(stats.captured, elapsed),
                            sender.dropped(),
                            sender.len()
                        );
                        if let Some(events) = &self.events {
                            let _ = events.send(RecordingEvent::Progress {
                                frames: stats.captured,
                                elapsed_ms: elapsed.as_secs_f64() * 1000.0,
                            });
                        }
                    }
                }
                Ok(None) => stats.empty_polls += 1,
                Err(e) => {
                    stats.grab_errors += 1;
                    if stats.grab_errors == 1 || stats.grab_errors % PROGRESS_INTERVAL == 0 {
                        tracing::warn!("Grab failed ({} so far): {}", stats.grab_errors, e);
                    }
                }
            }

            deadline += interval;
            let now = Instant::now();
            if now > deadline + interval {
                // Fell behind; resynchronize instead of bursting
                deadline = now + interval;
            }
        }

        stats.duration = started.elapsed();
        stats.dropped = sender.dropped();

        tracing::info!(
            "Capture loop stopped: {} captured, {} dropped, {} empty polls in {:.2}s",
            stats.captured,
            stats.dropped,
            stats.empty_polls,
            stats.duration.as_secs_f64()
        );
        stats
    }
}

/// Flags the session uses to wind the writer down
#[derive(Clone, Default)]
pub struct WriterControl {
    /// Capture has stopped; exit once the queue is empty
    pub input_closed: Arc<AtomicBool>,

    /// Stop immediately, leaving queued frames unwritten
    pub abandon: Arc<AtomicBool>,
}

/// What the writer hands back after finalizing
pub struct WriterReport {
    pub stats: WriterStats,
    /// Encoder counters just before finalize
    pub state: EncoderState,
    pub finalized: EncoderResult<PathBuf>,
}

/// Drain the queue into `backend`, then finalize it
pub fn run_writer_loop(
    mut backend: Box<dyn EncoderBackend>,
    queue: FrameReceiver,
    control: WriterControl,
) -> WriterReport {
    let mut stats = WriterStats::default();

    loop {
        if control.abandon.load(Ordering::Relaxed) {
            stats.abandoned = queue.len() as u64;
            tracing::warn!("Writer abandoned with {} frames queued", stats.abandoned);
            break;
        }

        match queue.next(WRITER_POLL) {
            Next::Frame(frame) => match backend.write(&frame) {
                Ok(()) => stats.written += 1,
                Err(e) => {
                    stats.failures += 1;
                    if stats.failures == 1 || stats.failures % WRITE_WARN_EVERY == 0 {
                        tracing::warn!(
                            "Frame {} write failed ({} so far): {}",
                            frame.seq,
                            stats.failures,
                            e
                        );
                    }
                }
            },
            Next::Idle => {
                if control.input_closed.load(Ordering::Relaxed) && queue.is_empty() {
                    break;
                }
            }
            Next::Finished => break,
        }
    }

    let state = backend.state();
    tracing::info!(
        "Writer loop finished: {} written, {} failed; finalizing {}",
        stats.written,
        stats.failures,
        state.tier
    );

    let finalized = backend.finalize();
    if let Err(e) = &finalized {
        tracing::error!("Encoder finalize failed: {}", e);
    }

    WriterReport {
        stats,
        state,
        finalized,
    }
}
