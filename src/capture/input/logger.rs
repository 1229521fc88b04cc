//! Event logger
//!
//! Listener callbacks push into an unbounded channel and never block; the
//! session drains and writes the log once, at stop.

use super::listener::InputCapabilities;
use super::types::{InputEvent, InputEventKind, MouseButton};
use crossbeam_channel::{Receiver, Sender};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Append-only store of timestamped input events
pub struct EventLogger {
    tx: Sender<InputEvent>,
    rx: Receiver<InputEvent>,
}

impl EventLogger {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    /// Record one event; safe to call from any thread
    pub fn record(&self, event: InputEvent) {
        // The receiver lives as long as the logger, so this cannot fail
        let _ = self.tx.send(event);
    }

    /// Producer handle for listener threads
    pub fn sink(&self, origin: Instant, capabilities: InputCapabilities) -> EventSink {
        EventSink {
            tx: self.tx.clone(),
            origin,
            capabilities,
            last_move_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Events recorded and not yet drained
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Drain all pending events, stably sorted by timestamp
    pub fn drain_sorted(&self) -> Vec<InputEvent> {
        let mut events: Vec<InputEvent> = self.rx.try_iter().collect();
        events.sort_by_key(|e| e.timestamp_ms);
        events
    }

    /// Drain, sort and write the log as a JSON array
    ///
    /// Returns the number of events written. With no events the file holds `[]`.
    pub fn flush(&self, path: &Path) -> std::io::Result<usize> {
        let events = self.drain_sorted();

        let file = std::fs::File::create(path)?;
        let mut writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &events)?;
        writer.write_all(b"\n")?;
        writer.flush()?;

        tracing::info!("Saved {} input events to {:?}", events.len(), path);
        Ok(events.len())
    }
}

impl Default for EventLogger {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable producer used by input listeners
///
/// Timestamps are taken here, relative to the session origin, so every
/// listener shares one clock.
#[derive(Clone)]
pub struct EventSink {
    tx: Sender<InputEvent>,
    origin: Instant,
    capabilities: InputCapabilities,
    /// Last accepted mouse move, stored as `ms + 1` (0 = none yet)
    last_move_ms: Arc<AtomicU64>,
}

impl EventSink {
    /// Milliseconds since the session origin
    pub fn elapsed_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    pub fn capabilities(&self) -> &InputCapabilities {
        &self.capabilities
    }

    fn push(&self, kind: InputEventKind) {
        let event = InputEvent::new(self.elapsed_ms(), kind);
        let _ = self.tx.send(event);
    }

    pub fn key_press(&self, key: impl Into<String>) {
        if self.capabilities.keyboard {
            self.push(InputEventKind::KeyPress { key: key.into() });
        }
    }

    pub fn key_release(&self, key: impl Into<String>) {
        if self.capabilities.keyboard {
            self.push(InputEventKind::KeyRelease { key: key.into() });
        }
    }

    /// Record a pointer move, throttled to one per `mouse_move_interval_ms`
    pub fn mouse_move(&self, x: i32, y: i32) {
        if !self.capabilities.mouse {
            return;
        }

        let now = self.elapsed_ms();
        let last = self.last_move_ms.load(Ordering::Relaxed);
        if last != 0 && now + 1 < last + self.capabilities.mouse_move_interval_ms {
            return;
        }
        if self
            .last_move_ms
            .compare_exchange(last, now + 1, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            // Another thread accepted a move in the same instant
            return;
        }

        let _ = self.tx.send(InputEvent::new(now, InputEventKind::MouseMove { x, y }));
    }

    pub fn mouse_click(&self, x: i32, y: i32, button: MouseButton, pressed: bool) {
        if self.capabilities.mouse {
            self.push(InputEventKind::MouseClick { x, y, button, pressed });
        }
    }

    pub fn mouse_scroll(&self, x: i32, y: i32, dx: i32, dy: i32) {
        if self.capabilities.mouse {
            self.push(InputEventKind::MouseScroll { x, y, dx, dy });
        }
    }
}
