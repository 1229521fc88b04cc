//! macOS input listener using a listen-only CGEventTap
//!
//! The tap runs on its own thread with its own run loop; the loop is pumped
//! in short slices so `stop` only has to flip a flag.

use super::listener::{InputListener, ListenerError};
use super::logger::EventSink;
use super::types::MouseButton;
use crate::capture::macos::permissions::has_accessibility_permission;
use core_foundation::runloop::{kCFRunLoopCommonModes, kCFRunLoopDefaultMode, CFRunLoop};
use core_graphics::event::{
    CGEvent, CGEventTap, CGEventTapLocation, CGEventTapOptions, CGEventTapPlacement,
    CGEventTapProxy,
    CGEventType, EventField,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const RUN_LOOP_SLICE: Duration = Duration::from_millis(100);

/// Event tap listener
pub struct EventTapListener {
    thread: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl EventTapListener {
    pub fn new() -> Self {
        Self {
            thread: None,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Default for EventTapListener {
    fn default() -> Self {
        Self::new()
    }
}

impl InputListener for EventTapListener {
    fn name(&self) -> &str {
        "macos-event-tap"
    }

    fn start(&mut self, sink: EventSink) -> Result<(), ListenerError> {
        if self.thread.is_some() {
            return Ok(());
        }

        if !has_accessibility_permission() {
            return Err(ListenerError::PermissionDenied(
                "Accessibility permission not granted; input will not be logged".to_string(),
            ));
        }

        self.shutdown.store(false, Ordering::SeqCst);
        let shutdown = Arc::clone(&self.shutdown);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<(), String>>(1);

        let thread = std::thread::Builder::new()
            .name("input-event-tap".to_string())
            .spawn(move || run_tap_thread(sink, shutdown, ready_tx))
            .map_err(|e| ListenerError::Unavailable(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.thread = Some(thread);
                tracing::info!("Input event tap installed");
                Ok(())
            }
            Ok(Err(message)) => {
                let _ = thread.join();
                Err(ListenerError::Unavailable(message))
            }
            Err(_) => {
                let _ = thread.join();
                Err(ListenerError::Unavailable("event tap thread exited early".to_string()))
            }
        }
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("Input event tap thread panicked");
            }
            tracing::info!("Input event tap removed");
        }
    }

    fn is_active(&self) -> bool {
        self.thread.is_some()
    }
}

impl Drop for EventTapListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn interesting_events(sink: &EventSink) -> Vec<CGEventType> {
    let mut events = Vec::new();
    if sink.capabilities().keyboard {
        events.extend([CGEventType::KeyDown, CGEventType::KeyUp]);
    }
    if sink.capabilities().mouse {
        events.extend([
            CGEventType::MouseMoved,
            CGEventType::LeftMouseDragged,
            CGEventType::RightMouseDragged,
            CGEventType::LeftMouseDown,
            CGEventType::LeftMouseUp,
            CGEventType::RightMouseDown,
            CGEventType::RightMouseUp,
            CGEventType::OtherMouseDown,
            CGEventType::OtherMouseUp,
            CGEventType::ScrollWheel,
        ]);
    }
    events
}

fn run_tap_thread(
    sink: EventSink,
    shutdown: Arc<AtomicBool>,
    ready: crossbeam_channel::Sender<Result<(), String>>,
) {
    let events = interesting_events(&sink);
    let callback_sink = sink.clone();

    let tap = CGEventTap::new(
        CGEventTapLocation::Session,
        CGEventTapPlacement::HeadInsertEventTap,
        CGEventTapOptions::ListenOnly,
        events,
        move |_proxy: CGEventTapProxy, event_type: CGEventType, event: &CGEvent| {
            handle_event(&callback_sink, event_type, event);
            None
        },
    );

    let tap = match tap {
        Ok(tap) => tap,
        Err(()) => {
            let _ = ready.send(Err("CGEventTapCreate failed".to_string()));
            return;
        }
    };

    let source = match tap.mach_port.create_runloop_source(0) {
        Ok(source) => source,
        Err(()) => {
            let _ = ready.send(Err("Failed to create run loop source".to_string()));
            return;
        }
    };

    unsafe {
        CFRunLoop::get_current().add_source(&source, kCFRunLoopCommonModes);
    }
    tap.enable();
    let _ = ready.send(Ok(()));

    while !shutdown.load(Ordering::SeqCst) {
        unsafe {
            CFRunLoop::run_in_mode(kCFRunLoopDefaultMode, RUN_LOOP_SLICE, false);
        }
    }
}

fn handle_event(sink: &EventSink, event_type: CGEventType, event: &CGEvent) {
    let point = event.location();
    let (x, y) = (point.x as i32, point.y as i32);

    match event_type {
        CGEventType::KeyDown => sink.key_press(key_name(event)),
        CGEventType::KeyUp => sink.key_release(key_name(event)),
        CGEventType::MouseMoved
        | CGEventType::LeftMouseDragged
        | CGEventType::RightMouseDragged => {
            sink.mouse_move(x, y)
        }
        CGEventType::LeftMouseDown => sink.mouse_click(x, y, MouseButton::Left, true),
        CGEventType::LeftMouseUp => sink.mouse_click(x, y, MouseButton::Left, false),
        CGEventType::RightMouseDown => sink.mouse_click(x, y, MouseButton::Right, true),
        CGEventType::RightMouseUp => sink.mouse_click(x, y, MouseButton::Right, false),
        CGEventType::OtherMouseDown => sink.mouse_click(x, y, other_button(event), true),
        CGEventType::OtherMouseUp => sink.mouse_click(x, y, other_button(event), false),
        CGEventType::ScrollWheel => {
            let dy =
                event.get_integer_value_field(EventField::SCROLL_WHEEL_EVENT_DELTA_AXIS_1) as i32;
            let dx =
                event.get_integer_value_field(EventField::SCROLL_WHEEL_EVENT_DELTA_AXIS_2) as i32;
            sink.mouse_scroll(x, y, dx, dy)
        }
        _ => {}
    }
}

fn other_button(event: &CGEvent) -> MouseButton {
    match event.get_integer_value_field(EventField::MOUSE_EVENT_BUTTON_NUMBER) {
        2 => MouseButton::Middle,
        3 => MouseButton::X1,
        4 => MouseButton::X2,
        _ => MouseButton::Unknown,
    }
}

fn key_name(event: &CGEvent) -> String {
    let code = event.get_integer_value_field(EventField::KEYBOARD_EVENT_KEYCODE);
    keycode_name(code)
}

/// Readable name for an ANSI virtual keycode
fn keycode_name(code: i64) -> String {
    const LETTERS: [(i64, &str); 36] = [
        (0, "a"), (11, "b"), (8, "c"), (2, "d"), (14, "e"), (3, "f"), (5, "g"), (4, "h"), (34, "i"),
        (38, "j"), (40, "k"), (37, "l"), (46, "m"), (45, "n"), (31, "o"), (35, "p"), (12, "q"),
        (15, "r"), (1, "s"), (17, "t"), (32, "u"), (9, "v"), (13, "w"), (7, "x"), (16, "y"),
        (6, "z"), (29, "0"), (18, "1"), (19, "2"), (20, "3"), (21, "4"), (23, "5"), (22, "6"),
        (26, "7"), (28, "8"), (25, "9"),
    ];

    if let Some((_, name)) = LETTERS.iter().find(|(c, _)| *c == code) {
        return name.to_string();
    }

    match code {
        36 => "enter",
        48 => "tab",
        49 => "space",
        51 => "backspace",
        53 => "esc",
        55 => "cmd",
        56 => "shift",
        57 => "caps_lock",
        58 => "alt",
        59 => "ctrl",
        117 => "delete",
        123 => "left",
        124 => "right",
        125 => "down",
        126 => "up",
        _ => return format!("keycode_{}", code),
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keycode_names() {
        assert_eq!(keycode_name(0), "a");
        assert_eq!(keycode_name(49), "space");
        assert_eq!(keycode_name(200), "keycode_200");
    }
}
