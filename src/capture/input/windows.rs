//! Windows low-level keyboard and mouse hooks
//!
//! Hooks run on a dedicated thread with its own message loop. Hook procs are
//! plain `extern "system"` functions, so the active sink lives in a static.

use super::listener::{InputListener, ListenerError};
use super::logger::EventSink;
use super::types::MouseButton;
use parking_lot::RwLock;
use std::thread::JoinHandle;

use windows::Win32::{
    Foundation::{HINSTANCE, HWND, LPARAM, LRESULT, WPARAM},
    System::LibraryLoader::GetModuleHandleW,
    System::Threading::GetCurrentThreadId,
    UI::WindowsAndMessaging::{
        CallNextHookEx, DispatchMessageW, GetMessageW, PostThreadMessageW, SetWindowsHookExW,
        TranslateMessage, UnhookWindowsHookEx, HHOOK, KBDLLHOOKSTRUCT, MSG, MSLLHOOKSTRUCT,
        WH_KEYBOARD_LL, WH_MOUSE_LL, WM_KEYDOWN, WM_KEYUP, WM_LBUTTONDOWN, WM_LBUTTONUP,
        WM_MBUTTONDOWN, WM_MBUTTONUP, WM_MOUSEHWHEEL, WM_MOUSEMOVE, WM_MOUSEWHEEL, WM_QUIT,
        WM_RBUTTONDOWN, WM_RBUTTONUP, WM_SYSKEYDOWN, WM_SYSKEYUP, WM_XBUTTONDOWN, WM_XBUTTONUP,
    },
};

/// Sink used by the hook procs while a listener is active
static HOOK_SINK: RwLock<Option<EventSink>> = RwLock::new(None);

/// Low-level hook listener
pub struct HookListener {
    thread: Option<JoinHandle<()>>,
    thread_id: u32,
}

impl HookListener {
    pub fn new() -> Self {
        Self {
            thread: None,
            thread_id: 0,
        }
    }
}

impl Default for HookListener {
    fn default() -> Self {
        Self::new()
    }
}

impl InputListener for HookListener {
    fn name(&self) -> &str {
        "windows-ll-hooks"
    }

    fn start(&mut self, sink: EventSink) -> Result<(), ListenerError> {
        if self.thread.is_some() {
            return Ok(());
        }

        let want_keyboard = sink.capabilities().keyboard;
        let want_mouse = sink.capabilities().mouse;
        *HOOK_SINK.write() = Some(sink);

        // The hook thread reports its id (or install failure) before pumping
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<u32, String>>(1);

        let thread = std::thread::Builder::new()
            .name("input-hooks".to_string())
            .spawn(move || run_hook_thread(want_keyboard, want_mouse, ready_tx))
            .map_err(|e| ListenerError::Unavailable(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(thread_id)) => {
                self.thread = Some(thread);
                self.thread_id = thread_id;
                tracing::info!(
                    "Input hooks installed (keyboard: {}, mouse: {})",
                    want_keyboard,
                    want_mouse
                );
                Ok(())
            }
            Ok(Err(message)) => {
                let _ = thread.join();
                *HOOK_SINK.write() = None;
                Err(ListenerError::Unavailable(message))
            }
            Err(_) => {
                let _ = thread.join();
                *HOOK_SINK.write() = None;
                Err(ListenerError::Unavailable("hook thread exited early".to_string()))
            }
        }
    }

    fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            unsafe {
                let _ = PostThreadMessageW(self.thread_id, WM_QUIT, WPARAM(0), LPARAM(0));
            }
            if thread.join().is_err() {
                tracing::warn!("Input hook thread panicked");
            }
            self.thread_id = 0;
            tracing::info!("Input hooks removed");
        }
        *HOOK_SINK.write() = None;
    }

    fn is_active(&self) -> bool {
        self.thread.is_some()
    }
}

impl Drop for HookListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_hook_thread(
    want_keyboard: bool,
    want_mouse: bool,
    ready: crossbeam_channel::Sender<Result<u32, String>>,
) {
    unsafe {
        let module = match GetModuleHandleW(None) {
            Ok(module) => HINSTANCE(module.0),
            Err(e) => {
                let _ = ready.send(Err(format!("GetModuleHandleW: {}", e)));
                return;
            }
        };

        let mouse_hook = if want_mouse {
            match SetWindowsHookExW(WH_MOUSE_LL, Some(mouse_hook_proc), module, 0) {
                Ok(hook) => Some(hook),
                Err(e) => {
                    let _ = ready.send(Err(format!("Failed to install mouse hook: {}", e)));
                    return;
                }
            }
        } else {
            None
        };

        let keyboard_hook = if want_keyboard {
            match SetWindowsHookExW(WH_KEYBOARD_LL, Some(keyboard_hook_proc), module, 0) {
                Ok(hook) => Some(hook),
                Err(e) => {
                    if let Some(hook) = mouse_hook {
                        let _ = UnhookWindowsHookEx(hook);
                    }
                    let _ = ready.send(Err(format!("Failed to install keyboard hook: {}", e)));
                    return;
                }
            }
        } else {
            None
        };

        let _ = ready.send(Ok(GetCurrentThreadId()));

        let mut msg = MSG::default();
        while GetMessageW(&mut msg, HWND::default(), 0, 0).as_bool() {
            let _ = TranslateMessage(&msg);
            DispatchMessageW(&msg);
        }

        if let Some(hook) = mouse_hook {
            let _ = UnhookWindowsHookEx(hook);
        }
        if let Some(hook) = keyboard_hook {
            let _ = UnhookWindowsHookEx(hook);
        }
    }
}

unsafe extern "system" fn mouse_hook_proc(code: i32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
    if code == 0 {
        if let Some(sink) = HOOK_SINK.read().as_ref() {
            let data = *(lparam.0 as *const MSLLHOOKSTRUCT);
            let (x, y) = (data.pt.x, data.pt.y);
            let wheel = ((data.mouseData >> 16) & 0xffff) as i16 as i32;
            let xbutton = if (data.mouseData >> 16) & 0xffff == 1 {
                MouseButton::X1
            } else {
                MouseButton::X2
            };

            match wparam.0 as u32 {
                WM_MOUSEMOVE => sink.mouse_move(x, y),
                WM_LBUTTONDOWN => sink.mouse_click(x, y, MouseButton::Left, true),
                WM_LBUTTONUP => sink.mouse_click(x, y, MouseButton::Left, false),
                WM_RBUTTONDOWN => sink.mouse_click(x, y, MouseButton::Right, true),
                WM_RBUTTONUP => sink.mouse_click(x, y, MouseButton::Right, false),
                WM_MBUTTONDOWN => sink.mouse_click(x, y, MouseButton::Middle, true),
                WM_MBUTTONUP => sink.mouse_click(x, y, MouseButton::Middle, false),
                WM_XBUTTONDOWN => sink.mouse_click(x, y, xbutton, true),
                WM_XBUTTONUP => sink.mouse_click(x, y, xbutton, false),
                // One notch is 120; log notches like other platforms do
                WM_MOUSEWHEEL => sink.mouse_scroll(x, y, 0, wheel / 120),
                WM_MOUSEHWHEEL => sink.mouse_scroll(x, y, wheel / 120, 0),
                _ => {}
            }
        }
    }
    CallNextHookEx(HHOOK::default(), code, wparam, lparam)
}

unsafe extern "system" fn keyboard_hook_proc(code: i32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
    if code == 0 {
        if let Some(sink) = HOOK_SINK.read().as_ref() {
            let data = *(lparam.0 as *const KBDLLHOOKSTRUCT);
            let key = key_name(data.vkCode);

            match wparam.0 as u32 {
                WM_KEYDOWN | WM_SYSKEYDOWN => sink.key_press(key),
                WM_KEYUP | WM_SYSKEYUP => sink.key_release(key),
                _ => {}
            }
        }
    }
    CallNextHookEx(HHOOK::default(), code, wparam, lparam)
}

/// Readable name for a virtual-key code
fn key_name(vk: u32) -> String {
    match vk {
        0x30..=0x39 | 0x41..=0x5A => char::from_u32(vk)
            .map(|c| c.to_ascii_lowercase().to_string())
            .unwrap_or_default(),
        0x08 => "backspace".to_string(),
        0x09 => "tab".to_string(),
        0x0D => "enter".to_string(),
        0x10 | 0xA0 | 0xA1 => "shift".to_string(),
        0x11 | 0xA2 | 0xA3 => "ctrl".to_string(),
        0x12 | 0xA4 | 0xA5 => "alt".to_string(),
        0x14 => "caps_lock".to_string(),
        0x1B => "esc".to_string(),
        0x20 => "space".to_string(),
        0x21 => "page_up".to_string(),
        0x22 => "page_down".to_string(),
        0x23 => "end".to_string(),
        0x24 => "home".to_string(),
        0x25 => "left".to_string(),
        0x26 => "up".to_string(),
        0x27 => "right".to_string(),
        0x28 => "down".to_string(),
        0x2E => "delete".to_string(),
        0x5B | 0x5C => "cmd".to_string(),
        0x70..=0x87 => format!("f{}", vk - 0x6F),
        _ => format!("vk_{:#04x}", vk),
    }
}
