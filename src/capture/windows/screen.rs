//! Windows screen capture using GDI BitBlt
//!
//! The desktop DC, memory DC and bitmap are created once per handle and
//! reused for every grab. GDI objects belong to the creating thread, so the
//! handle is opened inside the capture worker.

use crate::capture::frame::{bgra_to_rgb, RawFrame};
use crate::capture::traits::{CaptureError, CaptureResult, DisplayInfo, FrameSource, SourceOpener};

use windows::{
    Win32::Foundation::{BOOL, HWND, LPARAM, RECT},
    Win32::Graphics::Gdi::{
        BitBlt, CreateCompatibleBitmap, CreateCompatibleDC, DeleteDC, DeleteObject,
        EnumDisplayMonitors, GetDC, GetDIBits, GetMonitorInfoW, ReleaseDC, SelectObject,
        BITMAPINFO, BITMAPINFOHEADER, BI_RGB, DIB_RGB_COLORS, HBITMAP, HDC, HGDIOBJ, HMONITOR,
        MONITORINFOEXW, SRCCOPY,
    },
    Win32::UI::WindowsAndMessaging::GetDesktopWindow,
};

/// A monitor with its position on the virtual desktop
#[derive(Debug, Clone)]
struct MonitorRect {
    info: DisplayInfo,
    left: i32,
    top: i32,
}

fn enumerate_monitors() -> Vec<MonitorRect> {
    use std::mem::zeroed;

    let mut monitors: Vec<MonitorRect> = Vec::new();
    let monitors_ptr = &mut monitors as *mut Vec<MonitorRect>;

    unsafe extern "system" fn enum_monitors_callback(
        hmonitor: HMONITOR,
        _hdc: HDC,
        _rect: *mut RECT,
        lparam: LPARAM,
    ) -> BOOL {
        let monitors = &mut *(lparam.0 as *mut Vec<MonitorRect>);

        let mut monitor_info: MONITORINFOEXW = unsafe { zeroed() };
        monitor_info.monitorInfo.cbSize = std::mem::size_of::<MONITORINFOEXW>() as u32;

        if unsafe { GetMonitorInfoW(hmonitor, &mut monitor_info.monitorInfo) }.as_bool() {
            let rect = monitor_info.monitorInfo.rcMonitor;
            let is_primary = (monitor_info.monitorInfo.dwFlags & 1) != 0; // MONITORINFOF_PRIMARY

            let name_len = monitor_info
                .szDevice
                .iter()
                .position(|&c| c == 0)
                .unwrap_or(monitor_info.szDevice.len());

            monitors.push(MonitorRect {
                info: DisplayInfo {
                    id: monitors.len() as u32,
                    name: String::from_utf16_lossy(&monitor_info.szDevice[..name_len]),
                    width: (rect.right - rect.left).max(0) as u32,
                    height: (rect.bottom - rect.top).max(0) as u32,
                    is_primary,
                },
                left: rect.left,
                top: rect.top,
            });
        }

        BOOL::from(true)
    }

    unsafe {
        let _ = EnumDisplayMonitors(
            HDC::default(),
            None,
            Some(enum_monitors_callback),
            LPARAM(monitors_ptr as isize),
        );
    }

    // Primary monitor first so display index 0 is always the main screen
    monitors.sort_by_key(|m| !m.info.is_primary);
    for (index, monitor) in monitors.iter_mut().enumerate() {
        monitor.info.id = index as u32;
    }

    monitors
}

/// Get list of available displays on Windows
pub fn get_displays() -> Vec<DisplayInfo> {
    enumerate_monitors().into_iter().map(|m| m.info).collect()
}

/// Opener for GDI capture handles
#[derive(Debug, Default, Clone, Copy)]
pub struct GdiOpener;

impl SourceOpener for GdiOpener {
    fn name(&self) -> &str {
        "gdi"
    }

    fn open(&self, display_index: u32) -> CaptureResult<Box<dyn FrameSource>> {
        let monitor = enumerate_monitors()
            .into_iter()
            .nth(display_index as usize)
            .ok_or(CaptureError::DisplayNotFound(display_index))?;

        Ok(Box::new(GdiSource::new(monitor)?))
    }
}

/// Open GDI capture handle for one monitor
pub struct GdiSource {
    desktop: HWND,
    hdc_screen: HDC,
    hdc_mem: HDC,
    hbitmap: HBITMAP,
    old_object: HGDIOBJ,
    left: i32,
    top: i32,
    width: u32,
    height: u32,
    buffer: Vec<u8>,
}

impl GdiSource {
    fn new(monitor: MonitorRect) -> CaptureResult<Self> {
        let width = monitor.info.width;
        let height = monitor.info.height;
        if width == 0 || height == 0 {
            return Err(CaptureError::Unavailable("monitor reports zero size".to_string()));
        }

        unsafe {
            let desktop = GetDesktopWindow();
            let hdc_screen = GetDC(desktop);
            if hdc_screen.is_invalid() {
                return Err(CaptureError::Unavailable("GetDC failed".to_string()));
            }

            let hdc_mem = CreateCompatibleDC(hdc_screen);
            if hdc_mem.is_invalid() {
                ReleaseDC(desktop, hdc_screen);
                return Err(CaptureError::Unavailable("CreateCompatibleDC failed".to_string()));
            }

            let hbitmap = CreateCompatibleBitmap(hdc_screen, width as i32, height as i32);
            if hbitmap.is_invalid() {
                let _ = DeleteDC(hdc_mem);
                ReleaseDC(desktop, hdc_screen);
                return Err(CaptureError::Unavailable("CreateCompatibleBitmap failed".to_string()));
            }

            let old_object = SelectObject(hdc_mem, hbitmap);

            Ok(Self {
                desktop,
                hdc_screen,
                hdc_mem,
                hbitmap,
                old_object,
                left: monitor.left,
                top: monitor.top,
                width,
                height,
                buffer: vec![0u8; width as usize * height as usize * 4],
            })
        }
    }
}

impl FrameSource for GdiSource {
    fn native_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn grab(&mut self) -> CaptureResult<Option<RawFrame>> {
        unsafe {
            BitBlt(
                self.hdc_mem,
                0,
                0,
                self.width as i32,
                self.height as i32,
                self.hdc_screen,
                self.left,
                self.top,
                SRCCOPY,
            )
            .map_err(|e| CaptureError::GrabFailed(format!("BitBlt: {}", e)))?;

            let mut bmi: BITMAPINFO = std::mem::zeroed();
            bmi.bmiHeader.biSize = std::mem::size_of::<BITMAPINFOHEADER>() as u32;
            bmi.bmiHeader.biWidth = self.width as i32;
            bmi.bmiHeader.biHeight = -(self.height as i32); // Negative for top-down
            bmi.bmiHeader.biPlanes = 1;
            bmi.bmiHeader.biBitCount = 32; // BGRA
            bmi.bmiHeader.biCompression = BI_RGB.0;

            let lines = GetDIBits(
                self.hdc_mem,
                self.hbitmap,
                0,
                self.height,
                Some(self.buffer.as_mut_ptr() as *mut _),
                &mut bmi,
                DIB_RGB_COLORS,
            );

            // Secure desktop or a display mode switch; try again next tick
            if lines == 0 {
                return Ok(None);
            }
        }

        Ok(Some(RawFrame {
            data: bgra_to_rgb(&self.buffer),
            width: self.width,
            height: self.height,
        }))
    }
}

impl Drop for GdiSource {
    fn drop(&mut self) {
        unsafe {
            SelectObject(self.hdc_mem, self.old_object);
            let _ = DeleteObject(self.hbitmap);
            let _ = DeleteDC(self.hdc_mem);
            ReleaseDC(self.desktop, self.hdc_screen);
        }
    }
}
