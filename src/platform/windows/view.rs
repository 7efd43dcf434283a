//! The view: a child window of the host, owning one render thread for
//! its lifetime. Destroying the window (the host's job) tears down the
//! thread, the renderer, and every capture resource behind it.

use std::cell::RefCell;
use std::ffi::c_void;
use std::rc::Rc;

use windows::Win32::Foundation::{HWND, LPARAM, LRESULT, WPARAM};
use windows::Win32::UI::WindowsAndMessaging::{SendMessageW, WM_SIZE};

use crate::api::SourceSelection;
use crate::monitor::MonitorRect;

use super::render_thread::{RenderThread, SourceKind};
use super::win32::{create_child_window, MessageHandler, SendHwnd};

/// Host-facing "switch monitors" message for the view window. WPARAM
/// points at four ints (x, y, w, h); `SendMessage` keeps the pointer
/// alive for the duration of the call.
const WM_APP_SETSCREEN: u32 = 0x8001;

struct ViewHandler {
    render: Rc<RefCell<Option<RenderThread>>>,
}

impl MessageHandler for ViewHandler {
    fn message(&self, _hwnd: HWND, msg: u32, wparam: WPARAM, _lparam: LPARAM) -> Option<LRESULT> {
        match msg {
            WM_SIZE => {
                if let Some(render) = self.render.borrow().as_ref() {
                    render.send_resize();
                }
                None
            }
            WM_APP_SETSCREEN => {
                let xywh = wparam.0 as *const [i32; 4];
                if xywh.is_null() {
                    return Some(LRESULT(0));
                }
                let [x, y, w, h] = unsafe { *xywh };
                let rect = MonitorRect::from_position_and_size(x, y, w, h);
                if let Some(render) = self.render.borrow().as_ref() {
                    render.send_new_screen(rect);
                }
                Some(LRESULT(1))
            }
            _ => None,
        }
    }
}

pub(crate) fn create_view(parent: *mut c_void, rect: MonitorRect) -> *mut c_void {
    let Some((major, minor)) = super::windows_version() else {
        log::error!("failed to determine the Windows version");
        return std::ptr::null_mut();
    };

    let kind = match crate::api::select_source(major, minor) {
        Some(SourceSelection::Modern) => SourceKind::Duplication,
        Some(SourceSelection::Legacy) => SourceKind::LegacyDwm,
        None => {
            log::warn!("no capture strategy for Windows {major}.{minor}");
            return std::ptr::null_mut();
        }
    };

    let render: Rc<RefCell<Option<RenderThread>>> = Rc::new(RefCell::new(None));
    let handler = ViewHandler {
        render: render.clone(),
    };

    let hwnd = match create_child_window(HWND(parent), Box::new(handler)) {
        Ok(hwnd) => hwnd,
        Err(e) => {
            log::error!("{e:#}");
            return std::ptr::null_mut();
        }
    };

    *render.borrow_mut() = Some(RenderThread::spawn(SendHwnd(hwnd), rect, kind));

    hwnd.0
}

pub(crate) fn change_screen(view: *mut c_void, rect: MonitorRect) {
    let xywh = [rect.left, rect.top, rect.width(), rect.height()];
    unsafe {
        SendMessageW(
            HWND(view),
            WM_APP_SETSCREEN,
            Some(WPARAM(&xywh as *const [i32; 4] as usize)),
            None,
        );
    }
}
