//! Window-class plumbing shared by every window this crate creates:
//! the per-view child window, the viewer/agent communicators, and the
//! throwaway window the agent's hook bootstrap needs.
//!
//! One trampoline `wndproc` dispatches to a boxed [`MessageHandler`]
//! stashed in the window's user data. The box travels in through
//! `CREATESTRUCT.lpCreateParams` at `WM_NCCREATE` and is reclaimed at
//! `WM_NCDESTROY`, so a window destroyed by the host (the view) frees
//! its state without any cooperation from our side.

use std::ffi::c_void;
use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};
use windows::core::w;
use windows::Win32::Foundation::{HINSTANCE, HMODULE, HWND, LPARAM, LRESULT, WPARAM};
use windows::Win32::System::LibraryLoader::{
    GetModuleFileNameW, GetModuleHandleExW, GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS,
    GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
};
use windows::Win32::UI::WindowsAndMessaging::{
    CreateWindowExW, DefWindowProcW, DestroyWindow, DispatchMessageW, GetMessageW, PeekMessageW,
    RegisterClassExW, TranslateMessage, CREATESTRUCTW, CS_HREDRAW, CS_VREDRAW, GWLP_USERDATA,
    HWND_MESSAGE, MSG, PM_REMOVE, WINDOW_EX_STYLE, WM_NCCREATE, WM_NCDESTROY, WM_QUIT,
    WNDCLASSEXW, WNDCLASS_STYLES, WS_CHILD,
};

/// Per-window message callback. Returning `None` falls through to
/// `DefWindowProc`.
pub(crate) trait MessageHandler {
    fn message(&self, hwnd: HWND, msg: u32, wparam: WPARAM, lparam: LPARAM) -> Option<LRESULT>;
}

/// `HWND` is a plain pointer-sized token; the OS dispatches messages to
/// the owning thread regardless of who posts them.
#[derive(Clone, Copy)]
pub(crate) struct SendHwnd(pub HWND);
unsafe impl Send for SendHwnd {}

#[cfg(target_pointer_width = "64")]
unsafe fn set_window_data(hwnd: HWND, value: isize) {
    use windows::Win32::UI::WindowsAndMessaging::SetWindowLongPtrW;
    unsafe { SetWindowLongPtrW(hwnd, GWLP_USERDATA, value) };
}

#[cfg(target_pointer_width = "64")]
unsafe fn get_window_data(hwnd: HWND) -> isize {
    use windows::Win32::UI::WindowsAndMessaging::GetWindowLongPtrW;
    unsafe { GetWindowLongPtrW(hwnd, GWLP_USERDATA) }
}

#[cfg(target_pointer_width = "32")]
unsafe fn set_window_data(hwnd: HWND, value: isize) {
    use windows::Win32::UI::WindowsAndMessaging::SetWindowLongW;
    unsafe { SetWindowLongW(hwnd, GWLP_USERDATA, value as i32) };
}

#[cfg(target_pointer_width = "32")]
unsafe fn get_window_data(hwnd: HWND) -> isize {
    use windows::Win32::UI::WindowsAndMessaging::GetWindowLongW;
    unsafe { GetWindowLongW(hwnd, GWLP_USERDATA) as isize }
}

unsafe extern "system" fn wndproc(
    hwnd: HWND,
    msg: u32,
    wparam: WPARAM,
    lparam: LPARAM,
) -> LRESULT {
    if msg == WM_NCCREATE {
        let create = lparam.0 as *const CREATESTRUCTW;
        if !create.is_null() {
            let handler = unsafe { (*create).lpCreateParams };
            unsafe { set_window_data(hwnd, handler as isize) };
        }
        return unsafe { DefWindowProcW(hwnd, msg, wparam, lparam) };
    }

    if msg == WM_NCDESTROY {
        let handler = unsafe { get_window_data(hwnd) } as *mut Box<dyn MessageHandler>;
        unsafe { set_window_data(hwnd, 0) };
        if !handler.is_null() {
            drop(unsafe { Box::from_raw(handler) });
        }
        return unsafe { DefWindowProcW(hwnd, msg, wparam, lparam) };
    }

    let handler = unsafe { get_window_data(hwnd) } as *mut Box<dyn MessageHandler>;
    if !handler.is_null() {
        if let Some(result) = unsafe { (*handler).message(hwnd, msg, wparam, lparam) } {
            return result;
        }
    }

    unsafe { DefWindowProcW(hwnd, msg, wparam, lparam) }
}

/// The module this code lives in -- the DLL, not the host executable.
/// Needed both as the window-class instance and as the file that gets
/// loaded into the compositor.
pub(crate) fn own_module_handle() -> Result<HMODULE> {
    static HANDLE: OnceLock<isize> = OnceLock::new();
    let raw = *HANDLE.get_or_init(|| {
        let mut module = HMODULE::default();
        let anchor = own_module_handle as *const c_void;
        let ok = unsafe {
            GetModuleHandleExW(
                GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS | GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
                windows::core::PCWSTR(anchor as *const u16),
                &mut module,
            )
        };
        if ok.is_ok() {
            module.0 as isize
        } else {
            0
        }
    });
    if raw == 0 {
        return Err(anyhow!("failed to resolve our own module handle"));
    }
    Ok(HMODULE(raw as *mut c_void))
}

/// Full on-disk path of this DLL, as UTF-16 without the terminator.
pub(crate) fn own_module_path() -> Result<Vec<u16>> {
    let module = own_module_handle()?;
    let mut buffer = vec![0u16; 1024];
    let len = unsafe { GetModuleFileNameW(Some(module), &mut buffer) } as usize;
    if len == 0 || len >= buffer.len() {
        return Err(anyhow!("GetModuleFileNameW failed"));
    }
    buffer.truncate(len);
    Ok(buffer)
}

fn register_class(name: windows::core::PCWSTR, style: WNDCLASS_STYLES) -> Result<u16> {
    let instance: HINSTANCE = own_module_handle()?.into();
    let class = WNDCLASSEXW {
        cbSize: std::mem::size_of::<WNDCLASSEXW>() as u32,
        style,
        lpfnWndProc: Some(wndproc),
        hInstance: instance,
        lpszClassName: name,
        ..Default::default()
    };
    let atom = unsafe { RegisterClassExW(&class) };
    if atom == 0 {
        return Err(anyhow!("RegisterClassExW failed"));
    }
    Ok(atom)
}

fn message_class() -> Result<u16> {
    static ATOM: OnceLock<Result<u16>> = OnceLock::new();
    ATOM.get_or_init(|| register_class(w!("ScreenViewMessageWindow"), WNDCLASS_STYLES(0)))
        .as_ref()
        .map(|atom| *atom)
        .map_err(|e| anyhow!("{e}"))
}

fn view_class() -> Result<u16> {
    static ATOM: OnceLock<Result<u16>> = OnceLock::new();
    ATOM.get_or_init(|| register_class(w!("ScreenViewViewWindow"), CS_HREDRAW | CS_VREDRAW))
        .as_ref()
        .map(|atom| *atom)
        .map_err(|e| anyhow!("{e}"))
}

fn create_window(
    atom: u16,
    style: windows::Win32::UI::WindowsAndMessaging::WINDOW_STYLE,
    parent: Option<HWND>,
    handler: Box<dyn MessageHandler>,
) -> Result<HWND> {
    let instance: HINSTANCE = own_module_handle()?.into();
    // Double-boxed so the user-data word is a thin pointer even for a
    // trait object.
    let payload: *mut Box<dyn MessageHandler> = Box::into_raw(Box::new(handler));

    let created = unsafe {
        CreateWindowExW(
            WINDOW_EX_STYLE(0),
            windows::core::PCWSTR(atom as usize as *const u16),
            windows::core::PCWSTR::null(),
            style,
            0,
            0,
            0,
            0,
            parent,
            None,
            Some(instance),
            Some(payload as *const c_void),
        )
    };

    match created {
        Ok(hwnd) => Ok(hwnd),
        Err(e) => {
            // WM_NCCREATE never ran; reclaim the handler here.
            drop(unsafe { Box::from_raw(payload) });
            Err(anyhow::Error::from(e).context("CreateWindowExW failed"))
        }
    }
}

/// A message-only window owned by a Rust value; destroyed on drop. The
/// handler box itself is freed by `WM_NCDESTROY`.
pub(crate) struct MessageWindow {
    hwnd: HWND,
}

impl MessageWindow {
    pub fn new(handler: Box<dyn MessageHandler>) -> Result<Self> {
        let atom = message_class()?;
        let hwnd = create_window(
            atom,
            windows::Win32::UI::WindowsAndMessaging::WINDOW_STYLE(0),
            Some(HWND_MESSAGE),
            handler,
        )
        .context("failed to create message-only window")?;
        Ok(Self { hwnd })
    }

    /// A hidden, never-shown top-level window. Some APIs (swap-chain
    /// creation among them) refuse message-only windows, so this one is
    /// real but invisible.
    pub fn hidden_dummy() -> Result<Self> {
        struct NullHandler;
        impl MessageHandler for NullHandler {
            fn message(
                &self,
                _hwnd: HWND,
                _msg: u32,
                _wparam: WPARAM,
                _lparam: LPARAM,
            ) -> Option<LRESULT> {
                None
            }
        }

        let atom = message_class()?;
        let hwnd = create_window(
            atom,
            windows::Win32::UI::WindowsAndMessaging::WS_OVERLAPPED,
            None,
            Box::new(NullHandler),
        )
        .context("failed to create hidden dummy window")?;
        Ok(Self { hwnd })
    }

    pub fn hwnd(&self) -> HWND {
        self.hwnd
    }
}

impl Drop for MessageWindow {
    fn drop(&mut self) {
        unsafe {
            let _ = DestroyWindow(self.hwnd);
        }
    }
}

/// Creates the per-view child window. Unlike [`MessageWindow`] the
/// returned handle is owned by the host: destruction happens through
/// `DestroyWindow` on their side, and the handler state is released by
/// the `WM_NCDESTROY` path.
pub(crate) fn create_child_window(parent: HWND, handler: Box<dyn MessageHandler>) -> Result<HWND> {
    let atom = view_class()?;
    create_window(atom, WS_CHILD, Some(parent), handler).context("failed to create view window")
}

/// Drains every pending message on the calling thread. Returns `false`
/// once `WM_QUIT` was seen.
pub(crate) fn pump_pending_messages() -> bool {
    let mut msg = MSG::default();
    while unsafe { PeekMessageW(&mut msg, None, 0, 0, PM_REMOVE) }.as_bool() {
        if msg.message == WM_QUIT {
            return false;
        }
        unsafe {
            let _ = TranslateMessage(&msg);
            DispatchMessageW(&msg);
        }
    }
    true
}

/// Blocking message loop; returns when `WM_QUIT` arrives or the thread's
/// queue breaks.
pub(crate) fn run_message_loop() {
    let mut msg = MSG::default();
    loop {
        let ret = unsafe { GetMessageW(&mut msg, None, 0, 0) };
        if ret.0 <= 0 {
            return;
        }
        unsafe {
            let _ = TranslateMessage(&msg);
            DispatchMessageW(&msg);
        }
    }
}
