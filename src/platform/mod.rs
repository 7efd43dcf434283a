use std::ffi::c_void;

use crate::monitor::MonitorRect;

#[cfg(target_os = "windows")]
pub(crate) mod windows;

#[cfg(target_os = "windows")]
pub(crate) fn create_view(parent: *mut c_void, rect: MonitorRect) -> *mut c_void {
    windows::view::create_view(parent, rect)
}

#[cfg(target_os = "windows")]
pub(crate) fn change_screen(view: *mut c_void, rect: MonitorRect) {
    windows::view::change_screen(view, rect);
}

#[cfg(not(target_os = "windows"))]
pub(crate) fn create_view(_parent: *mut c_void, rect: MonitorRect) -> *mut c_void {
    log::warn!("screen views are only supported on Windows (requested {rect})");
    std::ptr::null_mut()
}

#[cfg(not(target_os = "windows"))]
pub(crate) fn change_screen(_view: *mut c_void, _rect: MonitorRect) {}
