//! The exported C surface: three cdecl entry points mirroring the
//! header the host links against.
//!
//! Failures never travel through return codes; everything lands in the
//! log sink, and `CreateView` alone may return null.

use std::ffi::{c_int, c_void};

use crate::logging::{self, LogHandler};
use crate::monitor::MonitorRect;
use crate::platform;

/// Which capture strategy a given Windows generation gets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SourceSelection {
    /// Desktop duplication, available from NT 6.2 (Windows 8) on.
    Modern,
    /// Compositor injection; only NT 6.1 (Windows 7) needs it and only
    /// there does the hook target exist.
    Legacy,
}

pub(crate) fn select_source(major: u32, minor: u32) -> Option<SourceSelection> {
    if crate::env_config::force_legacy_source() {
        return Some(SourceSelection::Legacy);
    }
    if (major, minor) >= (6, 2) {
        Some(SourceSelection::Modern)
    } else if (major, minor) == (6, 1) {
        Some(SourceSelection::Legacy)
    } else {
        None
    }
}

/// Installs `handler` as the process-wide log sink. Passing null
/// restores the stderr default. The handler may be called from any
/// thread and appends its own line break.
///
/// # Safety
///
/// `handler`, if non-null, must remain callable (and `userdata` valid
/// for it) until replaced by another call.
#[no_mangle]
pub unsafe extern "C" fn SetLogHandler(handler: Option<LogHandler>, userdata: *mut c_void) {
    logging::init();
    logging::set_handler(handler, userdata);
}

/// Creates a child window of `parent` showing the live contents of the
/// monitor whose desktop rectangle is exactly `(x, y, w, h)`. Returns
/// the window handle, or null when no capture strategy exists for this
/// OS or the window could not be created. Destroying the returned
/// window (`DestroyWindow`) frees every associated resource.
///
/// # Safety
///
/// `parent` must be a valid window handle owned by the caller.
#[no_mangle]
pub unsafe extern "C" fn CreateView(
    parent: *mut c_void,
    x: c_int,
    y: c_int,
    w: c_int,
    h: c_int,
) -> *mut c_void {
    logging::init();

    let rect = MonitorRect::from_position_and_size(x, y, w, h);
    if !rect.is_valid() {
        log::warn!("CreateView called with a degenerate rectangle: {rect}");
        return std::ptr::null_mut();
    }

    platform::create_view(parent, rect)
}

/// Asynchronously rebinds the view to the monitor whose desktop
/// rectangle is exactly `(x, y, w, h)`.
///
/// # Safety
///
/// `view` must be a handle previously returned by [`CreateView`] and
/// not yet destroyed.
#[no_mangle]
pub unsafe extern "C" fn ChangeScreen(view: *mut c_void, x: c_int, y: c_int, w: c_int, h: c_int) {
    let rect = MonitorRect::from_position_and_size(x, y, w, h);
    if !rect.is_valid() {
        log::warn!("ChangeScreen called with a degenerate rectangle: {rect}");
        return;
    }

    platform::change_screen(view, rect);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_8_and_later_use_duplication() {
        assert_eq!(select_source(6, 2), Some(SourceSelection::Modern));
        assert_eq!(select_source(6, 3), Some(SourceSelection::Modern));
        assert_eq!(select_source(10, 0), Some(SourceSelection::Modern));
    }

    #[test]
    fn windows_7_uses_the_injected_agent() {
        assert_eq!(select_source(6, 1), Some(SourceSelection::Legacy));
    }

    #[test]
    fn older_systems_are_unsupported() {
        assert_eq!(select_source(6, 0), None);
        assert_eq!(select_source(5, 1), None);
    }
}
