//! Process-global log sink bridging the `log` facade to the host's
//! C callback.
//!
//! The host installs a handler through the `SetLogHandler` entry point;
//! until then messages go to stderr. Handler and userdata are swapped
//! together under one lock so an install is atomic with respect to
//! concurrent log calls from any thread.

use std::ffi::{c_char, c_void, CString};
use std::io::Write;
use std::sync::{Mutex, OnceLock};

use log::{LevelFilter, Metadata, Record};

/// Callback receiving one log message. The message is UTF-8,
/// NUL-terminated, without a trailing line break; the handler emits its
/// own. May be invoked from any thread, including threads inside the
/// compositor process.
pub type LogHandler = unsafe extern "C" fn(message: *const c_char, userdata: *mut c_void);

struct Sink {
    handler: Option<LogHandler>,
    userdata: *mut c_void,
}

// The userdata pointer is opaque to this crate; it is only ever handed
// back to the host's handler.
unsafe impl Send for Sink {}

static SINK: Mutex<Sink> = Mutex::new(Sink {
    handler: None,
    userdata: std::ptr::null_mut(),
});

/// Replaces the sink. `None` restores the stderr default.
pub fn set_handler(handler: Option<LogHandler>, userdata: *mut c_void) {
    let mut sink = SINK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    sink.handler = handler;
    sink.userdata = userdata;
}

fn emit(message: &str) {
    let message = message.trim();
    if message.is_empty() {
        return;
    }

    let sink = SINK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    match sink.handler {
        Some(handler) => {
            // Interior NULs would truncate the line; replace them rather
            // than drop the message.
            let owned;
            let text = if message.contains('\0') {
                owned = message.replace('\0', "?");
                owned.as_str()
            } else {
                message
            };
            if let Ok(cstring) = CString::new(text) {
                unsafe { handler(cstring.as_ptr(), sink.userdata) };
            }
        }
        None => {
            let _ = writeln!(std::io::stderr(), "{message}");
        }
    }
}

struct SinkLogger;

impl log::Log for SinkLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if record.level() <= log::Level::Info {
            emit(&format!("{}", record.args()));
        } else {
            emit(&format!("{}: {}", record.level(), record.args()));
        }
    }

    fn flush(&self) {}
}

/// Routes the `log` facade into the sink. Safe to call repeatedly; the
/// first call wins (another logger already installed by the host
/// process is left in place).
pub(crate) fn init() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        if log::set_logger(&SinkLogger).is_ok() {
            log::set_max_level(LevelFilter::Debug);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static CALLS: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn counting_handler(message: *const c_char, userdata: *mut c_void) {
        assert!(!message.is_null());
        assert!(userdata.is_null());
        let text = unsafe { std::ffi::CStr::from_ptr(message) };
        assert!(!text.to_bytes().is_empty());
        CALLS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn handler_receives_trimmed_nonempty_lines() {
        set_handler(Some(counting_handler), std::ptr::null_mut());
        emit("  hello  ");
        emit("   ");
        emit("world");
        set_handler(None, std::ptr::null_mut());
        assert_eq!(CALLS.load(Ordering::SeqCst), 2);
    }
}
