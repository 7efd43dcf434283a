pub(crate) mod agent;
pub(crate) mod com;
pub(crate) mod duplication;
pub(crate) mod hook;
pub(crate) mod injection;
pub(crate) mod legacy;
pub(crate) mod output;
pub(crate) mod render_thread;
pub(crate) mod renderer;
pub(crate) mod source;
pub(crate) mod view;
pub(crate) mod win32;

use windows::core::s;
use windows::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
use windows::Win32::System::SystemInformation::OSVERSIONINFOW;

/// Reports the true (major, minor) Windows version.
///
/// `GetVersionEx` lies to unmanifested processes on modern systems;
/// `RtlGetVersion` does not, but only exists as an ntdll export, so it
/// is resolved at runtime.
pub(crate) fn windows_version() -> Option<(u32, u32)> {
    type RtlGetVersionFn = unsafe extern "system" fn(*mut OSVERSIONINFOW) -> i32;

    let ntdll = unsafe { GetModuleHandleW(windows::core::w!("ntdll.dll")) }.ok()?;
    let proc = unsafe { GetProcAddress(ntdll, s!("RtlGetVersion")) }?;
    let rtl_get_version: RtlGetVersionFn = unsafe { std::mem::transmute(proc) };

    let mut info = OSVERSIONINFOW {
        dwOSVersionInfoSize: std::mem::size_of::<OSVERSIONINFOW>() as u32,
        ..Default::default()
    };
    if unsafe { rtl_get_version(&mut info) } != 0 {
        return None;
    }
    Some((info.dwMajorVersion, info.dwMinorVersion))
}

/// Decodes a NUL-terminated UTF-16 buffer (fixed-size Win32 string
/// fields) into an owned `String`.
pub(crate) fn utf16z_to_string(input: &[u16]) -> String {
    let len = input.iter().position(|&ch| ch == 0).unwrap_or(input.len());
    String::from_utf16_lossy(&input[..len])
}

/// Encodes a `&str` as a NUL-terminated UTF-16 buffer for Win32 calls.
pub(crate) fn to_utf16z(input: &str) -> Vec<u16> {
    input.encode_utf16().chain(std::iter::once(0)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf16z_stops_at_the_terminator() {
        let buffer: Vec<u16> = "dwm.exe\0garbage".encode_utf16().collect();
        assert_eq!(utf16z_to_string(&buffer), "dwm.exe");
    }

    #[test]
    fn utf16z_round_trip() {
        let wide = to_utf16z("kernel32.dll");
        assert_eq!(*wide.last().unwrap(), 0);
        assert_eq!(utf16z_to_string(&wide), "kernel32.dll");
    }
}
