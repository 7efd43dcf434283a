//! Remote-process plumbing for loading the agent into the compositor:
//! process/module snapshots, remote memory, remote threads.
//!
//! The whole dance happens once per agent launch. Every acquired
//! resource (snapshot, process handle, remote allocation, thread
//! handle) is scoped and released on success and failure alike.

use std::ffi::c_void;

use windows::core::PCSTR;
use windows::Win32::Foundation::{CloseHandle, ERROR_BAD_LENGTH, HANDLE};
use windows::Win32::System::Diagnostics::Debug::WriteProcessMemory;
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Module32FirstW, Module32NextW, Process32FirstW, Process32NextW,
    MODULEENTRY32W, PROCESSENTRY32W, TH32CS_SNAPMODULE, TH32CS_SNAPPROCESS,
};
use windows::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
use windows::Win32::System::Memory::{
    VirtualAllocEx, VirtualFreeEx, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};
use windows::Win32::System::Threading::{
    CreateRemoteThread, GetExitCodeThread, OpenProcess, WaitForSingleObject, INFINITE,
    PROCESS_CREATE_THREAD, PROCESS_DUP_HANDLE, PROCESS_QUERY_INFORMATION, PROCESS_VM_OPERATION,
    PROCESS_VM_READ, PROCESS_VM_WRITE,
};

use crate::error::{ViewError, ViewResult};

use super::{to_utf16z, utf16z_to_string};

struct OwnedHandle(HANDLE);

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if !self.0.is_invalid() {
            unsafe {
                let _ = CloseHandle(self.0);
            }
        }
    }
}

/// Memory allocated inside another process, freed on drop.
struct RemoteMemory<'a> {
    process: &'a OwnedHandle,
    address: *mut c_void,
}

impl<'a> RemoteMemory<'a> {
    fn allocate_and_fill(process: &'a OwnedHandle, bytes: &[u8]) -> ViewResult<Self> {
        let address = unsafe {
            VirtualAllocEx(
                process.0,
                None,
                bytes.len(),
                MEM_RESERVE | MEM_COMMIT,
                PAGE_READWRITE,
            )
        };
        if address.is_null() {
            return Err(ViewError::InjectionFailed(
                "failed to allocate remote memory".into(),
            ));
        }
        let memory = Self { process, address };

        unsafe {
            WriteProcessMemory(
                process.0,
                address,
                bytes.as_ptr() as *const c_void,
                bytes.len(),
                None,
            )
        }
        .map_err(|e| ViewError::InjectionFailed(format!("failed to fill remote memory: {e}")))?;

        Ok(memory)
    }
}

impl Drop for RemoteMemory<'_> {
    fn drop(&mut self) {
        unsafe {
            let _ = VirtualFreeEx(self.process.0, self.address, 0, MEM_RELEASE);
        }
    }
}

fn module_name_matches(entry_name: &str, wanted: &str) -> bool {
    entry_name.eq_ignore_ascii_case(wanted)
}

/// Base address of `module_base_name` inside process `pid`, or 0.
///
/// When the same DLL is loaded twice under one name, the first snapshot
/// entry wins.
fn find_remote_base_address(pid: u32, module_base_name: &str) -> usize {
    // "If the function fails with ERROR_BAD_LENGTH, retry the function
    // until it succeeds." (module snapshots race against loader activity)
    let snapshot = loop {
        match unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPMODULE, pid) } {
            Ok(handle) => break OwnedHandle(handle),
            Err(e) if e.code() == ERROR_BAD_LENGTH.to_hresult() => continue,
            Err(_) => return 0,
        }
    };

    let mut entry = MODULEENTRY32W {
        dwSize: std::mem::size_of::<MODULEENTRY32W>() as u32,
        ..Default::default()
    };
    if unsafe { Module32FirstW(snapshot.0, &mut entry) }.is_err() {
        return 0;
    }
    loop {
        if module_name_matches(&utf16z_to_string(&entry.szModule), module_base_name) {
            return entry.modBaseAddr as usize;
        }
        if unsafe { Module32NextW(snapshot.0, &mut entry) }.is_err() {
            return 0;
        }
    }
}

/// First process whose image name matches, case-insensitive, or 0.
pub(crate) fn process_id_for_name(name: &str) -> u32 {
    let snapshot = match unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) } {
        Ok(handle) => OwnedHandle(handle),
        Err(_) => return 0,
    };

    let mut entry = PROCESSENTRY32W {
        dwSize: std::mem::size_of::<PROCESSENTRY32W>() as u32,
        ..Default::default()
    };
    if unsafe { Process32FirstW(snapshot.0, &mut entry) }.is_err() {
        return 0;
    }
    loop {
        if module_name_matches(&utf16z_to_string(&entry.szExeFile), name) {
            return entry.th32ProcessID;
        }
        if unsafe { Process32NextW(snapshot.0, &mut entry) }.is_err() {
            return 0;
        }
    }
}

pub(crate) fn is_dll_loaded(pid: u32, module_base_name: &str) -> bool {
    find_remote_base_address(pid, module_base_name) != 0
}

/// Offset of `function` from its module's base, resolved in this
/// process. The same module mapped elsewhere keeps the same offset.
pub(crate) fn get_function_offset(module_base_name: &str, function: &str) -> Option<isize> {
    let wide = to_utf16z(module_base_name);
    let module =
        unsafe { GetModuleHandleW(windows::core::PCWSTR(wide.as_ptr())) }.ok()?;

    let mut name = function.as_bytes().to_vec();
    name.push(0);
    let proc = unsafe { GetProcAddress(module, PCSTR::from_raw(name.as_ptr())) }?;

    Some(proc as usize as isize - module.0 as usize as isize)
}

/// The argument handed to the remote thread: either bytes copied into
/// freshly allocated remote memory (the thread receives the remote
/// address), or a raw word passed through unchanged.
pub(crate) enum RemoteArg<'a> {
    Buffer(&'a [u8]),
    Raw(usize),
}

/// Starts a thread in process `pid` at `module base + offset`.
///
/// When `arg` is a buffer the wait is unconditionally infinite so the
/// remote allocation can be reclaimed safely afterwards. Returns the
/// thread's exit code when a wait happened.
pub(crate) fn call_remote_func(
    pid: u32,
    module_base_name: &str,
    offset: isize,
    arg: RemoteArg<'_>,
    wait: bool,
) -> ViewResult<Option<u32>> {
    let base = find_remote_base_address(pid, module_base_name);
    if base == 0 {
        return Err(ViewError::InjectionFailed(format!(
            "{module_base_name} is not loaded in process {pid}"
        )));
    }

    let process = unsafe {
        OpenProcess(
            PROCESS_DUP_HANDLE
                | PROCESS_CREATE_THREAD
                | PROCESS_QUERY_INFORMATION
                | PROCESS_VM_READ
                | PROCESS_VM_WRITE
                | PROCESS_VM_OPERATION,
            false,
            pid,
        )
    }
    .map_err(|e| ViewError::InjectionFailed(format!("failed to open process {pid}: {e}")))?;
    let process = OwnedHandle(process);

    let remote_memory;
    let (argument, wrote_memory) = match arg {
        RemoteArg::Buffer(bytes) => {
            remote_memory = Some(RemoteMemory::allocate_and_fill(&process, bytes)?);
            (
                remote_memory.as_ref().unwrap().address as usize,
                true,
            )
        }
        RemoteArg::Raw(value) => {
            remote_memory = None;
            (value, false)
        }
    };

    let entry_address = remote_entry_address(base, offset);
    // SAFETY: the address is `module base + offset` where the offset was
    // measured against our own mapping of the same module; the remote
    // mapping exposes the same function there.
    let start_routine: unsafe extern "system" fn(*mut c_void) -> u32 =
        unsafe { std::mem::transmute(entry_address) };

    let thread = unsafe {
        CreateRemoteThread(
            process.0,
            None,
            0,
            Some(start_routine),
            Some(argument as *const c_void),
            0,
            None,
        )
    }
    .map_err(|e| ViewError::InjectionFailed(format!("failed to start remote thread: {e}")))?;
    let thread = OwnedHandle(thread);

    let mut exit_code = None;
    if wait || wrote_memory {
        unsafe { WaitForSingleObject(thread.0, INFINITE) };
        let mut code = 0u32;
        if unsafe { GetExitCodeThread(thread.0, &mut code) }.is_ok() {
            exit_code = Some(code);
        }
    }

    drop(remote_memory);
    Ok(exit_code)
}

/// Where the remote thread starts: the module's remote base plus the
/// locally measured function offset.
fn remote_entry_address(base: usize, offset: isize) -> usize {
    base.wrapping_add_signed(offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_names_compare_case_insensitively() {
        assert!(module_name_matches("DWM.EXE", "dwm.exe"));
        assert!(module_name_matches("ScreenView.dll", "screenview.DLL"));
        assert!(!module_name_matches("dwm.exe", "csrss.exe"));
    }

    #[test]
    fn remote_entry_address_applies_signed_offsets() {
        assert_eq!(remote_entry_address(0x7FF0_0000, 0x1234), 0x7FF0_1234);
        assert_eq!(remote_entry_address(0x7FF0_1000, -0x1000), 0x7FF0_0000);
    }

    #[test]
    fn kernel32_exports_loadlibrary_at_a_nonzero_offset() {
        // kernel32 is mapped into every Windows process, ours included.
        let offset = get_function_offset("kernel32.dll", "LoadLibraryW");
        assert!(matches!(offset, Some(o) if o != 0));
    }
}
