//! The agent that runs inside the compositor process.
//!
//! Loaded by the viewer through the injection primitive, its entry
//! thread installs a log tunnel back to the host, announces itself,
//! hooks the swap-chain present call, and then sits in a message loop
//! until the viewer stops sending keep-alives. The hooked present,
//! running on the compositor's own render thread, identifies the swap
//! chain of the watched monitor and copies its back buffer into the
//! viewer's shared texture.
//!
//! Everything the two threads share is a single machine word updated
//! atomically; the opened capture target lives in an [`InterfaceSlot`]
//! and is only ever released on the thread that stopped using it.

use std::ffi::{c_char, c_void, CStr};
use std::sync::atomic::{AtomicI32, AtomicIsize, AtomicPtr, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use windows::core::{Interface, HRESULT};
use windows::Win32::Foundation::{HANDLE, HWND, LPARAM, LRESULT, WPARAM};
use windows::Win32::Graphics::Direct3D::D3D_DRIVER_TYPE_NULL;
use windows::Win32::Graphics::Direct3D11::{
    D3D11CreateDeviceAndSwapChain, ID3D11Device, ID3D11Texture2D, D3D11_CREATE_DEVICE_FLAG,
    D3D11_SDK_VERSION,
};
use windows::Win32::Graphics::Dxgi::Common::{
    DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_MODE_DESC, DXGI_SAMPLE_DESC,
};
use windows::Win32::Graphics::Dxgi::{
    IDXGISwapChain, DXGI_SWAP_CHAIN_DESC, DXGI_USAGE_RENDER_TARGET_OUTPUT,
};
use windows::Win32::System::DataExchange::COPYDATASTRUCT;
use windows::Win32::System::LibraryLoader::FreeLibraryAndExitThread;
use windows::Win32::UI::WindowsAndMessaging::{
    PostMessageW, PostQuitMessage, SendMessageTimeoutW, SetTimer, SMTO_ABORTIFHUNG, WM_COPYDATA,
    WM_TIMER,
};

use crate::logging;
use crate::monitor::MonitorRect;
use crate::pacing::{CopyThrottle, Watchdog};
use crate::protocol::{
    self, COPYDATA_LOG, COPYDATA_NEWSCREEN, WM_APP_INJECTED, WM_APP_KEEPALIVE, WM_APP_NEWTEXTURE,
};

use super::com::InterfaceSlot;
use super::hook::VtableHook;
use super::win32::{run_message_loop, MessageHandler, MessageWindow};

/// Name of the exported entry the viewer resolves and starts remotely.
/// Must match the `#[no_mangle]` function below, byte for byte.
pub(crate) const AGENT_ENTRY_SYMBOL: &str = "ScreenViewDwmEntry";

const CHECK_KEEPALIVE_TIMER_ID: usize = 42;

// Control-plane state shared between the message thread and the hooked
// present running on the compositor's render thread.
static MONITOR_LEFT: AtomicI32 = AtomicI32::new(0);
static MONITOR_TOP: AtomicI32 = AtomicI32::new(0);
static MONITOR_RIGHT: AtomicI32 = AtomicI32::new(0);
static MONITOR_BOTTOM: AtomicI32 = AtomicI32::new(0);
static SHARED_TEXTURE_HANDLE: AtomicIsize = AtomicIsize::new(0);

/// Identity of the swap chain being captured; never dereferenced as an
/// owned interface, only compared.
static CAPTURED_SWAP_CHAIN: AtomicPtr<c_void> = AtomicPtr::new(std::ptr::null_mut());

/// The opened shared texture. Owned by the slot; the present thread
/// takes it out for each copy and puts it back.
static CAPTURE_TARGET: InterfaceSlot<ID3D11Texture2D> = InterfaceSlot::new();

/// Bumped whenever the capture target must be re-opened (new handle,
/// new monitor, shutdown). The present thread releases the old target
/// before opening against the current handle.
static TARGET_GENERATION: AtomicU32 = AtomicU32::new(0);
static OPENED_GENERATION: AtomicU32 = AtomicU32::new(0);

static PRESENT_HOOK: VtableHook = VtableHook::new();
static COPY_THROTTLE: Mutex<Option<CopyThrottle>> = Mutex::new(None);

fn store_monitor_rect(rect: MonitorRect) {
    MONITOR_LEFT.store(rect.left, Ordering::SeqCst);
    MONITOR_TOP.store(rect.top, Ordering::SeqCst);
    MONITOR_RIGHT.store(rect.right, Ordering::SeqCst);
    MONITOR_BOTTOM.store(rect.bottom, Ordering::SeqCst);
}

fn load_monitor_rect() -> MonitorRect {
    MonitorRect {
        left: MONITOR_LEFT.load(Ordering::SeqCst),
        top: MONITOR_TOP.load(Ordering::SeqCst),
        right: MONITOR_RIGHT.load(Ordering::SeqCst),
        bottom: MONITOR_BOTTOM.load(Ordering::SeqCst),
    }
}

fn invalidate_capture_target() {
    TARGET_GENERATION.fetch_add(1, Ordering::SeqCst);
}

/// Log sink inside the compositor: every line crosses back to the host
/// window as COPYDATA, with a bounded send so a hung host never wedges
/// the compositor.
unsafe extern "C" fn send_message_log_handler(message: *const c_char, userdata: *mut c_void) {
    let host = HWND(userdata);
    let bytes = unsafe { CStr::from_ptr(message) }.to_bytes();
    let copy = COPYDATASTRUCT {
        dwData: COPYDATA_LOG,
        cbData: bytes.len() as u32,
        lpData: bytes.as_ptr() as *mut c_void,
    };
    unsafe {
        SendMessageTimeoutW(
            host,
            WM_COPYDATA,
            WPARAM(0),
            LPARAM(&copy as *const COPYDATASTRUCT as isize),
            SMTO_ABORTIFHUNG,
            500,
            None,
        );
    }
}

struct AgentHandler {
    watchdog: std::cell::RefCell<Watchdog>,
}

impl MessageHandler for AgentHandler {
    fn message(&self, _hwnd: HWND, msg: u32, wparam: WPARAM, lparam: LPARAM) -> Option<LRESULT> {
        match msg {
            WM_COPYDATA => {
                let data = lparam.0 as *const COPYDATASTRUCT;
                if data.is_null() {
                    return Some(LRESULT(0));
                }
                let data = unsafe { &*data };
                if data.dwData == COPYDATA_NEWSCREEN {
                    let payload = unsafe {
                        std::slice::from_raw_parts(data.lpData as *const u8, data.cbData as usize)
                    };
                    if let Some(rect) = protocol::decode_screen_rect(payload) {
                        store_monitor_rect(rect);
                        // Identification runs again on the next present.
                        CAPTURED_SWAP_CHAIN.store(std::ptr::null_mut(), Ordering::SeqCst);
                    }
                }
                Some(LRESULT(1))
            }
            WM_APP_NEWTEXTURE => {
                SHARED_TEXTURE_HANDLE.store(lparam.0, Ordering::SeqCst);
                invalidate_capture_target();
                Some(LRESULT(1))
            }
            WM_APP_KEEPALIVE => {
                self.watchdog.borrow_mut().refresh(Instant::now());
                Some(LRESULT(1))
            }
            WM_TIMER if wparam.0 == CHECK_KEEPALIVE_TIMER_ID => {
                if self.watchdog.borrow().expired(Instant::now()) {
                    unsafe { PostQuitMessage(-1) };
                }
                Some(LRESULT(1))
            }
            _ => None,
        }
    }
}

fn create_agent_communicator(host: HWND) -> Option<MessageWindow> {
    let handler = AgentHandler {
        watchdog: std::cell::RefCell::new(Watchdog::new(Instant::now())),
    };
    let window = match MessageWindow::new(Box::new(handler)) {
        Ok(window) => window,
        Err(e) => {
            log::error!("failed to create the agent communicator: {e}");
            return None;
        }
    };

    unsafe {
        SetTimer(
            Some(window.hwnd()),
            CHECK_KEEPALIVE_TIMER_ID,
            1000,
            None,
        );
        let _ = PostMessageW(
            Some(host),
            WM_APP_INJECTED,
            WPARAM(0),
            LPARAM(window.hwnd().0 as isize),
        );
    }

    Some(window)
}

/// Opens the viewer's shared texture through the device behind the
/// compositor's swap chain.
fn open_capture_target(swap: &IDXGISwapChain) -> Option<ID3D11Texture2D> {
    let handle = SHARED_TEXTURE_HANDLE.load(Ordering::SeqCst);
    if handle == 0 {
        return None;
    }

    let device: ID3D11Device = match unsafe { swap.GetDevice() } {
        Ok(device) => device,
        Err(e) => {
            log::warn!("failed to retrieve device from swap chain: {e}");
            return None;
        }
    };

    let mut texture: Option<ID3D11Texture2D> = None;
    if let Err(e) =
        unsafe { device.OpenSharedResource(HANDLE(handle as *mut c_void), &mut texture) }
    {
        log::warn!("failed to open shared texture: {e}");
        return None;
    }
    texture
}

/// Copies the presented back buffer into the capture target, resolving
/// when the compositor renders multisampled.
fn copy_back_buffer(swap: &IDXGISwapChain, target: &ID3D11Texture2D) {
    let device: ID3D11Device = match unsafe { swap.GetDevice() } {
        Ok(device) => device,
        Err(e) => {
            log::warn!("failed to retrieve device from swap chain: {e}");
            return;
        }
    };
    let context = match unsafe { device.GetImmediateContext() } {
        Ok(context) => context,
        Err(e) => {
            log::warn!("failed to retrieve immediate context: {e}");
            return;
        }
    };

    let back_buffer: ID3D11Texture2D = match unsafe { swap.GetBuffer(0) } {
        Ok(buffer) => buffer,
        Err(e) => {
            log::warn!("failed to retrieve back buffer from swap chain: {e}");
            return;
        }
    };

    let desc = match unsafe { swap.GetDesc() } {
        Ok(desc) => desc,
        Err(e) => {
            log::warn!("failed to retrieve swap chain description: {e}");
            return;
        }
    };

    unsafe {
        if desc.SampleDesc.Count > 1 {
            context.ResolveSubresource(target, 0, &back_buffer, 0, DXGI_FORMAT_B8G8R8A8_UNORM);
        } else {
            context.CopyResource(target, &back_buffer);
        }
    }
}

/// Checks whether this swap chain feeds the watched monitor, and if so
/// claims it.
fn try_setup_capturing(swap_raw: *mut c_void, swap: &IDXGISwapChain) {
    let output = match unsafe { swap.GetContainingOutput() } {
        Ok(output) => output,
        // Plenty of compositor swap chains have no containing output;
        // not worth a log line each present.
        Err(_) => return,
    };

    let desc = match unsafe { output.GetDesc() } {
        Ok(desc) => desc,
        Err(e) => {
            log::warn!("failed to retrieve output description: {e}");
            return;
        }
    };

    if !desc.AttachedToDesktop.as_bool() {
        return;
    }

    let wanted = load_monitor_rect();
    let coords = desc.DesktopCoordinates;
    if wanted.matches(coords.left, coords.top, coords.right, coords.bottom) {
        CAPTURED_SWAP_CHAIN.store(swap_raw, Ordering::SeqCst);
        invalidate_capture_target();
    }
}

fn capture_this_present(swap: &IDXGISwapChain) {
    // Lazily re-open when the viewer announced a new texture (or the
    // monitor changed): release the stale target here, on the thread
    // that was using it, then open against the current handle.
    let current_generation = TARGET_GENERATION.load(Ordering::SeqCst);
    if OPENED_GENERATION.swap(current_generation, Ordering::SeqCst) != current_generation {
        CAPTURE_TARGET.store(None);
    }

    let target = match CAPTURE_TARGET.take() {
        Some(target) => target,
        None => match open_capture_target(swap) {
            Some(target) => target,
            None => return,
        },
    };

    let due = {
        let mut throttle = COPY_THROTTLE.lock().unwrap_or_else(|p| p.into_inner());
        throttle
            .get_or_insert_with(CopyThrottle::new)
            .should_copy(Instant::now())
    };
    if due {
        copy_back_buffer(swap, &target);
    }

    CAPTURE_TARGET.store(Some(target));
}

/// The replacement `Present`. Runs on the compositor's render thread
/// for every swap chain in the process; must always forward.
unsafe extern "system" fn overridden_present(
    swap_raw: *mut c_void,
    sync_interval: u32,
    flags: u32,
) -> HRESULT {
    if let Some(swap) = unsafe { IDXGISwapChain::from_raw_borrowed(&swap_raw) } {
        let captured = CAPTURED_SWAP_CHAIN.load(Ordering::SeqCst);
        if captured == swap_raw {
            capture_this_present(swap);
        } else if captured.is_null() {
            try_setup_capturing(swap_raw, swap);
        }
    }

    let original = PRESENT_HOOK.original();
    if original == 0 {
        return HRESULT(0);
    }
    let present: unsafe extern "system" fn(*mut c_void, u32, u32) -> HRESULT =
        unsafe { std::mem::transmute(original) };
    unsafe { present(swap_raw, sync_interval, flags) }
}

/// Builds a throwaway NULL-driver swap chain to learn where this
/// process's `Present` lives, then patches that vtable slot.
fn install_present_hook() -> bool {
    let dummy_window = match MessageWindow::hidden_dummy() {
        Ok(window) => window,
        Err(e) => {
            log::error!("failed to create a dummy window for the hook bootstrap: {e}");
            return false;
        }
    };

    let swap_desc = DXGI_SWAP_CHAIN_DESC {
        BufferDesc: DXGI_MODE_DESC {
            Width: 2,
            Height: 2,
            Format: DXGI_FORMAT_B8G8R8A8_UNORM,
            ..Default::default()
        },
        SampleDesc: DXGI_SAMPLE_DESC {
            Count: 1,
            Quality: 0,
        },
        BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
        BufferCount: 2,
        OutputWindow: dummy_window.hwnd(),
        Windowed: true.into(),
        ..Default::default()
    };

    let mut swap: Option<IDXGISwapChain> = None;
    let mut device: Option<ID3D11Device> = None;
    let created = unsafe {
        D3D11CreateDeviceAndSwapChain(
            None,
            D3D_DRIVER_TYPE_NULL,
            None,
            D3D11_CREATE_DEVICE_FLAG(0),
            None,
            D3D11_SDK_VERSION,
            Some(&swap_desc),
            Some(&mut swap),
            Some(&mut device),
            None,
            None,
        )
    };
    if let Err(e) = created {
        log::error!("FAILED: D3D11CreateDeviceAndSwapChain (NULL driver): {e}");
        return false;
    }
    let Some(swap) = swap else {
        log::error!("NULL-driver device creation produced no swap chain");
        return false;
    };

    // Every IDXGISwapChain in the process shares this vtable; patching
    // the slot here redirects the compositor's own presents.
    let vtable = swap.vtable();
    let slot = std::ptr::addr_of!(vtable.Present) as *mut usize;

    match unsafe { PRESENT_HOOK.install(slot, overridden_present as usize) } {
        Ok(()) => true,
        Err(e) => {
            log::error!("failed to hook Present: {e}");
            false
        }
    }
}

fn remove_present_hook() -> bool {
    unsafe { PRESENT_HOOK.remove() }.is_ok()
}

/// The remote-thread entry the viewer starts after loading this DLL
/// into the compositor. `param` is the host's communicator window.
///
/// # Safety
///
/// Must only be invoked as a thread start routine with a window handle
/// as its argument, inside a process whose graphics runtime is loaded.
#[no_mangle]
pub unsafe extern "system" fn ScreenViewDwmEntry(param: *mut c_void) -> u32 {
    let host = HWND(param);

    logging::init();
    logging::set_handler(Some(send_message_log_handler), param);

    log::info!("Thread has been injected!");

    let communicator = create_agent_communicator(host);
    if communicator.is_none() {
        return u32::MAX;
    }

    if !install_present_hook() {
        return u32::MAX;
    }

    run_message_loop();

    log::info!("Bye Bye DWM!");

    drop(communicator);

    if remove_present_hook() {
        // Free the opened shared texture; the hook is gone, so nobody
        // can race this release.
        CAPTURE_TARGET.store(None);
        CAPTURED_SWAP_CHAIN.store(std::ptr::null_mut(), Ordering::SeqCst);
        SHARED_TEXTURE_HANDLE.store(0, Ordering::SeqCst);

        if let Ok(module) = super::win32::own_module_handle() {
            unsafe { FreeLibraryAndExitThread(module, 0) };
        }
        return 0;
    }

    // Unhooking failed: unloading now would leave the compositor
    // calling into freed code. Stay resident instead.
    log::error!("Unhook failed, guess we're staying...");
    loop {
        std::thread::sleep(std::time::Duration::from_secs(3600));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_rect_atomics_round_trip() {
        let rect = MonitorRect {
            left: 10,
            top: 20,
            right: 1930,
            bottom: 1100,
        };
        store_monitor_rect(rect);
        assert_eq!(load_monitor_rect(), rect);
        store_monitor_rect(MonitorRect::from_position_and_size(0, 0, 0, 0));
    }

    #[test]
    fn new_texture_forces_a_reopen() {
        let before = TARGET_GENERATION.load(Ordering::SeqCst);
        invalidate_capture_target();
        let after = TARGET_GENERATION.load(Ordering::SeqCst);
        assert_eq!(after, before + 1);
        // The present path reopens when the generations disagree.
        assert_ne!(OPENED_GENERATION.load(Ordering::SeqCst), after);
    }
}
