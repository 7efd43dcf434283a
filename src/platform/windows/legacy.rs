//! The legacy capture source for Windows 7, viewer side.
//!
//! The compositor there keeps desktop pixels to itself, so the viewer
//! allocates a cross-process shared texture and a cooperative agent
//! inside the compositor copies each presented frame into it. This
//! module owns the viewer half: the shared texture, the communicator
//! window that injects and keeps the agent alive, and the local cursor
//! poll (the agent has no cursor to offer).

use std::cell::RefCell;
use std::ffi::c_void;
use std::rc::Rc;
use std::time::Instant;

use anyhow::Context;
use windows::core::Interface;
use windows::Win32::Foundation::{HWND, LPARAM, LRESULT, POINT, WPARAM};
use windows::Win32::Graphics::Direct3D11::{
    ID3D11Device, ID3D11DeviceContext, ID3D11Texture2D, D3D11_BIND_RENDER_TARGET,
    D3D11_BIND_SHADER_RESOURCE, D3D11_CPU_ACCESS_FLAG, D3D11_MAPPED_SUBRESOURCE,
    D3D11_MAP_WRITE_DISCARD, D3D11_RESOURCE_MISC_SHARED, D3D11_USAGE_DEFAULT,
};
use windows::Win32::Graphics::Dxgi::IDXGIResource;
use windows::Win32::Graphics::Gdi::{
    CreateCompatibleDC, DeleteDC, DeleteObject, GetDIBits, BITMAPINFO, BITMAPINFOHEADER,
    BI_RGB, DIB_RGB_COLORS, HDC, RGBQUAD,
};
use windows::Win32::System::DataExchange::COPYDATASTRUCT;
use windows::Win32::UI::WindowsAndMessaging::{
    GetCursorInfo, GetCursorPos, GetIconInfo, PostMessageW, SendMessageTimeoutW, SetTimer,
    CURSORINFO, CURSOR_SHOWING, HICON, ICONINFO, SMTO_ABORTIFHUNG, WM_COPYDATA, WM_TIMER,
};

use crate::cursor::{
    self, CursorState, CursorSurface, CURSOR_TEXTURE_SIZE,
};
use crate::error::{ViewError, ViewResult};
use crate::monitor::MonitorRect;
use crate::protocol::{
    self, LinkState, TickAction, COPYDATA_LOG, COPYDATA_NEWSCREEN, WM_APP_INJECTED,
    WM_APP_KEEPALIVE, WM_APP_NEWTEXTURE,
};

use super::agent::AGENT_ENTRY_SYMBOL;
use super::injection::{self, RemoteArg};
use super::source::{create_bgra_texture, create_cursor_texture, CaptureSource};
use super::utf16z_to_string;
use super::win32::{own_module_path, MessageHandler, MessageWindow};

const COMPOSITOR_IMAGE_NAME: &str = "dwm.exe";
const KEEPALIVE_TIMER_ID: usize = 42;
const KEEPALIVE_TIMER_MS: u32 = 1000;
const SEND_TIMEOUT_MS: u32 = 500;

/// Everything the communicator window needs across messages. Lives in
/// an `Rc` shared between the window handler and the source; all
/// access happens on the render thread.
struct CommunicatorState {
    agent_window: Option<HWND>,
    link: LinkState,
    /// Shared-texture handle to (re)announce to the agent.
    texture_for_agent: Option<isize>,
    /// Monitor rectangle to (re)announce to the agent.
    screen_for_agent: Option<MonitorRect>,
    /// When the previous keep-alive tick ran. A long gap means this
    /// thread was suspended and the agent's watchdog has likely fired.
    last_tick: Instant,
    dll_path: Vec<u16>,
    dll_base_name: String,
}

struct CommunicatorHandler {
    state: Rc<RefCell<CommunicatorState>>,
}

impl CommunicatorHandler {
    fn on_keepalive_tick(&self, hwnd: HWND) {
        let now = Instant::now();
        {
            let mut state = self.state.borrow_mut();
            if now.duration_since(state.last_tick) > crate::pacing::Watchdog::KEEPALIVE_TIMEOUT {
                state.link = state.link.on_silence();
            }
            state.last_tick = now;
        }

        let pid = injection::process_id_for_name(COMPOSITOR_IMAGE_NAME);
        let compositor_running = pid != 0;
        let base_name = self.state.borrow().dll_base_name.clone();
        let agent_loaded = compositor_running && injection::is_dll_loaded(pid, &base_name);

        let action = {
            let mut state = self.state.borrow_mut();
            let (next, action) = state.link.on_tick(compositor_running, agent_loaded);
            state.link = next;
            if !compositor_running {
                state.agent_window = None;
            }
            action
        };

        match action {
            TickAction::None => {}
            TickAction::Inject => {
                if crate::env_config::injection_enabled() {
                    self.inject(hwnd, pid);
                } else {
                    log::debug!("injection disabled by environment; skipping");
                }
            }
            TickAction::SendKeepalive => {
                let agent = self.state.borrow().agent_window;
                if let Some(agent) = agent {
                    let _ = unsafe {
                        PostMessageW(Some(agent), WM_APP_KEEPALIVE, WPARAM(0), LPARAM(0))
                    };
                }
            }
        }
    }

    fn inject(&self, hwnd: HWND, pid: u32) {
        log::info!("Now injecting into DWM");

        let (path, base_name) = {
            let mut state = self.state.borrow_mut();
            state.agent_window = None;
            (state.dll_path.clone(), state.dll_base_name.clone())
        };

        let Some(load_library_offset) = injection::get_function_offset("kernel32.dll", "LoadLibraryW")
        else {
            log::error!("FATAL: LoadLibraryW not found, can't inject");
            return;
        };
        let Some(entry_offset) = injection::get_function_offset(&base_name, AGENT_ENTRY_SYMBOL)
        else {
            log::error!("FATAL: Entry point not found, can't inject");
            return;
        };

        // LoadLibraryW wants the DLL path inside the compositor's
        // address space, NUL-terminated.
        let mut path_bytes = Vec::with_capacity((path.len() + 1) * 2);
        for unit in path.iter().chain(std::iter::once(&0u16)) {
            path_bytes.extend_from_slice(&unit.to_le_bytes());
        }

        if let Err(e) = injection::call_remote_func(
            pid,
            "kernel32.dll",
            load_library_offset,
            RemoteArg::Buffer(&path_bytes),
            false,
        ) {
            log::error!("FATAL: LoadLibraryW could not be executed: {e}");
            return;
        }

        // Fire-and-forget: the agent announces itself with INJECTED.
        if let Err(e) = injection::call_remote_func(
            pid,
            &base_name,
            entry_offset,
            RemoteArg::Raw(hwnd.0 as usize),
            false,
        ) {
            log::error!("failed to start the agent entry point: {e}");
        }
    }

    fn on_injected(&self, hwnd: HWND, agent: HWND) {
        let (texture, screen) = {
            let mut state = self.state.borrow_mut();
            state.agent_window = Some(agent);
            state.link = state.link.on_injected();
            (state.texture_for_agent, state.screen_for_agent)
        };

        // A (re)connected agent starts from nothing; resend the latest
        // capture target and screen so it is fully synchronized.
        if let Some(handle) = texture {
            post_texture(agent, handle);
        }
        if let Some(rect) = screen {
            send_screen(hwnd, agent, rect);
        }
    }

    fn on_copydata(&self, data: &COPYDATASTRUCT) -> bool {
        if data.dwData != COPYDATA_LOG {
            return false;
        }

        let bytes =
            unsafe { std::slice::from_raw_parts(data.lpData as *const u8, data.cbData as usize) };
        // Not necessarily NUL-terminated; copy before use.
        let line = String::from_utf8_lossy(bytes);
        log::info!("FROM DWM: {line}");
        true
    }
}

impl MessageHandler for CommunicatorHandler {
    fn message(&self, hwnd: HWND, msg: u32, wparam: WPARAM, lparam: LPARAM) -> Option<LRESULT> {
        match msg {
            WM_COPYDATA => {
                let data = lparam.0 as *const COPYDATASTRUCT;
                if data.is_null() {
                    return Some(LRESULT(0));
                }
                let handled = self.on_copydata(unsafe { &*data });
                Some(LRESULT(handled as isize))
            }
            WM_APP_INJECTED => {
                self.on_injected(hwnd, HWND(lparam.0 as *mut c_void));
                Some(LRESULT(1))
            }
            WM_TIMER if wparam.0 == KEEPALIVE_TIMER_ID => {
                self.on_keepalive_tick(hwnd);
                Some(LRESULT(1))
            }
            _ => None,
        }
    }
}

fn post_texture(agent: HWND, handle: isize) {
    let _ = unsafe { PostMessageW(Some(agent), WM_APP_NEWTEXTURE, WPARAM(0), LPARAM(handle)) };
}

fn send_screen(own: HWND, agent: HWND, rect: MonitorRect) {
    let payload = protocol::encode_screen_rect(rect);
    let copy = COPYDATASTRUCT {
        dwData: COPYDATA_NEWSCREEN,
        cbData: payload.len() as u32,
        lpData: payload.as_ptr() as *mut c_void,
    };
    // Bounded send so a wedged agent cannot stall the render thread.
    unsafe {
        SendMessageTimeoutW(
            agent,
            WM_COPYDATA,
            WPARAM(own.0 as usize),
            LPARAM(&copy as *const COPYDATASTRUCT as isize),
            SMTO_ABORTIFHUNG,
            SEND_TIMEOUT_MS,
            None,
        );
    }
}

/// The viewer's mailbox to the agent: a message-only window plus the
/// 1-second keep-alive/injection timer.
struct DwmCommunicator {
    window: MessageWindow,
    state: Rc<RefCell<CommunicatorState>>,
}

impl DwmCommunicator {
    fn new() -> ViewResult<Self> {
        let path = own_module_path().map_err(ViewError::Platform)?;
        let path_string = utf16z_to_string(&path);
        let base_name = path_string
            .rsplit('\\')
            .next()
            .unwrap_or(path_string.as_str())
            .to_string();

        let state = Rc::new(RefCell::new(CommunicatorState {
            agent_window: None,
            link: LinkState::Disconnected,
            texture_for_agent: None,
            screen_for_agent: None,
            last_tick: Instant::now(),
            dll_path: path,
            dll_base_name: base_name,
        }));

        let window = MessageWindow::new(Box::new(CommunicatorHandler {
            state: state.clone(),
        }))
        .map_err(ViewError::Platform)?;

        unsafe {
            SetTimer(
                Some(window.hwnd()),
                KEEPALIVE_TIMER_ID,
                KEEPALIVE_TIMER_MS,
                None,
            )
        };

        Ok(Self { window, state })
    }

    fn set_texture(&self, handle: isize) {
        let agent = {
            let mut state = self.state.borrow_mut();
            state.texture_for_agent = Some(handle);
            state.agent_window
        };
        if let Some(agent) = agent {
            post_texture(agent, handle);
        }
    }

    fn set_screen(&self, rect: MonitorRect) {
        let agent = {
            let mut state = self.state.borrow_mut();
            state.screen_for_agent = Some(rect);
            state.agent_window
        };
        if let Some(agent) = agent {
            send_screen(self.window.hwnd(), agent, rect);
        }
    }
}

fn cursor_changed(last_seen: Option<isize>, current: isize) -> bool {
    last_seen != Some(current)
}

pub(crate) struct DwmSource {
    rect: MonitorRect,
    last_cursor_seen: Option<isize>,
    hotspot: (i32, i32),
    communicator: Option<DwmCommunicator>,
}

impl DwmSource {
    pub(crate) fn new() -> Self {
        Self {
            rect: MonitorRect::from_position_and_size(0, 0, 0, 0),
            last_cursor_seen: None,
            hotspot: (0, 0),
            communicator: None,
        }
    }

    fn communicator(&mut self) -> Option<&DwmCommunicator> {
        if self.communicator.is_none() {
            match DwmCommunicator::new() {
                Ok(communicator) => self.communicator = Some(communicator),
                Err(e) => log::error!("failed to create the DWM communicator: {e}"),
            }
        }
        self.communicator.as_ref()
    }
}

impl CaptureSource for DwmSource {
    fn reinit(&mut self, _device: &ID3D11Device, rect: MonitorRect) {
        log::info!("(Re)initializing dwm source: {rect}");

        self.rect = rect;
        self.last_cursor_seen = None;
        self.hotspot = (0, 0);

        if let Some(communicator) = self.communicator() {
            communicator.set_screen(rect);
        }
    }

    fn create_desktop_texture(&mut self, device: &ID3D11Device) -> ViewResult<ID3D11Texture2D> {
        if !self.rect.is_valid() {
            return Err(ViewError::NotBound);
        }

        // The agent opens this texture from inside the compositor and
        // renders into it, so it must be shared and render-target
        // bindable, not just a shader resource.
        let texture = create_bgra_texture(
            device,
            self.rect.width() as u32,
            self.rect.height() as u32,
            D3D11_USAGE_DEFAULT,
            D3D11_BIND_RENDER_TARGET | D3D11_BIND_SHADER_RESOURCE,
            D3D11_CPU_ACCESS_FLAG(0),
            D3D11_RESOURCE_MISC_SHARED,
        )?;

        let resource: IDXGIResource = texture
            .cast()
            .context("failed to query IDXGIResource from the shared texture")
            .map_err(ViewError::Platform)?;
        let shared = unsafe { resource.GetSharedHandle() }
            .context("GetSharedHandle failed")
            .map_err(ViewError::Platform)?;

        if let Some(communicator) = self.communicator() {
            communicator.set_texture(shared.0 as isize);
        }

        Ok(texture)
    }

    fn create_cursor_texture(&mut self, device: &ID3D11Device) -> ViewResult<ID3D11Texture2D> {
        create_cursor_texture(device)
    }

    fn acquire_frame(&mut self) {
        // The agent writes the shared texture on its own clock.
    }

    fn update_desktop(&mut self, _context: &ID3D11DeviceContext, _desktop: &ID3D11Texture2D) {
        // Nothing to copy; the desktop texture IS the capture target.
    }

    fn update_cursor(
        &mut self,
        context: &ID3D11DeviceContext,
        cursor: &ID3D11Texture2D,
        state: &mut CursorState,
    ) {
        let mut position = POINT::default();
        let mut info = CURSORINFO {
            cbSize: std::mem::size_of::<CURSORINFO>() as u32,
            ..Default::default()
        };
        if unsafe { GetCursorPos(&mut position) }.is_err()
            || unsafe { GetCursorInfo(&mut info) }.is_err()
        {
            return;
        }

        let handle = info.hCursor.0 as isize;
        if cursor_changed(self.last_cursor_seen, handle) {
            self.last_cursor_seen = Some(handle);
            if let Some(hotspot) = update_cursor_shape(context, cursor, HICON(info.hCursor.0)) {
                self.hotspot = hotspot;
            }
        }

        state.visible = info.flags == CURSOR_SHOWING;
        state.x = position.x - self.rect.left - self.hotspot.0;
        state.y = position.y - self.rect.top - self.hotspot.1;
    }

    fn release_frame(&mut self) {}
}

struct DcGuard(HDC);

impl Drop for DcGuard {
    fn drop(&mut self) {
        unsafe {
            let _ = DeleteDC(self.0);
        }
    }
}

struct IconInfoGuard(ICONINFO);

impl Drop for IconInfoGuard {
    fn drop(&mut self) {
        unsafe {
            if !self.0.hbmColor.is_invalid() {
                let _ = DeleteObject(self.0.hbmColor.into());
            }
            if !self.0.hbmMask.is_invalid() {
                let _ = DeleteObject(self.0.hbmMask.into());
            }
        }
    }
}

/// `BITMAPINFO` with room for the two palette entries a monochrome
/// bitmap carries.
#[repr(C)]
struct BitmapInfoMono {
    header: BITMAPINFOHEADER,
    colors: [RGBQUAD; 2],
}

/// Re-decodes the cursor's icon bitmaps into the cursor texture and
/// returns the hotspot. Runs only when the cursor handle changes.
fn update_cursor_shape(
    context: &ID3D11DeviceContext,
    texture: &ID3D11Texture2D,
    cursor: HICON,
) -> Option<(i32, i32)> {
    let mut info = ICONINFO::default();
    if unsafe { GetIconInfo(cursor, &mut info) }.is_err() {
        return None;
    }
    let info = IconInfoGuard(info);
    let hotspot = (info.0.xHotspot as i32, info.0.yHotspot as i32);

    let hdc = unsafe { CreateCompatibleDC(None) };
    if hdc.is_invalid() {
        return Some(hotspot);
    }
    let hdc = DcGuard(hdc);

    let mut bmi = BitmapInfoMono {
        header: BITMAPINFOHEADER {
            biSize: std::mem::size_of::<BITMAPINFOHEADER>() as u32,
            ..Default::default()
        },
        colors: [RGBQUAD::default(); 2],
    };
    let bmi_ptr = &mut bmi as *mut BitmapInfoMono as *mut BITMAPINFO;

    if info.0.hbmColor.is_invalid() {
        // Monochrome: the mask bitmap stacks the AND plane on top of
        // the XOR plane.
        if unsafe { GetDIBits(hdc.0, info.0.hbmMask, 0, 0, None, bmi_ptr, DIB_RGB_COLORS) } == 0 {
            return Some(hotspot);
        }

        let width = bmi.header.biWidth as u32;
        let total_height = bmi.header.biHeight.unsigned_abs();
        let plane_pitch = cursor::mono_plane_pitch(width);
        bmi.header.biHeight = -(bmi.header.biHeight.abs()); // top-down rows

        let mut planes = vec![0u8; plane_pitch * total_height as usize];
        if unsafe {
            GetDIBits(
                hdc.0,
                info.0.hbmMask,
                0,
                total_height,
                Some(planes.as_mut_ptr() as *mut c_void),
                bmi_ptr,
                DIB_RGB_COLORS,
            )
        } == 0
        {
            return Some(hotspot);
        }

        with_mapped_cursor(context, texture, |surface| {
            cursor::write_monochrome_shape(surface, &planes, plane_pitch, width, total_height);
        });
    } else {
        if unsafe { GetDIBits(hdc.0, info.0.hbmColor, 0, 1, None, bmi_ptr, DIB_RGB_COLORS) } == 0 {
            return Some(hotspot);
        }

        let width = bmi.header.biWidth as u32;
        let height = bmi.header.biHeight.unsigned_abs();
        bmi.header.biBitCount = 32;
        bmi.header.biCompression = BI_RGB.0;
        bmi.header.biHeight = -(bmi.header.biHeight.abs()); // top-down rows

        let mut color = vec![0u8; width as usize * height as usize * 4];
        if unsafe {
            GetDIBits(
                hdc.0,
                info.0.hbmColor,
                0,
                height,
                Some(color.as_mut_ptr() as *mut c_void),
                bmi_ptr,
                DIB_RGB_COLORS,
            )
        } == 0
        {
            log::warn!("Failed: GetDIBits (cursor color plane)");
            return Some(hotspot);
        }

        let mut mask = vec![0u8; width as usize * height as usize * 4];
        let mask_ok = unsafe {
            GetDIBits(
                hdc.0,
                info.0.hbmMask,
                0,
                height,
                Some(mask.as_mut_ptr() as *mut c_void),
                bmi_ptr,
                DIB_RGB_COLORS,
            )
        } != 0;

        with_mapped_cursor(context, texture, |surface| {
            cursor::write_color_with_mask(
                surface,
                &color,
                mask_ok.then_some(mask.as_slice()),
                width,
                height,
            );
        });
    }

    Some(hotspot)
}

fn with_mapped_cursor(
    context: &ID3D11DeviceContext,
    texture: &ID3D11Texture2D,
    write: impl FnOnce(&mut CursorSurface<'_>),
) {
    let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
    if let Err(e) =
        unsafe { context.Map(texture, 0, D3D11_MAP_WRITE_DISCARD, 0, Some(&mut mapped)) }
    {
        log::warn!("Failed: Map cursor texture: {e}");
        return;
    }

    let pixels = unsafe {
        std::slice::from_raw_parts_mut(
            mapped.pData as *mut u8,
            mapped.RowPitch as usize * CURSOR_TEXTURE_SIZE as usize,
        )
    };
    let mut surface = CursorSurface::new(pixels, mapped.RowPitch as usize);
    surface.clear();
    write(&mut surface);

    unsafe { context.Unmap(texture, 0) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_is_redecoded_only_when_the_handle_changes() {
        assert!(cursor_changed(None, 0x10));
        assert!(cursor_changed(Some(0x10), 0x20));
        assert!(!cursor_changed(Some(0x20), 0x20));
    }

    #[test]
    fn base_name_extraction_takes_the_last_path_component() {
        let path = "C:\\Program Files\\Host\\screen_view.dll";
        let base = path.rsplit('\\').next().unwrap();
        assert_eq!(base, "screen_view.dll");
    }
}
