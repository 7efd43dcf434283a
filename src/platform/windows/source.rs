use anyhow::Context;
use windows::Win32::Graphics::Direct3D11::{
    ID3D11Device, ID3D11DeviceContext, ID3D11Texture2D, D3D11_BIND_FLAG, D3D11_CPU_ACCESS_FLAG,
    D3D11_CPU_ACCESS_WRITE, D3D11_RESOURCE_MISC_FLAG, D3D11_SUBRESOURCE_DATA, D3D11_TEXTURE2D_DESC,
    D3D11_USAGE, D3D11_USAGE_DYNAMIC, D3D11_BIND_SHADER_RESOURCE,
};
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_SAMPLE_DESC};

use crate::cursor::{CursorState, CURSOR_TEXTURE_SIZE};
use crate::error::{ViewError, ViewResult};
use crate::monitor::MonitorRect;

/// The capture strategy behind a renderer. The render loop drives one
/// frame as `acquire_frame`, `update_desktop`, `update_cursor`,
/// `release_frame`.
///
/// Per-frame methods swallow and log their own failures -- a dropped
/// frame must never kill the loop. Texture creation reports errors so
/// the renderer can leave the corresponding quad undrawn.
pub(crate) trait CaptureSource {
    /// Rebinds the source to the monitor whose desktop rectangle is
    /// exactly `rect`. When no output matches, the source stays unbound
    /// and the failure is logged.
    fn reinit(&mut self, device: &ID3D11Device, rect: MonitorRect);

    /// Creates the desktop texture for the bound monitor (the legacy
    /// source makes it cross-process shareable).
    fn create_desktop_texture(&mut self, device: &ID3D11Device) -> ViewResult<ID3D11Texture2D>;

    /// Creates the 256x256 dynamic cursor texture.
    fn create_cursor_texture(&mut self, device: &ID3D11Device) -> ViewResult<ID3D11Texture2D>;

    fn acquire_frame(&mut self);

    fn update_desktop(&mut self, context: &ID3D11DeviceContext, desktop: &ID3D11Texture2D);

    fn update_cursor(
        &mut self,
        context: &ID3D11DeviceContext,
        cursor: &ID3D11Texture2D,
        state: &mut CursorState,
    );

    fn release_frame(&mut self);
}

/// Creates a BGRA 2D texture whose contents start out black and fully
/// transparent, so the first presented frames are defined even before
/// any capture lands.
pub(crate) fn create_bgra_texture(
    device: &ID3D11Device,
    width: u32,
    height: u32,
    usage: D3D11_USAGE,
    bind_flags: D3D11_BIND_FLAG,
    cpu_access: D3D11_CPU_ACCESS_FLAG,
    misc_flags: D3D11_RESOURCE_MISC_FLAG,
) -> ViewResult<ID3D11Texture2D> {
    let desc = D3D11_TEXTURE2D_DESC {
        Width: width,
        Height: height,
        MipLevels: 1,
        ArraySize: 1,
        Format: DXGI_FORMAT_B8G8R8A8_UNORM,
        SampleDesc: DXGI_SAMPLE_DESC {
            Count: 1,
            Quality: 0,
        },
        Usage: usage,
        BindFlags: bind_flags.0 as u32,
        CPUAccessFlags: cpu_access.0 as u32,
        MiscFlags: misc_flags.0 as u32,
    };

    let zeroes = vec![0u8; width as usize * height as usize * 4];
    let initial = D3D11_SUBRESOURCE_DATA {
        pSysMem: zeroes.as_ptr() as *const _,
        SysMemPitch: width * 4,
        SysMemSlicePitch: 0,
    };

    let mut texture: Option<ID3D11Texture2D> = None;
    unsafe { device.CreateTexture2D(&desc, Some(&initial), Some(&mut texture)) }
        .context("CreateTexture2D failed")
        .map_err(ViewError::Platform)?;
    texture
        .context("CreateTexture2D returned no texture")
        .map_err(ViewError::Platform)
}

/// The dynamic, CPU-writable cursor texture both sources share.
pub(crate) fn create_cursor_texture(device: &ID3D11Device) -> ViewResult<ID3D11Texture2D> {
    create_bgra_texture(
        device,
        CURSOR_TEXTURE_SIZE,
        CURSOR_TEXTURE_SIZE,
        D3D11_USAGE_DYNAMIC,
        D3D11_BIND_SHADER_RESOURCE,
        D3D11_CPU_ACCESS_WRITE,
        D3D11_RESOURCE_MISC_FLAG(0),
    )
}
