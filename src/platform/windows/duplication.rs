//! The modern capture source: desktop duplication.
//!
//! One duplication handle per bound monitor yields a desktop image and
//! a cursor descriptor per acquired frame. The handle dies whenever the
//! system revokes access (full-screen exclusive apps, mode switches);
//! rebinding against the same rectangle is the documented recovery.

use anyhow::Context;
use windows::core::Interface;
use windows::Win32::Graphics::Direct3D11::{
    ID3D11Device, ID3D11DeviceContext, ID3D11Texture2D, D3D11_BIND_SHADER_RESOURCE,
    D3D11_CPU_ACCESS_FLAG, D3D11_MAPPED_SUBRESOURCE, D3D11_MAP_WRITE_DISCARD,
    D3D11_RESOURCE_MISC_FLAG, D3D11_USAGE_DEFAULT,
};
use windows::Win32::Graphics::Dxgi::{
    IDXGIOutputDuplication, IDXGIResource, DXGI_ERROR_ACCESS_LOST, DXGI_ERROR_WAIT_TIMEOUT,
    DXGI_OUTDUPL_FRAME_INFO, DXGI_OUTDUPL_POINTER_SHAPE_INFO,
    DXGI_OUTDUPL_POINTER_SHAPE_TYPE_COLOR, DXGI_OUTDUPL_POINTER_SHAPE_TYPE_MASKED_COLOR,
};

use crate::cursor::{
    self, CursorState, CursorSurface, CURSOR_TEXTURE_SIZE,
};
use crate::error::{ViewError, ViewResult};
use crate::monitor::MonitorRect;

use super::output::find_output_for_rect;
use super::source::{create_bgra_texture, create_cursor_texture, CaptureSource};

const ACQUIRE_TIMEOUT_MS: u32 = 100;

pub(crate) struct DuplicationSource {
    device: Option<ID3D11Device>,
    rect: MonitorRect,
    duplication: Option<IDXGIOutputDuplication>,
    frame_acquired: bool,
    frame_info: DXGI_OUTDUPL_FRAME_INFO,
    desktop_image: Option<IDXGIResource>,
}

impl DuplicationSource {
    pub(crate) fn new() -> Self {
        Self {
            device: None,
            rect: MonitorRect::from_position_and_size(0, 0, 0, 0),
            duplication: None,
            frame_acquired: false,
            frame_info: DXGI_OUTDUPL_FRAME_INFO::default(),
            desktop_image: None,
        }
    }

    fn bind(&mut self, device: &ID3D11Device, rect: MonitorRect) -> ViewResult<()> {
        let output = find_output_for_rect(device, rect)?;
        let duplication = unsafe { output.DuplicateOutput(device) }
            .context("DuplicateOutput failed")
            .map_err(ViewError::Platform)?;
        self.duplication = Some(duplication);
        Ok(())
    }
}

impl CaptureSource for DuplicationSource {
    fn reinit(&mut self, device: &ID3D11Device, rect: MonitorRect) {
        log::info!("(Re)initializing duplication source: {rect}");

        self.duplication = None;
        self.desktop_image = None;
        self.frame_acquired = false;
        self.rect = rect;
        self.device = Some(device.clone());

        match self.bind(device, rect) {
            Ok(()) => {}
            Err(error @ ViewError::MonitorNotFound(_)) => log::warn!("WARNING: {error}"),
            Err(error) => log::warn!("failed to duplicate output for {rect}: {error}"),
        }
    }

    fn create_desktop_texture(&mut self, device: &ID3D11Device) -> ViewResult<ID3D11Texture2D> {
        let duplication = self.duplication.as_ref().ok_or(ViewError::NotBound)?;

        let mut desc = Default::default();
        unsafe { duplication.GetDesc(&mut desc) };

        create_bgra_texture(
            device,
            desc.ModeDesc.Width,
            desc.ModeDesc.Height,
            D3D11_USAGE_DEFAULT,
            D3D11_BIND_SHADER_RESOURCE,
            D3D11_CPU_ACCESS_FLAG(0),
            D3D11_RESOURCE_MISC_FLAG(0),
        )
    }

    fn create_cursor_texture(&mut self, device: &ID3D11Device) -> ViewResult<ID3D11Texture2D> {
        create_cursor_texture(device)
    }

    fn acquire_frame(&mut self) {
        let (Some(duplication), Some(device)) = (self.duplication.clone(), self.device.clone())
        else {
            return;
        };

        let mut info = DXGI_OUTDUPL_FRAME_INFO::default();
        let mut resource: Option<IDXGIResource> = None;
        let acquired =
            unsafe { duplication.AcquireNextFrame(ACQUIRE_TIMEOUT_MS, &mut info, &mut resource) };

        match acquired {
            Ok(()) => {
                self.frame_acquired = true;
                self.frame_info = info;
                self.desktop_image = resource;
            }
            // An idle monitor; nothing to log.
            Err(e) if e.code() == DXGI_ERROR_WAIT_TIMEOUT => {}
            Err(e) if e.code() == DXGI_ERROR_ACCESS_LOST => {
                log::info!(
                    "recreating the duplication interface after DXGI_ERROR_ACCESS_LOST ({e})"
                );
                let rect = self.rect;
                self.reinit(&device, rect);
            }
            Err(e) => {
                log::warn!("Failed: AcquireNextFrame: {e}");
            }
        }
    }

    fn update_desktop(&mut self, context: &ID3D11DeviceContext, desktop: &ID3D11Texture2D) {
        if !self.frame_acquired {
            return;
        }
        // LastPresentTime of zero means the frame carries only
        // cursor/metadata updates; the desktop pixels are unchanged.
        if self.frame_info.LastPresentTime == 0 {
            return;
        }
        let Some(image) = self.desktop_image.as_ref() else {
            return;
        };

        let source: ID3D11Texture2D = match image.cast() {
            Ok(texture) => texture,
            Err(e) => {
                log::warn!("acquired frame is not a 2D texture: {e}");
                return;
            }
        };
        unsafe { context.CopyResource(desktop, &source) };
    }

    fn update_cursor(
        &mut self,
        context: &ID3D11DeviceContext,
        cursor: &ID3D11Texture2D,
        state: &mut CursorState,
    ) {
        if !self.frame_acquired {
            return;
        }
        if self.frame_info.LastMouseUpdateTime == 0 {
            return;
        }

        state.visible = self.frame_info.PointerPosition.Visible.as_bool();
        if state.visible {
            state.x = self.frame_info.PointerPosition.Position.x;
            state.y = self.frame_info.PointerPosition.Position.y;
        }

        let buffer_size = self.frame_info.PointerShapeBufferSize;
        if buffer_size == 0 {
            return;
        }
        let Some(duplication) = self.duplication.as_ref() else {
            return;
        };

        let mut shape_buffer = vec![0u8; buffer_size as usize];
        let mut shape_info = DXGI_OUTDUPL_POINTER_SHAPE_INFO::default();
        let mut required = 0u32;
        if let Err(e) = unsafe {
            duplication.GetFramePointerShape(
                buffer_size,
                shape_buffer.as_mut_ptr() as *mut _,
                &mut required,
                &mut shape_info,
            )
        } {
            log::warn!("Failed: GetFramePointerShape: {e}");
            return;
        }

        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        if let Err(e) =
            unsafe { context.Map(cursor, 0, D3D11_MAP_WRITE_DISCARD, 0, Some(&mut mapped)) }
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

        let pitch = shape_info.Pitch as usize;
        match shape_info.Type {
            t if t == DXGI_OUTDUPL_POINTER_SHAPE_TYPE_COLOR.0 as u32 => {
                cursor::write_color_shape(
                    &mut surface,
                    &shape_buffer,
                    pitch,
                    shape_info.Width,
                    shape_info.Height,
                );
            }
            t if t == DXGI_OUTDUPL_POINTER_SHAPE_TYPE_MASKED_COLOR.0 as u32 => {
                cursor::write_masked_color_shape(
                    &mut surface,
                    &shape_buffer,
                    pitch,
                    shape_info.Width,
                    shape_info.Height,
                );
            }
            _ => {
                cursor::write_monochrome_shape(
                    &mut surface,
                    &shape_buffer,
                    pitch,
                    shape_info.Width,
                    shape_info.Height,
                );
            }
        }

        unsafe { context.Unmap(cursor, 0) };
    }

    fn release_frame(&mut self) {
        if self.frame_acquired {
            if let Some(duplication) = self.duplication.as_ref() {
                unsafe { duplication.ReleaseFrame().ok() };
            }
        }
        self.frame_acquired = false;
        self.desktop_image = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_without_acquire_is_a_no_op() {
        let mut source = DuplicationSource::new();
        assert!(!source.frame_acquired);
        source.release_frame();
        source.release_frame();
        assert!(!source.frame_acquired);
        assert!(source.desktop_image.is_none());
    }

    #[test]
    fn acquire_without_a_binding_does_nothing() {
        let mut source = DuplicationSource::new();
        source.acquire_frame();
        assert!(!source.frame_acquired);
    }
}
