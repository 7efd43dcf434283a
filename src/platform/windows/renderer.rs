//! The scene: a full-screen desktop quad, a cursor quad on top, one
//! vsync'd present per frame.
//!
//! Everything graphics-related is owned here and touched only from the
//! render thread. Initialization is strictly ordered and fatal on
//! failure; per-frame failures are logged and the loop keeps going.

use std::sync::OnceLock;

use anyhow::Context;
use windows::core::Interface;
use windows::Win32::Foundation::HWND;
use windows::Win32::Graphics::Direct3D::{
    D3D_DRIVER_TYPE_UNKNOWN, D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST,
};
use windows::Win32::Graphics::Direct3D11::{
    D3D11CreateDeviceAndSwapChain, ID3D11BlendState, ID3D11Buffer, ID3D11Device,
    ID3D11DeviceContext, ID3D11InputLayout, ID3D11PixelShader, ID3D11RenderTargetView,
    ID3D11SamplerState, ID3D11ShaderResourceView, ID3D11Texture2D, ID3D11VertexShader,
    D3D11_BIND_VERTEX_BUFFER, D3D11_BLEND_DESC, D3D11_BLEND_INV_SRC_ALPHA, D3D11_BLEND_OP_ADD,
    D3D11_BLEND_SRC_ALPHA, D3D11_BLEND_ZERO, D3D11_BUFFER_DESC, D3D11_COLOR_WRITE_ENABLE_ALL,
    D3D11_COMPARISON_ALWAYS, D3D11_CPU_ACCESS_WRITE, D3D11_CREATE_DEVICE_BGRA_SUPPORT,
    D3D11_FILTER_MIN_MAG_MIP_LINEAR, D3D11_FLOAT32_MAX, D3D11_INPUT_ELEMENT_DESC,
    D3D11_INPUT_PER_VERTEX_DATA, D3D11_MAPPED_SUBRESOURCE, D3D11_MAP_WRITE_DISCARD,
    D3D11_RENDER_TARGET_BLEND_DESC, D3D11_SAMPLER_DESC, D3D11_SDK_VERSION,
    D3D11_SUBRESOURCE_DATA, D3D11_TEXTURE_ADDRESS_CLAMP, D3D11_USAGE_DYNAMIC,
    D3D11_USAGE_IMMUTABLE, D3D11_VIEWPORT,
};
use windows::Win32::Graphics::Dxgi::Common::{
    DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_FORMAT_R32G32B32_FLOAT, DXGI_FORMAT_R32G32_FLOAT,
    DXGI_FORMAT_UNKNOWN, DXGI_SAMPLE_DESC,
};
use windows::Win32::Graphics::Dxgi::{
    CreateDXGIFactory1, IDXGIAdapter, IDXGIDevice1, IDXGIFactory1, IDXGISwapChain, DXGI_PRESENT,
    DXGI_SWAP_CHAIN_DESC, DXGI_SWAP_CHAIN_FLAG, DXGI_USAGE_RENDER_TARGET_OUTPUT,
};

use crate::cursor::{CursorState, CURSOR_TEXTURE_SIZE};
use crate::error::{ViewError, ViewResult};
use crate::monitor::MonitorRect;

use super::source::CaptureSource;

/// Interleaved vertex: position then texcoord, 20 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Vertex {
    pub position: [f32; 3],
    pub texcoord: [f32; 2],
}

const VERTEX_STRIDE: u32 = std::mem::size_of::<Vertex>() as u32;

const CLEAR_COLOR: [f32; 4] = [0.5, 0.5, 0.5, 1.0];

/// The full normalized-device-coordinate square, texture coordinates
/// spanning the whole desktop texture. Two triangles, clockwise.
fn desktop_quad() -> [Vertex; 6] {
    let corner = |x: f32, y: f32, u: f32, v: f32| Vertex {
        position: [x, y, 0.0],
        texcoord: [u, v],
    };
    [
        corner(-1.0, 1.0, 0.0, 0.0),
        corner(1.0, -1.0, 1.0, 1.0),
        corner(-1.0, -1.0, 0.0, 1.0),
        corner(-1.0, 1.0, 0.0, 0.0),
        corner(1.0, 1.0, 1.0, 0.0),
        corner(1.0, -1.0, 1.0, 1.0),
    ]
}

/// Maps the cursor's pixel rectangle on a `desktop_w` x `desktop_h`
/// monitor into NDC. Top-left of the monitor is (-1, +1).
pub(crate) fn cursor_quad(
    x: i32,
    y: i32,
    cursor_w: u32,
    cursor_h: u32,
    desktop_w: i32,
    desktop_h: i32,
) -> [Vertex; 6] {
    let left = -1.0 + 2.0 * x as f32 / desktop_w as f32;
    let top = 1.0 - 2.0 * y as f32 / desktop_h as f32;
    let right = left + 2.0 * cursor_w as f32 / desktop_w as f32;
    let bottom = top - 2.0 * cursor_h as f32 / desktop_h as f32;

    let corner = |x: f32, y: f32, u: f32, v: f32| Vertex {
        position: [x, y, 0.0],
        texcoord: [u, v],
    };
    [
        corner(left, top, 0.0, 0.0),
        corner(right, bottom, 1.0, 1.0),
        corner(left, bottom, 0.0, 1.0),
        corner(left, top, 0.0, 0.0),
        corner(right, top, 1.0, 0.0),
        corner(right, bottom, 1.0, 1.0),
    ]
}

// Shader bytecode: prefer the fxc output embedded by build.rs, fall
// back to runtime D3DCompile of the same source.

#[cfg(has_precompiled_vs)]
const PRECOMPILED_VS: &[u8] = include_bytes!(env!("QUAD_VS_CSO_PATH"));

#[cfg(has_precompiled_ps)]
const PRECOMPILED_PS: &[u8] = include_bytes!(env!("QUAD_PS_CSO_PATH"));

#[cfg(any(not(has_precompiled_vs), not(has_precompiled_ps)))]
fn compile_shader_runtime(entry: &[u8], target: &[u8]) -> ViewResult<Vec<u8>> {
    use windows::core::PCSTR;
    use windows::Win32::Graphics::Direct3D::Fxc::D3DCompile;

    let source = include_str!("quad.hlsl").as_bytes();
    let mut blob = None;
    let mut errors = None;

    let compiled = unsafe {
        D3DCompile(
            source.as_ptr() as *const _,
            source.len(),
            None,
            None,
            None,
            PCSTR::from_raw(entry.as_ptr()),
            PCSTR::from_raw(target.as_ptr()),
            0,
            0,
            &mut blob,
            Some(&mut errors),
        )
    };

    if let Err(e) = compiled {
        let diagnostics = errors
            .map(|b| {
                let ptr = unsafe { b.GetBufferPointer() } as *const u8;
                let len = unsafe { b.GetBufferSize() };
                let slice = unsafe { std::slice::from_raw_parts(ptr, len) };
                String::from_utf8_lossy(slice).to_string()
            })
            .unwrap_or_default();
        return Err(ViewError::Platform(
            anyhow::anyhow!("HLSL compile failed: {diagnostics}").context(e.to_string()),
        ));
    }

    let blob = blob.ok_or_else(|| {
        ViewError::Platform(anyhow::anyhow!("D3DCompile returned no bytecode blob"))
    })?;
    let ptr = unsafe { blob.GetBufferPointer() } as *const u8;
    let len = unsafe { blob.GetBufferSize() };
    Ok(unsafe { std::slice::from_raw_parts(ptr, len) }.to_vec())
}

fn vertex_shader_bytecode() -> &'static ViewResult<Vec<u8>> {
    static BYTECODE: OnceLock<ViewResult<Vec<u8>>> = OnceLock::new();
    BYTECODE.get_or_init(|| {
        #[cfg(has_precompiled_vs)]
        {
            Ok(PRECOMPILED_VS.to_vec())
        }
        #[cfg(not(has_precompiled_vs))]
        {
            compile_shader_runtime(b"vs_main\0", b"vs_4_0\0")
        }
    })
}

fn pixel_shader_bytecode() -> &'static ViewResult<Vec<u8>> {
    static BYTECODE: OnceLock<ViewResult<Vec<u8>>> = OnceLock::new();
    BYTECODE.get_or_init(|| {
        #[cfg(has_precompiled_ps)]
        {
            Ok(PRECOMPILED_PS.to_vec())
        }
        #[cfg(not(has_precompiled_ps))]
        {
            compile_shader_runtime(b"ps_main\0", b"ps_4_0\0")
        }
    })
}

fn bytecode(cached: &'static ViewResult<Vec<u8>>) -> ViewResult<&'static [u8]> {
    match cached {
        Ok(bytes) => Ok(bytes.as_slice()),
        Err(e) => Err(ViewError::Platform(anyhow::anyhow!(
            "shader compilation failed: {e}"
        ))),
    }
}

pub(crate) struct Renderer {
    hwnd: HWND,
    device: ID3D11Device,
    context: ID3D11DeviceContext,
    swap: IDXGISwapChain,
    render_target: Option<ID3D11RenderTargetView>,

    _vshader: ID3D11VertexShader,
    _pshader: ID3D11PixelShader,
    _input_layout: ID3D11InputLayout,
    _sampler: ID3D11SamplerState,
    _blend: ID3D11BlendState,

    desktop_texture: Option<ID3D11Texture2D>,
    desktop_srv: Option<ID3D11ShaderResourceView>,
    desktop_vbuffer: Option<ID3D11Buffer>,
    cursor_texture: Option<ID3D11Texture2D>,
    cursor_srv: Option<ID3D11ShaderResourceView>,
    cursor_vbuffer: Option<ID3D11Buffer>,

    cursor: CursorState,
    desktop_width: i32,
    desktop_height: i32,

    source: Box<dyn CaptureSource>,
}

impl Renderer {
    pub(crate) fn new(
        hwnd: HWND,
        rect: MonitorRect,
        source: Box<dyn CaptureSource>,
    ) -> ViewResult<Self> {
        let (device, context, swap) = create_device_and_swap_chain(hwnd)?;

        let vs_bytes = bytecode(vertex_shader_bytecode())?;
        let ps_bytes = bytecode(pixel_shader_bytecode())?;

        let mut vshader: Option<ID3D11VertexShader> = None;
        unsafe { device.CreateVertexShader(vs_bytes, None, Some(&mut vshader)) }
            .context("CreateVertexShader failed")
            .map_err(ViewError::Platform)?;
        let vshader = vshader
            .context("CreateVertexShader returned nothing")
            .map_err(ViewError::Platform)?;

        let mut pshader: Option<ID3D11PixelShader> = None;
        unsafe { device.CreatePixelShader(ps_bytes, None, Some(&mut pshader)) }
            .context("CreatePixelShader failed")
            .map_err(ViewError::Platform)?;
        let pshader = pshader
            .context("CreatePixelShader returned nothing")
            .map_err(ViewError::Platform)?;

        unsafe {
            context.VSSetShader(&vshader, None);
            context.PSSetShader(&pshader, None);
        }

        let input_layout = create_input_layout(&device, vs_bytes)?;
        unsafe { context.IASetInputLayout(&input_layout) };

        let sampler = create_sampler(&device)?;
        unsafe { context.PSSetSamplers(0, Some(&[Some(sampler.clone())])) };

        let blend = create_blend_state(&device)?;
        unsafe { context.OMSetBlendState(&blend, None, 0xFFFF_FFFF) };

        let mut renderer = Self {
            hwnd,
            device,
            context,
            swap,
            render_target: None,
            _vshader: vshader,
            _pshader: pshader,
            _input_layout: input_layout,
            _sampler: sampler,
            _blend: blend,
            desktop_texture: None,
            desktop_srv: None,
            desktop_vbuffer: None,
            cursor_texture: None,
            cursor_srv: None,
            cursor_vbuffer: None,
            cursor: CursorState {
                x: 0,
                y: 0,
                visible: true,
            },
            desktop_width: rect.width(),
            desktop_height: rect.height(),
            source,
        };

        let (client_w, client_h) = client_size(hwnd);
        renderer.resize(client_w, client_h);
        renderer.reset(rect);

        Ok(renderer)
    }

    /// Rebuilds the swap-chain buffers and render target for a new
    /// client size. The device survives; only views are recreated.
    pub(crate) fn resize(&mut self, width: u32, height: u32) {
        unsafe { self.context.OMSetRenderTargets(None, None) };
        self.render_target = None;

        if let Err(e) = unsafe {
            self.swap
                .ResizeBuffers(0, width, height, DXGI_FORMAT_UNKNOWN, DXGI_SWAP_CHAIN_FLAG(0))
        } {
            log::warn!("Failed: ResizeBuffers({width}x{height}): {e}");
        }

        let back_buffer: ID3D11Texture2D = match unsafe { self.swap.GetBuffer(0) } {
            Ok(buffer) => buffer,
            Err(e) => {
                log::warn!("Failed: IDXGISwapChain::GetBuffer: {e}");
                return;
            }
        };

        let mut rtv: Option<ID3D11RenderTargetView> = None;
        if let Err(e) = unsafe {
            self.device
                .CreateRenderTargetView(&back_buffer, None, Some(&mut rtv))
        } {
            log::warn!("Failed: CreateRenderTargetView: {e}");
            return;
        }
        self.render_target = rtv;

        unsafe {
            self.context
                .OMSetRenderTargets(Some(&[self.render_target.clone()]), None);

            let viewport = D3D11_VIEWPORT {
                TopLeftX: 0.0,
                TopLeftY: 0.0,
                Width: width as f32,
                Height: height as f32,
                MinDepth: 0.0,
                MaxDepth: 0.0,
            };
            self.context.RSSetViewports(Some(&[viewport]));
        }
    }

    /// Rebinds the source to a monitor and rebuilds every
    /// monitor-dependent resource.
    pub(crate) fn reset(&mut self, rect: MonitorRect) {
        log::info!("Resetting renderer to screen {rect}");

        self.desktop_width = rect.width();
        self.desktop_height = rect.height();

        self.source.reinit(&self.device, rect);

        self.desktop_texture = None;
        self.desktop_srv = None;
        self.desktop_vbuffer = None;
        self.cursor_texture = None;
        self.cursor_srv = None;
        self.cursor_vbuffer = None;

        match self.source.create_desktop_texture(&self.device) {
            Ok(texture) => match self.create_srv(&texture) {
                Ok(srv) => {
                    self.desktop_texture = Some(texture);
                    self.desktop_srv = Some(srv);
                    self.desktop_vbuffer = self.create_desktop_vbuffer();
                }
                Err(e) => log::warn!("Failed: CreateShaderResourceView (desktop): {e}"),
            },
            Err(ViewError::NotBound) => {
                // No output matched; the view stays grey until a rebind.
            }
            Err(e) => log::warn!("failed to create desktop texture: {e}"),
        }

        match self.source.create_cursor_texture(&self.device) {
            Ok(texture) => match self.create_srv(&texture) {
                Ok(srv) => {
                    self.cursor_texture = Some(texture);
                    self.cursor_srv = Some(srv);
                    self.cursor_vbuffer = self.create_cursor_vbuffer();
                }
                Err(e) => log::warn!("Failed: CreateShaderResourceView (cursor): {e}"),
            },
            Err(e) => log::warn!("failed to create cursor texture: {e}"),
        }
    }

    /// One frame: pull from the source, refresh the cursor quad, draw
    /// both quads, present at vsync.
    pub(crate) fn render(&mut self) {
        let Some(render_target) = self.render_target.clone() else {
            return;
        };

        self.source.acquire_frame();

        if let Some(desktop) = self.desktop_texture.as_ref() {
            self.source.update_desktop(&self.context, desktop);
        }
        if let Some(cursor) = self.cursor_texture.as_ref() {
            self.source
                .update_cursor(&self.context, cursor, &mut self.cursor);
        }

        self.update_cursor_vbuffer();

        self.source.release_frame();

        unsafe {
            self.context
                .ClearRenderTargetView(&render_target, &CLEAR_COLOR);
        }

        if let (Some(vbuffer), Some(srv)) = (self.desktop_vbuffer.clone(), self.desktop_srv.clone())
        {
            self.draw_quad(&vbuffer, &srv);
        }

        if self.cursor.visible {
            if let (Some(vbuffer), Some(srv)) =
                (self.cursor_vbuffer.clone(), self.cursor_srv.clone())
            {
                self.draw_quad(&vbuffer, &srv);
            }
        }

        // Blocks for vsync. Occlusion statuses are fine; real failures
        // have nowhere to go but the log.
        let presented = unsafe { self.swap.Present(1, DXGI_PRESENT(0)) };
        if presented.is_err() {
            log::debug!("Present returned {presented:?}");
        }
    }

    fn draw_quad(&self, vbuffer: &ID3D11Buffer, srv: &ID3D11ShaderResourceView) {
        let buffer = Some(vbuffer.clone());
        let offset = 0u32;
        unsafe {
            self.context.IASetVertexBuffers(
                0,
                1,
                Some(&buffer as *const _),
                Some(&VERTEX_STRIDE as *const u32),
                Some(&offset as *const u32),
            );
            self.context
                .IASetPrimitiveTopology(D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST);
            self.context
                .PSSetShaderResources(0, Some(&[Some(srv.clone())]));
            self.context.Draw(6, 0);
        }
    }

    fn create_srv(&self, texture: &ID3D11Texture2D) -> ViewResult<ID3D11ShaderResourceView> {
        let mut srv: Option<ID3D11ShaderResourceView> = None;
        unsafe {
            self.device
                .CreateShaderResourceView(texture, None, Some(&mut srv))
        }
        .context("CreateShaderResourceView failed")
        .map_err(ViewError::Platform)?;
        srv.context("CreateShaderResourceView returned nothing")
            .map_err(ViewError::Platform)
    }

    fn create_desktop_vbuffer(&self) -> Option<ID3D11Buffer> {
        let vertices = desktop_quad();
        let desc = D3D11_BUFFER_DESC {
            ByteWidth: std::mem::size_of_val(&vertices) as u32,
            Usage: D3D11_USAGE_IMMUTABLE,
            BindFlags: D3D11_BIND_VERTEX_BUFFER.0 as u32,
            ..Default::default()
        };
        let initial = D3D11_SUBRESOURCE_DATA {
            pSysMem: vertices.as_ptr() as *const _,
            ..Default::default()
        };

        let mut buffer: Option<ID3D11Buffer> = None;
        if let Err(e) = unsafe {
            self.device
                .CreateBuffer(&desc, Some(&initial), Some(&mut buffer))
        } {
            log::warn!("Failed: CreateBuffer (desktop quad): {e}");
            return None;
        }
        buffer
    }

    fn create_cursor_vbuffer(&self) -> Option<ID3D11Buffer> {
        let vertices = [Vertex {
            position: [0.0; 3],
            texcoord: [0.0; 2],
        }; 6];
        let desc = D3D11_BUFFER_DESC {
            ByteWidth: std::mem::size_of_val(&vertices) as u32,
            Usage: D3D11_USAGE_DYNAMIC,
            BindFlags: D3D11_BIND_VERTEX_BUFFER.0 as u32,
            CPUAccessFlags: D3D11_CPU_ACCESS_WRITE.0 as u32,
            ..Default::default()
        };
        let initial = D3D11_SUBRESOURCE_DATA {
            pSysMem: vertices.as_ptr() as *const _,
            ..Default::default()
        };

        let mut buffer: Option<ID3D11Buffer> = None;
        if let Err(e) = unsafe {
            self.device
                .CreateBuffer(&desc, Some(&initial), Some(&mut buffer))
        } {
            log::warn!("Failed: CreateBuffer (cursor quad): {e}");
            return None;
        }
        buffer
    }

    fn update_cursor_vbuffer(&mut self) {
        let Some(vbuffer) = self.cursor_vbuffer.as_ref() else {
            return;
        };
        if self.desktop_width <= 0 || self.desktop_height <= 0 {
            return;
        }

        let vertices = cursor_quad(
            self.cursor.x,
            self.cursor.y,
            CURSOR_TEXTURE_SIZE,
            CURSOR_TEXTURE_SIZE,
            self.desktop_width,
            self.desktop_height,
        );

        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        if let Err(e) =
            unsafe { self.context.Map(vbuffer, 0, D3D11_MAP_WRITE_DISCARD, 0, Some(&mut mapped)) }
        {
            log::warn!("Failed: Map cursor vertex buffer: {e}");
            return;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                vertices.as_ptr(),
                mapped.pData as *mut Vertex,
                vertices.len(),
            );
            self.context.Unmap(vbuffer, 0);
        }
    }

    pub(crate) fn hwnd(&self) -> HWND {
        self.hwnd
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        unsafe { self.context.ClearState() };
    }
}

pub(crate) fn client_size(hwnd: HWND) -> (u32, u32) {
    use windows::Win32::Foundation::RECT;
    use windows::Win32::UI::WindowsAndMessaging::GetClientRect;

    let mut rect = RECT::default();
    if unsafe { GetClientRect(hwnd, &mut rect) }.is_err() {
        return (0, 0);
    }
    (
        (rect.right - rect.left).max(0) as u32,
        (rect.bottom - rect.top).max(0) as u32,
    )
}

fn create_device_and_swap_chain(
    hwnd: HWND,
) -> ViewResult<(ID3D11Device, ID3D11DeviceContext, IDXGISwapChain)> {
    // Desktop duplication needs at least a DXGI 1.1 factory, so the
    // adapter is enumerated explicitly instead of letting device
    // creation conjure a default factory.
    let factory: IDXGIFactory1 = unsafe { CreateDXGIFactory1() }
        .context("CreateDXGIFactory1 failed")
        .map_err(ViewError::Platform)?;
    let adapter: IDXGIAdapter = unsafe { factory.EnumAdapters(0) }
        .context("failed to get adapter #0")
        .map_err(ViewError::Platform)?;

    let swap_desc = DXGI_SWAP_CHAIN_DESC {
        BufferDesc: windows::Win32::Graphics::Dxgi::Common::DXGI_MODE_DESC {
            Format: DXGI_FORMAT_B8G8R8A8_UNORM,
            ..Default::default()
        },
        SampleDesc: DXGI_SAMPLE_DESC {
            Count: 1,
            Quality: 0,
        },
        BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
        BufferCount: 1,
        OutputWindow: hwnd,
        Windowed: true.into(),
        ..Default::default()
    };

    let mut swap: Option<IDXGISwapChain> = None;
    let mut device: Option<ID3D11Device> = None;
    let mut context: Option<ID3D11DeviceContext> = None;
    unsafe {
        D3D11CreateDeviceAndSwapChain(
            &adapter,
            D3D_DRIVER_TYPE_UNKNOWN,
            None,
            D3D11_CREATE_DEVICE_BGRA_SUPPORT,
            None,
            D3D11_SDK_VERSION,
            Some(&swap_desc),
            Some(&mut swap),
            Some(&mut device),
            None,
            Some(&mut context),
        )
    }
    .context("D3D11CreateDeviceAndSwapChain failed")
    .map_err(ViewError::Platform)?;

    let device = device
        .context("device creation returned no device")
        .map_err(ViewError::Platform)?;
    let context = context
        .context("device creation returned no immediate context")
        .map_err(ViewError::Platform)?;
    let swap = swap
        .context("device creation returned no swap chain")
        .map_err(ViewError::Platform)?;

    // One queued frame keeps Present(1) an honest vsync wait.
    if let Ok(dxgi_device) = device.cast::<IDXGIDevice1>() {
        let _ = unsafe { dxgi_device.SetMaximumFrameLatency(1) };
    }

    Ok((device, context, swap))
}

fn create_input_layout(device: &ID3D11Device, vs_bytes: &[u8]) -> ViewResult<ID3D11InputLayout> {
    let layout = [
        D3D11_INPUT_ELEMENT_DESC {
            SemanticName: windows::core::s!("POSITION"),
            SemanticIndex: 0,
            Format: DXGI_FORMAT_R32G32B32_FLOAT,
            InputSlot: 0,
            AlignedByteOffset: 0,
            InputSlotClass: D3D11_INPUT_PER_VERTEX_DATA,
            InstanceDataStepRate: 0,
        },
        D3D11_INPUT_ELEMENT_DESC {
            SemanticName: windows::core::s!("TEXCOORD"),
            SemanticIndex: 0,
            Format: DXGI_FORMAT_R32G32_FLOAT,
            InputSlot: 0,
            AlignedByteOffset: 12,
            InputSlotClass: D3D11_INPUT_PER_VERTEX_DATA,
            InstanceDataStepRate: 0,
        },
    ];

    let mut input_layout: Option<ID3D11InputLayout> = None;
    unsafe { device.CreateInputLayout(&layout, vs_bytes, Some(&mut input_layout)) }
        .context("CreateInputLayout failed")
        .map_err(ViewError::Platform)?;
    input_layout
        .context("CreateInputLayout returned nothing")
        .map_err(ViewError::Platform)
}

fn create_sampler(device: &ID3D11Device) -> ViewResult<ID3D11SamplerState> {
    let desc = D3D11_SAMPLER_DESC {
        Filter: D3D11_FILTER_MIN_MAG_MIP_LINEAR,
        AddressU: D3D11_TEXTURE_ADDRESS_CLAMP,
        AddressV: D3D11_TEXTURE_ADDRESS_CLAMP,
        AddressW: D3D11_TEXTURE_ADDRESS_CLAMP,
        MipLODBias: 0.0,
        MaxAnisotropy: 1,
        ComparisonFunc: D3D11_COMPARISON_ALWAYS,
        BorderColor: [0.0, 0.0, 0.0, 1.0],
        MinLOD: 0.0,
        MaxLOD: D3D11_FLOAT32_MAX,
    };

    let mut sampler: Option<ID3D11SamplerState> = None;
    unsafe { device.CreateSamplerState(&desc, Some(&mut sampler)) }
        .context("CreateSamplerState failed")
        .map_err(ViewError::Platform)?;
    sampler
        .context("CreateSamplerState returned nothing")
        .map_err(ViewError::Platform)
}

fn create_blend_state(device: &ID3D11Device) -> ViewResult<ID3D11BlendState> {
    let render_target = D3D11_RENDER_TARGET_BLEND_DESC {
        BlendEnable: true.into(),
        SrcBlend: D3D11_BLEND_SRC_ALPHA,
        DestBlend: D3D11_BLEND_INV_SRC_ALPHA,
        BlendOp: D3D11_BLEND_OP_ADD,
        SrcBlendAlpha: D3D11_BLEND_ZERO,
        DestBlendAlpha: D3D11_BLEND_ZERO,
        BlendOpAlpha: D3D11_BLEND_OP_ADD,
        RenderTargetWriteMask: D3D11_COLOR_WRITE_ENABLE_ALL.0 as u8,
    };
    let desc = D3D11_BLEND_DESC {
        AlphaToCoverageEnable: false.into(),
        IndependentBlendEnable: false.into(),
        RenderTarget: [render_target; 8],
    };

    let mut blend: Option<ID3D11BlendState> = None;
    unsafe { device.CreateBlendState(&desc, Some(&mut blend)) }
        .context("CreateBlendState failed")
        .map_err(ViewError::Platform)?;
    blend
        .context("CreateBlendState returned nothing")
        .map_err(ViewError::Platform)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad_bounds(quad: &[Vertex; 6]) -> (f32, f32, f32, f32) {
        let xs: Vec<f32> = quad.iter().map(|v| v.position[0]).collect();
        let ys: Vec<f32> = quad.iter().map(|v| v.position[1]).collect();
        let left = xs.iter().copied().fold(f32::INFINITY, f32::min);
        let right = xs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let bottom = ys.iter().copied().fold(f32::INFINITY, f32::min);
        let top = ys.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        (left, top, right, bottom)
    }

    #[test]
    fn desktop_quad_spans_full_ndc() {
        let quad = desktop_quad();
        let (left, top, right, bottom) = quad_bounds(&quad);
        assert_eq!((left, top, right, bottom), (-1.0, 1.0, 1.0, -1.0));
        // Texture coordinates cover [0,1]^2.
        assert!(quad.iter().any(|v| v.texcoord == [0.0, 0.0]));
        assert!(quad.iter().any(|v| v.texcoord == [1.0, 1.0]));
    }

    #[test]
    fn cursor_quad_corners_satisfy_the_ndc_mapping() {
        for (x, y, w, h, dw, dh) in [
            (0, 0, 256u32, 256u32, 1920, 1080),
            (100, 50, 256, 256, 1920, 1080),
            (1919, 1079, 32, 32, 1920, 1080),
            (0, 0, 64, 64, 800, 600),
        ] {
            let quad = cursor_quad(x, y, w, h, dw, dh);
            let (left, top, right, bottom) = quad_bounds(&quad);

            let expected_left = -1.0 + 2.0 * x as f32 / dw as f32;
            let expected_top = 1.0 - 2.0 * y as f32 / dh as f32;
            assert!((left - expected_left).abs() < 1e-6);
            assert!((top - expected_top).abs() < 1e-6);
            assert!((right - (left + 2.0 * w as f32 / dw as f32)).abs() < 1e-6);
            assert!((bottom - (top - 2.0 * h as f32 / dh as f32)).abs() < 1e-6);

            assert_eq!(left == -1.0, x == 0);
            assert_eq!(top == 1.0, y == 0);
        }
    }

    #[test]
    fn vertex_layout_matches_the_input_layout_offsets() {
        assert_eq!(VERTEX_STRIDE, 20);
        assert_eq!(std::mem::offset_of!(Vertex, texcoord), 12);
    }
}
