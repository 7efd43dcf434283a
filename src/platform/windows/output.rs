use anyhow::Context;
use windows::core::Interface;
use windows::Win32::Graphics::Dxgi::{
    IDXGIAdapter, IDXGIDevice, IDXGIOutput, IDXGIOutput1, DXGI_ERROR_NOT_FOUND,
};
use windows::Win32::Graphics::Direct3D11::ID3D11Device;

use crate::error::{ViewError, ViewResult};
use crate::monitor::MonitorRect;

/// Finds the output on the device's adapter whose desktop coordinates
/// exactly match `rect`.
///
/// Scaled, cloned, or repositioned monitors never match by accident:
/// the comparison is exact on all four edges, and detached outputs are
/// skipped.
pub(crate) fn find_output_for_rect(
    device: &ID3D11Device,
    rect: MonitorRect,
) -> ViewResult<IDXGIOutput1> {
    let dxgi_device: IDXGIDevice = device
        .cast()
        .context("failed to query IDXGIDevice from the D3D11 device")
        .map_err(ViewError::Platform)?;
    let adapter: IDXGIAdapter = unsafe { dxgi_device.GetAdapter() }
        .context("IDXGIDevice::GetAdapter failed")
        .map_err(ViewError::Platform)?;

    let mut output_idx = 0u32;
    loop {
        let output: IDXGIOutput = match unsafe { adapter.EnumOutputs(output_idx) } {
            Ok(output) => output,
            Err(e) if e.code() == DXGI_ERROR_NOT_FOUND => break,
            Err(e) => {
                return Err(ViewError::Platform(
                    anyhow::Error::from(e).context(format!("EnumOutputs({output_idx}) failed")),
                ));
            }
        };
        output_idx += 1;

        let desc = match unsafe { output.GetDesc() } {
            Ok(desc) => desc,
            Err(e) => {
                log::warn!("IDXGIOutput::GetDesc failed: {e}");
                continue;
            }
        };

        if !desc.AttachedToDesktop.as_bool() {
            continue;
        }

        let coords = desc.DesktopCoordinates;
        if rect.matches(coords.left, coords.top, coords.right, coords.bottom) {
            return output
                .cast::<IDXGIOutput1>()
                .context("failed to query IDXGIOutput1 (desktop duplication needs DXGI 1.2)")
                .map_err(ViewError::Platform);
        }
    }

    Err(ViewError::MonitorNotFound(rect))
}
