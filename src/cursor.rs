//! CPU-side decoding of mouse-cursor shapes into a BGRA texture image.
//!
//! Both capture strategies funnel their cursor pixels through here: the
//! duplication source decodes the pointer-shape buffer that arrives with
//! each frame, the legacy source decodes the icon bitmaps of the cursor
//! handle it polls. The destination is always the mapped 256x256 BGRA
//! cursor texture.
//!
//! Monochrome and masked-color shapes are decoded as if the underlying
//! desktop were black: the correct semantics would XOR/blend against the
//! live desktop image, which would require reading it back to the CPU.

/// Edge length of the square cursor texture, in pixels.
pub const CURSOR_TEXTURE_SIZE: u32 = 256;

/// Cursor position and visibility handed from the active source to the
/// renderer each frame. Coordinates are monitor-relative pixels of the
/// shape's top-left corner (hotspot already applied).
#[derive(Clone, Copy, Debug, Default)]
pub struct CursorState {
    pub x: i32,
    pub y: i32,
    pub visible: bool,
}

/// Mutable view over a mapped cursor texture: `row_pitch` bytes per row,
/// BGRA, `CURSOR_TEXTURE_SIZE` rows.
pub struct CursorSurface<'a> {
    data: &'a mut [u8],
    row_pitch: usize,
}

impl<'a> CursorSurface<'a> {
    pub fn new(data: &'a mut [u8], row_pitch: usize) -> Self {
        debug_assert!(row_pitch >= CURSOR_TEXTURE_SIZE as usize * 4);
        debug_assert!(data.len() >= row_pitch * CURSOR_TEXTURE_SIZE as usize);
        Self { data, row_pitch }
    }

    /// Black and fully transparent, so stale pixels from a previous
    /// (possibly larger) shape never linger.
    pub fn clear(&mut self) {
        self.data[..self.row_pitch * CURSOR_TEXTURE_SIZE as usize].fill(0);
    }

    fn pixel_mut(&mut self, x: usize, y: usize) -> &mut [u8] {
        let offset = y * self.row_pitch + x * 4;
        &mut self.data[offset..offset + 4]
    }
}

fn clamp_to_texture(value: u32) -> usize {
    value.min(CURSOR_TEXTURE_SIZE) as usize
}

/// Reads one pixel of a 1-bit-per-pixel mask row, MSB first.
fn plane_bit(row: &[u8], x: usize) -> u8 {
    (row[x / 8] >> (7 - (x % 8))) & 1
}

/// Bytes per line of a 1bpp DIB plane, rounded up to a 4-byte boundary.
pub fn mono_plane_pitch(width: u32) -> usize {
    (((width as usize).saturating_sub(1)) / 32 + 1) * 4
}

/// A full-color BGRA shape: row-wise copy, clamped to the texture.
pub fn write_color_shape(
    surface: &mut CursorSurface<'_>,
    src: &[u8],
    src_pitch: usize,
    width: u32,
    height: u32,
) {
    let rows = clamp_to_texture(height);
    let cols = clamp_to_texture(width);
    for row in 0..rows {
        let src_offset = row * src_pitch;
        let dst_offset = row * surface.row_pitch;
        surface.data[dst_offset..dst_offset + cols * 4]
            .copy_from_slice(&src[src_offset..src_offset + cols * 4]);
    }
}

/// A masked-color shape: the mask selects between "use source RGB" and
/// "XOR source RGB with the desktop". Against a black desktop both
/// cases reduce to the source RGB, so the mask byte is ignored and
/// alpha is forced opaque.
pub fn write_masked_color_shape(
    surface: &mut CursorSurface<'_>,
    src: &[u8],
    src_pitch: usize,
    width: u32,
    height: u32,
) {
    let rows = clamp_to_texture(height);
    let cols = clamp_to_texture(width);
    for row in 0..rows {
        for col in 0..cols {
            let source = &src[row * src_pitch + col * 4..row * src_pitch + col * 4 + 4];
            let (b, g, r) = (source[0], source[1], source[2]);
            let target = surface.pixel_mut(col, row);
            target[0] = b;
            target[1] = g;
            target[2] = r;
            target[3] = 0xFF;
        }
    }
}

/// A monochrome shape: two stacked 1bpp planes of equal height, the AND
/// mask above the XOR mask. `total_height` counts both planes; the
/// visible cursor is the top half.
///
/// AND bit 0 makes the pixel opaque; the XOR bit picks white or black.
pub fn write_monochrome_shape(
    surface: &mut CursorSurface<'_>,
    planes: &[u8],
    plane_pitch: usize,
    width: u32,
    total_height: u32,
) {
    let height = total_height / 2;
    let rows = clamp_to_texture(height);
    let cols = clamp_to_texture(width);
    let (and_plane, xor_plane) = planes.split_at(plane_pitch * height as usize);

    for row in 0..rows {
        let and_row = &and_plane[row * plane_pitch..];
        let xor_row = &xor_plane[row * plane_pitch..];

        for col in 0..cols {
            let alpha = if plane_bit(and_row, col) != 0 { 0 } else { 0xFF };
            let rgb = if plane_bit(xor_row, col) != 0 { 0xFF } else { 0 };

            let target = surface.pixel_mut(col, row);
            target[0] = rgb;
            target[1] = rgb;
            target[2] = rgb;
            target[3] = alpha;
        }
    }
}

/// A color cursor read from its GDI icon bitmaps: `color` is the BGRA
/// color plane (tightly packed, `width * 4` bytes per row), `mask` the
/// AND mask rendered as 32-bit pixels. Alpha becomes `255 - mask` so a
/// white mask pixel (transparent in AND terms) yields alpha 0.
pub fn write_color_with_mask(
    surface: &mut CursorSurface<'_>,
    color: &[u8],
    mask: Option<&[u8]>,
    width: u32,
    height: u32,
) {
    let rows = clamp_to_texture(height);
    let cols = clamp_to_texture(width);
    let src_pitch = width as usize * 4;

    for row in 0..rows {
        let src_offset = row * src_pitch;
        let dst_offset = row * surface.row_pitch;
        surface.data[dst_offset..dst_offset + cols * 4]
            .copy_from_slice(&color[src_offset..src_offset + cols * 4]);
    }

    let Some(mask) = mask else {
        return;
    };

    for row in 0..rows {
        for col in 0..cols {
            let mask_byte = mask[(row * width as usize + col) * 4];
            surface.pixel_mut(col, row)[3] = 255 - mask_byte;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PITCH: usize = CURSOR_TEXTURE_SIZE as usize * 4;

    fn surface_buffer() -> Vec<u8> {
        vec![0xAA; PITCH * CURSOR_TEXTURE_SIZE as usize]
    }

    fn pixel(buffer: &[u8], x: usize, y: usize) -> [u8; 4] {
        let offset = y * PITCH + x * 4;
        [
            buffer[offset],
            buffer[offset + 1],
            buffer[offset + 2],
            buffer[offset + 3],
        ]
    }

    #[test]
    fn clear_zeroes_the_full_texture() {
        let mut buffer = surface_buffer();
        CursorSurface::new(&mut buffer, PITCH).clear();
        assert!(buffer.iter().all(|&b| b == 0));
    }

    #[test]
    fn monochrome_all_zero_and_all_one_xor_is_solid_white() {
        let width = 32u32;
        let height = 8u32;
        let pitch = mono_plane_pitch(width);
        // AND plane all zero (opaque), XOR plane all one (white).
        let mut planes = vec![0u8; pitch * height as usize];
        planes.extend(std::iter::repeat(0xFF).take(pitch * height as usize));

        let mut buffer = surface_buffer();
        let mut surface = CursorSurface::new(&mut buffer, PITCH);
        surface.clear();
        write_monochrome_shape(&mut surface, &planes, pitch, width, height * 2);

        for y in 0..height as usize {
            for x in 0..width as usize {
                assert_eq!(pixel(&buffer, x, y), [0xFF, 0xFF, 0xFF, 0xFF]);
            }
        }
        // Outside the footprint stays transparent black.
        assert_eq!(pixel(&buffer, width as usize, 0), [0, 0, 0, 0]);
        assert_eq!(pixel(&buffer, 0, height as usize), [0, 0, 0, 0]);
    }

    #[test]
    fn monochrome_all_one_and_mask_is_fully_transparent() {
        let width = 16u32;
        let height = 4u32;
        let pitch = mono_plane_pitch(width);
        let mut planes = vec![0xFFu8; pitch * height as usize];
        planes.extend(std::iter::repeat(0xFF).take(pitch * height as usize));

        let mut buffer = surface_buffer();
        let mut surface = CursorSurface::new(&mut buffer, PITCH);
        surface.clear();
        write_monochrome_shape(&mut surface, &planes, pitch, width, height * 2);

        for y in 0..height as usize {
            for x in 0..width as usize {
                assert_eq!(pixel(&buffer, x, y)[3], 0);
            }
        }
    }

    #[test]
    fn mono_plane_bits_are_msb_first() {
        let row = [0b1000_0001u8];
        assert_eq!(plane_bit(&row, 0), 1);
        assert_eq!(plane_bit(&row, 1), 0);
        assert_eq!(plane_bit(&row, 7), 1);
    }

    #[test]
    fn mono_plane_pitch_rounds_to_dwords() {
        assert_eq!(mono_plane_pitch(1), 4);
        assert_eq!(mono_plane_pitch(32), 4);
        assert_eq!(mono_plane_pitch(33), 8);
        assert_eq!(mono_plane_pitch(64), 8);
    }

    #[test]
    fn color_shape_respects_source_pitch_and_clamps() {
        let width = 2u32;
        let height = 2u32;
        let src_pitch = 16usize; // wider than width * 4
        let mut src = vec![0u8; src_pitch * height as usize];
        src[0..4].copy_from_slice(&[1, 2, 3, 4]);
        src[src_pitch..src_pitch + 4].copy_from_slice(&[5, 6, 7, 8]);

        let mut buffer = surface_buffer();
        let mut surface = CursorSurface::new(&mut buffer, PITCH);
        surface.clear();
        write_color_shape(&mut surface, &src, src_pitch, width, height);

        assert_eq!(pixel(&buffer, 0, 0), [1, 2, 3, 4]);
        assert_eq!(pixel(&buffer, 0, 1), [5, 6, 7, 8]);
        assert_eq!(pixel(&buffer, 2, 0), [0, 0, 0, 0]);
    }

    #[test]
    fn masked_color_forces_opaque_alpha() {
        let width = 1u32;
        let height = 1u32;
        let src = [10u8, 20, 30, 0x00]; // source alpha carries the mask bit
        let mut buffer = surface_buffer();
        let mut surface = CursorSurface::new(&mut buffer, PITCH);
        surface.clear();
        write_masked_color_shape(&mut surface, &src, 4, width, height);

        assert_eq!(pixel(&buffer, 0, 0), [10, 20, 30, 0xFF]);
    }

    #[test]
    fn gdi_color_cursor_takes_alpha_from_inverted_mask() {
        let width = 2u32;
        let height = 1u32;
        let color = [1u8, 1, 1, 9, 2, 2, 2, 9];
        // First pixel masked out (0xFF), second opaque (0x00).
        let mask = [0xFFu8, 0xFF, 0xFF, 0, 0x00, 0x00, 0x00, 0];

        let mut buffer = surface_buffer();
        let mut surface = CursorSurface::new(&mut buffer, PITCH);
        surface.clear();
        write_color_with_mask(&mut surface, &color, Some(&mask), width, height);

        assert_eq!(pixel(&buffer, 0, 0), [1, 1, 1, 0]);
        assert_eq!(pixel(&buffer, 1, 0), [2, 2, 2, 255]);
    }
}
