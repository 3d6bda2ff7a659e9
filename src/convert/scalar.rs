//! Row kernels. Each kernel converts one row of the dirty rectangle; the
//! source slice holds exactly `pixels * src_bpp` bytes and the destination
//! exactly `pixels * dst_bpp`.

/// Top 5/6/5 bits of each channel, red in the most significant bits.
#[inline(always)]
pub(crate) fn pack_rgb565(red: u8, green: u8, blue: u8) -> u16 {
    ((u16::from(red) & 0xF8) << 8) | ((u16::from(green) & 0xFC) << 3) | (u16::from(blue) >> 3)
}

pub(crate) fn copy_row(src: &[u8], dst: &mut [u8]) {
    dst.copy_from_slice(src);
}

pub(crate) fn swap16_row(src: &[u8], dst: &mut [u8]) {
    for (out, pixel) in dst.chunks_exact_mut(2).zip(src.chunks_exact(2)) {
        out[0] = pixel[1];
        out[1] = pixel[0];
    }
}

/// XRGB8888 is stored little-endian: bytes are B, G, R, X.
pub(crate) fn xrgb8888_to_rgb565_row(src: &[u8], dst: &mut [u8]) {
    for (out, pixel) in dst.chunks_exact_mut(2).zip(src.chunks_exact(4)) {
        out.copy_from_slice(&pack_rgb565(pixel[2], pixel[1], pixel[0]).to_le_bytes());
    }
}

pub(crate) fn xrgb8888_to_rgb565_swapped_row(src: &[u8], dst: &mut [u8]) {
    for (out, pixel) in dst.chunks_exact_mut(2).zip(src.chunks_exact(4)) {
        out.copy_from_slice(&pack_rgb565(pixel[2], pixel[1], pixel[0]).to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_keeps_only_top_bits() {
        assert_eq!(pack_rgb565(0xF8, 0xFC, 0xF8), 0xFFFF);
        assert_eq!(pack_rgb565(0xFF, 0xFF, 0xFF), 0xFFFF);
        assert_eq!(pack_rgb565(0x07, 0x03, 0x07), 0x0000);
        assert_eq!(pack_rgb565(0xFF, 0x00, 0x00), 0xF800);
        assert_eq!(pack_rgb565(0x00, 0xFF, 0x00), 0x07E0);
        assert_eq!(pack_rgb565(0x00, 0x00, 0xFF), 0x001F);
    }

    #[test]
    fn swap_reverses_each_pixel() {
        let src = [0x34, 0x12, 0xCD, 0xAB];
        let mut dst = [0u8; 4];
        swap16_row(&src, &mut dst);
        assert_eq!(dst, [0x12, 0x34, 0xAB, 0xCD]);
    }

    #[test]
    fn emulation_reads_bgrx_byte_order() {
        // Pure red in XRGB8888 memory order.
        let src = [0x00, 0x00, 0xFF, 0x00];
        let mut dst = [0u8; 2];
        xrgb8888_to_rgb565_row(&src, &mut dst);
        assert_eq!(u16::from_le_bytes(dst), 0xF800);

        xrgb8888_to_rgb565_swapped_row(&src, &mut dst);
        assert_eq!(dst, [0xF8, 0x00]);
    }
}
