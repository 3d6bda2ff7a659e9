//! Pixel transcoding of a dirty rectangle into the side buffer.
//!
//! Only the rectangle is read and only the rectangle is written. The
//! destination is addressed with the same coordinates as the source, using
//! its own pitch and the output format's bytes per pixel.

mod parallel;
mod scalar;

use bitflags::bitflags;
use rayon::prelude::*;

use crate::env_config::{SERIAL_TRANSCODE_ENV, define_env_flag};
use crate::error::{RelayError, RelayResult};
use crate::framework::{PixelFormat, SurfaceGeometry};
use crate::region::ClipRect;
use parallel::{SplitPolicy, install_transcode_pool};

define_env_flag!(enabled_when(serial_transcode, SERIAL_TRANSCODE_ENV));

const TRANSCODE_SPLIT: SplitPolicy = SplitPolicy {
    min_pixels: 262_144,
    min_chunk_pixels: 65_536,
    max_workers: 8,
};

/// Pre-initialize the transcode thread pool. Safe to call repeatedly.
pub fn warmup() {
    parallel::warmup_pool(TRANSCODE_SPLIT.max_workers);
}

bitflags! {
    /// Side-buffer transcoding requested by the consumer at registration.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct BufferMode: u32 {
        const PLAIN_COPY = 1;
        const SWAP_BYTES = 2;
        /// Advertise XRGB8888 and convert it down to RGB565.
        const EMULATE_XRGB8888 = 1 << 8;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TranscodeMode {
    Copy,
    SwapBytes,
    EmulateRgb565 { swap: bool },
}

impl TranscodeMode {
    /// `Ok(None)` when no side buffer is wanted.
    pub fn from_buffer_mode(mode: BufferMode) -> RelayResult<Option<Self>> {
        let unknown = mode.bits() & !BufferMode::all().bits();
        if unknown != 0 {
            return Err(RelayError::InvalidArgument(format!(
                "unknown buffer mode bits {unknown:#x}"
            )));
        }
        if mode.contains(BufferMode::PLAIN_COPY | BufferMode::SWAP_BYTES) {
            return Err(RelayError::InvalidArgument(
                "plain copy and byte swap are mutually exclusive".into(),
            ));
        }

        let swap = mode.contains(BufferMode::SWAP_BYTES);
        Ok(if mode.contains(BufferMode::EMULATE_XRGB8888) {
            Some(Self::EmulateRgb565 { swap })
        } else if swap {
            Some(Self::SwapBytes)
        } else if mode.contains(BufferMode::PLAIN_COPY) {
            Some(Self::Copy)
        } else {
            None
        })
    }

    /// Format of the bytes written for a `source` surface.
    pub fn output_format(self, source: PixelFormat) -> PixelFormat {
        match self {
            Self::EmulateRgb565 { .. } if source.bytes_per_pixel() == 4 => PixelFormat::Rgb565,
            _ => source,
        }
    }
}

type RowKernel = fn(&[u8], &mut [u8]);

#[derive(Clone, Copy)]
struct TranscodePlan {
    src_bytes_per_pixel: usize,
    dst_bytes_per_pixel: usize,
    row_kernel: RowKernel,
}

fn transcode_plan(mode: TranscodeMode, format: PixelFormat) -> RelayResult<TranscodePlan> {
    let bpp = format.bytes_per_pixel();
    let plan = |dst_bytes_per_pixel: usize, row_kernel: RowKernel| TranscodePlan {
        src_bytes_per_pixel: bpp,
        dst_bytes_per_pixel,
        row_kernel,
    };
    match (mode, bpp) {
        (TranscodeMode::Copy, _) => Ok(plan(bpp, scalar::copy_row)),
        (TranscodeMode::SwapBytes, 2) => Ok(plan(2, scalar::swap16_row)),
        (TranscodeMode::SwapBytes, _) => Err(RelayError::UnsupportedMode(format!(
            "cannot byte swap {} bpp pixels",
            bpp * 8
        ))),
        // 16-bit surfaces are already in the emulated format.
        (TranscodeMode::EmulateRgb565 { swap: false }, 2) => Ok(plan(2, scalar::copy_row)),
        (TranscodeMode::EmulateRgb565 { swap: true }, 2) => Ok(plan(2, scalar::swap16_row)),
        (TranscodeMode::EmulateRgb565 { swap: false }, 4) => {
            Ok(plan(2, scalar::xrgb8888_to_rgb565_row))
        }
        (TranscodeMode::EmulateRgb565 { swap: true }, 4) => {
            Ok(plan(2, scalar::xrgb8888_to_rgb565_swapped_row))
        }
        (TranscodeMode::EmulateRgb565 { .. }, _) => Err(RelayError::UnsupportedMode(format!(
            "cannot emulate RGB565 from {} bpp pixels",
            bpp * 8
        ))),
    }
}

/// Geometry of one transcode call, validated against both buffers.
#[derive(Clone, Copy)]
struct RectLayout {
    src_pitch: usize,
    dst_pitch: usize,
    src_start: usize,
    dst_start: usize,
    src_row_bytes: usize,
    dst_row_bytes: usize,
    rows: usize,
    width: usize,
}

impl RectLayout {
    fn new(
        plan: TranscodePlan,
        src_len: usize,
        src_geometry: &SurfaceGeometry,
        dst_len: usize,
        dst_pitch: usize,
        clip: ClipRect,
    ) -> RelayResult<Self> {
        if !clip.is_valid_within(src_geometry.width, src_geometry.height) {
            return Err(RelayError::InvalidArgument(format!(
                "clip {clip:?} outside {}x{} surface",
                src_geometry.width, src_geometry.height
            )));
        }
        let overflow = || RelayError::InvalidArgument("transcode rectangle overflows".into());

        let width = usize::from(clip.width());
        let rows = usize::from(clip.height());
        let x1 = usize::from(clip.x1);
        let y1 = usize::from(clip.y1);

        let src_row_bytes = width * plan.src_bytes_per_pixel;
        let dst_row_bytes = width * plan.dst_bytes_per_pixel;
        let src_pitch = src_geometry.pitch;

        if src_pitch < usize::from(src_geometry.width) * plan.src_bytes_per_pixel {
            return Err(RelayError::InvalidArgument(format!(
                "source pitch {src_pitch} shorter than a {} pixel row",
                src_geometry.width
            )));
        }
        if dst_pitch < usize::from(clip.x2) * plan.dst_bytes_per_pixel {
            return Err(RelayError::InvalidArgument(format!(
                "destination pitch {dst_pitch} cannot hold column {}",
                clip.x2
            )));
        }

        let src_start = y1
            .checked_mul(src_pitch)
            .and_then(|offset| offset.checked_add(x1 * plan.src_bytes_per_pixel))
            .ok_or_else(overflow)?;
        let dst_start = y1
            .checked_mul(dst_pitch)
            .and_then(|offset| offset.checked_add(x1 * plan.dst_bytes_per_pixel))
            .ok_or_else(overflow)?;
        let src_end = (rows - 1)
            .checked_mul(src_pitch)
            .and_then(|span| span.checked_add(src_start + src_row_bytes))
            .ok_or_else(overflow)?;
        let dst_end = (rows - 1)
            .checked_mul(dst_pitch)
            .and_then(|span| span.checked_add(dst_start + dst_row_bytes))
            .ok_or_else(overflow)?;

        if src_end > src_len {
            return Err(RelayError::InvalidArgument(format!(
                "source buffer of {src_len} bytes too small, need {src_end}"
            )));
        }
        if dst_end > dst_len {
            return Err(RelayError::InvalidArgument(format!(
                "destination buffer of {dst_len} bytes too small, need {dst_end}"
            )));
        }

        Ok(Self {
            src_pitch,
            dst_pitch,
            src_start,
            dst_start,
            src_row_bytes,
            dst_row_bytes,
            rows,
            width,
        })
    }

    fn src_row<'a>(&self, src: &'a [u8], row: usize) -> &'a [u8] {
        let start = self.src_start + row * self.src_pitch;
        &src[start..start + self.src_row_bytes]
    }

    /// Destination bytes from the first rectangle row up to the end of the
    /// last rectangle row, split later into `dst_pitch` strides.
    fn dst_span<'a>(&self, dst: &'a mut [u8]) -> &'a mut [u8] {
        let end = self.dst_start + (self.rows - 1) * self.dst_pitch + self.dst_row_bytes;
        &mut dst[self.dst_start..end]
    }
}

/// Convert the `clip` rectangle of `src` into `dst` under `mode`.
///
/// All bounds are checked before the first byte is written.
pub fn transcode_rect(
    mode: TranscodeMode,
    src: &[u8],
    src_geometry: &SurfaceGeometry,
    dst: &mut [u8],
    dst_pitch: usize,
    clip: ClipRect,
) -> RelayResult<()> {
    transcode_rect_with(
        mode,
        src,
        src_geometry,
        dst,
        dst_pitch,
        clip,
        !serial_transcode(),
    )
}

fn transcode_rect_with(
    mode: TranscodeMode,
    src: &[u8],
    src_geometry: &SurfaceGeometry,
    dst: &mut [u8],
    dst_pitch: usize,
    clip: ClipRect,
    allow_parallel: bool,
) -> RelayResult<()> {
    let plan = transcode_plan(mode, src_geometry.format)?;
    let layout = RectLayout::new(plan, src.len(), src_geometry, dst.len(), dst_pitch, clip)?;
    let kernel = plan.row_kernel;
    let span = layout.dst_span(dst);

    let chunk_rows = if allow_parallel {
        TRANSCODE_SPLIT.chunk_rows(layout.rows, layout.width)
    } else {
        None
    };

    match chunk_rows {
        Some(chunk_rows) => {
            tracing::trace!(
                "transcoding {}x{} in chunks of {chunk_rows} rows",
                layout.width,
                layout.rows
            );
            install_transcode_pool(TRANSCODE_SPLIT.max_workers, || {
                span.par_chunks_mut(layout.dst_pitch * chunk_rows)
                    .enumerate()
                    .for_each(|(chunk_index, chunk)| {
                        let first_row = chunk_index * chunk_rows;
                        convert_rows(&layout, kernel, src, chunk, first_row);
                    });
            });
        }
        None => convert_rows(&layout, kernel, src, span, 0),
    }
    Ok(())
}

fn convert_rows(
    layout: &RectLayout,
    kernel: RowKernel,
    src: &[u8],
    dst_rows: &mut [u8],
    first_row: usize,
) {
    for (offset, dst_row) in dst_rows.chunks_mut(layout.dst_pitch).enumerate() {
        let row = first_row + offset;
        if row >= layout.rows {
            break;
        }
        kernel(
            layout.src_row(src, row),
            &mut dst_row[..layout.dst_row_bytes],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgb565_geometry(width: u16, height: u16) -> SurfaceGeometry {
        SurfaceGeometry::packed(width, height, PixelFormat::Rgb565)
    }

    #[test]
    fn plain_copy_of_saturated_rect_is_identical() -> RelayResult<()> {
        let geometry = rgb565_geometry(8, 4);
        let src = vec![0xFF; 8 * 4 * 2];
        let mut dst = vec![0u8; 8 * 4 * 2];
        transcode_rect(
            TranscodeMode::Copy,
            &src,
            &geometry,
            &mut dst,
            geometry.pitch,
            ClipRect::full_frame(8, 4),
        )?;
        assert_eq!(dst, src);
        Ok(())
    }

    #[test]
    fn byte_swap_reverses_pixel() -> RelayResult<()> {
        let geometry = rgb565_geometry(1, 1);
        let src = 0x1234u16.to_le_bytes();
        let mut dst = [0u8; 2];
        transcode_rect(
            TranscodeMode::SwapBytes,
            &src,
            &geometry,
            &mut dst,
            2,
            ClipRect::full_frame(1, 1),
        )?;
        assert_eq!(u16::from_le_bytes(dst), 0x3412);
        Ok(())
    }

    #[test]
    fn emulation_keeps_top_bits() -> RelayResult<()> {
        let geometry = SurfaceGeometry::packed(1, 1, PixelFormat::Xrgb8888);
        // B, G, R, X
        let src = [0xF8, 0xFC, 0xF8, 0x00];
        let mut dst = [0u8; 2];
        transcode_rect(
            TranscodeMode::EmulateRgb565 { swap: false },
            &src,
            &geometry,
            &mut dst,
            2,
            ClipRect::full_frame(1, 1),
        )?;
        assert_eq!(u16::from_le_bytes(dst), 0xFFFF);
        Ok(())
    }

    #[test]
    fn byte_swap_of_32bpp_is_unsupported() {
        let geometry = SurfaceGeometry::packed(2, 2, PixelFormat::Xrgb8888);
        let src = vec![0u8; 16];
        let mut dst = vec![0u8; 16];
        let result = transcode_rect(
            TranscodeMode::SwapBytes,
            &src,
            &geometry,
            &mut dst,
            8,
            ClipRect::full_frame(2, 2),
        );
        assert!(matches!(result, Err(RelayError::UnsupportedMode(_))));
        assert!(dst.iter().all(|byte| *byte == 0));
    }

    #[test]
    fn bytes_outside_rect_are_untouched() -> RelayResult<()> {
        let geometry = rgb565_geometry(4, 4);
        let src = vec![0xAA; 4 * 4 * 2];
        let mut dst = vec![0u8; 4 * 4 * 2];
        transcode_rect(
            TranscodeMode::Copy,
            &src,
            &geometry,
            &mut dst,
            geometry.pitch,
            ClipRect::new(1, 1, 3, 3),
        )?;
        for y in 0..4 {
            for x in 0..4 {
                let inside = (1..3).contains(&x) && (1..3).contains(&y);
                let offset = y * 8 + x * 2;
                let expected = if inside { 0xAA } else { 0x00 };
                assert_eq!(dst[offset], expected, "pixel ({x},{y})");
                assert_eq!(dst[offset + 1], expected, "pixel ({x},{y})");
            }
        }
        Ok(())
    }

    #[test]
    fn emulated_rect_lands_at_same_coordinates() -> RelayResult<()> {
        let geometry = SurfaceGeometry::packed(4, 2, PixelFormat::Xrgb8888);
        let mut src = vec![0u8; 4 * 2 * 4];
        // Pixel (2,1) pure blue.
        src[(4 + 2) * 4] = 0xFF;
        let mut dst = vec![0u8; 4 * 2 * 2];
        transcode_rect(
            TranscodeMode::EmulateRgb565 { swap: true },
            &src,
            &geometry,
            &mut dst,
            8,
            ClipRect::new(2, 1, 3, 2),
        )?;
        assert_eq!(&dst[8 + 4..8 + 6], &[0x00, 0x1F]);
        assert!(dst[..12].iter().all(|byte| *byte == 0));
        Ok(())
    }

    #[test]
    fn short_destination_is_rejected_before_writing() {
        let geometry = rgb565_geometry(4, 4);
        let src = vec![0xAA; 32];
        let mut dst = vec![0u8; 30];
        let result = transcode_rect(
            TranscodeMode::Copy,
            &src,
            &geometry,
            &mut dst,
            8,
            ClipRect::full_frame(4, 4),
        );
        assert!(matches!(result, Err(RelayError::InvalidArgument(_))));
        assert!(dst.iter().all(|byte| *byte == 0));
    }

    #[test]
    fn parallel_and_serial_paths_agree() -> RelayResult<()> {
        let geometry = SurfaceGeometry::packed(1024, 600, PixelFormat::Xrgb8888);
        let src: Vec<u8> = (0..geometry.pitch * 600).map(|i| (i * 7 % 251) as u8).collect();
        let dst_pitch = 1024 * 2;
        let mut serial = vec![0u8; dst_pitch * 600];
        let mut parallel = vec![0u8; dst_pitch * 600];
        let clip = ClipRect::new(3, 1, 1021, 599);
        let mode = TranscodeMode::EmulateRgb565 { swap: true };

        transcode_rect_with(mode, &src, &geometry, &mut serial, dst_pitch, clip, false)?;
        transcode_rect_with(mode, &src, &geometry, &mut parallel, dst_pitch, clip, true)?;
        assert!(serial == parallel);
        Ok(())
    }

    #[test]
    fn buffer_mode_parsing() -> RelayResult<()> {
        assert_eq!(TranscodeMode::from_buffer_mode(BufferMode::empty())?, None);
        assert_eq!(
            TranscodeMode::from_buffer_mode(BufferMode::PLAIN_COPY)?,
            Some(TranscodeMode::Copy)
        );
        assert_eq!(
            TranscodeMode::from_buffer_mode(BufferMode::EMULATE_XRGB8888 | BufferMode::SWAP_BYTES)?,
            Some(TranscodeMode::EmulateRgb565 { swap: true })
        );
        assert!(
            TranscodeMode::from_buffer_mode(BufferMode::PLAIN_COPY | BufferMode::SWAP_BYTES)
                .is_err()
        );
        assert!(TranscodeMode::from_buffer_mode(BufferMode::from_bits_retain(0x40)).is_err());
        Ok(())
    }
}
