//! Boundary with the display framework that owns modes, connectors and
//! memory-backed surfaces.
//!
//! The relay never allocates or scans out surfaces itself. It is attached
//! to a [`DisplayFramework`] during registration, receives pipeline
//! callbacks through the [`Pipeline`](crate::device::Pipeline) handle it
//! hands over, and reads surface memory through the [`Surface`] trait.

use std::fmt;
use std::time::Duration;

use crate::device::Pipeline;
use crate::error::{RelayError, RelayResult};

/// Stable identifier of a framework surface. Stays meaningful after the
/// surface itself is gone, which is why destroy notifications carry it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub u32);

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | ((code[1] as u32) << 8) | ((code[2] as u32) << 16) | ((code[3] as u32) << 24)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgb565,
    Bgr565,
    Xrgb8888,
    Argb8888,
    Xbgr8888,
}

impl PixelFormat {
    pub const fn fourcc(self) -> u32 {
        match self {
            Self::Rgb565 => fourcc(b"RG16"),
            Self::Bgr565 => fourcc(b"BG16"),
            Self::Xrgb8888 => fourcc(b"XR24"),
            Self::Argb8888 => fourcc(b"AR24"),
            Self::Xbgr8888 => fourcc(b"XB24"),
        }
    }

    pub fn from_fourcc(code: u32) -> RelayResult<Self> {
        [
            Self::Rgb565,
            Self::Bgr565,
            Self::Xrgb8888,
            Self::Argb8888,
            Self::Xbgr8888,
        ]
        .into_iter()
        .find(|format| format.fourcc() == code)
        .ok_or_else(|| RelayError::InvalidArgument(format!("unknown pixel format {code:#010x}")))
    }

    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgb565 | Self::Bgr565 => 2,
            Self::Xrgb8888 | Self::Argb8888 | Self::Xbgr8888 => 4,
        }
    }

    pub const fn depth(self) -> u32 {
        match self {
            Self::Rgb565 | Self::Bgr565 => 16,
            Self::Xrgb8888 | Self::Xbgr8888 => 24,
            Self::Argb8888 => 32,
        }
    }
}

/// Display timings handed over by the consumer at registration time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DisplayMode {
    pub name: String,
    /// Pixel clock in kHz.
    pub clock_khz: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vrefresh: u32,
    pub width_mm: u32,
    pub height_mm: u32,
}

impl DisplayMode {
    /// A mode with zero-length blanking, the usual shape for panels that
    /// are refreshed by an external controller.
    pub fn fixed(width: u16, height: u16) -> Self {
        Self {
            name: format!("{width}x{height}"),
            clock_khz: (u32::from(width) * u32::from(height) * 60).div_ceil(1000).max(1),
            hdisplay: width,
            hsync_start: width,
            hsync_end: width,
            htotal: width,
            vdisplay: height,
            vsync_start: height,
            vsync_end: height,
            vtotal: height,
            vrefresh: 60,
            width_mm: 0,
            height_mm: 0,
        }
    }

    pub fn validate(&self) -> RelayResult<()> {
        if self.clock_khz == 0 || self.clock_khz > i32::MAX as u32 {
            return Err(RelayError::InvalidArgument(format!(
                "mode {:?}: pixel clock {} kHz out of range",
                self.name, self.clock_khz
            )));
        }
        if self.hdisplay == 0
            || self.hsync_start < self.hdisplay
            || self.hsync_end < self.hsync_start
            || self.htotal < self.hsync_end
        {
            return Err(RelayError::InvalidArgument(format!(
                "mode {:?}: illegal horizontal timings",
                self.name
            )));
        }
        if self.vdisplay == 0
            || self.vsync_start < self.vdisplay
            || self.vsync_end < self.vsync_start
            || self.vtotal < self.vsync_end
        {
            return Err(RelayError::InvalidArgument(format!(
                "mode {:?}: illegal vertical timings",
                self.name
            )));
        }
        Ok(())
    }

    pub fn width(&self) -> u16 {
        self.hdisplay
    }

    pub fn height(&self) -> u16 {
        self.vdisplay
    }
}

/// Memory layout of a surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurfaceGeometry {
    pub width: u16,
    pub height: u16,
    /// Bytes per row, at least `width * bytes_per_pixel`.
    pub pitch: usize,
    pub format: PixelFormat,
}

impl SurfaceGeometry {
    pub fn packed(width: u16, height: u16, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            pitch: usize::from(width) * format.bytes_per_pixel(),
            format,
        }
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.format.bytes_per_pixel()
    }

    /// Minimum number of bytes a buffer with this geometry must hold.
    pub fn required_len(&self) -> Option<usize> {
        if self.height == 0 {
            return Some(0);
        }
        let last_row = usize::from(self.width).checked_mul(self.bytes_per_pixel())?;
        self.pitch
            .checked_mul(usize::from(self.height) - 1)?
            .checked_add(last_row)
    }
}

/// A drawable pixel buffer owned by the display framework.
pub trait Surface: Send + Sync {
    fn id(&self) -> SurfaceId;

    fn geometry(&self) -> SurfaceGeometry;

    /// Make the backing memory CPU-visible. Imported buffers may need a
    /// mapping or cache maintenance before they can be read.
    fn begin_cpu_access(&self) -> RelayResult<()> {
        Ok(())
    }

    fn end_cpu_access(&self) {}

    /// Run `reader` over the surface bytes. Only valid between
    /// [`begin_cpu_access`](Self::begin_cpu_access) and
    /// [`end_cpu_access`](Self::end_cpu_access).
    fn with_pixels(&self, reader: &mut dyn FnMut(&[u8]) -> RelayResult<()>) -> RelayResult<()>;
}

/// Scoped CPU access to a surface. Access is released on drop, so every
/// exit path of the holder ends it, including transcoding failures.
pub struct CpuAccessGuard<'a> {
    surface: &'a dyn Surface,
}

impl<'a> CpuAccessGuard<'a> {
    pub fn begin(surface: &'a dyn Surface) -> RelayResult<Self> {
        surface.begin_cpu_access()?;
        Ok(Self { surface })
    }

    pub fn with_pixels(
        &self,
        reader: &mut dyn FnMut(&[u8]) -> RelayResult<()>,
    ) -> RelayResult<()> {
        self.surface.with_pixels(reader)
    }
}

impl Drop for CpuAccessGuard<'_> {
    fn drop(&mut self) {
        self.surface.end_cpu_access();
    }
}

/// What the relay asks the framework to create when a consumer registers.
#[derive(Clone, Debug)]
pub struct AttachRequest {
    pub name: String,
    pub mode: DisplayMode,
    /// Formats advertised on the primary plane, in preference order.
    pub formats: Vec<PixelFormat>,
    /// Depth the framework should prefer for its own console surface.
    pub preferred_depth: u32,
}

pub trait DisplayFramework: Send + Sync {
    /// Create a display device driven by `pipeline` and return its
    /// externally visible index.
    fn attach(&self, pipeline: Pipeline, request: &AttachRequest) -> RelayResult<u32>;

    /// Turn every output of the device off. Implementations invoke the
    /// pipeline's disable callback when the output was running.
    fn force_disable_all(&self, index: u32);

    fn detach(&self, index: u32);

    /// Number of external references (open handles) to the device.
    fn open_count(&self, index: u32) -> usize;

    /// Block until [`open_count`](Self::open_count) reaches zero.
    ///
    /// The default polls with `poll_interval` between checks.
    /// Frameworks that can signal reference drops should override this.
    fn wait_released(&self, index: u32, poll_interval: Duration) {
        loop {
            let open = self.open_count(index);
            if open == 0 {
                return;
            }
            tracing::debug!("device {index}: waiting for {open} open reference(s)");
            std::thread::sleep(poll_interval);
        }
    }
}
