//! In-memory display framework.
//!
//! [`HeadlessFramework`] implements the framework boundary without any
//! display hardware: it tracks attached devices, their output state and
//! open references, and hands out memory-backed [`HeadlessSurface`]s.
//! Hosts without a real display stack drive the relay through it, and it
//! doubles as the framework in tests and demos.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::time::Duration;

use rustc_hash::FxHashMap;

use crate::device::Pipeline;
use crate::error::{RelayError, RelayResult};
use crate::framework::{
    AttachRequest, DisplayFramework, PixelFormat, Surface, SurfaceGeometry, SurfaceId,
};
use crate::region::{ClipRect, DirtyFlags};
use crate::{lock_unpoisoned, read_unpoisoned, write_unpoisoned};

struct HeadlessDevice {
    pipeline: Pipeline,
    request: AttachRequest,
    enabled: bool,
    open: usize,
}

#[derive(Default)]
pub struct HeadlessFramework {
    next_index: AtomicU32,
    next_surface_id: AtomicU32,
    devices: Mutex<FxHashMap<u32, HeadlessDevice>>,
    released: Condvar,
    fail_next_attach: Mutex<Option<String>>,
}

impl HeadlessFramework {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next [`attach`](DisplayFramework::attach) fail with `message`.
    pub fn fail_next_attach(&self, message: impl Into<String>) {
        *lock_unpoisoned(&self.fail_next_attach) = Some(message.into());
    }

    pub fn is_attached(&self, index: u32) -> bool {
        lock_unpoisoned(&self.devices).contains_key(&index)
    }

    /// The request a device was attached with.
    pub fn attach_request(&self, index: u32) -> Option<AttachRequest> {
        lock_unpoisoned(&self.devices)
            .get(&index)
            .map(|device| device.request.clone())
    }

    pub fn is_enabled(&self, index: u32) -> bool {
        lock_unpoisoned(&self.devices)
            .get(&index)
            .is_some_and(|device| device.enabled)
    }

    fn pipeline(&self, index: u32) -> RelayResult<Pipeline> {
        lock_unpoisoned(&self.devices)
            .get(&index)
            .map(|device| device.pipeline.clone())
            .ok_or(RelayError::NotInitialized)
    }

    /// Take an open reference on the device, released when the returned
    /// guard drops. Teardown after a consumer disconnect waits for all of
    /// them.
    pub fn acquire(self: &Arc<Self>, index: u32) -> RelayResult<DisplayRef> {
        let mut devices = lock_unpoisoned(&self.devices);
        let device = devices.get_mut(&index).ok_or(RelayError::NotInitialized)?;
        device.open += 1;
        Ok(DisplayRef {
            framework: Arc::clone(self),
            index,
        })
    }

    fn release(&self, index: u32) {
        let mut devices = lock_unpoisoned(&self.devices);
        if let Some(device) = devices.get_mut(&index) {
            device.open = device.open.saturating_sub(1);
        }
        self.released.notify_all();
    }

    /// Turn the output on. Returns the consumer's reply code.
    pub fn enable(&self, index: u32) -> RelayResult<i32> {
        let pipeline = {
            let mut devices = lock_unpoisoned(&self.devices);
            let device = devices.get_mut(&index).ok_or(RelayError::NotInitialized)?;
            device.enabled = true;
            device.pipeline.clone()
        };
        pipeline.enable()
    }

    pub fn disable(&self, index: u32) -> RelayResult<i32> {
        let pipeline = {
            let mut devices = lock_unpoisoned(&self.devices);
            let device = devices.get_mut(&index).ok_or(RelayError::NotInitialized)?;
            device.enabled = false;
            device.pipeline.clone()
        };
        pipeline.disable()
    }

    /// Allocate a zeroed surface and announce it to the device.
    pub fn create_surface(
        &self,
        index: u32,
        width: u16,
        height: u16,
        format: PixelFormat,
    ) -> RelayResult<Arc<HeadlessSurface>> {
        let pipeline = self.pipeline(index)?;
        let id = SurfaceId(self.next_surface_id.fetch_add(1, Ordering::Relaxed) + 1);
        let surface = Arc::new(HeadlessSurface::new(id, width, height, format));
        let handle: Arc<dyn Surface> = surface.clone();
        pipeline.surface_created(&handle)?;
        Ok(surface)
    }

    /// A surface the device is not told about, like a console buffer
    /// allocated inside the framework.
    pub fn create_internal_surface(
        &self,
        width: u16,
        height: u16,
        format: PixelFormat,
    ) -> Arc<HeadlessSurface> {
        let id = SurfaceId(self.next_surface_id.fetch_add(1, Ordering::Relaxed) + 1);
        Arc::new(HeadlessSurface::new(id, width, height, format))
    }

    pub fn destroy_surface(&self, index: u32, surface: &Arc<HeadlessSurface>) -> RelayResult<i32> {
        let handle: Arc<dyn Surface> = surface.clone();
        self.pipeline(index)?.surface_destroyed(&handle)
    }

    /// Scan `surface` out on the primary plane. `None` unsets the framebuffer.
    pub fn set_plane(&self, index: u32, surface: Option<&Arc<HeadlessSurface>>) -> RelayResult<()> {
        let handle = surface.map(|surface| -> Arc<dyn Surface> { surface.clone() });
        self.pipeline(index)?.plane_update(handle)
    }

    pub fn flush(
        &self,
        index: u32,
        surface: &Arc<HeadlessSurface>,
        flags: DirtyFlags,
        color: u32,
        clips: &[ClipRect],
    ) -> RelayResult<i32> {
        let handle: Arc<dyn Surface> = surface.clone();
        self.pipeline(index)?
            .surface_dirty(&handle, flags, color, clips)
    }
}

impl DisplayFramework for HeadlessFramework {
    fn attach(&self, pipeline: Pipeline, request: &AttachRequest) -> RelayResult<u32> {
        if let Some(message) = lock_unpoisoned(&self.fail_next_attach).take() {
            return Err(RelayError::Platform(anyhow::anyhow!(message)));
        }
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        lock_unpoisoned(&self.devices).insert(
            index,
            HeadlessDevice {
                pipeline,
                request: request.clone(),
                enabled: false,
                open: 0,
            },
        );
        tracing::debug!("headless: attached {:?} as device {index}", request.name);
        Ok(index)
    }

    fn force_disable_all(&self, index: u32) {
        let pipeline = {
            let mut devices = lock_unpoisoned(&self.devices);
            match devices.get_mut(&index) {
                Some(device) if device.enabled => {
                    device.enabled = false;
                    Some(device.pipeline.clone())
                }
                _ => None,
            }
        };
        if let Some(pipeline) = pipeline {
            if let Err(err) = pipeline.disable() {
                tracing::debug!("headless: disable of device {index} not acknowledged: {err}");
            }
        }
    }

    fn detach(&self, index: u32) {
        lock_unpoisoned(&self.devices).remove(&index);
        self.released.notify_all();
    }

    fn open_count(&self, index: u32) -> usize {
        lock_unpoisoned(&self.devices)
            .get(&index)
            .map_or(0, |device| device.open)
    }

    fn wait_released(&self, index: u32, _poll_interval: Duration) {
        let devices = lock_unpoisoned(&self.devices);
        let _devices = self
            .released
            .wait_while(devices, |devices| {
                devices.get(&index).is_some_and(|device| device.open > 0)
            })
            .unwrap_or_else(PoisonError::into_inner);
    }
}

/// An open reference on a headless device.
pub struct DisplayRef {
    framework: Arc<HeadlessFramework>,
    index: u32,
}

impl DisplayRef {
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl Drop for DisplayRef {
    fn drop(&mut self) {
        self.framework.release(self.index);
    }
}

/// A surface backed by a heap buffer with a packed pitch.
pub struct HeadlessSurface {
    id: SurfaceId,
    geometry: SurfaceGeometry,
    pixels: RwLock<Vec<u8>>,
    cpu_access: AtomicUsize,
    cpu_access_total: AtomicUsize,
    fail_cpu_access: AtomicBool,
}

impl HeadlessSurface {
    pub fn new(id: SurfaceId, width: u16, height: u16, format: PixelFormat) -> Self {
        let geometry = SurfaceGeometry::packed(width, height, format);
        let len = geometry.pitch * usize::from(height);
        Self {
            id,
            geometry,
            pixels: RwLock::new(vec![0; len]),
            cpu_access: AtomicUsize::new(0),
            cpu_access_total: AtomicUsize::new(0),
            fail_cpu_access: AtomicBool::new(false),
        }
    }

    pub fn write_pixels<R>(&self, writer: impl FnOnce(&mut [u8]) -> R) -> R {
        writer(&mut write_unpoisoned(&self.pixels))
    }

    pub fn fill(&self, value: u8) {
        self.write_pixels(|pixels| pixels.fill(value));
    }

    /// Number of currently open CPU access scopes.
    pub fn cpu_access_depth(&self) -> usize {
        self.cpu_access.load(Ordering::Acquire)
    }

    pub fn cpu_access_count(&self) -> usize {
        self.cpu_access_total.load(Ordering::Acquire)
    }

    /// Make `begin_cpu_access` fail, as an unmappable import would.
    pub fn set_fail_cpu_access(&self, fail: bool) {
        self.fail_cpu_access.store(fail, Ordering::Release);
    }
}

impl Surface for HeadlessSurface {
    fn id(&self) -> SurfaceId {
        self.id
    }

    fn geometry(&self) -> SurfaceGeometry {
        self.geometry
    }

    fn begin_cpu_access(&self) -> RelayResult<()> {
        if self.fail_cpu_access.load(Ordering::Acquire) {
            return Err(RelayError::Platform(anyhow::anyhow!(
                "surface {} cannot be mapped",
                self.id
            )));
        }
        self.cpu_access.fetch_add(1, Ordering::AcqRel);
        self.cpu_access_total.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn end_cpu_access(&self) {
        self.cpu_access.fetch_sub(1, Ordering::AcqRel);
    }

    fn with_pixels(&self, reader: &mut dyn FnMut(&[u8]) -> RelayResult<()>) -> RelayResult<()> {
        if self.cpu_access_depth() == 0 {
            return Err(RelayError::InvalidArgument(format!(
                "surface {} read outside CPU access",
                self.id
            )));
        }
        reader(&read_unpoisoned(&self.pixels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::CpuAccessGuard;

    #[test]
    fn references_are_counted_and_released() -> RelayResult<()> {
        let framework = HeadlessFramework::new();
        let index = framework.attach(
            Pipeline::detached(),
            &AttachRequest {
                name: "test".into(),
                mode: crate::framework::DisplayMode::fixed(8, 8),
                formats: vec![PixelFormat::Rgb565],
                preferred_depth: 16,
            },
        )?;
        let first = framework.acquire(index)?;
        let second = framework.acquire(index)?;
        assert_eq!(framework.open_count(index), 2);
        drop(first);
        assert_eq!(framework.open_count(index), 1);

        let waiter = {
            let framework = framework.clone();
            std::thread::spawn(move || framework.wait_released(index, Duration::from_secs(60)))
        };
        std::thread::sleep(Duration::from_millis(20));
        drop(second);
        waiter
            .join()
            .map_err(|_| RelayError::Platform(anyhow::anyhow!("waiter panicked")))?;
        assert_eq!(framework.open_count(index), 0);
        Ok(())
    }

    #[test]
    fn acquire_on_unknown_device_fails() {
        let framework = HeadlessFramework::new();
        assert!(matches!(
            framework.acquire(42),
            Err(RelayError::NotInitialized)
        ));
    }

    #[test]
    fn pixels_need_cpu_access() -> RelayResult<()> {
        let surface = HeadlessSurface::new(SurfaceId(1), 2, 2, PixelFormat::Rgb565);
        surface.fill(0x5A);
        assert!(surface.with_pixels(&mut |_| Ok(())).is_err());

        {
            let guard = CpuAccessGuard::begin(&surface)?;
            assert_eq!(surface.cpu_access_depth(), 1);
            guard.with_pixels(&mut |pixels| {
                assert!(pixels.iter().all(|byte| *byte == 0x5A));
                Ok(())
            })?;
        }
        assert_eq!(surface.cpu_access_depth(), 0);
        assert_eq!(surface.cpu_access_count(), 1);
        Ok(())
    }
}
