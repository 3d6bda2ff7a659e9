use std::fmt;
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError, RwLock, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use rustc_hash::FxHashMap;

use crate::convert::{BufferMode, TranscodeMode, transcode_rect};
use crate::env_config::{
    DRAIN_POLL_ENV, FULL_WIDTH_FLUSH_ENV, REPLY_TIMEOUT_ENV, env_var_millis_or, env_var_truthy,
};
use crate::error::{RelayError, RelayResult};
use crate::event::Event;
use crate::framework::{
    AttachRequest, CpuAccessGuard, DisplayFramework, DisplayMode, PixelFormat, Surface,
};
use crate::mailbox::Mailbox;
use crate::region::{ClipRect, DirtyFlags, merge_clips};
use crate::registry::SurfaceRegistry;
use crate::worker::{FlushJob, FlushWorker, spawn_release_task};
use crate::{lock_unpoisoned, read_unpoisoned, write_unpoisoned};

/// Device names must be shorter than this many bytes.
pub const MAX_NAME_LEN: usize = 80;

const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(5_000);
const DEFAULT_DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(1_000);

/// Registered devices by framework index.
pub(crate) type DeviceTable = Mutex<FxHashMap<u32, Device>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelayConfig {
    /// How long a pipeline callback waits for the consumer's reply.
    pub reply_timeout: Duration,
    /// Poll interval used while waiting for framework references to drop,
    /// for frameworks that cannot signal it.
    pub drain_poll_interval: Duration,
    /// Widen every flushed rectangle to whole rows.
    pub full_width_flush: bool,
}

impl RelayConfig {
    /// Defaults, overridden by `SNOW_RELAY_REPLY_TIMEOUT_MS`,
    /// `SNOW_RELAY_DRAIN_POLL_MS` and `SNOW_RELAY_FULL_WIDTH_FLUSH`.
    pub fn from_env() -> Self {
        Self {
            reply_timeout: env_var_millis_or(REPLY_TIMEOUT_ENV, DEFAULT_REPLY_TIMEOUT),
            drain_poll_interval: env_var_millis_or(DRAIN_POLL_ENV, DEFAULT_DRAIN_POLL_INTERVAL),
            full_width_flush: env_var_truthy(FULL_WIDTH_FLUSH_ENV),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Created,
    Registering,
    Active,
    /// The consumer is gone; waiting for framework references to drop.
    Draining,
    Destroyed,
}

#[derive(Clone, Debug)]
pub struct DeviceCreateRequest {
    pub name: String,
    pub mode: DisplayMode,
    /// Supported formats, preferred first.
    pub formats: Vec<PixelFormat>,
    pub buffer_mode: BufferMode,
}

impl DeviceCreateRequest {
    pub fn new(name: impl Into<String>, mode: DisplayMode, formats: Vec<PixelFormat>) -> Self {
        Self {
            name: name.into(),
            mode,
            formats,
            buffer_mode: BufferMode::empty(),
        }
    }

    pub fn with_buffer_mode(mut self, buffer_mode: BufferMode) -> Self {
        self.buffer_mode = buffer_mode;
        self
    }
}

#[derive(Clone, Debug)]
pub struct DeviceRegistration {
    pub index: u32,
    /// Present when a buffer mode was requested.
    pub buffer: Option<SideBufferHandle>,
}

/// Controller-owned transcode destination. Only written under the
/// pipeline lock.
pub(crate) struct SideBuffer {
    bytes: Arc<RwLock<Vec<u8>>>,
    mode: TranscodeMode,
    width: u16,
    height: u16,
    pitch: usize,
    format: PixelFormat,
}

impl SideBuffer {
    fn allocate(
        mode: TranscodeMode,
        native: PixelFormat,
        width: u16,
        height: u16,
    ) -> RelayResult<Self> {
        let format = mode.output_format(native);
        let pitch = usize::from(width) * format.bytes_per_pixel();
        let len = pitch
            .checked_mul(usize::from(height))
            .ok_or_else(|| RelayError::ResourceExhausted("side buffer size overflows".into()))?;

        let mut bytes = Vec::new();
        bytes.try_reserve_exact(len).map_err(|e| {
            RelayError::ResourceExhausted(format!("side buffer of {len} bytes: {e}"))
        })?;
        bytes.resize(len, 0);

        Ok(Self {
            bytes: Arc::new(RwLock::new(bytes)),
            mode,
            width,
            height,
            pitch,
            format,
        })
    }

    fn handle(&self) -> SideBufferHandle {
        SideBufferHandle {
            bytes: Arc::clone(&self.bytes),
            width: self.width,
            height: self.height,
            pitch: self.pitch,
            format: self.format,
        }
    }

    fn transcode_from(&self, surface: &dyn Surface, clip: ClipRect) -> RelayResult<()> {
        let geometry = surface.geometry();
        let access = CpuAccessGuard::begin(surface)?;
        let mut bytes = write_unpoisoned(&self.bytes);
        access.with_pixels(&mut |src| {
            transcode_rect(self.mode, src, &geometry, &mut bytes, self.pitch, clip)
        })
    }
}

/// Read-only view of a device's side buffer, shared with the consumer.
#[derive(Clone)]
pub struct SideBufferHandle {
    bytes: Arc<RwLock<Vec<u8>>>,
    width: u16,
    height: u16,
    pitch: usize,
    format: PixelFormat,
}

impl SideBufferHandle {
    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    pub fn pitch(&self) -> usize {
        self.pitch
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn len(&self) -> usize {
        read_unpoisoned(&self.bytes).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `reader` over the buffer while holding off writers.
    pub fn read<R>(&self, reader: impl FnOnce(&[u8]) -> R) -> R {
        reader(&read_unpoisoned(&self.bytes))
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.read(<[u8]>::to_vec)
    }
}

impl fmt::Debug for SideBufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SideBufferHandle")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pitch", &self.pitch)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

struct Lifecycle {
    state: DeviceState,
    unregistering: bool,
    buffer: Option<SideBufferHandle>,
    flush_worker: Option<FlushWorker>,
    release_task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct PipelineState {
    /// The output was enabled by the framework.
    prepared: bool,
    /// At least one flush went out since enable.
    enabled: bool,
    plane: Option<Arc<dyn Surface>>,
    side_buffer: Option<SideBuffer>,
}

fn same_surface(a: &Arc<dyn Surface>, b: &Arc<dyn Surface>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

pub(crate) struct DeviceShared {
    framework: Arc<dyn DisplayFramework>,
    config: RelayConfig,
    mailbox: Mailbox,
    registry: SurfaceRegistry,
    index: OnceLock<u32>,
    lifecycle: Mutex<Lifecycle>,
    state_changed: Condvar,
    /// Serializes pipeline callbacks and guards the side buffer.
    pipeline: Mutex<PipelineState>,
    table: Weak<DeviceTable>,
}

impl DeviceShared {
    fn label(&self) -> String {
        self.index
            .get()
            .map_or_else(|| "(unregistered)".to_string(), u32::to_string)
    }

    fn set_state(&self, lifecycle: &mut Lifecycle, state: DeviceState) {
        tracing::debug!("device {}: {:?} -> {state:?}", self.label(), lifecycle.state);
        lifecycle.state = state;
        self.state_changed.notify_all();
    }

    fn submit(&self, event: Event) -> RelayResult<i32> {
        let event_type = event.event_type();
        self.mailbox.submit(event).inspect_err(|err| {
            tracing::warn!("device {}: {event_type:?} not delivered: {err}", self.label());
        })
    }

    fn register(self: &Arc<Self>, request: DeviceCreateRequest) -> RelayResult<DeviceRegistration> {
        {
            let mut lifecycle = lock_unpoisoned(&self.lifecycle);
            match lifecycle.state {
                DeviceState::Created => {}
                DeviceState::Registering | DeviceState::Active => {
                    return Err(RelayError::InvalidArgument(
                        "device is already registered".into(),
                    ));
                }
                DeviceState::Draining | DeviceState::Destroyed => {
                    return Err(RelayError::NotInitialized);
                }
            }
            self.set_state(&mut lifecycle, DeviceState::Registering);
        }

        let result = self.try_register(request);
        let mut lifecycle = lock_unpoisoned(&self.lifecycle);
        match result {
            Ok(registration) => {
                lifecycle.buffer = registration.buffer.clone();
                self.set_state(&mut lifecycle, DeviceState::Active);
                tracing::info!("device {}: registered", registration.index);
                Ok(registration)
            }
            Err(err) => {
                self.set_state(&mut lifecycle, DeviceState::Created);
                tracing::warn!("device registration failed: {err}");
                Err(err)
            }
        }
    }

    fn try_register(self: &Arc<Self>, request: DeviceCreateRequest) -> RelayResult<DeviceRegistration> {
        let DeviceCreateRequest {
            name,
            mode,
            mut formats,
            buffer_mode,
        } = request;

        if name.len() >= MAX_NAME_LEN {
            return Err(RelayError::InvalidArgument(format!(
                "device name must be shorter than {MAX_NAME_LEN} bytes"
            )));
        }
        mode.validate()?;
        let native = *formats.first().ok_or_else(|| {
            RelayError::InvalidArgument("at least one pixel format is required".into())
        })?;
        let transcode = TranscodeMode::from_buffer_mode(buffer_mode)?;
        if buffer_mode.contains(BufferMode::EMULATE_XRGB8888)
            && !formats.contains(&PixelFormat::Xrgb8888)
        {
            formats.push(PixelFormat::Xrgb8888);
        }

        let side_buffer = transcode
            .map(|transcode| SideBuffer::allocate(transcode, native, mode.width(), mode.height()))
            .transpose()?;
        let buffer = side_buffer.as_ref().map(SideBuffer::handle);

        let worker = {
            let device = Arc::downgrade(self);
            FlushWorker::start("snow-relay-flush".into(), move |job| {
                if let Some(device) = device.upgrade() {
                    device.run_flush_job(job);
                }
            })?
        };
        lock_unpoisoned(&self.lifecycle).flush_worker = Some(worker);
        *lock_unpoisoned(&self.pipeline) = PipelineState {
            side_buffer,
            ..PipelineState::default()
        };
        self.mailbox.set_active(true);

        let attach = AttachRequest {
            name,
            mode,
            formats,
            preferred_depth: native.depth(),
        };
        let pipeline = Pipeline {
            shared: Arc::downgrade(self),
        };
        let index = match self.framework.attach(pipeline, &attach) {
            Ok(index) => index,
            Err(err) => {
                self.mailbox.set_active(false);
                let worker = lock_unpoisoned(&self.lifecycle).flush_worker.take();
                if let Some(worker) = worker {
                    worker.cancel();
                }
                *lock_unpoisoned(&self.pipeline) = PipelineState::default();
                self.registry.drain_leftovers();
                return Err(err);
            }
        };

        let _ = self.index.set(index);
        if let Some(table) = self.table.upgrade() {
            lock_unpoisoned(&table).insert(
                index,
                Device {
                    shared: Arc::clone(self),
                },
            );
        }
        Ok(DeviceRegistration { index, buffer })
    }

    fn unregister(&self) -> RelayResult<()> {
        let index = {
            let mut lifecycle = lock_unpoisoned(&self.lifecycle);
            let index = match (lifecycle.state, self.index.get()) {
                (DeviceState::Active | DeviceState::Draining, Some(index))
                    if !lifecycle.unregistering =>
                {
                    *index
                }
                _ => return Err(RelayError::NotInitialized),
            };
            lifecycle.unregistering = true;
            index
        };
        tracing::info!("device {index}: unregistering");

        // Turning the outputs off may still deliver a final PipeDisable.
        self.framework.force_disable_all(index);

        let worker = lock_unpoisoned(&self.lifecycle).flush_worker.take();
        if let Some(worker) = worker {
            worker.cancel();
        }
        self.framework.detach(index);
        self.mailbox.close();
        self.registry.drain_leftovers();
        *lock_unpoisoned(&self.pipeline) = PipelineState::default();

        if let Some(table) = self.table.upgrade() {
            let removed = lock_unpoisoned(&table).remove(&index);
            drop(removed);
        }

        let mut lifecycle = lock_unpoisoned(&self.lifecycle);
        lifecycle.buffer = None;
        self.set_state(&mut lifecycle, DeviceState::Destroyed);
        Ok(())
    }

    fn close(self: &Arc<Self>) {
        let lifecycle = lock_unpoisoned(&self.lifecycle);
        let mut lifecycle = self
            .state_changed
            .wait_while(lifecycle, |lifecycle| {
                lifecycle.state == DeviceState::Registering
            })
            .unwrap_or_else(PoisonError::into_inner);

        match lifecycle.state {
            DeviceState::Created => {
                self.set_state(&mut lifecycle, DeviceState::Destroyed);
                drop(lifecycle);
                self.mailbox.close();
            }
            DeviceState::Active => {
                self.set_state(&mut lifecycle, DeviceState::Draining);
                drop(lifecycle);
                self.mailbox.close();
                self.start_release_task();
            }
            DeviceState::Registering | DeviceState::Draining | DeviceState::Destroyed => {}
        }
    }

    fn start_release_task(self: &Arc<Self>) {
        let Some(index) = self.index.get().copied() else {
            return;
        };
        let device = Arc::clone(self);
        let task = spawn_release_task(format!("snow-relay-release-{index}"), move || {
            device
                .framework
                .wait_released(index, device.config.drain_poll_interval);
            match device.unregister() {
                Ok(()) => {}
                Err(RelayError::NotInitialized) => {
                    tracing::debug!("device {index}: already torn down");
                }
                Err(err) => {
                    tracing::warn!("device {index}: teardown after disconnect failed: {err}");
                }
            }
        });
        match task {
            Ok(handle) => lock_unpoisoned(&self.lifecycle).release_task = Some(handle),
            Err(err) => {
                tracing::error!("device {index}: {err}, tearing down inline");
                self.framework
                    .wait_released(index, self.config.drain_poll_interval);
                let _ = self.unregister();
            }
        }
    }

    fn run_flush_job(&self, job: FlushJob) {
        match job {
            FlushJob::FullFrame => {
                let plane = lock_unpoisoned(&self.pipeline).plane.clone();
                if let Some(surface) = plane {
                    if let Err(err) = self.surface_dirty(&surface, DirtyFlags::empty(), 0, &[]) {
                        tracing::debug!("device {}: full-frame flush skipped: {err}", self.label());
                    }
                }
            }
        }
    }

    fn pipe_enable(&self) -> RelayResult<i32> {
        let mut pipeline = lock_unpoisoned(&self.pipeline);
        pipeline.prepared = true;
        self.submit(Event::PipeEnable)
    }

    fn pipe_disable(&self) -> RelayResult<i32> {
        let mut pipeline = lock_unpoisoned(&self.pipeline);
        pipeline.prepared = false;
        pipeline.enabled = false;
        self.submit(Event::PipeDisable)
    }

    /// Unsetting the plane keeps the last scanned-out surface, so late
    /// flushes to it still go through.
    fn plane_update(&self, surface: Option<Arc<dyn Surface>>) -> RelayResult<()> {
        let Some(surface) = surface else {
            return Ok(());
        };
        {
            let mut pipeline = lock_unpoisoned(&self.pipeline);
            if pipeline
                .plane
                .as_ref()
                .is_some_and(|current| same_surface(current, &surface))
            {
                return Ok(());
            }
            pipeline.plane = Some(surface);
        }
        match lock_unpoisoned(&self.lifecycle).flush_worker.as_ref() {
            Some(worker) => worker.queue(FlushJob::FullFrame),
            None => Err(RelayError::NotInitialized),
        }
    }

    fn surface_created(&self, surface: &Arc<dyn Surface>) -> RelayResult<i32> {
        let _pipeline = lock_unpoisoned(&self.pipeline);
        let id = surface.id();
        self.registry.record(id, surface).inspect_err(|err| {
            tracing::error!("device {}: {err}", self.label());
        })?;
        self.submit(Event::SurfaceCreated { id })
    }

    fn surface_destroyed(&self, surface: &Arc<dyn Surface>) -> RelayResult<i32> {
        let mut pipeline = lock_unpoisoned(&self.pipeline);
        let Some(id) = self.registry.lookup_id_for(surface) else {
            tracing::error!(
                "device {}: destroyed surface {} was never recorded",
                self.label(),
                surface.id()
            );
            return Err(RelayError::InvalidArgument(format!(
                "surface {} is not registered",
                surface.id()
            )));
        };
        self.registry.remove(id);
        if pipeline
            .plane
            .as_ref()
            .is_some_and(|plane| same_surface(plane, surface))
        {
            pipeline.plane = None;
        }
        self.submit(Event::SurfaceDestroyed { id })
    }

    fn surface_dirty(
        &self,
        surface: &Arc<dyn Surface>,
        flags: DirtyFlags,
        color: u32,
        clips: &[ClipRect],
    ) -> RelayResult<i32> {
        let mut pipeline = lock_unpoisoned(&self.pipeline);
        if !pipeline.prepared {
            return Err(RelayError::InvalidArgument("output is not enabled".into()));
        }
        if !pipeline
            .plane
            .as_ref()
            .is_some_and(|plane| same_surface(plane, surface))
        {
            return Err(RelayError::InvalidArgument(format!(
                "surface {} is not on the plane",
                surface.id()
            )));
        }

        let id = match self.registry.lookup_id_for(surface) {
            Some(id) => id,
            None => {
                // Surfaces allocated inside the framework are never
                // announced through the create callback.
                let id = surface.id();
                self.registry.record(id, surface)?;
                self.submit(Event::SurfaceCreated { id })?;
                id
            }
        };

        // Flushes cover everything until one after enable has been copied.
        let clips: &[ClipRect] = if pipeline.enabled { clips } else { &[] };

        let geometry = surface.geometry();
        let mut clip = merge_clips(clips, flags, geometry.width, geometry.height);
        if self.config.full_width_flush {
            clip = clip.full_width(geometry.width);
        }

        if let Some(buffer) = pipeline.side_buffer.as_ref() {
            buffer
                .transcode_from(surface.as_ref(), clip)
                .inspect_err(|err| {
                    tracing::warn!(
                        "device {}: skipping flush of surface {id}: {err}",
                        self.label()
                    );
                })?;
        }
        pipeline.enabled = true;

        tracing::debug!(
            "device {}: flushing surface {id} x1={} x2={} y1={} y2={}",
            self.label(),
            clip.x1,
            clip.x2,
            clip.y1,
            clip.y2
        );
        self.submit(Event::SurfaceDirty {
            id,
            flags,
            color,
            clips: vec![clip],
        })
    }
}

/// Callback handle given to the display framework at attach time.
///
/// Holds only a weak reference: callbacks arriving after the device is
/// gone fail with [`RelayError::NotInitialized`].
#[derive(Clone)]
pub struct Pipeline {
    shared: Weak<DeviceShared>,
}

impl Pipeline {
    /// A handle bound to no device.
    pub fn detached() -> Self {
        Self {
            shared: Weak::new(),
        }
    }

    fn device(&self) -> RelayResult<Arc<DeviceShared>> {
        self.shared.upgrade().ok_or(RelayError::NotInitialized)
    }

    pub fn enable(&self) -> RelayResult<i32> {
        self.device()?.pipe_enable()
    }

    pub fn disable(&self) -> RelayResult<i32> {
        self.device()?.pipe_disable()
    }

    /// The framework scanned out `surface` (or nothing) on the primary plane.
    pub fn plane_update(&self, surface: Option<Arc<dyn Surface>>) -> RelayResult<()> {
        self.device()?.plane_update(surface)
    }

    pub fn surface_created(&self, surface: &Arc<dyn Surface>) -> RelayResult<i32> {
        self.device()?.surface_created(surface)
    }

    pub fn surface_destroyed(&self, surface: &Arc<dyn Surface>) -> RelayResult<i32> {
        self.device()?.surface_destroyed(surface)
    }

    pub fn surface_dirty(
        &self,
        surface: &Arc<dyn Surface>,
        flags: DirtyFlags,
        color: u32,
        clips: &[ClipRect],
    ) -> RelayResult<i32> {
        self.device()?.surface_dirty(surface, flags, color, clips)
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let index = self.shared.upgrade().and_then(|shared| shared.index.get().copied());
        f.debug_struct("Pipeline").field("index", &index).finish()
    }
}

/// One display device driven by one consumer.
///
/// Cloning yields another handle to the same instance.
#[derive(Clone)]
pub struct Device {
    shared: Arc<DeviceShared>,
}

impl Device {
    pub fn new(framework: Arc<dyn DisplayFramework>, config: RelayConfig) -> Self {
        Self::with_table(framework, config, Weak::new())
    }

    pub(crate) fn with_table(
        framework: Arc<dyn DisplayFramework>,
        config: RelayConfig,
        table: Weak<DeviceTable>,
    ) -> Self {
        Self {
            shared: Arc::new(DeviceShared {
                framework,
                mailbox: Mailbox::new(config.reply_timeout),
                config,
                registry: SurfaceRegistry::new(),
                index: OnceLock::new(),
                lifecycle: Mutex::new(Lifecycle {
                    state: DeviceState::Created,
                    unregistering: false,
                    buffer: None,
                    flush_worker: None,
                    release_task: None,
                }),
                state_changed: Condvar::new(),
                pipeline: Mutex::new(PipelineState::default()),
                table,
            }),
        }
    }

    /// Validate `request`, attach to the framework and become active.
    ///
    /// On failure everything set up so far is undone and the device is
    /// back in [`DeviceState::Created`].
    pub fn register(&self, request: DeviceCreateRequest) -> RelayResult<DeviceRegistration> {
        self.shared.register(request)
    }

    /// Force outputs off, stop background work, detach and destroy.
    pub fn unregister(&self) -> RelayResult<()> {
        self.shared.unregister()
    }

    /// The consumer went away. An active device drains in the background
    /// and is destroyed once the framework holds no more references.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn state(&self) -> DeviceState {
        lock_unpoisoned(&self.shared.lifecycle).state
    }

    /// Block until the device reaches `state` or `timeout` passes.
    pub fn wait_for_state(&self, state: DeviceState, timeout: Duration) -> bool {
        let lifecycle = lock_unpoisoned(&self.shared.lifecycle);
        let (lifecycle, _) = self
            .shared
            .state_changed
            .wait_timeout_while(lifecycle, timeout, |lifecycle| lifecycle.state != state)
            .unwrap_or_else(PoisonError::into_inner);
        lifecycle.state == state
    }

    /// Framework index, once registered.
    pub fn index(&self) -> Option<u32> {
        self.shared.index.get().copied()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.shared.config
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.shared.mailbox
    }

    pub fn pipeline(&self) -> Pipeline {
        Pipeline {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn side_buffer(&self) -> Option<SideBufferHandle> {
        lock_unpoisoned(&self.shared.lifecycle).buffer.clone()
    }

    pub fn pipe_enable(&self) -> RelayResult<i32> {
        self.shared.pipe_enable()
    }

    pub fn pipe_disable(&self) -> RelayResult<i32> {
        self.shared.pipe_disable()
    }

    pub fn plane_update(&self, surface: Option<Arc<dyn Surface>>) -> RelayResult<()> {
        self.shared.plane_update(surface)
    }

    pub fn surface_created(&self, surface: &Arc<dyn Surface>) -> RelayResult<i32> {
        self.shared.surface_created(surface)
    }

    pub fn surface_destroyed(&self, surface: &Arc<dyn Surface>) -> RelayResult<i32> {
        self.shared.surface_destroyed(surface)
    }

    pub fn surface_dirty(
        &self,
        surface: &Arc<dyn Surface>,
        flags: DirtyFlags,
        color: u32,
        clips: &[ClipRect],
    ) -> RelayResult<i32> {
        self.shared.surface_dirty(surface, flags, color, clips)
    }

    /// Wait for a background release task started by [`close`](Self::close).
    pub(crate) fn join_release_task(&self) {
        let task = lock_unpoisoned(&self.shared.lifecycle).release_task.take();
        if let Some(task) = task {
            if task.thread().id() != std::thread::current().id() {
                let _ = task.join();
            }
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("index", &self.index())
            .field("state", &self.state())
            .finish()
    }
}
