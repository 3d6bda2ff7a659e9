//! Consumer-facing boundary.
//!
//! A [`RelayHub`] is the process-wide table of registered devices. Each
//! [`RelayHub::open`] creates a fresh device instance behind a
//! [`ChannelEndpoint`], which the consumer reads encoded events from and
//! writes reply codes to.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rustc_hash::FxHashMap;

use crate::device::{
    Device, DeviceCreateRequest, DeviceRegistration, DeviceState, DeviceTable, RelayConfig,
};
use crate::error::{RelayError, RelayResult};
use crate::event::Event;
use crate::framework::DisplayFramework;
use crate::lock_unpoisoned;

pub struct RelayHubBuilder {
    config: RelayConfig,
}

impl RelayHubBuilder {
    pub fn new() -> Self {
        Self {
            config: RelayConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    /// How long pipeline callbacks wait for a reply.
    pub fn reply_timeout(mut self, reply_timeout: Duration) -> Self {
        self.config.reply_timeout = reply_timeout;
        self
    }

    pub fn drain_poll_interval(mut self, interval: Duration) -> Self {
        self.config.drain_poll_interval = interval;
        self
    }

    /// Widen every flushed rectangle to whole rows.
    pub fn full_width_flush(mut self, enabled: bool) -> Self {
        self.config.full_width_flush = enabled;
        self
    }

    pub fn build(self, framework: Arc<dyn DisplayFramework>) -> RelayHub {
        // Spin up the transcode pool before the first large flush needs it.
        crate::convert::warmup();
        RelayHub {
            framework,
            config: self.config,
            table: Arc::new(DeviceTable::new(FxHashMap::default())),
            shut_down: AtomicBool::new(false),
        }
    }
}

impl Default for RelayHubBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RelayHub {
    framework: Arc<dyn DisplayFramework>,
    config: RelayConfig,
    table: Arc<DeviceTable>,
    shut_down: AtomicBool,
}

impl RelayHub {
    pub fn builder() -> RelayHubBuilder {
        RelayHubBuilder::new()
    }

    /// A hub with configuration taken from the environment.
    pub fn new(framework: Arc<dyn DisplayFramework>) -> Self {
        RelayHubBuilder::new().build(framework)
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Open a channel backed by a new, unregistered device.
    pub fn open(&self) -> RelayResult<ChannelEndpoint> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(RelayError::NotInitialized);
        }
        let device = Device::with_table(
            Arc::clone(&self.framework),
            self.config,
            Arc::downgrade(&self.table),
        );
        Ok(ChannelEndpoint {
            device,
            nonblocking: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// The registered device with framework index `index`.
    pub fn device(&self, index: u32) -> Option<Device> {
        lock_unpoisoned(&self.table).get(&index).cloned()
    }

    pub fn device_count(&self) -> usize {
        lock_unpoisoned(&self.table).len()
    }

    /// Unregister every device and refuse further opens.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let devices: Vec<Device> = lock_unpoisoned(&self.table).values().cloned().collect();
        for device in devices {
            match device.unregister() {
                Ok(()) => {}
                // Already being torn down by its release task.
                Err(RelayError::NotInitialized) => {}
                Err(err) => {
                    tracing::warn!("hub shutdown: device {:?}: {err}", device.index());
                }
            }
            device.join_release_task();
        }
        tracing::info!("relay hub shut down");
    }
}

impl Drop for RelayHub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Readiness {
    /// An undelivered event is queued.
    pub readable: bool,
    /// The device is gone; reads only drain what is left.
    pub hangup: bool,
}

/// The consumer's end of one device channel. Dropping it closes the
/// channel.
pub struct ChannelEndpoint {
    device: Device,
    nonblocking: AtomicBool,
    closed: AtomicBool,
}

impl ChannelEndpoint {
    pub fn set_nonblocking(&self, nonblocking: bool) {
        self.nonblocking.store(nonblocking, Ordering::Release);
    }

    fn ensure_open(&self) -> RelayResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RelayError::NotInitialized);
        }
        Ok(())
    }

    /// Copy the next encoded event into `buf` and return its length.
    ///
    /// An empty `buf` reads nothing. A `buf` shorter than the next event
    /// fails with [`RelayError::InvalidArgument`] and leaves the event
    /// queued.
    pub fn read(&self, buf: &mut [u8]) -> RelayResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.ensure_open()?;
        if self.device.state() == DeviceState::Created {
            return Err(RelayError::NotInitialized);
        }
        let event = self
            .device
            .mailbox()
            .take_within(buf.len(), !self.nonblocking.load(Ordering::Acquire))?;
        let encoded = event.encode();
        buf[..encoded.len()].copy_from_slice(&encoded);
        tracing::debug!("delivered {:?} ({} bytes)", event.event_type(), encoded.len());
        Ok(encoded.len())
    }

    /// Take the next event without going through its encoding.
    pub fn read_event(&self) -> RelayResult<Event> {
        self.ensure_open()?;
        if self.device.state() == DeviceState::Created {
            return Err(RelayError::NotInitialized);
        }
        self.device
            .mailbox()
            .take(!self.nonblocking.load(Ordering::Acquire))
    }

    /// Write one little-endian `i32` reply code. Returns the bytes consumed.
    pub fn write(&self, buf: &[u8]) -> RelayResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.ensure_open()?;
        if self.device.index().is_none() {
            return Err(RelayError::InvalidArgument(
                "no device registered on this channel".into(),
            ));
        }
        let code: [u8; 4] = buf.try_into().map_err(|_| {
            RelayError::InvalidArgument(format!(
                "reply must be exactly 4 bytes, got {}",
                buf.len()
            ))
        })?;
        self.device.mailbox().reply(i32::from_le_bytes(code));
        Ok(code.len())
    }

    /// Reply with `code`. Returns whether a submitter was still waiting.
    pub fn reply(&self, code: i32) -> RelayResult<bool> {
        self.ensure_open()?;
        if self.device.index().is_none() {
            return Err(RelayError::InvalidArgument(
                "no device registered on this channel".into(),
            ));
        }
        Ok(self.device.mailbox().reply(code))
    }

    pub fn poll(&self) -> Readiness {
        let mailbox = self.device.mailbox();
        Readiness {
            readable: mailbox.readiness(),
            hangup: self.closed.load(Ordering::Acquire) || mailbox.is_closed(),
        }
    }

    /// The control operation: register this channel's device.
    pub fn create_device(&self, request: DeviceCreateRequest) -> RelayResult<DeviceRegistration> {
        self.ensure_open()?;
        self.device.register(request)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("channel closed, device {:?}", self.device.index());
        self.device.close();
    }
}

impl Drop for ChannelEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

/// Async event source for tokio consumers.
///
/// A bridge thread performs the blocking reads and forwards events into a
/// `tokio::sync::mpsc` channel. Dropping the reader closes the channel.
#[cfg(feature = "tokio-stream")]
pub struct AsyncEventReader {
    endpoint: ChannelEndpoint,
    events: tokio::sync::mpsc::Receiver<Event>,
    _bridge_handle: Option<std::thread::JoinHandle<()>>,
}

#[cfg(feature = "tokio-stream")]
impl AsyncEventReader {
    pub fn new(endpoint: ChannelEndpoint) -> RelayResult<Self> {
        let (async_tx, async_rx) = tokio::sync::mpsc::channel::<Event>(32);
        let device = endpoint.device.clone();
        let bridge_handle = std::thread::Builder::new()
            .name("snow-relay-async-bridge".to_string())
            .spawn(move || {
                loop {
                    match device.mailbox().take(true) {
                        Ok(event) => {
                            if async_tx.blocking_send(event).is_err() {
                                break;
                            }
                        }
                        Err(RelayError::Cancelled) => break,
                        Err(err) => {
                            tracing::warn!("async bridge stopped: {err}");
                            break;
                        }
                    }
                }
            })
            .map_err(|e| {
                RelayError::Platform(anyhow::anyhow!("failed to spawn async bridge: {e}"))
            })?;

        Ok(Self {
            endpoint,
            events: async_rx,
            _bridge_handle: Some(bridge_handle),
        })
    }

    /// Next event, or `None` once the channel is closed and drained.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    pub fn reply(&self, code: i32) -> RelayResult<bool> {
        self.endpoint.reply(code)
    }

    pub fn endpoint(&self) -> &ChannelEndpoint {
        &self.endpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::BufferMode;
    use crate::framework::{DisplayMode, PixelFormat};
    use crate::headless::HeadlessFramework;
    use crate::region::{ClipRect, DirtyFlags};
    use std::thread;

    fn test_hub(framework: &Arc<HeadlessFramework>) -> RelayHub {
        RelayHub::builder()
            .reply_timeout(Duration::from_millis(2_000))
            .drain_poll_interval(Duration::from_millis(10))
            .full_width_flush(false)
            .build(framework.clone())
    }

    fn request() -> DeviceCreateRequest {
        DeviceCreateRequest::new("channel", DisplayMode::fixed(8, 4), vec![PixelFormat::Rgb565])
    }

    fn join<T>(handle: thread::JoinHandle<T>) -> RelayResult<T> {
        handle
            .join()
            .map_err(|_| RelayError::Platform(anyhow::anyhow!("thread panicked")))
    }

    #[test]
    fn read_and_reply_over_bytes() -> RelayResult<()> {
        let framework = HeadlessFramework::new();
        let hub = test_hub(&framework);
        let endpoint = hub.open()?;
        let index = endpoint.create_device(request())?.index;
        assert_eq!(hub.device_count(), 1);
        assert_eq!(hub.device(index).and_then(|device| device.index()), Some(index));

        let enabler = {
            let framework = framework.clone();
            thread::spawn(move || framework.enable(index))
        };
        let mut buf = [0u8; 64];
        let len = endpoint.read(&mut buf)?;
        assert_eq!(len, 8);
        assert_eq!(Event::decode(&buf[..len])?, Event::PipeEnable);
        assert_eq!(endpoint.write(&(-3i32).to_le_bytes())?, 4);
        assert_eq!(join(enabler)??, -3);
        Ok(())
    }

    #[test]
    fn short_read_buffer_keeps_event() -> RelayResult<()> {
        let framework = HeadlessFramework::new();
        let hub = test_hub(&framework);
        let endpoint = hub.open()?;
        let index = endpoint.create_device(request())?.index;

        let creator = {
            let framework = framework.clone();
            thread::spawn(move || framework.create_surface(index, 8, 4, PixelFormat::Rgb565))
        };
        while !endpoint.poll().readable {
            thread::sleep(Duration::from_millis(1));
        }

        let mut small = [0u8; 11];
        assert!(matches!(
            endpoint.read(&mut small),
            Err(RelayError::InvalidArgument(_))
        ));
        assert_eq!(endpoint.read(&mut [0u8; 0])?, 0);
        assert!(endpoint.poll().readable);

        let mut buf = [0u8; 12];
        assert_eq!(endpoint.read(&mut buf)?, 12);
        assert!(!endpoint.poll().readable);
        endpoint.reply(0)?;
        join(creator)??;
        Ok(())
    }

    #[test]
    fn nonblocking_read_on_empty_mailbox() -> RelayResult<()> {
        let framework = HeadlessFramework::new();
        let hub = test_hub(&framework);
        let endpoint = hub.open()?;
        endpoint.create_device(request())?;
        endpoint.set_nonblocking(true);

        let mut buf = [0u8; 64];
        assert!(matches!(endpoint.read(&mut buf), Err(RelayError::WouldBlock)));
        assert_eq!(endpoint.poll(), Readiness::default());
        Ok(())
    }

    #[test]
    fn write_validation() -> RelayResult<()> {
        let framework = HeadlessFramework::new();
        let hub = test_hub(&framework);
        let endpoint = hub.open()?;

        assert_eq!(endpoint.write(&[])?, 0);
        // Nothing registered yet.
        assert!(matches!(
            endpoint.write(&0i32.to_le_bytes()),
            Err(RelayError::InvalidArgument(_))
        ));
        let mut buf = [0u8; 16];
        assert!(matches!(
            endpoint.read(&mut buf),
            Err(RelayError::NotInitialized)
        ));

        endpoint.create_device(request())?;
        for bad in [&[0u8; 3][..], &[0u8; 5][..], &[0u8; 8][..]] {
            assert!(matches!(
                endpoint.write(bad),
                Err(RelayError::InvalidArgument(_))
            ));
        }
        // Nobody waiting: accepted and dropped.
        assert_eq!(endpoint.write(&7i32.to_le_bytes())?, 4);
        assert!(!endpoint.reply(7)?);
        Ok(())
    }

    #[test]
    fn close_wakes_blocked_reader() -> RelayResult<()> {
        let framework = HeadlessFramework::new();
        let hub = test_hub(&framework);
        let endpoint = Arc::new(hub.open()?);
        endpoint.create_device(request())?;

        let reader = {
            let endpoint = endpoint.clone();
            thread::spawn(move || endpoint.read_event())
        };
        thread::sleep(Duration::from_millis(20));
        endpoint.device().mailbox().close();
        assert!(matches!(join(reader)?, Err(RelayError::Cancelled)));
        Ok(())
    }

    #[test]
    fn dropping_endpoint_tears_down_device() -> RelayResult<()> {
        let framework = HeadlessFramework::new();
        let hub = test_hub(&framework);
        let endpoint = hub.open()?;
        let index = endpoint.create_device(request())?.index;
        let device = endpoint.device().clone();

        drop(endpoint);
        assert!(device.wait_for_state(DeviceState::Destroyed, Duration::from_secs(2)));
        assert!(hub.device(index).is_none());
        assert!(!framework.is_attached(index));
        Ok(())
    }

    #[test]
    fn closed_endpoint_rejects_operations() -> RelayResult<()> {
        let framework = HeadlessFramework::new();
        let hub = test_hub(&framework);
        let endpoint = hub.open()?;
        endpoint.close();
        endpoint.close();

        assert!(endpoint.poll().hangup);
        assert!(matches!(
            endpoint.create_device(request()),
            Err(RelayError::NotInitialized)
        ));
        assert!(matches!(
            endpoint.read(&mut [0u8; 8]),
            Err(RelayError::NotInitialized)
        ));
        Ok(())
    }

    #[test]
    fn shutdown_unregisters_everything() -> RelayResult<()> {
        let framework = HeadlessFramework::new();
        let hub = test_hub(&framework);
        let first = hub.open()?;
        let second = hub.open()?;
        let a = first.create_device(request())?.index;
        let b = second
            .create_device(request().with_buffer_mode(BufferMode::PLAIN_COPY))?
            .index;
        assert_eq!(hub.device_count(), 2);

        hub.shutdown();
        assert_eq!(hub.device_count(), 0);
        assert!(!framework.is_attached(a));
        assert!(!framework.is_attached(b));
        assert_eq!(first.device().state(), DeviceState::Destroyed);
        assert!(matches!(hub.open(), Err(RelayError::NotInitialized)));
        Ok(())
    }

    #[test]
    fn shutdown_while_draining_finishes_teardown() -> RelayResult<()> {
        let framework = HeadlessFramework::new();
        let hub = test_hub(&framework);
        let endpoint = hub.open()?;
        let index = endpoint.create_device(request())?.index;
        let reference = framework.acquire(index)?;

        endpoint.close();
        assert_eq!(endpoint.device().state(), DeviceState::Draining);

        // The release task wakes on detach and finds the device gone.
        hub.shutdown();
        assert_eq!(endpoint.device().state(), DeviceState::Destroyed);
        assert_eq!(hub.device_count(), 0);
        assert!(!framework.is_attached(index));
        assert!(matches!(
            endpoint.device().unregister(),
            Err(RelayError::NotInitialized)
        ));
        drop(reference);
        Ok(())
    }

    #[test]
    fn dirty_flush_over_channel() -> RelayResult<()> {
        let framework = HeadlessFramework::new();
        let hub = test_hub(&framework);
        let endpoint = Arc::new(hub.open()?);
        let registration = endpoint.create_device(
            request().with_buffer_mode(BufferMode::PLAIN_COPY | BufferMode::EMULATE_XRGB8888),
        )?;
        let index = registration.index;

        let consumer = {
            let endpoint = endpoint.clone();
            thread::spawn(move || -> RelayResult<Vec<Event>> {
                let mut events = Vec::new();
                let mut buf = [0u8; 256];
                while let Ok(len) = endpoint.read(&mut buf) {
                    events.push(Event::decode(&buf[..len])?);
                    endpoint.write(&0i32.to_le_bytes())?;
                }
                Ok(events)
            })
        };

        let surface = framework.create_surface(index, 8, 4, PixelFormat::Xrgb8888)?;
        surface.fill(0xFF);
        framework.enable(index)?;
        framework.set_plane(index, Some(&surface))?;

        let buffer = registration.buffer.ok_or(RelayError::NotInitialized)?;
        for _ in 0..200 {
            if buffer.read(|bytes| bytes.iter().all(|byte| *byte == 0xFF)) {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        endpoint.device().unregister()?;
        let events = join(consumer)??;

        let id = crate::framework::Surface::id(surface.as_ref());
        assert_eq!(events[0], Event::SurfaceCreated { id });
        assert_eq!(events[1], Event::PipeEnable);
        assert!(events.contains(&Event::SurfaceDirty {
            id,
            flags: DirtyFlags::empty(),
            color: 0,
            clips: vec![ClipRect::full_frame(8, 4)],
        }));
        assert_eq!(events.last(), Some(&Event::PipeDisable));
        assert!(buffer.read(|bytes| bytes.iter().all(|byte| *byte == 0xFF)));
        Ok(())
    }
}
