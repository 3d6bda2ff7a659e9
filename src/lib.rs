pub mod channel;
pub mod convert;
pub mod device;
pub(crate) mod env_config;
pub mod error;
pub mod event;
pub mod framework;
pub mod headless;
pub mod mailbox;
pub mod region;
pub mod registry;
pub(crate) mod worker;

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use channel::{ChannelEndpoint, Readiness, RelayHub, RelayHubBuilder};
pub use convert::{BufferMode, TranscodeMode};
pub use device::{
    Device, DeviceCreateRequest, DeviceRegistration, DeviceState, Pipeline, RelayConfig,
    SideBufferHandle,
};
pub use error::{RelayError, RelayErrorClass, RelayResult};
pub use event::{Event, EventType};
pub use framework::{
    AttachRequest, DisplayFramework, DisplayMode, PixelFormat, Surface, SurfaceGeometry,
    SurfaceId,
};
pub use headless::{HeadlessFramework, HeadlessSurface};
pub use mailbox::{Mailbox, MailboxPhase, MailboxStatsSnapshot};
pub use region::{ClipRect, DirtyFlags};

#[cfg(feature = "tokio-stream")]
pub use channel::AsyncEventReader;

// A panicking callback must not wedge the device for everyone else, so
// poisoned locks are taken over as-is.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read_unpoisoned<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_unpoisoned<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
