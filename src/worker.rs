//! Background work tied to a device instance.
//!
//! The flush worker performs full-frame flushes requested by plane
//! updates, off the framework thread that reported the update. The release
//! task tears a device down once the framework has dropped its last
//! reference after a consumer disconnect.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;

use crate::error::{RelayError, RelayResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FlushJob {
    /// Flush the whole surface currently on the plane.
    FullFrame,
}

/// Handle to a running flush worker. Dropping it cancels the worker and
/// joins its thread.
pub(crate) struct FlushWorker {
    sender: Option<mpsc::Sender<FlushJob>>,
    stop_flag: Arc<AtomicBool>,
    join_handle: Option<JoinHandle<()>>,
}

impl FlushWorker {
    /// Start the worker thread. Jobs queued while `handler` is busy are
    /// coalesced into a single run.
    pub(crate) fn start<F>(name: String, handler: F) -> RelayResult<Self>
    where
        F: Fn(FlushJob) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<FlushJob>();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop = stop_flag.clone();

        let join_handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    // Requests queued meanwhile are covered by this run.
                    while rx.try_recv().is_ok() {}
                    handler(job);
                }
            })
            .map_err(|e| {
                RelayError::Platform(anyhow::anyhow!("failed to spawn flush worker: {e}"))
            })?;

        Ok(Self {
            sender: Some(tx),
            stop_flag,
            join_handle: Some(join_handle),
        })
    }

    pub(crate) fn queue(&self, job: FlushJob) -> RelayResult<()> {
        if self.stop_flag.load(Ordering::Acquire) {
            return Err(RelayError::Cancelled);
        }
        self.sender
            .as_ref()
            .ok_or(RelayError::Cancelled)?
            .send(job)
            .map_err(|_| RelayError::Cancelled)
    }

    /// Stop accepting jobs, skip queued ones and wait for the job in
    /// progress, if any.
    pub(crate) fn cancel(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop_flag.store(true, Ordering::Release);
        self.sender.take();
        if let Some(handle) = self.join_handle.take() {
            // The last device reference can be dropped by a running job.
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for FlushWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Run `task` on its own named thread.
pub(crate) fn spawn_release_task<F>(name: String, task: F) -> RelayResult<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name)
        .spawn(task)
        .map_err(|e| RelayError::Platform(anyhow::anyhow!("failed to spawn release task: {e}")))
}
