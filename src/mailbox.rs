//! Single-slot synchronous request/reply between the pipeline and the
//! consumer.
//!
//! A submitter places one [`Event`] in the slot and blocks until the
//! consumer has read it and written a reply code back, or until the reply
//! timeout expires. Submitters are serialized by an exclusivity lock held
//! for the whole submit-to-reply span, separate from the slot lock the
//! consumer side takes, so the consumer can always make progress while a
//! submitter is parked.
//!
//! A timed-out event stays queued: the consumer still reads it, and its
//! late reply is discarded. The next submitter waits for that stale event
//! to be drained before placing its own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{RelayError, RelayResult};
use crate::event::Event;
use crate::lock_unpoisoned;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MailboxPhase {
    Idle,
    /// An event is queued and not yet read.
    PendingDelivery,
    /// The consumer read the event and has not replied yet.
    Delivered,
}

/// Counters updated by the mailbox. Read from any thread via
/// [`Mailbox::stats`].
#[derive(Debug, Default)]
pub struct MailboxStats {
    /// Events placed in the slot.
    pub submitted: AtomicU64,
    /// Replies that reached their submitter.
    pub replied: AtomicU64,
    /// Submissions that gave up waiting.
    pub timeouts: AtomicU64,
    /// Replies written after their submitter gave up.
    pub late_replies: AtomicU64,
}

impl MailboxStats {
    pub fn snapshot(&self) -> MailboxStatsSnapshot {
        MailboxStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            replied: self.replied.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            late_replies: self.late_replies.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MailboxStatsSnapshot {
    pub submitted: u64,
    pub replied: u64,
    pub timeouts: u64,
    pub late_replies: u64,
}

struct Slot {
    phase: MailboxPhase,
    pending: Option<Event>,
    /// Ticket of the event most recently placed in the slot.
    ticket: u64,
    /// Ticket whose submitter is still blocked waiting for a reply.
    waiting: Option<u64>,
    reply: Option<i32>,
    active: bool,
    closed: bool,
}

pub struct Mailbox {
    exclusive: Mutex<()>,
    slot: Mutex<Slot>,
    /// Signalled when an event is queued or the mailbox closes.
    readable: Condvar,
    /// Signalled when an event is read or a reply arrives.
    changed: Condvar,
    reply_timeout: Duration,
    stats: MailboxStats,
}

fn wait_until<'a, T>(
    condvar: &Condvar,
    guard: MutexGuard<'a, T>,
    deadline: Instant,
) -> MutexGuard<'a, T> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    condvar
        .wait_timeout(guard, remaining)
        .map(|(guard, _)| guard)
        .unwrap_or_else(|poisoned| poisoned.into_inner().0)
}

impl Mailbox {
    pub fn new(reply_timeout: Duration) -> Self {
        Self {
            exclusive: Mutex::new(()),
            slot: Mutex::new(Slot {
                phase: MailboxPhase::Idle,
                pending: None,
                ticket: 0,
                waiting: None,
                reply: None,
                active: false,
                closed: false,
            }),
            readable: Condvar::new(),
            changed: Condvar::new(),
            reply_timeout,
            stats: MailboxStats::default(),
        }
    }

    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }

    pub fn stats(&self) -> &MailboxStats {
        &self.stats
    }

    /// Submit `event` and block until the consumer replies.
    ///
    /// Returns the consumer's reply code, [`RelayError::Timeout`] when no
    /// reply arrived in time, or [`RelayError::NotInitialized`] when the
    /// mailbox is not active.
    pub fn submit(&self, event: Event) -> RelayResult<i32> {
        let _turn = self.exclusive.lock().unwrap_or_else(PoisonError::into_inner);
        let deadline = Instant::now() + self.reply_timeout;
        let event_type = event.event_type();

        let mut slot = lock_unpoisoned(&self.slot);
        loop {
            if !slot.active {
                return Err(RelayError::NotInitialized);
            }
            if slot.pending.is_none() {
                break;
            }
            if Instant::now() >= deadline {
                tracing::error!("{event_type:?}: previous event was never read, giving up");
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(RelayError::Timeout);
            }
            slot = wait_until(&self.changed, slot, deadline);
        }

        slot.ticket = slot.ticket.wrapping_add(1);
        let ticket = slot.ticket;
        slot.pending = Some(event);
        slot.phase = MailboxPhase::PendingDelivery;
        slot.waiting = Some(ticket);
        slot.reply = None;
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("submitted {event_type:?} (ticket {ticket})");
        self.readable.notify_all();

        loop {
            if let Some(code) = slot.reply.take() {
                slot.waiting = None;
                slot.phase = MailboxPhase::Idle;
                tracing::debug!("{event_type:?} acknowledged with {code}");
                return Ok(code);
            }
            if Instant::now() >= deadline {
                // A delivered event stays `Delivered` so the consumer's
                // eventual reply is counted as late.
                slot.waiting = None;
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    "{event_type:?}: no reply within {:?} (ticket {ticket})",
                    self.reply_timeout
                );
                return Err(RelayError::Timeout);
            }
            slot = wait_until(&self.changed, slot, deadline);
        }
    }

    pub fn take(&self, blocking: bool) -> RelayResult<Event> {
        self.take_inner(None, blocking)
    }

    /// Like [`take`](Self::take), but fails with
    /// [`RelayError::InvalidArgument`] without consuming the event when its
    /// encoding is longer than `capacity`.
    pub fn take_within(&self, capacity: usize, blocking: bool) -> RelayResult<Event> {
        self.take_inner(Some(capacity), blocking)
    }

    fn take_inner(&self, capacity: Option<usize>, blocking: bool) -> RelayResult<Event> {
        let mut slot = lock_unpoisoned(&self.slot);
        loop {
            if let Some(pending) = slot.pending.as_ref() {
                let needed = pending.encoded_len();
                if capacity.is_some_and(|capacity| needed > capacity) {
                    return Err(RelayError::InvalidArgument(format!(
                        "read buffer too small: {needed} bytes needed"
                    )));
                }
            }
            if let Some(event) = slot.pending.take() {
                slot.phase = MailboxPhase::Delivered;
                self.changed.notify_all();
                return Ok(event);
            }
            if slot.closed {
                return Err(RelayError::Cancelled);
            }
            if !blocking {
                return Err(RelayError::WouldBlock);
            }
            slot = self
                .readable
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Hand a reply code to the waiting submitter. Returns `false` when
    /// nobody is waiting for it, e.g. the submitter already timed out.
    pub fn reply(&self, code: i32) -> bool {
        let mut slot = lock_unpoisoned(&self.slot);
        if slot.phase != MailboxPhase::Delivered {
            tracing::debug!("reply {code} with no delivered event, ignoring");
            return false;
        }
        if slot.waiting != Some(slot.ticket) {
            slot.phase = MailboxPhase::Idle;
            self.stats.late_replies.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("late reply {code} for ticket {}, discarded", slot.ticket);
            return false;
        }
        slot.reply = Some(code);
        self.stats.replied.fetch_add(1, Ordering::Relaxed);
        self.changed.notify_all();
        true
    }

    /// Whether an undelivered event is queued.
    pub fn readiness(&self) -> bool {
        lock_unpoisoned(&self.slot).pending.is_some()
    }

    pub fn set_active(&self, active: bool) {
        let mut slot = lock_unpoisoned(&self.slot);
        slot.active = active;
        self.changed.notify_all();
    }

    pub fn is_active(&self) -> bool {
        lock_unpoisoned(&self.slot).active
    }

    /// Deactivate and wake blocked readers, which see
    /// [`RelayError::Cancelled`] once the slot is empty. A submitter that
    /// is already waiting keeps waiting until its own deadline.
    pub fn close(&self) {
        let mut slot = lock_unpoisoned(&self.slot);
        slot.active = false;
        slot.closed = true;
        self.readable.notify_all();
        self.changed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        lock_unpoisoned(&self.slot).closed
    }

    pub fn phase(&self) -> MailboxPhase {
        lock_unpoisoned(&self.slot).phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::SurfaceId;
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};

    fn active_mailbox(timeout_ms: u64) -> Arc<Mailbox> {
        let mailbox = Arc::new(Mailbox::new(Duration::from_millis(timeout_ms)));
        mailbox.set_active(true);
        mailbox
    }

    fn joined<T>(handle: JoinHandle<RelayResult<T>>) -> RelayResult<T> {
        handle
            .join()
            .map_err(|_| RelayError::Platform(anyhow::anyhow!("test thread panicked")))?
    }

    #[test]
    fn submit_returns_consumer_reply() -> RelayResult<()> {
        let mailbox = active_mailbox(2_000);
        let consumer = {
            let mailbox = mailbox.clone();
            thread::spawn(move || -> RelayResult<Event> {
                let event = mailbox.take(true)?;
                assert_eq!(mailbox.phase(), MailboxPhase::Delivered);
                assert!(mailbox.reply(42));
                Ok(event)
            })
        };

        assert_eq!(mailbox.submit(Event::PipeEnable)?, 42);
        assert_eq!(joined(consumer)?, Event::PipeEnable);
        assert_eq!(mailbox.phase(), MailboxPhase::Idle);
        assert_eq!(mailbox.stats().snapshot().replied, 1);
        Ok(())
    }

    #[test]
    fn inactive_mailbox_rejects_submit() {
        let mailbox = Mailbox::new(Duration::from_millis(50));
        assert!(matches!(
            mailbox.submit(Event::PipeDisable),
            Err(RelayError::NotInitialized)
        ));
        assert!(!mailbox.readiness());
    }

    #[test]
    fn timed_out_event_stays_queued() -> RelayResult<()> {
        let mailbox = active_mailbox(30);
        let started = Instant::now();
        assert!(matches!(
            mailbox.submit(Event::SurfaceCreated { id: SurfaceId(1) }),
            Err(RelayError::Timeout)
        ));
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(mailbox.readiness());
        assert_eq!(mailbox.phase(), MailboxPhase::PendingDelivery);

        let event = mailbox.take(false)?;
        assert_eq!(event, Event::SurfaceCreated { id: SurfaceId(1) });
        assert!(!mailbox.readiness());
        Ok(())
    }

    #[test]
    fn next_submit_waits_for_stale_event_to_drain() -> RelayResult<()> {
        let mailbox = active_mailbox(30);
        assert!(mailbox.submit(Event::PipeEnable).is_err());

        // Nobody reads: the second submit cannot place its event.
        assert!(matches!(
            mailbox.submit(Event::PipeDisable),
            Err(RelayError::Timeout)
        ));
        assert_eq!(mailbox.take(false)?, Event::PipeEnable);
        assert!(matches!(mailbox.take(false), Err(RelayError::WouldBlock)));
        Ok(())
    }

    #[test]
    fn late_reply_is_discarded() -> RelayResult<()> {
        let mailbox = active_mailbox(30);
        let reader = {
            let mailbox = mailbox.clone();
            thread::spawn(move || mailbox.take(true))
        };
        assert!(matches!(
            mailbox.submit(Event::PipeEnable),
            Err(RelayError::Timeout)
        ));
        joined(reader)?;

        assert!(!mailbox.reply(7));
        assert_eq!(mailbox.phase(), MailboxPhase::Idle);
        assert_eq!(mailbox.stats().snapshot().late_replies, 1);

        // Later exchanges only ever see their own reply.
        let consumer = {
            let mailbox = mailbox.clone();
            thread::spawn(move || -> RelayResult<()> {
                loop {
                    mailbox.take(true)?;
                    if mailbox.reply(3) {
                        return Ok(());
                    }
                }
            })
        };
        let code = loop {
            match mailbox.submit(Event::PipeDisable) {
                Err(RelayError::Timeout) => continue,
                other => break other?,
            }
        };
        joined(consumer)?;
        assert_eq!(code, 3);
        Ok(())
    }

    #[test]
    fn reply_to_event_read_after_timeout_is_late() -> RelayResult<()> {
        let mailbox = active_mailbox(20);
        assert!(matches!(
            mailbox.submit(Event::PipeDisable),
            Err(RelayError::Timeout)
        ));
        assert_eq!(mailbox.phase(), MailboxPhase::PendingDelivery);

        assert_eq!(mailbox.take(false)?, Event::PipeDisable);
        assert!(!mailbox.reply(1));
        let stats = mailbox.stats().snapshot();
        assert_eq!(stats.late_replies, 1);
        assert_eq!(stats.replied, 0);
        assert_eq!(mailbox.phase(), MailboxPhase::Idle);
        Ok(())
    }

    #[test]
    fn nonblocking_take_on_empty_slot_would_block() {
        let mailbox = active_mailbox(50);
        assert!(matches!(mailbox.take(false), Err(RelayError::WouldBlock)));
        assert!(!mailbox.reply(1));
    }

    #[test]
    fn close_cancels_blocked_reader() -> RelayResult<()> {
        let mailbox = active_mailbox(50);
        let reader = {
            let mailbox = mailbox.clone();
            thread::spawn(move || -> RelayResult<RelayResult<Event>> { Ok(mailbox.take(true)) })
        };
        thread::sleep(Duration::from_millis(20));
        mailbox.close();

        assert!(matches!(joined(reader)?, Err(RelayError::Cancelled)));
        assert!(matches!(mailbox.take(true), Err(RelayError::Cancelled)));
        assert!(matches!(
            mailbox.submit(Event::PipeEnable),
            Err(RelayError::NotInitialized)
        ));
        Ok(())
    }

    #[test]
    fn small_capacity_does_not_consume() -> RelayResult<()> {
        let mailbox = active_mailbox(20);
        let _ = mailbox.submit(Event::SurfaceDestroyed { id: SurfaceId(4) });
        assert!(matches!(
            mailbox.take_within(8, false),
            Err(RelayError::InvalidArgument(_))
        ));
        assert!(mailbox.readiness());
        assert_eq!(
            mailbox.take_within(12, false)?,
            Event::SurfaceDestroyed { id: SurfaceId(4) }
        );
        Ok(())
    }

    #[test]
    fn concurrent_submitters_never_overlap() -> RelayResult<()> {
        let mailbox = active_mailbox(5_000);
        let submitters: Vec<_> = (0..4u32)
            .map(|n| {
                let mailbox = mailbox.clone();
                thread::spawn(move || mailbox.submit(Event::SurfaceCreated { id: SurfaceId(n) }))
            })
            .collect();

        for _ in 0..4 {
            let event = mailbox.take(true)?;
            // Other submitters are parked on the exclusivity lock.
            thread::sleep(Duration::from_millis(5));
            assert!(!mailbox.readiness());
            assert_eq!(mailbox.phase(), MailboxPhase::Delivered);
            let Event::SurfaceCreated { id } = event else {
                return Err(RelayError::InvalidArgument(format!("{event:?}")));
            };
            assert!(mailbox.reply(id.0 as i32 + 100));
        }

        let mut codes = Vec::new();
        for submitter in submitters {
            codes.push(joined(submitter)?);
        }
        codes.sort_unstable();
        assert_eq!(codes, vec![100, 101, 102, 103]);
        Ok(())
    }
}
