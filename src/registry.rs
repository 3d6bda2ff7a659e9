//! Surface identifier bookkeeping.
//!
//! Destroy notifications must carry the identifier the consumer was told
//! about at creation time. By the time the framework reports a destroy the
//! surface may already be half torn down, so the identifier is recovered
//! from this table by handle identity instead of asking the surface.

use std::sync::{Arc, Mutex, Weak};

use rustc_hash::FxHashMap;

use crate::error::{RelayError, RelayResult};
use crate::framework::{Surface, SurfaceId};
use crate::lock_unpoisoned;

#[derive(Default)]
pub struct SurfaceRegistry {
    entries: Mutex<FxHashMap<SurfaceId, Weak<dyn Surface>>>,
}

impl SurfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, id: SurfaceId, surface: &Arc<dyn Surface>) -> RelayResult<()> {
        let mut entries = lock_unpoisoned(&self.entries);
        if entries.contains_key(&id) {
            return Err(RelayError::DuplicateIdentifier(id));
        }
        entries.insert(id, Arc::downgrade(surface));
        Ok(())
    }

    /// Identifier recorded for `surface`, compared by allocation address.
    pub fn lookup_id_for(&self, surface: &Arc<dyn Surface>) -> Option<SurfaceId> {
        let target = Arc::as_ptr(surface);
        lock_unpoisoned(&self.entries)
            .iter()
            .find(|(_, entry)| std::ptr::addr_eq(entry.as_ptr(), target))
            .map(|(id, _)| *id)
    }

    pub fn contains(&self, id: SurfaceId) -> bool {
        lock_unpoisoned(&self.entries).contains_key(&id)
    }

    /// Returns whether an entry was removed. Removing twice is a no-op.
    pub fn remove(&self, id: SurfaceId) -> bool {
        lock_unpoisoned(&self.entries).remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty the table at teardown. Anything left means a surface was
    /// announced and never destroyed, which is logged and otherwise ignored.
    pub fn drain_leftovers(&self) -> Vec<SurfaceId> {
        let mut leftovers: Vec<SurfaceId> =
            lock_unpoisoned(&self.entries).drain().map(|(id, _)| id).collect();
        leftovers.sort_unstable();
        if !leftovers.is_empty() {
            tracing::warn!(
                "{} surface(s) never reported destroyed: {leftovers:?}",
                leftovers.len()
            );
        }
        leftovers
    }
}
