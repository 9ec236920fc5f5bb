//! Single-slot, time-bounded cache of the last presence lookup.
//!
//! STORE and a preceding CHECKPRESENT for the same key would otherwise cost
//! two round trips to the store. One slot with a short TTL is enough to
//! absorb that; the TTL (rather than cross-process invalidation) is an
//! accepted consistency relaxation, since B2 offers no coordination
//! primitive between concurrent remotes anyway.

use std::time::{Duration, Instant};

use crate::storage::{RemoteObject, RemoteStore, StoreError};

/// How long one lookup result stays reusable.
pub const PRESENCE_TTL: Duration = Duration::from_secs(15);

#[derive(Debug)]
struct CacheSlot {
    name: String,
    /// `Some` when the exact name exists remotely.
    outcome: Option<RemoteObject>,
    observed_at: Instant,
}

/// Last-query-wins memo of one `list_by_exact_name` result.
#[derive(Debug)]
pub struct PresenceCache {
    slot: Option<CacheSlot>,
    ttl: Duration,
}

impl Default for PresenceCache {
    fn default() -> Self {
        Self::new(PRESENCE_TTL)
    }
}

impl PresenceCache {
    pub fn new(ttl: Duration) -> Self {
        Self { slot: None, ttl }
    }

    /// Look up `name`, serving from the slot when it holds a fresh result
    /// for exactly this name. A listing that returns a different name (the
    /// lexicographically next one) counts as "not found".
    pub async fn lookup(
        &mut self,
        store: &dyn RemoteStore,
        name: &str,
    ) -> Result<Option<RemoteObject>, StoreError> {
        if let Some(slot) = &self.slot {
            if slot.name == name && slot.observed_at.elapsed() < self.ttl {
                return Ok(slot.outcome.clone());
            }
        }

        let outcome = store
            .list_by_exact_name(name)
            .await?
            .filter(|obj| obj.file_name == name);

        self.slot = Some(CacheSlot {
            name: name.to_string(),
            outcome: outcome.clone(),
            observed_at: Instant::now(),
        });
        Ok(outcome)
    }

    /// Drop the slot. Called after any mutation of the remote object the
    /// slot may describe; a stale "found" entry would otherwise survive a
    /// delete.
    pub fn invalidate(&mut self) {
        self.slot = None;
    }
}
