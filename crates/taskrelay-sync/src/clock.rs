//! Logical clocks and the pending-publish set.
//!
//! Admission rules:
//!
//! ```text
//!   scope event  (T, t)      admit if t >= scope_clock[T]
//!   entity event (T, id, t)  admit if t >  entity_clock[T][id]
//!                            or t == entity_clock[T][id] and (T, id) not pending
//! ```
//!
//! Entity clock entries also remember whether the admitted event was a
//! deletion. A non-deletion at or below a deletion's timestamp is refused, so
//! replays can never resurrect a removed task; a strictly later event can.
//!
//! Nothing here is persisted. After a restart the clocks are rebuilt from
//! the relays' retained history.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// State shared between the engine and its publisher.
pub type SharedReplicationState = Arc<Mutex<ReplicationState>>;

/// Last admitted timestamp for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityClock {
    pub at: u64,
    pub deleted: bool,
}

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admit,
    /// Older than what we already hold.
    Stale,
    /// Tie with our own in-flight publish.
    PendingTie,
    /// Would revive a deleted entity at or below its deletion time.
    Tombstoned,
}

impl Admission {
    pub fn is_admitted(self) -> bool {
        self == Admission::Admit
    }
}

/// Per-scope and per-entity clocks plus the pending-publish counters.
#[derive(Debug, Default)]
pub struct ReplicationState {
    scope_clock: HashMap<String, u64>,
    entity_clock: HashMap<String, HashMap<String, EntityClock>>,
    pending: HashMap<(String, String), usize>,
}

impl ReplicationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap into the shared handle used by the engine and publisher.
    pub fn shared() -> SharedReplicationState {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn scope_clock(&self, scope_tag: &str) -> Option<u64> {
        self.scope_clock.get(scope_tag).copied()
    }

    pub fn entity_clock(&self, scope_tag: &str, entity_id: &str) -> Option<EntityClock> {
        self.entity_clock
            .get(scope_tag)
            .and_then(|entities| entities.get(entity_id))
            .copied()
    }

    pub fn admit_scope(&self, scope_tag: &str, at: u64) -> Admission {
        match self.scope_clock(scope_tag) {
            Some(clock) if at < clock => Admission::Stale,
            _ => Admission::Admit,
        }
    }

    pub fn admit_entity(&self, scope_tag: &str, entity_id: &str, at: u64, deleted: bool) -> Admission {
        let Some(clock) = self.entity_clock(scope_tag, entity_id) else {
            return Admission::Admit;
        };
        if at > clock.at {
            return Admission::Admit;
        }
        if at < clock.at {
            return if clock.deleted && !deleted {
                Admission::Tombstoned
            } else {
                Admission::Stale
            };
        }
        // Equal timestamps.
        if deleted {
            Admission::Admit
        } else if clock.deleted {
            Admission::Tombstoned
        } else if self.is_pending(scope_tag, entity_id) {
            Admission::PendingTie
        } else {
            Admission::Admit
        }
    }

    /// Advance a scope clock. Never moves backwards.
    pub fn record_scope(&mut self, scope_tag: &str, at: u64) {
        let clock = self.scope_clock.entry(scope_tag.to_string()).or_insert(at);
        *clock = (*clock).max(at);
    }

    /// Advance an entity clock. Never moves backwards; a deletion at an
    /// equal timestamp marks the entry deleted.
    pub fn record_entity(&mut self, scope_tag: &str, entity_id: &str, at: u64, deleted: bool) {
        let entities = self.entity_clock.entry(scope_tag.to_string()).or_default();
        match entities.get_mut(entity_id) {
            Some(clock) if at > clock.at => *clock = EntityClock { at, deleted },
            Some(clock) if at == clock.at => clock.deleted |= deleted,
            Some(_) => {}
            None => {
                entities.insert(entity_id.to_string(), EntityClock { at, deleted });
            }
        }
    }

    pub fn mark_pending(&mut self, scope_tag: &str, entity_id: &str) {
        *self
            .pending
            .entry((scope_tag.to_string(), entity_id.to_string()))
            .or_insert(0) += 1;
    }

    pub fn clear_pending(&mut self, scope_tag: &str, entity_id: &str) {
        let key = (scope_tag.to_string(), entity_id.to_string());
        if let Some(count) = self.pending.get_mut(&key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.pending.remove(&key);
            }
        }
    }

    pub fn is_pending(&self, scope_tag: &str, entity_id: &str) -> bool {
        self.pending
            .contains_key(&(scope_tag.to_string(), entity_id.to_string()))
    }

    /// Drop every clock for a scope (board removed locally).
    pub fn forget_scope(&mut self, scope_tag: &str) {
        self.scope_clock.remove(scope_tag);
        self.entity_clock.remove(scope_tag);
        self.pending.retain(|(tag, _), _| tag != scope_tag);
    }
}

/// Lock the shared state, recovering from a poisoned mutex.
pub(crate) fn lock_state(state: &Mutex<ReplicationState>) -> MutexGuard<'_, ReplicationState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
