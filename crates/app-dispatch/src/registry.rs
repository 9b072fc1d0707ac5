//! Connection Registry
//!
//! The registry is the single owner of the application connection pool. All
//! mutable per-entry bookkeeping (lifecycle state, round-robin sequence,
//! active call count) lives behind one coarse lock: pool cardinality is low
//! and every critical section is a short in-memory operation, so nothing
//! here ever awaits while the lock is held.
//!
//! ## Round robin
//!
//! Each entry carries a `last_used_seq`. Selection picks the eligible entry
//! with the smallest sequence, breaking ties by ascending id (registration
//! order), and stamps it with the next value of a registry-wide counter that
//! is always larger than every entry's sequence. Because the counter only
//! advances inside the locked selection step, concurrent dispatches observe
//! a total order.
//!
//! ## Pools
//!
//! Untagged inbound entries form the default pool and only receive untagged
//! traffic. Tagged entries only receive requests routed to one of their
//! tags. Outbound entries are reserved for requests routed to their dial
//! target and never join either pool.
//!
//! An application may narrow what it receives by subscribing to request
//! methods after its handshake. Entries without subscriptions take every
//! method; subscribed entries only take the methods they asked for.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::entry::{ConnectionEntry, Direction, EntryHandle, EntryId, EntryState};
use crate::error::RegistryError;

/// Which pool a selection draws from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector<'a> {
    /// Untagged entries only
    Default,
    /// Entries advertising this tag
    Tag(&'a str),
}

impl<'a> Selector<'a> {
    fn tag(self) -> Option<&'a str> {
        match self {
            Selector::Default => None,
            Selector::Tag(tag) => Some(tag),
        }
    }
}

/// Point-in-time view of one entry's bookkeeping
#[derive(Debug, Clone)]
pub struct EntryStatus {
    pub handle: EntryHandle,
    pub state: EntryState,
    pub last_used_seq: u64,
    pub active_calls: u32,
    /// Subscribed request methods, empty when the entry takes every method
    pub methods: BTreeSet<String>,
}

/// Pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub active: usize,
    pub draining: usize,
    pub outbound: usize,
    pub active_calls: u64,
}

struct Slot {
    handle: EntryHandle,
    state: EntryState,
    last_used_seq: u64,
    active_calls: u32,
    draining_since: Option<Instant>,
    methods: BTreeSet<String>,
}

impl Slot {
    /// `method` is expected upper-case
    fn in_pool(&self, selector: Selector<'_>, method: Option<&str>) -> bool {
        self.state.is_selectable()
            && self.handle.direction() == Direction::Inbound
            && self.handle.accepts(selector.tag())
            && method.is_none_or(|method| self.methods.is_empty() || self.methods.contains(method))
    }

    fn status(&self) -> EntryStatus {
        EntryStatus {
            handle: self.handle.clone(),
            state: self.state,
            last_used_seq: self.last_used_seq,
            active_calls: self.active_calls,
            methods: self.methods.clone(),
        }
    }
}

#[derive(Default)]
struct RegistryIndex {
    // ordered by id, which is also the round-robin tie-break
    entries: BTreeMap<EntryId, Slot>,
    outbound: HashMap<String, EntryId>,
    next_seq: u64,
}

impl RegistryIndex {
    /// Drop an entry for good, marking it closed
    fn close(&mut self, id: EntryId) -> Option<EntryHandle> {
        let slot = self.entries.remove(&id)?;
        if let Some(target) = slot.handle.outbound_target() {
            if self.outbound.get(target) == Some(&id) {
                self.outbound.remove(target);
            }
        }
        info!(
            entry_id = %id,
            from = ?slot.state,
            active_calls = slot.active_calls,
            "Application connection closed, {} remaining",
            self.entries.len()
        );
        Some(slot.handle)
    }

    fn begin_drain(&mut self, id: EntryId) -> Result<EntryState, RegistryError> {
        let slot = self.entries.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        match slot.state {
            EntryState::Draining => return Ok(EntryState::Draining),
            state if !state.can_transition_to(EntryState::Draining) => {
                return Err(RegistryError::InvalidTransition {
                    from: state,
                    to: EntryState::Draining,
                });
            }
            _ => {}
        }

        slot.state = EntryState::Draining;
        slot.draining_since = Some(Instant::now());
        if slot.active_calls == 0 {
            self.close(id);
            return Ok(EntryState::Closed);
        }
        info!(entry_id = %id, active_calls = slot.active_calls, "Application connection draining");
        Ok(EntryState::Draining)
    }

    /// Decrement the call count, closing a drained entry on its last call
    fn release(&mut self, id: EntryId) -> bool {
        let Some(slot) = self.entries.get_mut(&id) else {
            return false;
        };
        slot.active_calls = slot.active_calls.saturating_sub(1);
        if slot.state == EntryState::Draining && slot.active_calls == 0 {
            self.close(id);
        }
        true
    }
}

/// Owner of the application connection pool
#[derive(Default)]
pub struct Registry {
    index: Mutex<RegistryIndex>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly established connection and make it selectable
    pub fn add(&self, mut entry: ConnectionEntry) -> Result<EntryHandle, RegistryError> {
        let mut index = self.index.lock();
        let id = entry.id();
        if index.entries.contains_key(&id) {
            return Err(RegistryError::DuplicateId(id));
        }
        entry.transition(EntryState::Active)?;

        let handle = entry.into_handle();
        if let Some(target) = handle.outbound_target() {
            if let Some(previous) = index.outbound.insert(target.to_string(), id) {
                debug!(
                    entry_id = %id,
                    previous = %previous,
                    "Replacing cached outbound entry for {}",
                    target
                );
            }
        }
        index.entries.insert(
            id,
            Slot {
                handle: handle.clone(),
                state: EntryState::Active,
                last_used_seq: 0,
                active_calls: 0,
                draining_since: None,
                methods: BTreeSet::new(),
            },
        );
        info!(
            entry_id = %id,
            direction = ?handle.direction(),
            tags = %handle.tags(),
            "Added application connection, count of connected applications is now {}",
            index.entries.len()
        );
        Ok(handle)
    }

    /// Close an entry and drop it from every index
    ///
    /// Idempotent: removing an unknown or already removed id is a no-op.
    pub fn remove(&self, id: EntryId) -> Option<EntryHandle> {
        self.index.lock().close(id)
    }

    /// Stop assigning new requests to an entry
    ///
    /// The entry closes immediately when it has no calls in progress,
    /// otherwise when its last call ends or the drain timeout expires.
    pub fn begin_drain(&self, id: EntryId) -> Result<EntryState, RegistryError> {
        self.index.lock().begin_drain(id)
    }

    /// Restrict an entry to new requests of `method`, on top of earlier subscriptions
    ///
    /// Returns whether the method was newly added.
    pub fn subscribe(&self, id: EntryId, method: &str) -> Result<bool, RegistryError> {
        let mut index = self.index.lock();
        let slot = index.entries.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        let method = method.to_ascii_uppercase();
        info!(entry_id = %id, "Application subscribed to {} requests", method);
        let added = slot.methods.insert(method);
        Ok(added)
    }

    /// Active entries of a pool, in round-robin order
    pub fn selectable_snapshot(&self, selector: Selector<'_>) -> Vec<EntryHandle> {
        self.snapshot(selector, None)
    }

    /// Active entries of a pool willing to take `method`, in round-robin order
    pub fn selectable_snapshot_for(
        &self,
        selector: Selector<'_>,
        method: &str,
    ) -> Vec<EntryHandle> {
        self.snapshot(selector, Some(method.to_ascii_uppercase().as_str()))
    }

    fn snapshot(&self, selector: Selector<'_>, method: Option<&str>) -> Vec<EntryHandle> {
        let index = self.index.lock();
        let mut eligible: Vec<&Slot> = index
            .entries
            .values()
            .filter(|slot| slot.in_pool(selector, method))
            .collect();
        // stable sort keeps id order among equal sequences
        eligible.sort_by_key(|slot| slot.last_used_seq);
        eligible.into_iter().map(|slot| slot.handle.clone()).collect()
    }

    /// Active outbound entry dialed at `uri`
    pub fn find_by_outbound_target(&self, uri: &str) -> Option<EntryHandle> {
        let index = self.index.lock();
        let id = index.outbound.get(uri)?;
        index
            .entries
            .get(id)
            .filter(|slot| slot.state.is_selectable())
            .map(|slot| slot.handle.clone())
    }

    /// Pick the next entry of a pool and reserve a call on it
    ///
    /// Entries in `excluded` are skipped. The selected entry's sequence is
    /// advanced and its call count incremented atomically with the choice.
    pub fn reserve_next(
        self: &Arc<Self>,
        selector: Selector<'_>,
        excluded: &HashSet<EntryId>,
    ) -> Option<Reservation> {
        self.reserve(selector, None, excluded)
    }

    /// Like [`reserve_next`](Self::reserve_next), skipping entries not subscribed to `method`
    pub fn reserve_next_for(
        self: &Arc<Self>,
        selector: Selector<'_>,
        method: &str,
        excluded: &HashSet<EntryId>,
    ) -> Option<Reservation> {
        self.reserve(selector, Some(method.to_ascii_uppercase().as_str()), excluded)
    }

    fn reserve(
        self: &Arc<Self>,
        selector: Selector<'_>,
        method: Option<&str>,
        excluded: &HashSet<EntryId>,
    ) -> Option<Reservation> {
        let mut index = self.index.lock();
        let next_seq = index.next_seq + 1;
        let slot = index
            .entries
            .values_mut()
            .filter(|slot| slot.in_pool(selector, method) && !excluded.contains(&slot.handle.id()))
            .min_by_key(|slot| slot.last_used_seq)?;

        slot.last_used_seq = next_seq;
        slot.active_calls += 1;
        let handle = slot.handle.clone();
        index.next_seq = next_seq;

        debug!(entry_id = %handle.id(), seq = next_seq, "Selected application by round robin");
        Some(Reservation::new(self.clone(), handle))
    }

    /// Reserve a call on one specific active entry
    pub fn reserve_entry(self: &Arc<Self>, id: EntryId) -> Option<Reservation> {
        let mut index = self.index.lock();
        let slot = index.entries.get_mut(&id).filter(|slot| slot.state.is_selectable())?;
        slot.active_calls += 1;
        let handle = slot.handle.clone();
        Some(Reservation::new(self.clone(), handle))
    }

    /// Account for a finished call; never touches the round-robin sequence
    pub fn release(&self, id: EntryId) -> bool {
        self.index.lock().release(id)
    }

    /// Drain every active entry whose link no longer reports alive
    pub fn prune(&self) -> Vec<EntryId> {
        let mut index = self.index.lock();
        let dead: Vec<EntryId> = index
            .entries
            .values()
            .filter(|slot| slot.state.is_selectable() && !slot.handle.link().is_alive())
            .map(|slot| slot.handle.id())
            .collect();
        for id in &dead {
            warn!(entry_id = %id, "Application failed liveness check");
            let _ = index.begin_drain(*id);
        }
        dead
    }

    /// Force-close entries that have been draining longer than `timeout`
    pub fn expire_drained(&self, timeout: Duration) -> Vec<EntryHandle> {
        let mut index = self.index.lock();
        let expired: Vec<EntryId> = index
            .entries
            .values()
            .filter(|slot| slot.draining_since.is_some_and(|since| since.elapsed() >= timeout))
            .map(|slot| slot.handle.id())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| {
                warn!(entry_id = %id, "Drain timeout expired, forcing close");
                index.close(id)
            })
            .collect()
    }

    /// Close every entry, returning them so their links can be shut down
    pub fn clear(&self) -> Vec<EntryHandle> {
        let mut index = self.index.lock();
        let ids: Vec<EntryId> = index.entries.keys().copied().collect();
        ids.into_iter().filter_map(|id| index.close(id)).collect()
    }

    pub fn get(&self, id: EntryId) -> Option<EntryStatus> {
        self.index.lock().entries.get(&id).map(Slot::status)
    }

    /// Whether the entry is still tracked (active or draining)
    pub fn contains(&self, id: EntryId) -> bool {
        self.index.lock().entries.contains_key(&id)
    }

    /// Number of tracked (active or draining) entries
    pub fn len(&self) -> usize {
        self.index.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_count(&self) -> usize {
        self.index
            .lock()
            .entries
            .values()
            .filter(|slot| slot.state.is_selectable())
            .count()
    }

    pub fn stats(&self) -> RegistryStats {
        let index = self.index.lock();
        index.entries.values().fold(RegistryStats::default(), |mut stats, slot| {
            match slot.state {
                EntryState::Active => stats.active += 1,
                EntryState::Draining => stats.draining += 1,
                _ => {}
            }
            if slot.handle.direction() == Direction::Outbound {
                stats.outbound += 1;
            }
            stats.active_calls += u64::from(slot.active_calls);
            stats
        })
    }
}

/// A call reserved on an entry but not yet confirmed as delivered
///
/// Dropping an uncommitted reservation (for instance when the dispatch
/// future is cancelled) rolls the call count back.
pub struct Reservation {
    registry: Arc<Registry>,
    handle: EntryHandle,
    settled: bool,
}

impl Reservation {
    fn new(registry: Arc<Registry>, handle: EntryHandle) -> Self {
        Self { registry, handle, settled: false }
    }

    pub fn handle(&self) -> &EntryHandle {
        &self.handle
    }

    /// Keep the call counted against the entry
    pub fn commit(mut self) -> EntryHandle {
        self.settled = true;
        self.handle.clone()
    }

    /// The peer turned out to be dead: roll back and drain the entry
    pub fn abandon_dead(mut self) {
        self.settled = true;
        let id = self.handle.id();
        let mut index = self.registry.index.lock();
        index.release(id);
        if index.entries.contains_key(&id) {
            let _ = index.begin_drain(id);
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.settled {
            debug!(entry_id = %self.handle.id(), "Rolling back uncommitted reservation");
            self.registry.release(self.handle.id());
        }
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("entry", &self.handle.id())
            .field("settled", &self.settled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{TagSet, TransportKind};
    use crate::error::LinkError;
    use crate::link::AppLink;
    use crate::request::InboundRequest;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, Default)]
    struct StubLink {
        dead: AtomicBool,
    }

    #[async_trait]
    impl AppLink for StubLink {
        async fn deliver(&self, _request: &InboundRequest) -> Result<(), LinkError> {
            Ok(())
        }

        fn is_alive(&self) -> bool {
            !self.dead.load(Ordering::Relaxed)
        }

        async fn close(&self) {
            self.dead.store(true, Ordering::Relaxed);
        }
    }

    fn inbound(tags: &str) -> ConnectionEntry {
        let link = Arc::new(StubLink::default());
        ConnectionEntry::new(Direction::Inbound, TransportKind::Plain, link)
            .with_tags(TagSet::parse_list(tags))
    }

    #[test]
    fn test_add_activates_and_rejects_duplicates() {
        let registry = Registry::new();
        let entry = inbound("");
        let id = entry.id();
        let handle = registry.add(entry).unwrap();
        assert_eq!(handle.id(), id);
        assert_eq!(registry.get(id).unwrap().state, EntryState::Active);

        let duplicate = inbound("").with_id(id);
        assert_eq!(registry.add(duplicate).unwrap_err(), RegistryError::DuplicateId(id));
    }

    #[test]
    fn test_closed_entry_cannot_be_added() {
        let registry = Registry::new();
        let mut entry = inbound("");
        entry.transition(EntryState::Closed).unwrap();
        assert!(matches!(
            registry.add(entry),
            Err(RegistryError::InvalidTransition {
                from: EntryState::Closed,
                to: EntryState::Active
            })
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = Registry::new();
        let id = registry.add(inbound("")).unwrap().id();
        assert!(registry.remove(id).is_some());
        assert!(registry.remove(id).is_none());
        assert!(registry.get(id).is_none());
        assert!(registry.selectable_snapshot(Selector::Default).is_empty());
    }

    #[test]
    fn test_snapshot_pools_are_disjoint() {
        let registry = Registry::new();
        let plain = registry.add(inbound("")).unwrap();
        let red = registry.add(inbound("red")).unwrap();
        let multi = registry.add(inbound("blue,green")).unwrap();

        assert_eq!(registry.selectable_snapshot(Selector::Default), vec![plain]);
        assert_eq!(registry.selectable_snapshot(Selector::Tag("red")), vec![red]);
        assert_eq!(registry.selectable_snapshot(Selector::Tag("green")), vec![multi.clone()]);
        assert_eq!(registry.selectable_snapshot(Selector::Tag("blue")), vec![multi]);
        assert!(registry.selectable_snapshot(Selector::Tag("black")).is_empty());
    }

    #[test]
    fn test_reserve_next_cycles_in_registration_order() {
        let registry = Arc::new(Registry::new());
        let ids: Vec<EntryId> = (0..3).map(|_| registry.add(inbound("")).unwrap().id()).collect();

        let mut picked = Vec::new();
        for _ in 0..6 {
            let reservation = registry.reserve_next(Selector::Default, &HashSet::new()).unwrap();
            picked.push(reservation.commit().id());
        }
        assert_eq!(picked, vec![ids[0], ids[1], ids[2], ids[0], ids[1], ids[2]]);
        assert_eq!(registry.get(ids[0]).unwrap().active_calls, 2);

        let snapshot: Vec<EntryId> = registry
            .selectable_snapshot(Selector::Default)
            .iter()
            .map(EntryHandle::id)
            .collect();
        assert_eq!(snapshot, ids);
    }

    #[test]
    fn test_dropped_reservation_rolls_back_call_count() {
        let registry = Arc::new(Registry::new());
        let id = registry.add(inbound("")).unwrap().id();

        let reservation = registry.reserve_next(Selector::Default, &HashSet::new()).unwrap();
        assert_eq!(registry.get(id).unwrap().active_calls, 1);
        drop(reservation);

        let status = registry.get(id).unwrap();
        assert_eq!(status.active_calls, 0);
        // the sequence stays advanced
        assert_eq!(status.last_used_seq, 1);
    }

    #[test]
    fn test_draining_entry_closes_on_last_release() {
        let registry = Arc::new(Registry::new());
        let id = registry.add(inbound("")).unwrap().id();
        registry.reserve_next(Selector::Default, &HashSet::new()).unwrap().commit();

        assert_eq!(registry.begin_drain(id).unwrap(), EntryState::Draining);
        assert!(registry.selectable_snapshot(Selector::Default).is_empty());
        assert_eq!(registry.stats().draining, 1);

        assert!(registry.release(id));
        assert!(registry.get(id).is_none());
        assert!(!registry.release(id));
    }

    #[test]
    fn test_idle_entry_closes_immediately_on_drain() {
        let registry = Registry::new();
        let id = registry.add(inbound("")).unwrap().id();
        assert_eq!(registry.begin_drain(id).unwrap(), EntryState::Closed);
        assert!(registry.is_empty());
        assert_eq!(registry.begin_drain(id), Err(RegistryError::NotFound(id)));
    }

    #[test]
    fn test_prune_drains_dead_links() {
        let registry = Registry::new();
        let link = Arc::new(StubLink::default());
        let entry = ConnectionEntry::new(Direction::Inbound, TransportKind::Plain, link.clone());
        let id = registry.add(entry).unwrap().id();
        let other = registry.add(inbound("")).unwrap().id();

        link.dead.store(true, Ordering::Relaxed);
        assert_eq!(registry.prune(), vec![id]);
        assert!(registry.get(id).is_none());
        assert!(registry.get(other).is_some());
    }

    #[test]
    fn test_expire_drained_forces_close() {
        let registry = Arc::new(Registry::new());
        let id = registry.add(inbound("")).unwrap().id();
        registry.reserve_next(Selector::Default, &HashSet::new()).unwrap().commit();
        registry.begin_drain(id).unwrap();

        assert!(registry.expire_drained(Duration::from_secs(3600)).is_empty());
        let expired = registry.expire_drained(Duration::ZERO);
        assert_eq!(expired.len(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_clear_closes_everything() {
        let registry = Registry::new();
        registry.add(inbound("")).unwrap();
        registry.add(inbound("red")).unwrap();
        assert_eq!(registry.clear().len(), 2);
        assert!(registry.is_empty());
        assert_eq!(registry.stats(), RegistryStats::default());
    }

    #[test]
    fn test_method_subscriptions_narrow_selection() {
        let registry = Arc::new(Registry::new());
        let any = registry.add(inbound("")).unwrap().id();
        let invites = registry.add(inbound("")).unwrap().id();
        assert!(registry.subscribe(invites, "invite").unwrap());
        assert!(!registry.subscribe(invites, "INVITE").unwrap());

        let pool = |method: &str| -> Vec<EntryId> {
            let handles = registry.selectable_snapshot_for(Selector::Default, method);
            handles.iter().map(EntryHandle::id).collect()
        };
        assert_eq!(pool("INVITE"), vec![any, invites]);
        assert_eq!(pool("options"), vec![any]);
        assert_eq!(registry.selectable_snapshot(Selector::Default).len(), 2);

        for _ in 0..2 {
            let reservation = registry
                .reserve_next_for(Selector::Default, "OPTIONS", &HashSet::new())
                .unwrap();
            assert_eq!(reservation.commit().id(), any);
        }
        let status = registry.get(invites).unwrap();
        assert_eq!(status.active_calls, 0);
        assert!(status.methods.contains("INVITE"));

        let missing = EntryId::next();
        assert_eq!(registry.subscribe(missing, "INVITE"), Err(RegistryError::NotFound(missing)));
    }

    #[test]
    fn test_contains_tracks_removal() {
        let registry = Registry::new();
        let id = registry.add(inbound("")).unwrap().id();
        assert!(registry.contains(id));
        registry.remove(id);
        assert!(!registry.contains(id));
    }

    #[test]
    fn test_outbound_entries_only_found_by_target() {
        let registry = Registry::new();
        let link = Arc::new(StubLink::default());
        let entry = ConnectionEntry::new(Direction::Outbound, TransportKind::Plain, link)
            .with_outbound_target("10.0.0.5:9022");
        let handle = registry.add(entry).unwrap();

        assert!(registry.selectable_snapshot(Selector::Default).is_empty());
        assert_eq!(registry.find_by_outbound_target("10.0.0.5:9022"), Some(handle.clone()));
        assert_eq!(registry.stats().outbound, 1);

        registry.remove(handle.id());
        assert!(registry.find_by_outbound_target("10.0.0.5:9022").is_none());
    }
}
