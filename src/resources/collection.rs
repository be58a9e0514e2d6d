//! Resource Collections
//!
//! Indexed set of entries for one provider binding.
//!
//! # Design
//!
//! - The index is a `HashMap` behind a `parking_lot::RwLock`; entry state lives
//!   in the entries themselves and never needs the lock
//! - Allocation is double-checked under the write lock so concurrent callers for
//!   the same identity get the same entry and exactly one of them sees it as new
//! - The renderer reads an immutable [`CollectionSnapshot`] that is rebuilt
//!   lazily after the index changes

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::Serialize;

use super::bindings::ProviderId;
use super::entry::{CollectionKind, ResourceEntry, ResourceId, ResourceType};
use super::state::ResourceState;

/// Entries of one provider binding.
pub struct ResourceCollection {
    provider_id: ProviderId,
    resource_type: ResourceType,
    kind: CollectionKind,
    entries: RwLock<HashMap<ResourceId, Arc<ResourceEntry>>>,
    /// Last published snapshot. Lock order: `snapshot` before `entries`.
    snapshot: RwLock<Arc<CollectionSnapshot>>,
    snapshot_dirty: AtomicBool,
    self_ref: Weak<ResourceCollection>,
}

impl ResourceCollection {
    /// Create an empty collection
    pub fn new(provider_id: ProviderId, resource_type: ResourceType, kind: CollectionKind) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            provider_id,
            resource_type,
            kind,
            entries: RwLock::new(HashMap::new()),
            snapshot: RwLock::new(Arc::new(CollectionSnapshot::default())),
            snapshot_dirty: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    #[inline]
    pub fn provider_id(&self) -> ProviderId {
        self.provider_id
    }

    #[inline]
    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    #[inline]
    pub fn kind(&self) -> CollectionKind {
        self.kind
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the collection is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Look up an entry
    pub fn get(&self, id: &ResourceId) -> Option<Arc<ResourceEntry>> {
        self.entries.read().get(id).cloned()
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.entries.read().contains_key(id)
    }

    /// Return the entry for `id`, constructing it with `factory` if absent.
    ///
    /// The flag is `true` for exactly one caller per allocated entry.
    pub fn obtain_or_allocate_entry<F>(&self, id: ResourceId, factory: F) -> (Arc<ResourceEntry>, bool)
    where
        F: FnOnce(ResourceId, Weak<ResourceCollection>) -> ResourceEntry,
    {
        debug_assert_eq!(id.kind(), self.kind, "{} used in a {} collection", id, self.kind);

        // Try read first
        if let Some(entry) = self.entries.read().get(&id) {
            return (entry.clone(), false);
        }

        let mut guard = self.entries.write();

        // Double-check under write lock
        if let Some(entry) = guard.get(&id) {
            return (entry.clone(), false);
        }

        let entry = Arc::new(factory(id.clone(), self.self_ref.clone()));
        guard.insert(id, entry.clone());
        self.snapshot_dirty.store(true, Ordering::Release);
        (entry, true)
    }

    /// [`obtain_or_allocate_entry`](Self::obtain_or_allocate_entry) with the
    /// default entry factory for this collection's type
    pub fn obtain_or_allocate(&self, id: ResourceId) -> (Arc<ResourceEntry>, bool) {
        let resource_type = self.resource_type;
        self.obtain_or_allocate_entry(id, |id, owner| ResourceEntry::new(id, resource_type, owner))
    }

    /// Remove every entry for which `predicate` returns `true`.
    ///
    /// Setting the `cancel` flag ends the sweep; the remaining entries are kept.
    /// Returns the removed entries.
    pub fn remove_resources<P>(&self, mut predicate: P) -> Vec<Arc<ResourceEntry>>
    where
        P: FnMut(&Arc<ResourceEntry>, &mut bool) -> bool,
    {
        let mut removed = Vec::new();
        let mut cancel = false;
        let mut guard = self.entries.write();
        guard.retain(|_, entry| {
            if cancel {
                return true;
            }
            if predicate(entry, &mut cancel) {
                removed.push(entry.clone());
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            self.snapshot_dirty.store(true, Ordering::Release);
        }
        removed
    }

    /// Clone of all entries, taken under the read lock
    pub fn entries(&self) -> Vec<Arc<ResourceEntry>> {
        self.entries.read().values().cloned().collect()
    }

    /// Point-in-time view of the collection.
    pub fn snapshot(&self) -> Arc<CollectionSnapshot> {
        if !self.snapshot_dirty.load(Ordering::Acquire) {
            return self.snapshot.read().clone();
        }

        let mut published = self.snapshot.write();
        if self.snapshot_dirty.swap(false, Ordering::AcqRel) {
            let mut entries: Vec<_> = self.entries.read().values().cloned().collect();
            entries.sort_by(|a, b| a.id().cmp(b.id()));
            *published = Arc::new(CollectionSnapshot { entries });
        }
        published.clone()
    }

    /// Entry counts by state
    pub fn stats(&self) -> CollectionStats {
        let mut by_state = BTreeMap::new();
        let mut junk = 0;
        let entries = self.entries.read();
        for entry in entries.values() {
            *by_state.entry(entry.state()).or_insert(0) += 1;
            if entry.is_junk() {
                junk += 1;
            }
        }
        CollectionStats {
            provider_id: self.provider_id,
            resource_type: self.resource_type,
            kind: self.kind,
            total: entries.len(),
            junk,
            by_state,
        }
    }
}

impl fmt::Debug for ResourceCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceCollection")
            .field("provider_id", &self.provider_id)
            .field("resource_type", &self.resource_type)
            .field("kind", &self.kind)
            .field("len", &self.len())
            .finish()
    }
}

/// Immutable view of a collection, sorted by identity.
#[derive(Debug, Default)]
pub struct CollectionSnapshot {
    entries: Vec<Arc<ResourceEntry>>,
}

impl CollectionSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ResourceEntry>> {
        self.entries.iter()
    }

    pub fn get(&self, id: &ResourceId) -> Option<&Arc<ResourceEntry>> {
        self.entries
            .binary_search_by(|entry| entry.id().cmp(id))
            .ok()
            .map(|idx| &self.entries[idx])
    }
}

/// Per-collection entry counts.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionStats {
    pub provider_id: ProviderId,
    pub resource_type: ResourceType,
    pub kind: CollectionKind,
    pub total: usize,
    pub junk: usize,
    pub by_state: BTreeMap<ResourceState, usize>,
}

impl CollectionStats {
    pub fn count(&self, state: ResourceState) -> usize {
        self.by_state.get(&state).copied().unwrap_or(0)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::tile::{TileId, TileKey, ZoomLevel};
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn tile(x: i32, y: i32, z: u8) -> ResourceId {
        ResourceId::Tile(TileKey::new(TileId::new(x, y), ZoomLevel::new(z)))
    }

    fn collection() -> Arc<ResourceCollection> {
        ResourceCollection::new(ProviderId::new(1), ResourceType::MapLayer, CollectionKind::Tiled)
    }

    #[test]
    fn test_obtain_or_allocate_returns_existing() {
        let c = collection();
        let (first, created) = c.obtain_or_allocate(tile(0, 0, 1));
        assert!(created);
        let (second, created) = c.obtain_or_allocate(tile(0, 0, 1));
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_entry_points_back_to_collection() {
        let c = collection();
        let (entry, _) = c.obtain_or_allocate(tile(2, 3, 4));
        let owner = entry.collection().unwrap();
        assert!(Arc::ptr_eq(&owner, &c));
        assert_eq!(entry.resource_type(), ResourceType::MapLayer);
    }

    #[test]
    fn test_concurrent_allocation_single_winner() {
        let c = collection();
        let factory_calls = Arc::new(AtomicUsize::new(0));
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let c = c.clone();
                let factory_calls = factory_calls.clone();
                let winners = winners.clone();
                thread::spawn(move || {
                    let (_, created) = c.obtain_or_allocate_entry(tile(5, 5, 5), |id, owner| {
                        factory_calls.fetch_add(1, Ordering::SeqCst);
                        ResourceEntry::new(id, ResourceType::MapLayer, owner)
                    });
                    if created {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(factory_calls.load(Ordering::SeqCst), 1);
        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_remove_resources_with_predicate() {
        let c = collection();
        for x in 0..10 {
            c.obtain_or_allocate(tile(x, 0, 3));
        }

        let removed = c.remove_resources(|entry, _| entry.tile_key().unwrap().tile.x % 2 == 0);
        assert_eq!(removed.len(), 5);
        assert_eq!(c.len(), 5);
        assert!(!c.contains(&tile(0, 0, 3)));
        assert!(c.contains(&tile(1, 0, 3)));
    }

    #[test]
    fn test_remove_resources_cancel_stops_sweep() {
        let c = collection();
        for x in 0..10 {
            c.obtain_or_allocate(tile(x, 0, 3));
        }

        let removed = c.remove_resources(|_, cancel| {
            *cancel = true;
            true
        });
        assert_eq!(removed.len(), 1);
        assert_eq!(c.len(), 9);
    }

    #[test]
    fn test_snapshot_is_point_in_time() {
        let c = collection();
        c.obtain_or_allocate(tile(1, 1, 2));
        let before = c.snapshot();
        assert_eq!(before.len(), 1);

        c.obtain_or_allocate(tile(0, 1, 2));
        assert_eq!(before.len(), 1);

        let after = c.snapshot();
        assert_eq!(after.len(), 2);
        assert!(after.get(&tile(0, 1, 2)).is_some());
        assert!(after.get(&tile(9, 9, 2)).is_none());

        let ids: Vec<_> = after.iter().map(|e| e.id().clone()).collect();
        assert_eq!(ids, vec![tile(0, 1, 2), tile(1, 1, 2)]);
    }

    #[test]
    fn test_snapshot_reused_when_unchanged() {
        let c = collection();
        c.obtain_or_allocate(tile(1, 1, 2));
        let a = c.snapshot();
        let b = c.snapshot();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_stats_by_state() {
        let c = collection();
        let (entry, _) = c.obtain_or_allocate(tile(1, 1, 2));
        c.obtain_or_allocate(tile(2, 1, 2));
        entry
            .transition(ResourceState::Unknown, ResourceState::Requesting)
            .unwrap();
        entry.mark_junk();

        let stats = c.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.junk, 1);
        assert_eq!(stats.count(ResourceState::Unknown), 1);
        assert_eq!(stats.count(ResourceState::Requesting), 1);
        assert_eq!(stats.count(ResourceState::Ready), 0);
    }
}
