//! Cache Eviction Pass
//!
//! Decides which entries are junk for the current active zone and drives junk
//! entries one step toward removal.
//!
//! # Sweeps
//!
//! 1. Provider gone: every entry of a pending-removal collection
//! 2. Invalidated types: every entry of an invalidated resource type
//! 3. Zoom shift: tiled entries too far from the active zoom, and entries at
//!    the active zoom outside the active tile set
//! 4. Fallback: tiled entries that are neither active nor the nearest usable
//!    coarser ancestor of an active tile that has nothing usable yet
//! 5. Keys: keyed entries whose key the provider no longer offers
//!
//! Only coarser ancestors are searched as fallback, never more detailed tiles.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use tracing::{debug, instrument, trace};

use super::bindings::ProviderBindingTable;
use super::collection::ResourceCollection;
use super::entry::{CollectionKind, ResourceEntry, ResourceId, ResourceType};
use super::metrics::EngineMetrics;
use super::scheduler::cancel_request;
use super::state::ResourceState;
use super::tile::{ActiveZone, TileKey};

/// Zoom limits of the eviction policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionLimits {
    /// Entries farther than this from the active zoom are junk
    pub max_zoom_shift: u8,
    /// How many levels the fallback walk may climb
    pub max_missing_data_zoom_shift: u8,
}

/// What one eviction pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionOutcome {
    pub junk_marked: usize,
    pub advanced: usize,
    pub removed: usize,
    /// Entries were queued for GPU release
    pub needs_gpu_sync: bool,
}

impl EvictionOutcome {
    fn absorb(&mut self, step: JunkStep) {
        match step {
            JunkStep::Advanced => self.advanced += 1,
            JunkStep::QueuedForUnload => {
                self.advanced += 1;
                self.needs_gpu_sync = true;
            }
            JunkStep::Waiting | JunkStep::Dead => {}
        }
    }
}

/// Eviction pass over every collection of a binding table.
pub struct EvictionPass<'a> {
    bindings: &'a ProviderBindingTable,
    zone: &'a ActiveZone,
    limits: EvictionLimits,
    invalidated: &'a HashSet<ResourceType>,
    metrics: &'a EngineMetrics,
}

impl<'a> EvictionPass<'a> {
    pub fn new(
        bindings: &'a ProviderBindingTable,
        zone: &'a ActiveZone,
        limits: EvictionLimits,
        invalidated: &'a HashSet<ResourceType>,
        metrics: &'a EngineMetrics,
    ) -> Self {
        Self {
            bindings,
            zone,
            limits,
            invalidated,
            metrics,
        }
    }

    #[instrument(skip(self), fields(zoom = %self.zone.zoom, tiles = self.zone.tiles.len()))]
    pub fn run(&self) -> EvictionOutcome {
        self.metrics.record_eviction_pass();
        let mut outcome = EvictionOutcome::default();

        for collection in self.bindings.pending_removal() {
            outcome.junk_marked += mark_all_junk(&collection);
            drive_junk(&collection, &mut outcome);
        }

        for binding in self.bindings.bindings() {
            let collection = binding.collection();
            if self.invalidated.contains(&collection.resource_type()) {
                outcome.junk_marked += mark_all_junk(collection);
            }
            outcome.junk_marked += match collection.kind() {
                CollectionKind::Tiled => self.sweep_tiled(collection),
                CollectionKind::Keyed => {
                    let offered: HashSet<String> =
                        binding.provider().provided_data_keys().into_iter().collect();
                    sweep_keyed(collection, &offered)
                }
            };
            drive_junk(collection, &mut outcome);
        }

        self.bindings.drop_drained();
        self.metrics.record_junk_marked(outcome.junk_marked as u64);
        self.metrics.record_entries_removed(outcome.removed as u64);
        if outcome.junk_marked > 0 || outcome.removed > 0 {
            debug!(
                junk_marked = outcome.junk_marked,
                advanced = outcome.advanced,
                removed = outcome.removed,
                "eviction pass"
            );
        }
        outcome
    }

    /// Zoom-shift and fallback sweeps. Returns the number of entries newly marked.
    fn sweep_tiled(&self, collection: &ResourceCollection) -> usize {
        let mut marked = 0;
        let entries = collection.entries();

        // Zoom shift
        for entry in &entries {
            let Some(key) = entry.tile_key() else { continue };
            let too_far = key.zoom.distance(self.zone.zoom) > self.limits.max_zoom_shift;
            let inactive_at_zoom = key.zoom == self.zone.zoom && !self.zone.contains(&key);
            if (too_far || inactive_at_zoom) && entry.mark_junk() {
                trace!(resource = %entry.id(), "junk: outside active zoom window");
                marked += 1;
            }
        }

        // Fallback
        let needed = needed_tiles(collection, self.zone, self.limits.max_missing_data_zoom_shift);
        for entry in &entries {
            let Some(key) = entry.tile_key() else { continue };
            if !needed.contains(&key) && entry.mark_junk() {
                trace!(resource = %entry.id(), "junk: not needed as fallback");
                marked += 1;
            }
        }

        marked
    }
}

/// Active tiles plus, for each active tile without a usable entry, the nearest
/// usable coarser ancestor within `max_shift` levels.
pub fn needed_tiles(collection: &ResourceCollection, zone: &ActiveZone, max_shift: u8) -> BTreeSet<TileKey> {
    let mut needed = BTreeSet::new();
    for key in zone.keys() {
        needed.insert(key);
        if is_usable(collection, key) {
            continue;
        }
        if let Some(ancestor) = key
            .overscale_chain(max_shift)
            .find(|ancestor| is_usable(collection, *ancestor))
        {
            needed.insert(ancestor);
        }
    }
    needed
}

fn is_usable(collection: &ResourceCollection, key: TileKey) -> bool {
    collection
        .get(&ResourceId::Tile(key))
        .is_some_and(|entry| !entry.is_junk() && entry.state().is_usable())
}

fn sweep_keyed(collection: &ResourceCollection, offered: &HashSet<String>) -> usize {
    let mut marked = 0;
    for entry in collection.entries() {
        let Some(key) = entry.id().key() else { continue };
        if !offered.contains(key) && entry.mark_junk() {
            trace!(resource = %entry.id(), "junk: key no longer offered");
            marked += 1;
        }
    }
    marked
}

/// Advance every junk entry one step and remove the dead ones.
pub(crate) fn drive_junk(collection: &ResourceCollection, outcome: &mut EvictionOutcome) {
    for entry in collection.entries() {
        if entry.is_junk() {
            outcome.absorb(advance_junk(&entry, false));
        }
    }
    outcome.removed += sweep_dead(collection).len();
}

/// Mark every entry junk. Returns the number of entries newly marked.
pub(crate) fn mark_all_junk(collection: &ResourceCollection) -> usize {
    collection
        .entries()
        .iter()
        .filter(|entry| entry.mark_junk())
        .count()
}

/// Remove entries in `JustBeforeDeath`.
pub(crate) fn sweep_dead(collection: &ResourceCollection) -> Vec<Arc<ResourceEntry>> {
    collection.remove_resources(|entry, _| entry.state() == ResourceState::JustBeforeDeath)
}

/// Result of driving one junk entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JunkStep {
    /// Moved one step toward removal
    Advanced,
    /// Moved to `UnloadPending`; the GPU thread has to release it
    QueuedForUnload,
    /// Another actor owns the next move
    Waiting,
    /// Already `JustBeforeDeath`
    Dead,
}

/// Drive a junk entry one step toward `JustBeforeDeath`.
///
/// `take_scheduler_states` lets teardown claim entries still in `Unknown`,
/// which otherwise belong to the scheduler.
pub(crate) fn advance_junk(entry: &ResourceEntry, take_scheduler_states: bool) -> JunkStep {
    use ResourceState::*;

    match entry.state() {
        Unknown if take_scheduler_states => {
            if entry.transition(Unknown, Requesting).is_some()
                && entry.transition(Requesting, Requested).is_some()
                && entry.transition(Requested, JustBeforeDeath).is_some()
            {
                entry.release_host_data();
                JunkStep::Advanced
            } else {
                JunkStep::Waiting
            }
        }
        Requested | ProcessingRequest => {
            if cancel_request(entry) {
                JunkStep::Advanced
            } else {
                JunkStep::Waiting
            }
        }
        state @ (Ready | Unavailable | Unloaded) => {
            if entry.transition(state, JustBeforeDeath).is_some() {
                entry.release_host_data();
                JunkStep::Advanced
            } else {
                JunkStep::Waiting
            }
        }
        Uploaded => {
            if entry.transition(Uploaded, UnloadPending).is_some() {
                JunkStep::QueuedForUnload
            } else {
                JunkStep::Waiting
            }
        }
        JustBeforeDeath => JunkStep::Dead,
        Unknown | Requesting | RequestCanceledWhileBeingProcessed | Uploading | IsBeingUsed
        | UnloadPending | Unloading => JunkStep::Waiting,
    }
}

// =============================================================================
// Tests
// =============================================================================
