//! Property-Based Tests for the Resource Lifecycle
//!
//! # Test Properties
//!
//! 1. **Graph Conformance**: concurrent transition attempts only ever succeed
//!    along edges of the lifecycle graph
//! 2. **Single History**: the winning transitions of an entry, ordered by
//!    generation, form one unbroken chain from `Unknown`
//! 3. **Identity Uniqueness**: concurrent allocation never yields two entries
//!    for one identity
//! 4. **Fallback Coverage**: the needed-tiles map always retains every active tile
//! 5. **Single Outcome**: a fetch racing a cancel ends exactly one way, and its
//!    job always leaves the pool

#![cfg(test)]

use std::collections::HashMap;
use std::hint;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use proptest::prelude::*;

use super::bindings::ProviderId;
use super::collection::ResourceCollection;
use super::entry::{CollectionKind, ResourceId, ResourceType};
use super::eviction::needed_tiles;
use super::metrics::EngineMetrics;
use super::scheduler::{cancel_request, RequestScheduler};
use super::state::{AtomicResourceState, ResourceState, Transition};
use super::tile::{ActiveZone, TileId, TileKey, ZoomLevel};
use crate::domain::data::{RasterTile, ResourceData};
use crate::domain::ports::{DataProvider, DataRequest, NoopSignals};
use crate::error::Result;

// =============================================================================
// Property Strategies
// =============================================================================

/// Every edge of the lifecycle graph.
fn edges() -> Vec<(ResourceState, ResourceState)> {
    let mut edges = Vec::new();
    for from in ResourceState::ALL {
        for to in ResourceState::ALL {
            if from.can_transition_to(to) {
                edges.push((from, to));
            }
        }
    }
    edges
}

/// Per-thread schedules of transition attempts.
fn schedules_strategy() -> impl Strategy<Value = Vec<Vec<(ResourceState, ResourceState)>>> {
    let edge = prop::sample::select(edges());
    prop::collection::vec(prop::collection::vec(edge, 1..60), 2..6)
}

/// Small tile ids at one zoom level.
fn tile_strategy() -> impl Strategy<Value = (i32, i32)> {
    (0i32..8, 0i32..8)
}

// =============================================================================
// State Machine Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: winners form a single chain and every step is an edge.
    #[test]
    fn prop_concurrent_transitions_form_one_chain(schedules in schedules_strategy()) {
        let state = Arc::new(AtomicResourceState::default());
        let history = Arc::new(Mutex::new(Vec::<Transition>::new()));
        let barrier = Arc::new(Barrier::new(schedules.len()));

        let handles: Vec<_> = schedules
            .into_iter()
            .map(|schedule| {
                let state = state.clone();
                let history = history.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for (from, to) in schedule {
                        if let Some(t) = state.transition(from, to) {
                            history.lock().push(t);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut history = history.lock().clone();
        history.sort_by_key(|t| t.generation);

        let mut current = ResourceState::Unknown;
        for (i, t) in history.iter().enumerate() {
            prop_assert_eq!(t.generation, i as u64 + 1);
            prop_assert_eq!(t.from, current);
            prop_assert!(t.from.can_transition_to(t.to));
            current = t.to;
        }
        prop_assert_eq!(state.load_with_generation(), (current, history.len() as u64));
    }

    /// Property: `JustBeforeDeath` has no outgoing edge.
    #[test]
    fn prop_terminal_state_has_no_exit(to in prop::sample::select(ResourceState::ALL.to_vec())) {
        prop_assert!(!ResourceState::JustBeforeDeath.can_transition_to(to));
    }
}

// =============================================================================
// Collection Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: concurrent allocation yields one entry per identity.
    #[test]
    fn prop_identity_uniqueness(
        requests in prop::collection::vec(prop::collection::vec(tile_strategy(), 1..40), 2..5),
    ) {
        let collection = ResourceCollection::new(ProviderId::new(1), ResourceType::MapLayer, CollectionKind::Tiled);
        let created = Arc::new(Mutex::new(HashMap::<ResourceId, usize>::new()));
        let barrier = Arc::new(Barrier::new(requests.len()));

        let mut distinct: Vec<(i32, i32)> = requests.iter().flatten().copied().collect();
        distinct.sort();
        distinct.dedup();

        let handles: Vec<_> = requests
            .into_iter()
            .map(|tiles| {
                let collection = collection.clone();
                let created = created.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for (x, y) in tiles {
                        let id = ResourceId::Tile(TileKey::new(TileId::new(x, y), ZoomLevel::new(3)));
                        let (entry, is_new) = collection.obtain_or_allocate(id.clone());
                        assert_eq!(entry.id(), &id);
                        if is_new {
                            *created.lock().entry(id).or_insert(0) += 1;
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        prop_assert_eq!(collection.len(), distinct.len());
        let created = created.lock();
        prop_assert_eq!(created.len(), distinct.len());
        prop_assert!(created.values().all(|count| *count == 1));
    }

    /// Property: the needed-tiles map contains every active tile.
    #[test]
    fn prop_needed_tiles_cover_active_zone(
        active in prop::collection::btree_set(tile_strategy(), 0..16),
        zoom in 0u8..10,
        shift in 0u8..5,
    ) {
        let collection = ResourceCollection::new(ProviderId::new(1), ResourceType::MapLayer, CollectionKind::Tiled);
        let zone = ActiveZone::new(active.iter().map(|(x, y)| TileId::new(*x, *y)), ZoomLevel::new(zoom));
        let needed = needed_tiles(&collection, &zone, shift);
        for key in zone.keys() {
            prop_assert!(needed.contains(&key));
        }
        // Nothing is usable, so nothing beyond the active set is needed
        prop_assert_eq!(needed.len(), zone.tiles.len());
    }
}

// =============================================================================
// Fetch Cancellation Properties
// =============================================================================

/// Busy-waits before answering, so a cancel can land in any state.
struct SpinningProvider {
    spins: u32,
}

impl DataProvider for SpinningProvider {
    fn resource_type(&self) -> ResourceType {
        ResourceType::MapLayer
    }

    fn obtain_data(&self, _request: &DataRequest, _is_cancelled: &dyn Fn() -> bool) -> Result<Option<ResourceData>> {
        for _ in 0..self.spins {
            hint::spin_loop();
        }
        Ok(Some(ResourceData::Raster(RasterTile::solid(1, 1, [7; 4]))))
    }
}

fn spin(iterations: u32) {
    for _ in 0..iterations {
        hint::spin_loop();
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: cancel racing completion yields one terminal outcome.
    #[test]
    fn prop_cancel_races_completion_to_one_outcome(
        fetch_spins in 0u32..20_000,
        cancel_delay in 0u32..20_000,
    ) {
        let metrics = Arc::new(EngineMetrics::new());
        let scheduler = RequestScheduler::new(1, metrics.clone(), Arc::new(NoopSignals)).unwrap();
        let collection = ResourceCollection::new(ProviderId::new(1), ResourceType::MapLayer, CollectionKind::Tiled);
        let provider: Arc<dyn DataProvider> = Arc::new(SpinningProvider { spins: fetch_spins });
        let id = ResourceId::Tile(TileKey::new(TileId::new(0, 0), ZoomLevel::new(2)));

        prop_assert!(scheduler.request_entry(&collection, &provider, id.clone()));
        let entry = collection.get(&id).unwrap();

        let canceller = {
            let entry = entry.clone();
            thread::spawn(move || {
                spin(cancel_delay);
                let deadline = Instant::now() + Duration::from_secs(10);
                while Instant::now() < deadline {
                    match entry.state() {
                        ResourceState::Ready
                        | ResourceState::Unavailable
                        | ResourceState::JustBeforeDeath => break,
                        ResourceState::RequestCanceledWhileBeingProcessed => hint::spin_loop(),
                        _ => {
                            cancel_request(&entry);
                        }
                    }
                }
            })
        };
        canceller.join().unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while scheduler.in_flight() > 0 && Instant::now() < deadline {
            thread::yield_now();
        }
        prop_assert_eq!(scheduler.in_flight(), 0);

        let snapshot = metrics.snapshot();
        prop_assert!(snapshot.fetches_ready + snapshot.fetches_cancelled <= 1);
        match entry.state() {
            ResourceState::Ready => {
                prop_assert_eq!(snapshot.fetches_ready, 1);
                prop_assert_eq!(snapshot.fetches_cancelled, 0);
                prop_assert!(entry.has_data());
            }
            ResourceState::JustBeforeDeath => {
                prop_assert_eq!(snapshot.fetches_ready, 0);
                prop_assert!(!entry.has_data());
            }
            other => prop_assert!(false, "fetch ended in {}", other),
        }
        scheduler.shutdown();
    }
}
