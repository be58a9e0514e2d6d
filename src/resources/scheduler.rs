//! Request Scheduler
//!
//! Allocates entries for identities the viewport needs and dispatches one fetch
//! job per new entry to the [`FetchWorkerPool`].
//!
//! ```text
//! schedule ─▶ obtain_or_allocate ─▶ Unknown→Requesting ─▶ Requesting→Requested ─▶ pool.submit
//!                                                                                    │
//!   worker:  Requested→ProcessingRequest ─▶ provider.obtain_data ─▶ ProcessingRequest→Ready|Unavailable
//!                                                                      │ (lost the race)
//!                                                                      ▼
//!                                                   request_cancel, RCWBP→JustBeforeDeath
//! ```
//!
//! Fetch jobs reach the shared services only through a [`LifecycleBridge`], and
//! hold entries weakly.

use std::sync::{Arc, Weak};
use std::time::Instant;

use tracing::{debug, instrument, trace, warn};

use super::bindings::ProviderBindingTable;
use super::bridge::LifecycleBridge;
use super::cancel::TaskHandle;
use super::collection::ResourceCollection;
use super::entry::{CollectionKind, ResourceEntry, ResourceId};
use super::metrics::EngineMetrics;
use super::pool::FetchWorkerPool;
use super::state::ResourceState;
use super::tile::ActiveZone;
use crate::domain::data::ResourceData;
use crate::domain::ports::{CancelCheck, DataProvider, DataRequest, RenderSignals};
use crate::error::Result;

/// What fetch jobs need once their data arrives.
pub(crate) struct FetchServices {
    pub metrics: Arc<EngineMetrics>,
    pub signals: Arc<dyn RenderSignals>,
}

/// Dispatches fetch jobs for missing entries.
pub struct RequestScheduler {
    pool: FetchWorkerPool,
    services: Arc<FetchServices>,
    bridge: LifecycleBridge<FetchServices>,
}

impl RequestScheduler {
    /// Start the scheduler with its own pool of `workers` threads
    pub fn new(workers: usize, metrics: Arc<EngineMetrics>, signals: Arc<dyn RenderSignals>) -> Result<Self> {
        let pool = FetchWorkerPool::new(workers)?;
        let services = Arc::new(FetchServices { metrics, signals });
        let bridge = LifecycleBridge::new(&services);
        Ok(Self {
            pool,
            services,
            bridge,
        })
    }

    /// Fetch jobs queued or running
    pub fn in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    pub fn num_workers(&self) -> usize {
        self.pool.num_workers()
    }

    /// Request every missing identity of every live binding. Returns the
    /// number of fetches dispatched.
    #[instrument(skip(self, bindings, zone), fields(zoom = %zone.zoom, tiles = zone.tiles.len()))]
    pub fn schedule(&self, bindings: &ProviderBindingTable, zone: &ActiveZone) -> usize {
        let mut dispatched = 0;
        for binding in bindings.bindings() {
            dispatched += self.schedule_collection(binding.collection(), binding.provider(), zone);
        }
        if dispatched > 0 {
            debug!(dispatched, "fetches dispatched");
        }
        dispatched
    }

    /// Request the missing part of one collection's active set
    pub fn schedule_collection(
        &self,
        collection: &Arc<ResourceCollection>,
        provider: &Arc<dyn DataProvider>,
        zone: &ActiveZone,
    ) -> usize {
        match collection.kind() {
            CollectionKind::Tiled => {
                let (min_zoom, max_zoom) = provider.zoom_range();
                if zone.zoom < min_zoom || zone.zoom > max_zoom {
                    return 0;
                }
                zone.keys()
                    .filter(|key| self.request_entry(collection, provider, ResourceId::Tile(*key)))
                    .count()
            }
            CollectionKind::Keyed => provider
                .provided_data_keys()
                .into_iter()
                .filter(|key| self.request_entry(collection, provider, ResourceId::Key(key.clone())))
                .count(),
        }
    }

    /// Allocate `id` if absent and dispatch its fetch. Returns `true` if a
    /// fetch job was submitted.
    pub fn request_entry(
        &self,
        collection: &Arc<ResourceCollection>,
        provider: &Arc<dyn DataProvider>,
        id: ResourceId,
    ) -> bool {
        if collection.contains(&id) {
            return false;
        }
        let (entry, created) = collection.obtain_or_allocate(id);
        if !created {
            return false;
        }
        if entry
            .transition(ResourceState::Unknown, ResourceState::Requesting)
            .is_none()
        {
            return false;
        }

        if entry.is_junk() {
            abandon_request(&entry);
            return false;
        }

        let task = TaskHandle::new();
        entry.attach_task(task.clone());
        if entry
            .transition(ResourceState::Requesting, ResourceState::Requested)
            .is_none()
        {
            return false;
        }
        self.services.metrics.record_request_issued();

        let job = FetchJob {
            entry: Arc::downgrade(&entry),
            provider: provider.clone(),
            task,
            bridge: self.bridge.clone(),
        };
        if let Err(e) = self.pool.submit(Box::new(move || job.run())) {
            warn!(resource = %entry.id(), error = %e, "fetch not dispatched");
            if entry
                .transition(ResourceState::Requested, ResourceState::JustBeforeDeath)
                .is_some()
            {
                entry.release_host_data();
            }
            return false;
        }
        true
    }

    /// Stop dispatching: pending callbacks become no-ops and the pool is joined
    pub fn shutdown(&self) {
        self.bridge.retire();
        self.pool.shutdown();
    }
}

impl Drop for RequestScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Finish an allocation that turned out to be junk before it was queued
fn abandon_request(entry: &ResourceEntry) {
    if entry
        .transition(ResourceState::Requesting, ResourceState::Requested)
        .is_some()
        && entry
            .transition(ResourceState::Requested, ResourceState::JustBeforeDeath)
            .is_some()
    {
        entry.release_host_data();
    }
}

// =============================================================================
// Fetch Job
// =============================================================================

struct FetchJob {
    entry: Weak<ResourceEntry>,
    provider: Arc<dyn DataProvider>,
    task: TaskHandle,
    bridge: LifecycleBridge<FetchServices>,
}

impl FetchJob {
    fn run(self) {
        let bridge = self.bridge.clone();
        bridge.with(|services| self.fetch(services));
    }

    fn fetch(self, services: &FetchServices) {
        let Some(entry) = self.entry.upgrade() else {
            return;
        };
        if self.task.is_cancel_requested() {
            // The canceller owns Requested → JustBeforeDeath
            return;
        }
        if entry
            .transition(ResourceState::Requested, ResourceState::ProcessingRequest)
            .is_none()
        {
            return;
        }

        let request = DataRequest {
            resource_type: entry.resource_type(),
            id: entry.id().clone(),
        };
        let started = Instant::now();

        if self.provider.supports_natural_async() {
            let task = self.task.clone();
            let is_cancelled: CancelCheck = Arc::new(move || task.is_cancel_requested());
            let entry = self.entry.clone();
            let task = self.task.clone();
            let bridge = self.bridge.clone();
            self.provider.obtain_data_async(
                request,
                is_cancelled,
                Box::new(move |succeeded, data| {
                    bridge.with(|services| {
                        if let Some(entry) = entry.upgrade() {
                            complete_fetch(services, &entry, &task, started, succeeded, data);
                        }
                    });
                }),
            );
        } else {
            let task = self.task.clone();
            let result = self
                .provider
                .obtain_data(&request, &|| task.is_cancel_requested());
            let (succeeded, data) = match result {
                Ok(data) => (true, data),
                Err(e) => {
                    warn!(resource = %entry.id(), error = %e, "fetch failed");
                    (false, None)
                }
            };
            complete_fetch(services, &entry, &self.task, started, succeeded, data);
        }
    }
}

/// Move a fetched entry out of `ProcessingRequest`, or finalize it if the fetch
/// was cancelled.
fn complete_fetch(
    services: &FetchServices,
    entry: &ResourceEntry,
    task: &TaskHandle,
    started: Instant,
    succeeded: bool,
    data: Option<ResourceData>,
) {
    if !task.is_cancel_requested() {
        let target = match (succeeded, data) {
            (true, Some(data)) => {
                entry.store_data(data);
                ResourceState::Ready
            }
            _ => ResourceState::Unavailable,
        };

        if entry
            .transition(ResourceState::ProcessingRequest, target)
            .is_some()
        {
            entry.detach_task();
            if target == ResourceState::Ready {
                services.metrics.record_fetch_ready(started.elapsed());
                services.signals.request_gpu_sync();
            } else {
                if succeeded {
                    services.metrics.record_fetch_unavailable();
                } else {
                    services.metrics.record_fetch_failed();
                }
                services.signals.request_redraw();
            }
            return;
        }

        // Cancelled concurrently; the completion handler below finalizes
        task.request_cancel();
    }

    finalize_cancelled(services, entry);
}

/// Completion handler of a cancelled fetch: the only actor that performs
/// `RequestCanceledWhileBeingProcessed → JustBeforeDeath`.
fn finalize_cancelled(services: &FetchServices, entry: &ResourceEntry) {
    entry.transition(
        ResourceState::ProcessingRequest,
        ResourceState::RequestCanceledWhileBeingProcessed,
    );
    if entry
        .transition(
            ResourceState::RequestCanceledWhileBeingProcessed,
            ResourceState::JustBeforeDeath,
        )
        .is_some()
    {
        entry.release_host_data();
        services.metrics.record_fetch_cancelled();
        trace!(resource = %entry.id(), "cancelled fetch finalized");
    }
}

/// Cancel whatever fetch currently owns `entry`, moving it one step toward
/// removal. Returns `true` if the entry is now in `JustBeforeDeath`.
pub(crate) fn cancel_request(entry: &ResourceEntry) -> bool {
    match entry.state() {
        ResourceState::Requested => {
            let won = entry
                .transition(ResourceState::Requested, ResourceState::JustBeforeDeath)
                .is_some();
            entry.cancel_task();
            if won {
                entry.release_host_data();
            }
            won
        }
        ResourceState::ProcessingRequest => {
            if entry
                .transition(
                    ResourceState::ProcessingRequest,
                    ResourceState::RequestCanceledWhileBeingProcessed,
                )
                .is_some()
            {
                entry.cancel_task();
            }
            false
        }
        state => state == ResourceState::JustBeforeDeath,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::data::RasterTile;
    use crate::domain::ports::NoopSignals;
    use crate::error::Error;
    use crate::resources::bindings::{ProviderId, ProviderRegistration};
    use crate::resources::entry::ResourceType;
    use crate::resources::tile::{TileId, TileKey, ZoomLevel};
    use parking_lot::{Condvar, Mutex};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Provider whose fetches block until released
    #[derive(Default)]
    struct GatedProvider {
        open: Mutex<bool>,
        cv: Condvar,
        calls: AtomicUsize,
        fail: bool,
    }

    impl GatedProvider {
        fn release(&self) {
            *self.open.lock() = true;
            self.cv.notify_all();
        }
    }

    impl DataProvider for GatedProvider {
        fn resource_type(&self) -> ResourceType {
            ResourceType::MapLayer
        }

        fn obtain_data(
            &self,
            request: &DataRequest,
            is_cancelled: &dyn Fn() -> bool,
        ) -> Result<Option<ResourceData>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut open = self.open.lock();
            while !*open {
                self.cv.wait(&mut open);
            }
            if is_cancelled() {
                return Ok(None);
            }
            if self.fail {
                return Err(Error::ProviderFailed {
                    provider: "gated".into(),
                    reason: format!("{} unreachable", request.id),
                });
            }
            Ok(Some(ResourceData::Raster(RasterTile::solid(1, 1, [1; 4]))))
        }
    }

    #[derive(Default)]
    struct CountingSignals {
        gpu_sync: AtomicUsize,
        redraw: AtomicUsize,
    }

    impl RenderSignals for CountingSignals {
        fn request_gpu_sync(&self) {
            self.gpu_sync.fetch_add(1, Ordering::SeqCst);
        }
        fn request_redraw(&self) {
            self.redraw.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_for(entry: &ResourceEntry, state: ResourceState) {
        for _ in 0..2500 {
            if entry.state() == state {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("{} never reached {}, stuck in {}", entry.id(), state, entry.state());
    }

    fn setup(provider: Arc<GatedProvider>) -> (ProviderBindingTable, Arc<ResourceCollection>) {
        let table = ProviderBindingTable::new();
        table
            .update_bindings(vec![ProviderRegistration::new(ProviderId::new(1), provider)])
            .unwrap();
        let collection = table.get(ProviderId::new(1)).unwrap().collection().clone();
        (table, collection)
    }

    fn key(x: i32) -> TileKey {
        TileKey::new(TileId::new(x, 0), ZoomLevel::new(2))
    }

    #[test]
    fn test_schedule_fetches_active_tiles_once() {
        let provider = Arc::new(GatedProvider::default());
        provider.release();
        let (table, collection) = setup(provider.clone());
        let signals = Arc::new(CountingSignals::default());
        let metrics = Arc::new(EngineMetrics::new());
        let scheduler = RequestScheduler::new(2, metrics.clone(), signals.clone()).unwrap();

        let zone = ActiveZone::new([TileId::new(0, 0), TileId::new(1, 0)], ZoomLevel::new(2));
        assert_eq!(scheduler.schedule(&table, &zone), 2);
        assert_eq!(scheduler.schedule(&table, &zone), 0);

        for x in 0..2 {
            let entry = collection.get(&ResourceId::Tile(key(x))).unwrap();
            wait_for(&entry, ResourceState::Ready);
            assert!(entry.has_data());
        }
        scheduler.shutdown();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(signals.gpu_sync.load(Ordering::SeqCst), 2);
        assert_eq!(metrics.requests_issued(), 2);
    }

    #[test]
    fn test_provider_error_is_unavailable() {
        let provider = Arc::new(GatedProvider {
            fail: true,
            ..Default::default()
        });
        provider.release();
        let (table, collection) = setup(provider);
        let signals = Arc::new(CountingSignals::default());
        let scheduler =
            RequestScheduler::new(1, Arc::new(EngineMetrics::new()), signals.clone()).unwrap();

        scheduler.schedule(&table, &ActiveZone::new([TileId::new(0, 0)], ZoomLevel::new(2)));
        let entry = collection.get(&ResourceId::Tile(key(0))).unwrap();
        wait_for(&entry, ResourceState::Unavailable);
        scheduler.shutdown();
        assert_eq!(signals.redraw.load(Ordering::SeqCst), 1);
        assert!(!entry.has_data());
    }

    #[test]
    fn test_cancel_mid_fetch_is_finalized_by_fetch_path() {
        let provider = Arc::new(GatedProvider::default());
        let (table, collection) = setup(provider.clone());
        let metrics = Arc::new(EngineMetrics::new());
        let scheduler = RequestScheduler::new(1, metrics.clone(), Arc::new(NoopSignals)).unwrap();

        scheduler.schedule(&table, &ActiveZone::new([TileId::new(0, 0)], ZoomLevel::new(2)));
        let entry = collection.get(&ResourceId::Tile(key(0))).unwrap();
        wait_for(&entry, ResourceState::ProcessingRequest);

        assert!(!cancel_request(&entry));
        assert_eq!(entry.state(), ResourceState::RequestCanceledWhileBeingProcessed);

        provider.release();
        wait_for(&entry, ResourceState::JustBeforeDeath);
        scheduler.shutdown();
        assert_eq!(metrics.fetches_cancelled(), 1);
        assert!(!entry.has_data());
    }

    #[test]
    fn test_junk_allocation_is_abandoned() {
        let collection =
            ResourceCollection::new(ProviderId::new(1), ResourceType::MapLayer, CollectionKind::Tiled);
        let (entry, _) = collection.obtain_or_allocate(ResourceId::Tile(key(0)));
        entry.transition(ResourceState::Unknown, ResourceState::Requesting).unwrap();
        entry.mark_junk();

        abandon_request(&entry);
        assert_eq!(entry.state(), ResourceState::JustBeforeDeath);
    }

    #[test]
    fn test_out_of_range_zoom_not_requested() {
        struct Shallow;
        impl DataProvider for Shallow {
            fn resource_type(&self) -> ResourceType {
                ResourceType::ElevationData
            }
            fn zoom_range(&self) -> (ZoomLevel, ZoomLevel) {
                (ZoomLevel::new(0), ZoomLevel::new(5))
            }
            fn obtain_data(
                &self,
                _request: &DataRequest,
                _is_cancelled: &dyn Fn() -> bool,
            ) -> Result<Option<ResourceData>> {
                Ok(None)
            }
        }

        let provider: Arc<dyn DataProvider> = Arc::new(Shallow);
        let collection = ResourceCollection::new(
            ProviderId::new(7),
            ResourceType::ElevationData,
            CollectionKind::Tiled,
        );
        let scheduler =
            RequestScheduler::new(1, Arc::new(EngineMetrics::new()), Arc::new(NoopSignals)).unwrap();

        let deep = ActiveZone::new([TileId::new(0, 0)], ZoomLevel::new(9));
        assert_eq!(scheduler.schedule_collection(&collection, &provider, &deep), 0);
        assert!(collection.is_empty());
    }

    #[test]
    fn test_shut_down_scheduler_finalizes_entry() {
        let provider = Arc::new(GatedProvider::default());
        let (table, collection) = setup(provider);
        let scheduler =
            RequestScheduler::new(1, Arc::new(EngineMetrics::new()), Arc::new(NoopSignals)).unwrap();
        scheduler.shutdown();

        scheduler.schedule(&table, &ActiveZone::new([TileId::new(0, 0)], ZoomLevel::new(2)));
        let entry = collection.get(&ResourceId::Tile(key(0))).unwrap();
        assert_eq!(entry.state(), ResourceState::JustBeforeDeath);
    }
}
