//! Resources Engine
//!
//! Public façade tying the binding table, scheduler, eviction pass and GPU
//! sync stage together.
//!
//! ```text
//!  update_active_zone ──┐
//!  update_bindings ─────┼──▶ wake ──▶ cache worker: EvictionPass ─▶ RequestScheduler ─▶ fetch pool
//!  invalidate_* ────────┘                                                                  │
//!                                                                      request_gpu_sync ◀──┘
//!  GPU thread:    sync_resources_in_gpu(gpu, limit) ─▶ GpuSyncStage (unload, upload)
//!  render thread: collection snapshot ─▶ entry.try_acquire_for_render()
//! ```
//!
//! The cache worker is a single thread blocked on a condition variable; it
//! reaches the engine through a [`LifecycleBridge`], so it never runs a pass
//! against an engine that is being dropped.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

use super::bindings::{BindingsDiff, ProviderBindingTable, ProviderId, ProviderRegistration};
use super::bootstrap::{StubKind, StubResources};
use super::bridge::LifecycleBridge;
use super::collection::{CollectionStats, ResourceCollection};
use super::entry::{ResourceEntry, ResourceType};
use super::eviction::{advance_junk, drive_junk, mark_all_junk, sweep_dead, EvictionLimits, EvictionOutcome, EvictionPass};
use super::gpu_sync::{GpuSyncStage, SyncOutcome};
use super::metrics::{EngineMetrics, MetricsSnapshot};
use super::scheduler::RequestScheduler;
use super::tile::{ActiveZone, TileId, ZoomLevel};
use crate::config::EngineConfig;
use crate::domain::ports::{GpuContext, RenderSignals, ResourceBundle};
use crate::error::{Error, Result};

/// Result of one eviction + scheduling cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheCycle {
    pub eviction: EvictionOutcome,
    /// Fetch jobs dispatched
    pub dispatched: usize,
}

// =============================================================================
// Core
// =============================================================================

struct EngineCore {
    config: EngineConfig,
    bindings: ProviderBindingTable,
    scheduler: RequestScheduler,
    stubs: Option<StubResources>,
    metrics: Arc<EngineMetrics>,
    signals: Arc<dyn RenderSignals>,
    zone: RwLock<ActiveZone>,
    invalidated: Mutex<HashSet<ResourceType>>,
    /// Serializes cache cycles and teardown
    pass_lock: Mutex<()>,
}

impl EngineCore {
    fn limits(&self) -> EvictionLimits {
        EvictionLimits {
            max_zoom_shift: self.config.max_zoom_shift,
            max_missing_data_zoom_shift: self.config.max_missing_data_zoom_shift,
        }
    }

    /// Live, pending and stub collections
    fn all_collections(&self) -> Vec<Arc<ResourceCollection>> {
        let mut collections = self.bindings.all_collections();
        if let Some(stubs) = &self.stubs {
            collections.push(stubs.collection().clone());
        }
        collections
    }

    #[instrument(skip(self))]
    fn run_cache_cycle(&self) -> CacheCycle {
        let _pass = self.pass_lock.lock();
        let zone = self.zone.read().clone();
        let invalidated = std::mem::take(&mut *self.invalidated.lock());

        let stub_invalidated = invalidated.contains(&ResourceType::MapLayer);
        let mut eviction = EvictionPass::new(&self.bindings, &zone, self.limits(), &invalidated, &self.metrics).run();

        let mut dispatched = self.scheduler.schedule(&self.bindings, &zone);
        if let Some(stubs) = &self.stubs {
            // Junk stubs may be borrowed or in flight; keep driving them until gone
            let mut stub_outcome = EvictionOutcome::default();
            if stub_invalidated {
                stub_outcome.junk_marked = mark_all_junk(stubs.collection());
            }
            drive_junk(stubs.collection(), &mut stub_outcome);
            self.metrics.record_junk_marked(stub_outcome.junk_marked as u64);
            self.metrics.record_entries_removed(stub_outcome.removed as u64);
            eviction.junk_marked += stub_outcome.junk_marked;
            eviction.advanced += stub_outcome.advanced;
            eviction.removed += stub_outcome.removed;
            eviction.needs_gpu_sync |= stub_outcome.needs_gpu_sync;

            dispatched += self
                .scheduler
                .schedule_collection(stubs.collection(), stubs.provider(), &zone);
        }

        if eviction.needs_gpu_sync {
            self.signals.request_gpu_sync();
        }
        CacheCycle { eviction, dispatched }
    }
}

// =============================================================================
// Cache Worker
// =============================================================================

#[derive(Default)]
struct WakeState {
    pending: bool,
    shutdown: bool,
}

#[derive(Default)]
struct CacheWorkerSignal {
    state: Mutex<WakeState>,
    cv: Condvar,
}

impl CacheWorkerSignal {
    fn wake(&self) {
        self.state.lock().pending = true;
        self.cv.notify_one();
    }

    fn stop(&self) {
        self.state.lock().shutdown = true;
        self.cv.notify_all();
    }

    /// Block until woken. Returns `false` on shutdown.
    fn wait(&self) -> bool {
        let mut state = self.state.lock();
        while !state.pending && !state.shutdown {
            self.cv.wait(&mut state);
        }
        state.pending = false;
        !state.shutdown
    }
}

fn spawn_cache_worker(
    bridge: LifecycleBridge<EngineCore>,
    signal: Arc<CacheWorkerSignal>,
) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("tileres-cache".into())
        .spawn(move || {
            debug!("cache worker started");
            while signal.wait() {
                if bridge.with(|core| core.run_cache_cycle()).is_none() {
                    break;
                }
            }
            debug!("cache worker exiting");
        })?;
    Ok(handle)
}

// =============================================================================
// Engine
// =============================================================================

/// Resource lifecycle and cache engine.
pub struct ResourcesEngine {
    core: Arc<EngineCore>,
    bridge: LifecycleBridge<EngineCore>,
    signal: Arc<CacheWorkerSignal>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for ResourcesEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcesEngine").finish_non_exhaustive()
    }
}

impl ResourcesEngine {
    /// Create an engine without stub imagery
    pub fn new(config: EngineConfig, signals: Arc<dyn RenderSignals>) -> Result<Self> {
        Self::build(config, signals, None)
    }

    /// Create an engine that loads stub imagery from `bundle`
    pub fn with_bundle(
        config: EngineConfig,
        signals: Arc<dyn RenderSignals>,
        bundle: Arc<dyn ResourceBundle>,
    ) -> Result<Self> {
        Self::build(config, signals, Some(bundle))
    }

    fn build(
        config: EngineConfig,
        signals: Arc<dyn RenderSignals>,
        bundle: Option<Arc<dyn ResourceBundle>>,
    ) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(EngineMetrics::new());
        let scheduler = RequestScheduler::new(config.effective_worker_threads(), metrics.clone(), signals.clone())?;
        let stubs = bundle.map(|bundle| StubResources::new(bundle, config.stub_density_factor));
        let background = config.background_worker;

        let core = Arc::new(EngineCore {
            config,
            bindings: ProviderBindingTable::new(),
            scheduler,
            stubs,
            metrics,
            signals,
            zone: RwLock::new(ActiveZone::default()),
            invalidated: Mutex::new(HashSet::new()),
            pass_lock: Mutex::new(()),
        });
        let bridge = LifecycleBridge::new(&core);
        let signal = Arc::new(CacheWorkerSignal::default());

        let worker = if background {
            Some(spawn_cache_worker(bridge.clone(), signal.clone())?)
        } else {
            None
        };

        info!(
            workers = core.scheduler.num_workers(),
            background,
            stubs = core.stubs.is_some(),
            "resources engine started"
        );

        let engine = Self {
            core,
            bridge,
            signal,
            worker: Mutex::new(worker),
            shut_down: AtomicBool::new(false),
        };
        engine.request_cache_cycle();
        Ok(engine)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::EngineShutDown);
        }
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    /// Wake the cache worker. Without a background worker callers drive
    /// cycles through [`process_pending_work`](Self::process_pending_work).
    pub fn request_cache_cycle(&self) {
        if self.core.config.background_worker {
            self.signal.wake();
        }
    }

    /// Run one eviction + scheduling cycle on the calling thread
    pub fn process_pending_work(&self) -> Result<CacheCycle> {
        self.ensure_running()?;
        Ok(self.core.run_cache_cycle())
    }

    // -------------------------------------------------------------------------
    // Driver API
    // -------------------------------------------------------------------------

    /// Replace the set of bound providers
    pub fn update_bindings(&self, providers: Vec<ProviderRegistration>) -> Result<BindingsDiff> {
        self.ensure_running()?;
        let diff = self.core.bindings.update_bindings(providers)?;
        if !diff.is_empty() {
            self.request_cache_cycle();
        }
        Ok(diff)
    }

    /// Set the tiles the viewport needs at `zoom`
    pub fn update_active_zone(&self, tiles: impl IntoIterator<Item = TileId>, zoom: ZoomLevel) {
        let zone = ActiveZone::new(tiles, zoom);
        {
            let mut current = self.core.zone.write();
            if *current == zone {
                return;
            }
            *current = zone;
        }
        self.request_cache_cycle();
    }

    pub fn active_zone(&self) -> ActiveZone {
        self.core.zone.read().clone()
    }

    /// Upload and unload on the GPU thread. `upload_limit` falls back to the
    /// configured per-sync limit.
    pub fn sync_resources_in_gpu(&self, gpu: &dyn GpuContext, upload_limit: Option<usize>) -> SyncOutcome {
        let limit = upload_limit.or(self.core.config.upload_limit_per_sync);
        let collections = self.core.all_collections();
        let outcome = GpuSyncStage::new(gpu, &self.core.metrics)
            .with_upload_wait(self.core.config.sync_uploads_with_gpu_worker)
            .sync(&collections, limit);
        if outcome.unloaded > 0 {
            self.core.bindings.drop_drained();
        }
        if outcome.uploaded > 0 || outcome.unloaded > 0 {
            // Uploads may release fallback ancestors; unloads may leave active
            // identities without an entry
            self.request_cache_cycle();
        }
        outcome
    }

    /// Mark every entry of `resource_type` junk on the next cycle
    pub fn invalidate_resources_of_type(&self, resource_type: ResourceType) {
        self.core.invalidated.lock().insert(resource_type);
        info!(%resource_type, "resources invalidated");
        self.request_cache_cycle();
    }

    /// Mark every entry junk on the next cycle
    pub fn invalidate_all_resources(&self) {
        self.core.invalidated.lock().extend(ResourceType::ALL);
        info!("all resources invalidated");
        self.request_cache_cycle();
    }

    /// Drive every entry of every collection to removal, blocking until done.
    ///
    /// Must be called on the GPU thread. With `gpu_context_lost` no release
    /// calls are made. Entries borrowed by the calling thread must be returned
    /// first or this never finishes.
    #[instrument(skip(self, gpu))]
    pub fn release_all_resources(&self, gpu: &dyn GpuContext, gpu_context_lost: bool) {
        let core = &self.core;
        let _pass = core.pass_lock.lock();
        let started = Instant::now();
        let interval = core.config.teardown_poll_interval();
        let stage = GpuSyncStage::new(gpu, &core.metrics);
        let mut passes = 0u64;

        loop {
            passes += 1;
            core.metrics.record_teardown_pass();
            let collections = core.all_collections();

            for collection in &collections {
                mark_all_junk(collection);
                for entry in collection.entries() {
                    advance_junk(&entry, true);
                }
            }
            stage.unload_pass(&collections, None, gpu_context_lost);

            let mut remaining = 0;
            for collection in &collections {
                let removed = sweep_dead(collection);
                core.metrics.record_entries_removed(removed.len() as u64);
                remaining += collection.len();
            }
            core.bindings.drop_drained();

            if remaining == 0 {
                break;
            }
            if passes % 1000 == 0 {
                warn!(passes, remaining, "teardown still waiting on busy entries");
            }
            thread::sleep(interval);
        }

        info!(passes, elapsed_ms = started.elapsed().as_millis() as u64, gpu_context_lost, "all resources released");
    }

    /// Stop the cache worker and the fetch pool. Further driver calls fail
    /// with [`Error::EngineShutDown`]. Call `release_all_resources` first to
    /// free GPU memory.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        for collection in self.core.all_collections() {
            for entry in collection.entries() {
                entry.cancel_task();
            }
        }

        self.signal.stop();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                error!("cache worker panicked");
            }
        }
        self.bridge.retire();
        self.core.scheduler.shutdown();
        info!("resources engine shut down");
    }

    // -------------------------------------------------------------------------
    // Renderer / inspection API
    // -------------------------------------------------------------------------

    /// Placeholder entry for `kind`, once uploaded
    pub fn stub(&self, kind: StubKind) -> Option<Arc<ResourceEntry>> {
        self.core.stubs.as_ref().and_then(|stubs| stubs.get(kind))
    }

    /// Collection bound to `provider`
    pub fn collection(&self, provider: ProviderId) -> Option<Arc<ResourceCollection>> {
        self.core
            .bindings
            .get(provider)
            .map(|binding| binding.collection().clone())
    }

    /// Every collection the engine still owns, including pending and stub ones
    pub fn collections(&self) -> Vec<Arc<ResourceCollection>> {
        self.core.all_collections()
    }

    /// Entry counts by state for every collection
    pub fn collection_stats(&self) -> Vec<CollectionStats> {
        self.core
            .all_collections()
            .iter()
            .map(|collection| collection.stats())
            .collect()
    }

    /// Total number of live entries
    pub fn entry_count(&self) -> usize {
        self.core.all_collections().iter().map(|c| c.len()).sum()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.core.metrics.snapshot()
    }

    /// Fetch jobs queued or running
    pub fn in_flight_fetches(&self) -> usize {
        self.core.scheduler.in_flight()
    }

    /// Wait until no fetch job is queued or running. Returns `false` on timeout.
    pub fn wait_for_fetches(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.in_flight_fetches() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }
}

impl Drop for ResourcesEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// =============================================================================
// Tests
// =============================================================================
