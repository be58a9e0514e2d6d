//! Synthetic Data Providers
//!
//! Providers that generate data in memory. Latency, missing tiles, failures
//! and natively asynchronous delivery can be configured to exercise every
//! path through the fetch lifecycle.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::domain::data::{ElevationTile, RasterTile, ResourceData, SymbolBitmap, SymbolsData};
use crate::domain::ports::{CancelCheck, DataProvider, DataRequest, ObtainDataCallback};
use crate::error::{Error, Result};
use crate::resources::entry::{CollectionKind, ResourceType};
use crate::resources::tile::{TileKey, ZoomLevel, MAX_ZOOM_LEVEL};

/// Granularity of cancellation checks while simulating latency
const LATENCY_SLICE: Duration = Duration::from_millis(1);

/// Sleep for `latency`, returning early (with `false`) once cancelled.
fn simulate_latency(latency: Duration, is_cancelled: &dyn Fn() -> bool) -> bool {
    let deadline = Instant::now() + latency;
    loop {
        if is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(LATENCY_SLICE.min(deadline - now));
    }
}

// =============================================================================
// Tiled Provider
// =============================================================================

#[derive(Debug)]
struct SyntheticInner {
    name: String,
    resource_type: ResourceType,
    zoom_range: (ZoomLevel, ZoomLevel),
    tile_size: u32,
    latency: Duration,
    missing: HashSet<TileKey>,
    failing: HashSet<TileKey>,
    natural_async: bool,
    fetches: AtomicUsize,
}

impl SyntheticInner {
    fn produce(
        &self,
        request: &DataRequest,
        is_cancelled: &dyn Fn() -> bool,
    ) -> Result<Option<ResourceData>> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        if !simulate_latency(self.latency, is_cancelled) {
            return Ok(None);
        }

        let key = request.id.tile_key().ok_or_else(|| Error::ProviderFailed {
            provider: self.name.clone(),
            reason: format!("{} is not a tile identity", request.id),
        })?;
        if self.failing.contains(&key) {
            return Err(Error::ProviderFailed {
                provider: self.name.clone(),
                reason: format!("no route to {key}"),
            });
        }
        if self.missing.contains(&key) {
            return Ok(None);
        }

        let data = match self.resource_type {
            ResourceType::ElevationData => {
                let samples = (self.tile_size * self.tile_size) as usize;
                let base = key.zoom.value() as f32 * 100.0;
                let heights = (0..samples).map(|i| base + i as f32).collect();
                ResourceData::Elevation(ElevationTile::new(self.tile_size, heights))
            }
            _ => ResourceData::Raster(RasterTile::solid(
                self.tile_size,
                self.tile_size,
                tile_color(&key),
            )),
        };
        Ok(Some(data))
    }
}

/// Tile color derived from its coordinates
fn tile_color(key: &TileKey) -> [u8; 4] {
    [
        (key.tile.x as u8).wrapping_mul(37),
        (key.tile.y as u8).wrapping_mul(59),
        key.zoom.value().wrapping_mul(13),
        0xff,
    ]
}

/// Tiled provider producing solid rasters or elevation ramps.
#[derive(Debug, Clone)]
pub struct SyntheticTileProvider {
    inner: Arc<SyntheticInner>,
}

impl SyntheticTileProvider {
    fn with_type(resource_type: ResourceType, name: &str) -> Self {
        Self {
            inner: Arc::new(SyntheticInner {
                name: name.to_string(),
                resource_type,
                zoom_range: (ZoomLevel::MIN, ZoomLevel::new(MAX_ZOOM_LEVEL)),
                tile_size: 4,
                latency: Duration::ZERO,
                missing: HashSet::new(),
                failing: HashSet::new(),
                natural_async: false,
                fetches: AtomicUsize::new(0),
            }),
        }
    }

    /// Map layer provider
    pub fn raster() -> Self {
        Self::with_type(ResourceType::MapLayer, "synthetic-raster")
    }

    /// Elevation provider
    pub fn elevation() -> Self {
        Self::with_type(ResourceType::ElevationData, "synthetic-elevation")
    }

    // Builders apply before the provider is shared, so `Arc::get_mut` holds.
    fn configure(mut self, f: impl FnOnce(&mut SyntheticInner)) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => f(inner),
            None => warn!(provider = %self.inner.name, "Provider already shared, configuration ignored"),
        }
        self
    }

    pub fn with_zoom_range(self, min: ZoomLevel, max: ZoomLevel) -> Self {
        self.configure(|inner| inner.zoom_range = (min, max))
    }

    pub fn with_tile_size(self, tile_size: u32) -> Self {
        self.configure(|inner| inner.tile_size = tile_size.max(1))
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.configure(|inner| inner.latency = latency)
    }

    /// Tiles answered with "no data"
    pub fn with_missing(self, keys: impl IntoIterator<Item = TileKey>) -> Self {
        self.configure(|inner| inner.missing.extend(keys))
    }

    /// Tiles answered with a provider failure
    pub fn with_failures(self, keys: impl IntoIterator<Item = TileKey>) -> Self {
        self.configure(|inner| inner.failing.extend(keys))
    }

    /// Deliver async fetches from a dedicated thread
    pub fn with_natural_async(self, natural_async: bool) -> Self {
        self.configure(|inner| inner.natural_async = natural_async)
    }

    /// Number of fetches started so far
    pub fn fetch_count(&self) -> usize {
        self.inner.fetches.load(Ordering::Relaxed)
    }
}

impl DataProvider for SyntheticTileProvider {
    fn resource_type(&self) -> ResourceType {
        self.inner.resource_type
    }

    fn zoom_range(&self) -> (ZoomLevel, ZoomLevel) {
        self.inner.zoom_range
    }

    fn obtain_data(
        &self,
        request: &DataRequest,
        is_cancelled: &dyn Fn() -> bool,
    ) -> Result<Option<ResourceData>> {
        self.inner.produce(request, is_cancelled)
    }

    fn supports_natural_async(&self) -> bool {
        self.inner.natural_async
    }

    fn obtain_data_async(
        &self,
        request: DataRequest,
        is_cancelled: CancelCheck,
        callback: ObtainDataCallback,
    ) {
        if !self.inner.natural_async {
            match self.inner.produce(&request, &*is_cancelled) {
                Ok(data) => callback(true, data),
                Err(_) => callback(false, None),
            }
            return;
        }

        let inner = self.inner.clone();
        let callback = Arc::new(Mutex::new(Some(callback)));
        let thread_callback = callback.clone();
        let spawned = thread::Builder::new()
            .name("synthetic-async".to_string())
            .spawn(move || {
                let result = inner.produce(&request, &*is_cancelled);
                let Some(callback) = thread_callback.lock().take() else {
                    return;
                };
                match result {
                    Ok(data) => callback(true, data),
                    Err(e) => {
                        debug!(error = %e, "Async fetch failed");
                        callback(false, None)
                    }
                }
            });
        if let Err(e) = spawned {
            warn!(error = %e, "Failed to spawn async fetch thread");
            if let Some(callback) = callback.lock().take() {
                callback(false, None);
            }
        }
    }
}

// =============================================================================
// Keyed Provider
// =============================================================================

/// Keyed symbols provider with a mutable key set.
#[derive(Debug)]
pub struct StaticKeyedProvider {
    keys: RwLock<Vec<String>>,
    symbols_per_key: usize,
    latency: Duration,
    fetches: AtomicUsize,
}

impl StaticKeyedProvider {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: RwLock::new(keys.into_iter().map(Into::into).collect()),
            symbols_per_key: 2,
            latency: Duration::ZERO,
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn with_symbols_per_key(mut self, n: usize) -> Self {
        self.symbols_per_key = n;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Replace the offered keys; takes effect on the next cache cycle
    pub fn set_keys<I, S>(&self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.keys.write() = keys.into_iter().map(Into::into).collect();
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }
}

impl DataProvider for StaticKeyedProvider {
    fn resource_type(&self) -> ResourceType {
        ResourceType::Symbols
    }

    fn collection_kind(&self) -> CollectionKind {
        CollectionKind::Keyed
    }

    fn obtain_data(
        &self,
        request: &DataRequest,
        is_cancelled: &dyn Fn() -> bool,
    ) -> Result<Option<ResourceData>> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        if !simulate_latency(self.latency, is_cancelled) {
            return Ok(None);
        }
        let Some(key) = request.id.key() else {
            return Ok(None);
        };
        if !self.keys.read().iter().any(|k| k == key) {
            return Ok(None);
        }

        let symbols = (0..self.symbols_per_key)
            .map(|i| SymbolBitmap {
                id: i as u64,
                bitmap: RasterTile::solid(4, 4, [i as u8, 0x80, 0x80, 0xff]),
            })
            .collect();
        Ok(Some(ResourceData::Symbols(SymbolsData { symbols })))
    }

    fn provided_data_keys(&self) -> Vec<String> {
        self.keys.read().clone()
    }
}

// =============================================================================
// Tests
// =============================================================================
