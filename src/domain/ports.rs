//! Domain Ports
//!
//! Collaborator abstractions the engine depends on. Providers, the GPU layer,
//! the renderer's wake-up hooks and the embedded resource bundle are all plugged
//! in through these traits; the `adapters` module holds in-memory implementations.
//!
//! ```text
//! ┌────────────────┐   obtain_data    ┌─────────────────────┐   upload/release   ┌─────────────┐
//! │  DataProvider  │ ───────────────▶ │   ResourcesEngine   │ ─────────────────▶ │ GpuContext  │
//! └────────────────┘                  └─────────────────────┘                    └─────────────┘
//!                                        │ request_gpu_sync / request_redraw
//!                                        ▼
//!                                     ┌───────────────┐
//!                                     │ RenderSignals │
//!                                     └───────────────┘
//! ```

use std::sync::Arc;

use bytes::Bytes;

use super::data::{GpuHandle, RasterTile, ResourceData, SymbolBitmap};
use crate::error::Result;
use crate::resources::entry::{CollectionKind, ResourceId, ResourceType};
use crate::resources::tile::{ZoomLevel, MAX_ZOOM_LEVEL};

// =============================================================================
// Data Providers
// =============================================================================

/// A single fetch request handed to a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRequest {
    /// Type of the collection the entry lives in
    pub resource_type: ResourceType,
    /// Identity of the entry being fetched
    pub id: ResourceId,
}

/// Cancellation check handed to async fetches. Returns `true` once the fetch
/// should be abandoned.
pub type CancelCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Completion callback of an async fetch: `(succeeded, data)`.
///
/// `succeeded == true` with `None` data means "no data here".
pub type ObtainDataCallback = Box<dyn FnOnce(bool, Option<ResourceData>) + Send>;

/// Source of raw data for one resource type.
pub trait DataProvider: Send + Sync {
    /// Resource type this provider produces
    fn resource_type(&self) -> ResourceType;

    /// How the collection bound to this provider is indexed
    fn collection_kind(&self) -> CollectionKind {
        self.resource_type().default_collection_kind()
    }

    /// Zoom range served by a tiled provider (inclusive)
    fn zoom_range(&self) -> (ZoomLevel, ZoomLevel) {
        (ZoomLevel::MIN, ZoomLevel::new(MAX_ZOOM_LEVEL))
    }

    /// Fetch data synchronously.
    ///
    /// `Ok(None)` reports that the provider has no data for this identity.
    /// Implementations should consult `is_cancelled` at least on entry and
    /// before returning.
    fn obtain_data(
        &self,
        request: &DataRequest,
        is_cancelled: &dyn Fn() -> bool,
    ) -> Result<Option<ResourceData>>;

    /// Whether `obtain_data_async` is natively asynchronous
    fn supports_natural_async(&self) -> bool {
        false
    }

    /// Fetch data asynchronously; `callback` is invoked exactly once.
    fn obtain_data_async(
        &self,
        request: DataRequest,
        is_cancelled: CancelCheck,
        callback: ObtainDataCallback,
    ) {
        match self.obtain_data(&request, &*is_cancelled) {
            Ok(data) => callback(true, data),
            Err(_) => callback(false, None),
        }
    }

    /// Keys currently offered by a keyed provider
    fn provided_data_keys(&self) -> Vec<String> {
        Vec::new()
    }
}

// =============================================================================
// GPU Layer
// =============================================================================

/// The GPU-owning side of the engine.
///
/// Only ever called from the GPU Sync Stage, on the thread that owns the
/// GPU context. Implementations need not be `Send`.
pub trait GpuContext {
    /// Upload a raster or elevation tile
    fn upload_tiled_data(&self, data: &ResourceData) -> Result<GpuHandle>;

    /// Upload a single symbol bitmap
    fn upload_symbol(&self, symbol: &SymbolBitmap) -> Result<GpuHandle>;

    /// Release a previously uploaded handle
    fn release_from_gpu(&self, handle: GpuHandle);

    /// Block until uploads issued so far are visible to the render thread
    fn wait_until_upload_completed(&self) {}
}

// =============================================================================
// Renderer Signals
// =============================================================================

/// Hooks used to wake the GPU and render threads.
pub trait RenderSignals: Send + Sync {
    /// Uploadable (or unloadable) data exists; the GPU thread should call
    /// `sync_resources_in_gpu`
    fn request_gpu_sync(&self);

    /// Something visible changed (e.g. a tile became unavailable)
    fn request_redraw(&self);
}

/// Signals sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSignals;

impl RenderSignals for NoopSignals {
    fn request_gpu_sync(&self) {}
    fn request_redraw(&self) {}
}

// =============================================================================
// Embedded Resources
// =============================================================================

/// Embedded resource bundle (stub imagery and the like).
pub trait ResourceBundle: Send + Sync {
    /// Encoded resource by name, best match for `density_factor`
    fn get_resource(&self, name: &str, density_factor: f32) -> Option<Bytes>;

    /// Decode an encoded bitmap
    fn decode_bitmap(&self, encoded: &[u8]) -> Option<RasterTile>;
}

// =============================================================================
// Tests
// =============================================================================
