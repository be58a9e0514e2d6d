//! Resource Entries
//!
//! One [`ResourceEntry`] exists per identity per collection. The entry owns the
//! fetched payload and, once uploaded, the GPU handle; who may touch either is
//! decided by winning the matching state transition.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, trace, warn};

use super::cancel::TaskHandle;
use super::collection::ResourceCollection;
use super::state::{AtomicResourceState, ResourceState, Transition};
use super::tile::TileKey;
use crate::domain::data::{GpuResource, ResourceData};
use crate::domain::ports::GpuContext;
use crate::error::{Error, Result};

// =============================================================================
// Identity and Type
// =============================================================================

/// Kind of data a collection holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceType {
    /// Elevation (height map) tiles
    ElevationData,
    /// Raster map layer tiles
    MapLayer,
    /// Vector symbol groups
    Symbols,
}

impl ResourceType {
    pub const ALL: [ResourceType; 3] = [
        ResourceType::ElevationData,
        ResourceType::MapLayer,
        ResourceType::Symbols,
    ];

    /// Collection kind used for this type unless the provider says otherwise
    pub fn default_collection_kind(self) -> CollectionKind {
        match self {
            ResourceType::ElevationData | ResourceType::MapLayer => CollectionKind::Tiled,
            ResourceType::Symbols => CollectionKind::Keyed,
        }
    }

    /// Upload a payload the way this resource type is uploaded
    pub(crate) fn upload(self, data: &ResourceData, gpu: &dyn GpuContext) -> Result<GpuResource> {
        match (self, data) {
            (ResourceType::MapLayer, ResourceData::Raster(_))
            | (ResourceType::ElevationData, ResourceData::Elevation(_)) => {
                gpu.upload_tiled_data(data).map(GpuResource::Tile)
            }
            (ResourceType::Symbols, ResourceData::Symbols(group)) => {
                let mut handles = Vec::with_capacity(group.symbols.len());
                for symbol in &group.symbols {
                    match gpu.upload_symbol(symbol) {
                        Ok(handle) => handles.push(handle),
                        Err(e) => {
                            for handle in handles {
                                gpu.release_from_gpu(handle);
                            }
                            return Err(e);
                        }
                    }
                }
                Ok(GpuResource::Symbols(handles))
            }
            (resource_type, data) => Err(Error::UploadFailed {
                resource: resource_type.to_string(),
                reason: format!("unexpected {} payload", data.kind_name()),
            }),
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::ElevationData => write!(f, "elevation"),
            ResourceType::MapLayer => write!(f, "map-layer"),
            ResourceType::Symbols => write!(f, "symbols"),
        }
    }
}

/// How a collection indexes its entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionKind {
    /// Indexed by tile coordinate and zoom
    Tiled,
    /// Indexed by provider-defined key
    Keyed,
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionKind::Tiled => write!(f, "tiled"),
            CollectionKind::Keyed => write!(f, "keyed"),
        }
    }
}

/// Immutable identity of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceId {
    Tile(TileKey),
    Key(String),
}

impl ResourceId {
    pub fn kind(&self) -> CollectionKind {
        match self {
            ResourceId::Tile(_) => CollectionKind::Tiled,
            ResourceId::Key(_) => CollectionKind::Keyed,
        }
    }

    pub fn tile_key(&self) -> Option<TileKey> {
        match self {
            ResourceId::Tile(key) => Some(*key),
            ResourceId::Key(_) => None,
        }
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            ResourceId::Tile(_) => None,
            ResourceId::Key(key) => Some(key),
        }
    }
}

impl From<TileKey> for ResourceId {
    fn from(key: TileKey) -> Self {
        ResourceId::Tile(key)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceId::Tile(key) => write!(f, "{}", key),
            ResourceId::Key(key) => write!(f, "key:{}", key),
        }
    }
}

// =============================================================================
// Entry
// =============================================================================

/// One cached unit of map data.
pub struct ResourceEntry {
    id: ResourceId,
    resource_type: ResourceType,
    state: AtomicResourceState,
    /// Sticky: once set the entry is committed to removal
    junk: AtomicBool,
    data: Mutex<Option<ResourceData>>,
    gpu: Mutex<Option<GpuResource>>,
    task: Mutex<Option<TaskHandle>>,
    collection: Weak<ResourceCollection>,
}

impl ResourceEntry {
    pub(crate) fn new(
        id: ResourceId,
        resource_type: ResourceType,
        collection: Weak<ResourceCollection>,
    ) -> Self {
        Self {
            id,
            resource_type,
            state: AtomicResourceState::default(),
            junk: AtomicBool::new(false),
            data: Mutex::new(None),
            gpu: Mutex::new(None),
            task: Mutex::new(None),
            collection,
        }
    }

    #[inline]
    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    #[inline]
    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    #[inline]
    pub fn tile_key(&self) -> Option<TileKey> {
        self.id.tile_key()
    }

    #[inline]
    pub fn state(&self) -> ResourceState {
        self.state.load()
    }

    /// State plus the number of transitions the entry has gone through
    pub fn state_with_generation(&self) -> (ResourceState, u64) {
        self.state.load_with_generation()
    }

    /// Compare-and-set `from → to`; `None` if another actor moved the entry.
    pub fn transition(&self, from: ResourceState, to: ResourceState) -> Option<Transition> {
        let result = self.state.transition(from, to);
        if let Some(t) = result {
            trace!(resource = %self.id, from = %t.from, to = %t.to, generation = t.generation, "state transition");
        }
        result
    }

    #[inline]
    pub fn is_junk(&self) -> bool {
        self.junk.load(Ordering::Acquire)
    }

    /// Mark the entry junk. Returns `true` only for the call that set the flag.
    pub fn mark_junk(&self) -> bool {
        !self.junk.swap(true, Ordering::AcqRel)
    }

    /// Owning collection, if it is still alive
    pub fn collection(&self) -> Option<Arc<ResourceCollection>> {
        self.collection.upgrade()
    }

    // -------------------------------------------------------------------------
    // Payload, GPU handle and task slots. Callers must hold the state that
    // grants them access (see the module docs of `state`).
    // -------------------------------------------------------------------------

    pub(crate) fn store_data(&self, data: ResourceData) {
        *self.data.lock() = Some(data);
    }

    pub(crate) fn take_data(&self) -> Option<ResourceData> {
        self.data.lock().take()
    }

    pub fn has_data(&self) -> bool {
        self.data.lock().is_some()
    }

    pub(crate) fn store_gpu_resource(&self, resource: GpuResource) {
        *self.gpu.lock() = Some(resource);
    }

    pub(crate) fn take_gpu_resource(&self) -> Option<GpuResource> {
        self.gpu.lock().take()
    }

    pub fn has_gpu_resource(&self) -> bool {
        self.gpu.lock().is_some()
    }

    pub(crate) fn attach_task(&self, task: TaskHandle) {
        *self.task.lock() = Some(task);
    }

    pub(crate) fn task(&self) -> Option<TaskHandle> {
        self.task.lock().clone()
    }

    pub(crate) fn detach_task(&self) {
        self.task.lock().take();
    }

    /// Request cancellation of the attached fetch task, if any
    pub(crate) fn cancel_task(&self) {
        if let Some(task) = self.task.lock().as_ref() {
            task.request_cancel();
        }
    }

    // -------------------------------------------------------------------------
    // GPU operations (GPU Sync Stage only)
    // -------------------------------------------------------------------------

    /// Upload the payload. The caller must have won `Ready → Uploading`.
    ///
    /// On failure the payload is put back so the entry can return to `Ready`.
    /// Returns the VRAM size of the uploaded resource.
    pub(crate) fn upload_to_gpu(&self, gpu: &dyn GpuContext) -> Result<usize> {
        let data = self.take_data().ok_or_else(|| Error::UploadFailed {
            resource: self.id.to_string(),
            reason: "no payload to upload".into(),
        })?;

        match self.resource_type.upload(&data, gpu) {
            Ok(resource) => {
                let size = resource.vram_size();
                self.store_gpu_resource(resource);
                Ok(size)
            }
            Err(e) => {
                self.store_data(data);
                Err(e)
            }
        }
    }

    /// Release the GPU handle. The caller must have won `UnloadPending → Unloading`
    /// (or be tearing down). With `gpu_context_lost` the release calls are skipped.
    pub(crate) fn unload_from_gpu(&self, gpu: Option<&dyn GpuContext>, gpu_context_lost: bool) {
        let Some(resource) = self.take_gpu_resource() else {
            warn!(resource = %self.id, "unloading entry without GPU resource");
            return;
        };
        if gpu_context_lost {
            return;
        }
        match gpu {
            Some(gpu) => {
                for handle in resource.handles() {
                    gpu.release_from_gpu(*handle);
                }
            }
            None => error!(resource = %self.id, "GPU resource dropped without a GPU context"),
        }
    }

    /// Drop host-side payload and task. Caller must have won the move into
    /// `JustBeforeDeath`.
    pub(crate) fn release_host_data(&self) {
        self.take_data();
        self.detach_task();
    }

    // -------------------------------------------------------------------------
    // Renderer access
    // -------------------------------------------------------------------------

    /// Borrow the GPU resource for the current frame (`Uploaded → IsBeingUsed`).
    pub fn try_acquire_for_render(self: &Arc<Self>) -> Option<RenderGuard> {
        if self.is_junk() {
            return None;
        }
        self.transition(ResourceState::Uploaded, ResourceState::IsBeingUsed)?;
        Some(RenderGuard {
            entry: Arc::clone(self),
        })
    }
}

impl fmt::Debug for ResourceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceEntry")
            .field("id", &self.id)
            .field("type", &self.resource_type)
            .field("state", &self.state())
            .field("junk", &self.is_junk())
            .finish()
    }
}

/// Frame-scoped borrow of an uploaded entry. Returns the entry to `Uploaded`
/// when dropped.
pub struct RenderGuard {
    entry: Arc<ResourceEntry>,
}

impl RenderGuard {
    pub fn entry(&self) -> &Arc<ResourceEntry> {
        &self.entry
    }

    /// GPU resource of the borrowed entry.
    ///
    /// # Panics
    ///
    /// Panics if the entry is not in `IsBeingUsed`.
    pub fn gpu_resource(&self) -> GpuResource {
        let state = self.entry.state();
        assert_eq!(
            state,
            ResourceState::IsBeingUsed,
            "GPU resource of {} used in state {}",
            self.entry.id,
            state
        );
        match self.entry.gpu.lock().clone() {
            Some(resource) => resource,
            None => panic!("entry {} is being used without a GPU resource", self.entry.id),
        }
    }
}

impl Drop for RenderGuard {
    fn drop(&mut self) {
        if self
            .entry
            .transition(ResourceState::IsBeingUsed, ResourceState::Uploaded)
            .is_none()
        {
            error!(resource = %self.entry.id, state = %self.entry.state(), "render guard released an entry it did not own");
            debug_assert!(false, "render guard lost ownership of {}", self.entry.id);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::data::{GpuHandle, RasterTile, SymbolBitmap, SymbolsData};
    use crate::resources::tile::{TileId, ZoomLevel};
    use std::cell::{Cell, RefCell};

    #[derive(Default)]
    struct TestGpu {
        next: Cell<u64>,
        fail_after: Cell<Option<u64>>,
        released: RefCell<Vec<GpuHandle>>,
    }

    impl GpuContext for TestGpu {
        fn upload_tiled_data(&self, data: &ResourceData) -> Result<GpuHandle> {
            let id = self.next.get() + 1;
            self.next.set(id);
            Ok(GpuHandle::new(id, data.size_bytes()))
        }

        fn upload_symbol(&self, symbol: &SymbolBitmap) -> Result<GpuHandle> {
            let id = self.next.get() + 1;
            if self.fail_after.get().is_some_and(|limit| id > limit) {
                return Err(Error::UploadFailed {
                    resource: format!("symbol {}", symbol.id),
                    reason: "out of memory".into(),
                });
            }
            self.next.set(id);
            Ok(GpuHandle::new(id, symbol.bitmap.pixels.len()))
        }

        fn release_from_gpu(&self, handle: GpuHandle) {
            self.released.borrow_mut().push(handle);
        }
    }

    fn tile_entry() -> Arc<ResourceEntry> {
        let id = ResourceId::Tile(TileKey::new(TileId::new(1, 2), ZoomLevel::new(3)));
        Arc::new(ResourceEntry::new(id, ResourceType::MapLayer, Weak::new()))
    }

    fn drive(entry: &ResourceEntry, path: &[ResourceState]) {
        for pair in path.windows(2) {
            entry.transition(pair[0], pair[1]).unwrap();
        }
    }

    fn symbols(count: u64) -> ResourceData {
        ResourceData::Symbols(SymbolsData {
            symbols: (0..count)
                .map(|id| SymbolBitmap {
                    id,
                    bitmap: RasterTile::solid(1, 1, [0; 4]),
                })
                .collect(),
        })
    }

    #[test]
    fn test_junk_is_sticky() {
        let entry = tile_entry();
        assert!(!entry.is_junk());
        assert!(entry.mark_junk());
        assert!(!entry.mark_junk());
        assert!(entry.is_junk());
    }

    #[test]
    fn test_identity_accessors() {
        let entry = tile_entry();
        assert_eq!(entry.id().kind(), CollectionKind::Tiled);
        assert_eq!(entry.tile_key().unwrap().zoom, ZoomLevel::new(3));
        assert_eq!(entry.id().to_string(), "1x2@z3");
        assert!(entry.collection().is_none());

        let keyed = ResourceId::Key("poi-42".into());
        assert_eq!(keyed.key(), Some("poi-42"));
        assert_eq!(keyed.to_string(), "key:poi-42");
    }

    #[test]
    fn test_upload_moves_payload_to_gpu() {
        use ResourceState::*;
        let entry = tile_entry();
        let gpu = TestGpu::default();
        entry.store_data(ResourceData::Raster(RasterTile::solid(2, 2, [1; 4])));
        drive(&entry, &[Unknown, Requesting, Requested, ProcessingRequest, Ready, Uploading]);

        assert_eq!(entry.upload_to_gpu(&gpu).unwrap(), 16);
        assert!(!entry.has_data());
        assert!(entry.has_gpu_resource());
    }

    #[test]
    fn test_failed_symbol_upload_restores_payload_and_releases_partial() {
        let id = ResourceId::Key("group".into());
        let entry = ResourceEntry::new(id, ResourceType::Symbols, Weak::new());
        let gpu = TestGpu::default();
        gpu.fail_after.set(Some(2));
        entry.store_data(symbols(3));

        assert!(entry.upload_to_gpu(&gpu).is_err());
        assert!(entry.has_data());
        assert!(!entry.has_gpu_resource());
        assert_eq!(gpu.released.borrow().len(), 2);
    }

    #[test]
    fn test_payload_type_mismatch_is_upload_error() {
        let entry = tile_entry();
        entry.store_data(symbols(1));
        let err = entry.upload_to_gpu(&TestGpu::default()).unwrap_err();
        assert!(matches!(err, Error::UploadFailed { .. }));
        assert!(entry.has_data());
    }

    #[test]
    fn test_unload_skips_release_when_context_lost() {
        let entry = tile_entry();
        let gpu = TestGpu::default();
        entry.store_gpu_resource(GpuResource::Tile(GpuHandle::new(5, 64)));

        entry.unload_from_gpu(Some(&gpu), true);
        assert!(!entry.has_gpu_resource());
        assert!(gpu.released.borrow().is_empty());

        entry.store_gpu_resource(GpuResource::Tile(GpuHandle::new(6, 64)));
        entry.unload_from_gpu(Some(&gpu), false);
        assert_eq!(gpu.released.borrow().as_slice(), &[GpuHandle::new(6, 64)]);
    }

    #[test]
    fn test_render_guard_round_trip() {
        use ResourceState::*;
        let entry = tile_entry();
        entry.store_gpu_resource(GpuResource::Tile(GpuHandle::new(1, 4)));
        drive(
            &entry,
            &[Unknown, Requesting, Requested, ProcessingRequest, Ready, Uploading, Uploaded],
        );

        {
            let guard = entry.try_acquire_for_render().unwrap();
            assert_eq!(entry.state(), IsBeingUsed);
            assert_eq!(guard.gpu_resource(), GpuResource::Tile(GpuHandle::new(1, 4)));
            assert!(entry.try_acquire_for_render().is_none());
        }
        assert_eq!(entry.state(), Uploaded);
    }

    #[test]
    fn test_junk_entries_cannot_be_borrowed() {
        use ResourceState::*;
        let entry = tile_entry();
        drive(
            &entry,
            &[Unknown, Requesting, Requested, ProcessingRequest, Ready, Uploading, Uploaded],
        );
        entry.mark_junk();
        assert!(entry.try_acquire_for_render().is_none());
    }

    #[test]
    fn test_cancel_task_flags_attached_handle() {
        let entry = tile_entry();
        let task = TaskHandle::new();
        entry.attach_task(task.clone());
        entry.cancel_task();
        assert!(task.is_cancel_requested());

        entry.release_host_data();
        assert!(entry.task().is_none());
    }
}
