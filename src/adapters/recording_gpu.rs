//! Recording GPU Context
//!
//! A [`GpuContext`] that hands out sequential handles and records every
//! upload and release. Used by the simulation and tests to check handle
//! balance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use crate::domain::data::{GpuHandle, ResourceData, SymbolBitmap};
use crate::domain::ports::GpuContext;
use crate::error::{Error, Result};

/// In-memory GPU context.
#[derive(Debug, Default)]
pub struct RecordingGpu {
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, GpuHandle>>,
    released: Mutex<Vec<GpuHandle>>,
    fail_next: AtomicUsize,
    upload_waits: AtomicUsize,
    uploads: AtomicUsize,
}

impl RecordingGpu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` uploads fail
    pub fn fail_next_uploads(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Handles uploaded and not yet released
    pub fn live_handles(&self) -> usize {
        self.live.lock().len()
    }

    /// VRAM held by live handles
    pub fn live_vram(&self) -> usize {
        self.live.lock().values().map(|h| h.vram_size).sum()
    }

    /// Every handle released so far, in release order
    pub fn released(&self) -> Vec<GpuHandle> {
        self.released.lock().clone()
    }

    /// Successful uploads so far
    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::Relaxed)
    }

    /// Calls to `wait_until_upload_completed`
    pub fn upload_waits(&self) -> usize {
        self.upload_waits.load(Ordering::Relaxed)
    }

    fn allocate(&self, vram_size: usize, what: &str) -> Result<GpuHandle> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::UploadFailed {
                resource: what.to_string(),
                reason: "injected failure".to_string(),
            });
        }

        let handle = GpuHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1, vram_size);
        self.live.lock().insert(handle.id, handle);
        self.uploads.fetch_add(1, Ordering::Relaxed);
        trace!(handle = handle.id, vram = vram_size, what, "Uploaded");
        Ok(handle)
    }
}

impl GpuContext for RecordingGpu {
    fn upload_tiled_data(&self, data: &ResourceData) -> Result<GpuHandle> {
        match data {
            ResourceData::Symbols(_) => Err(Error::UploadFailed {
                resource: data.kind_name().to_string(),
                reason: "symbols are uploaded one bitmap at a time".to_string(),
            }),
            _ => self.allocate(data.size_bytes(), data.kind_name()),
        }
    }

    fn upload_symbol(&self, symbol: &SymbolBitmap) -> Result<GpuHandle> {
        self.allocate(symbol.bitmap.pixels.len(), "symbol")
    }

    fn release_from_gpu(&self, handle: GpuHandle) {
        // Double release is a caller bug; make it loud in tests.
        let removed = self.live.lock().remove(&handle.id);
        debug_assert!(removed.is_some(), "handle {} released twice", handle.id);
        self.released.lock().push(handle);
    }

    fn wait_until_upload_completed(&self) {
        self.upload_waits.fetch_add(1, Ordering::Relaxed);
    }
}
