//! GPU Sync Stage
//!
//! The only code that calls into the [`GpuContext`]. It runs on the thread that
//! owns the GPU context and performs two bounded passes per call:
//!
//! - **Unload**: `UnloadPending → Unloading`, release, `Unloading → Unloaded`,
//!   then `Unloaded → JustBeforeDeath`
//! - **Upload**: `Ready → Uploading`, upload, `Uploading → Uploaded`; a failed
//!   upload goes back to `Ready` and is retried on a later call

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, instrument, trace, warn};

use super::collection::ResourceCollection;
use super::eviction::sweep_dead;
use super::metrics::EngineMetrics;
use super::state::ResourceState;
use crate::domain::ports::GpuContext;

/// Result of one sync call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub uploaded: usize,
    pub unloaded: usize,
    /// Work was left over (budget exhausted or an upload failed)
    pub more_available: bool,
}

impl SyncOutcome {
    pub fn did_work(&self) -> bool {
        self.uploaded > 0 || self.unloaded > 0
    }
}

/// GPU sync stage bound to an explicit GPU context.
pub struct GpuSyncStage<'a> {
    gpu: &'a dyn GpuContext,
    metrics: &'a EngineMetrics,
    wait_for_uploads: bool,
}

impl<'a> GpuSyncStage<'a> {
    pub fn new(gpu: &'a dyn GpuContext, metrics: &'a EngineMetrics) -> Self {
        Self {
            gpu,
            metrics,
            wait_for_uploads: false,
        }
    }

    /// Call `wait_until_upload_completed` after each batch of uploads
    pub fn with_upload_wait(mut self, wait: bool) -> Self {
        self.wait_for_uploads = wait;
        self
    }

    /// Unload then upload, each pass bounded by `limit`
    #[instrument(skip(self, collections), fields(collections = collections.len()))]
    pub fn sync(&self, collections: &[Arc<ResourceCollection>], limit: Option<usize>) -> SyncOutcome {
        self.metrics.record_sync_call();
        let (unloaded, unload_more) = self.unload_pass(collections, limit, false);
        let (uploaded, upload_more) = self.upload_pass(collections, limit);

        let outcome = SyncOutcome {
            uploaded,
            unloaded,
            more_available: unload_more || upload_more,
        };
        if outcome.did_work() || outcome.more_available {
            debug!(uploaded, unloaded, more_available = outcome.more_available, "GPU sync");
        }
        outcome
    }

    /// Release GPU resources of entries waiting for unload.
    ///
    /// With `gpu_context_lost` the release calls are skipped but the entries
    /// still move through the lattice.
    pub fn unload_pass(
        &self,
        collections: &[Arc<ResourceCollection>],
        limit: Option<usize>,
        gpu_context_lost: bool,
    ) -> (usize, bool) {
        let budget = limit.unwrap_or(usize::MAX);
        let mut unloaded = 0;

        for collection in collections {
            for entry in collection.entries() {
                if entry.state() != ResourceState::UnloadPending {
                    continue;
                }
                if unloaded >= budget {
                    return (unloaded, true);
                }
                if entry
                    .transition(ResourceState::UnloadPending, ResourceState::Unloading)
                    .is_none()
                {
                    continue;
                }

                entry.unload_from_gpu(Some(self.gpu), gpu_context_lost);
                if entry
                    .transition(ResourceState::Unloading, ResourceState::Unloaded)
                    .is_some()
                    && entry
                        .transition(ResourceState::Unloaded, ResourceState::JustBeforeDeath)
                        .is_some()
                {
                    entry.release_host_data();
                }
                self.metrics.record_unload();
                unloaded += 1;
            }

            let removed = sweep_dead(collection);
            if !removed.is_empty() {
                self.metrics.record_entries_removed(removed.len() as u64);
            }
        }

        (unloaded, false)
    }

    /// Upload fetched entries.
    pub fn upload_pass(&self, collections: &[Arc<ResourceCollection>], limit: Option<usize>) -> (usize, bool) {
        let budget = limit.unwrap_or(usize::MAX);
        let mut uploaded = 0;
        let mut more_available = false;

        'collections: for collection in collections {
            for entry in collection.entries() {
                if entry.state() != ResourceState::Ready || entry.is_junk() {
                    continue;
                }
                if uploaded >= budget {
                    more_available = true;
                    break 'collections;
                }
                if entry
                    .transition(ResourceState::Ready, ResourceState::Uploading)
                    .is_none()
                {
                    continue;
                }

                match entry.upload_to_gpu(self.gpu) {
                    Ok(bytes) => {
                        entry.transition(ResourceState::Uploading, ResourceState::Uploaded);
                        self.metrics.record_upload(bytes);
                        trace!(resource = %entry.id(), bytes, "uploaded");
                        uploaded += 1;
                    }
                    Err(e) => {
                        warn!(resource = %entry.id(), error = %e, "upload failed, will retry");
                        entry.transition(ResourceState::Uploading, ResourceState::Ready);
                        self.metrics.record_upload_failed();
                        more_available = true;
                    }
                }
            }
        }

        if uploaded > 0 && self.wait_for_uploads {
            self.gpu.wait_until_upload_completed();
        }
        (uploaded, more_available)
    }
}

// =============================================================================
// Tests
// =============================================================================
