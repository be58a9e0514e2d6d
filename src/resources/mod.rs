//! Resource Lifecycle & Cache Engine
//!
//! Tracks every piece of map data from "not yet requested" to "evicted" while
//! several threads request, cancel, upload, unload and sweep entries.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                        ResourcesEngine                            │
//! │                                                                   │
//! │  ProviderBindingTable ──▶ ResourceCollection ──▶ ResourceEntry    │
//! │          │                      ▲    ▲              (atomic state)│
//! │          ▼                      │    │                            │
//! │   EvictionPass ─────────────────┘    │                            │
//! │   RequestScheduler ──▶ FetchWorkerPool (LifecycleBridge)          │
//! │   GpuSyncStage ────────────────────── ▶ GpuContext                │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Execution Contexts
//!
//! - Cache worker: eviction and scheduling, woken by a condition variable
//! - Fetch pool: one job per entry
//! - GPU thread: the only caller of `sync_resources_in_gpu` and
//!   `release_all_resources`
//! - Render thread: reads snapshots and borrows entries per frame

pub mod bindings;
pub mod bootstrap;
pub mod bridge;
pub mod cancel;
pub mod collection;
pub mod engine;
pub mod entry;
pub mod eviction;
pub mod gpu_sync;
pub mod metrics;
pub mod pool;
pub mod scheduler;
pub mod state;
pub mod tile;

#[cfg(test)]
mod proptest;

pub use bindings::{BindingsDiff, ProviderBindingTable, ProviderId, ProviderRegistration};
pub use bootstrap::StubKind;
pub use bridge::LifecycleBridge;
pub use cancel::TaskHandle;
pub use collection::{CollectionSnapshot, CollectionStats, ResourceCollection};
pub use engine::{CacheCycle, ResourcesEngine};
pub use entry::{CollectionKind, RenderGuard, ResourceEntry, ResourceId, ResourceType};
pub use eviction::{EvictionLimits, EvictionOutcome, EvictionPass};
pub use gpu_sync::{GpuSyncStage, SyncOutcome};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use scheduler::RequestScheduler;
pub use state::{AtomicResourceState, ResourceState, Transition};
pub use tile::{ActiveZone, TileId, TileKey, ZoomLevel, MAX_ZOOM_LEVEL};
