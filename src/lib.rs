//! Tileres - Resource Lifecycle & Cache Engine for Tiled Map Rendering
//!
//! Decides which map tiles and auxiliary data must be fetched, keeps them in a
//! cache, uploads them to the GPU, falls back to coarser tiles while finer data
//! is missing, and evicts whatever is no longer needed. Every entry carries an
//! atomic lifecycle state so fetch workers, the cache worker, the GPU thread
//! and the render thread can cooperate without a global lock.
//!
//! # Architecture
//!
//! ```text
//! active zone ─▶ EvictionPass ─▶ RequestScheduler ─▶ FetchWorkerPool ─▶ DataProvider
//!                     │                                     │
//!                     ▼                                     ▼
//!              ResourceCollection ◀──── ResourceEntry (atomic state + payload)
//!                     │
//!                     ▼
//!               GpuSyncStage ─▶ GpuContext          RenderGuard ◀─ render thread
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - In-memory providers, GPU context and resource bundle
//! - [`config`] - Engine configuration
//! - [`domain`] - Payload types and collaborator traits
//! - [`error`] - Error types
//! - [`resources`] - Lifecycle state machine, collections and the engine

pub mod adapters;
pub mod config;
pub mod domain;
pub mod error;
pub mod resources;

// Re-export commonly used types
pub use config::EngineConfig;
pub use domain::{DataProvider, GpuContext, RenderSignals, ResourceBundle, ResourceData};
pub use error::{Error, Result};
pub use resources::{
    ProviderId, ProviderRegistration, ResourceState, ResourceType, ResourcesEngine, TileId,
    TileKey, ZoomLevel,
};

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
