//! In-Memory Adapters
//!
//! Implementations of the domain ports that need no real GPU, network or
//! asset archive. The CLI simulation and the test suites run on these.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Ports (domain::ports)                   │
//! │  DataProvider │ GpuContext │ ResourceBundle                  │
//! └──────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Adapters (this module)                    │
//! │  SyntheticTileProvider │ StaticKeyedProvider │ RecordingGpu  │
//! │  EmbeddedBundle                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod embedded_bundle;
mod memory_provider;
mod recording_gpu;

pub use embedded_bundle::{decode_bitmap, encode_bitmap, EmbeddedBundle};
pub use memory_provider::{StaticKeyedProvider, SyntheticTileProvider};
pub use recording_gpu::RecordingGpu;
