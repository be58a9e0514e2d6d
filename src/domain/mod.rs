//! Domain Layer
//!
//! Payload types and the collaborator traits the engine is written against.
//!
//! - **Data** (`data.rs`) - fetched payloads and GPU handles
//! - **Ports** (`ports.rs`) - providers, GPU context, render signals, resource bundle

pub mod data;
pub mod ports;

pub use data::{
    ElevationTile, GpuHandle, GpuResource, RasterTile, ResourceData, SymbolBitmap, SymbolsData,
};
pub use ports::{
    CancelCheck, DataProvider, DataRequest, GpuContext, NoopSignals, ObtainDataCallback,
    RenderSignals, ResourceBundle,
};
