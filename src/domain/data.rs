//! Resource Payload Types
//!
//! Host-side data returned by providers and the opaque GPU handles produced by
//! uploading it.

use bytes::Bytes;

// =============================================================================
// Host Payloads
// =============================================================================

/// A decoded raster bitmap (map layer tile or symbol image).
#[derive(Debug, Clone, PartialEq)]
pub struct RasterTile {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// RGBA8 pixel data
    pub pixels: Bytes,
    /// Density factor the bitmap was produced for
    pub density_factor: f32,
}

impl RasterTile {
    /// Create a new raster tile
    pub fn new(width: u32, height: u32, pixels: Bytes) -> Self {
        Self {
            width,
            height,
            pixels,
            density_factor: 1.0,
        }
    }

    /// Set the density factor
    pub fn with_density(mut self, density_factor: f32) -> Self {
        self.density_factor = density_factor;
        self
    }

    /// Create a tile filled with one RGBA color
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let pixels: Vec<u8> = rgba
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 4)
            .collect();
        Self::new(width, height, Bytes::from(pixels))
    }
}

/// A square grid of elevation samples.
#[derive(Debug, Clone, PartialEq)]
pub struct ElevationTile {
    /// Samples per side
    pub size: u32,
    /// Row-major heights in meters
    pub heights: Vec<f32>,
}

impl ElevationTile {
    /// Create a new elevation tile
    pub fn new(size: u32, heights: Vec<f32>) -> Self {
        Self { size, heights }
    }
}

/// One renderable symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolBitmap {
    /// Symbol id, unique within its group
    pub id: u64,
    /// Symbol image
    pub bitmap: RasterTile,
}

/// A group of symbols offered under one key.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SymbolsData {
    pub symbols: Vec<SymbolBitmap>,
}

/// Provider-returned data for a single resource.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceData {
    /// Raster map layer tile
    Raster(RasterTile),
    /// Elevation tile
    Elevation(ElevationTile),
    /// Symbol group
    Symbols(SymbolsData),
}

impl ResourceData {
    /// Approximate host memory held by this payload
    pub fn size_bytes(&self) -> usize {
        match self {
            ResourceData::Raster(tile) => tile.pixels.len(),
            ResourceData::Elevation(tile) => tile.heights.len() * std::mem::size_of::<f32>(),
            ResourceData::Symbols(data) => data.symbols.iter().map(|s| s.bitmap.pixels.len()).sum(),
        }
    }

    /// Short payload kind name used in logs
    pub fn kind_name(&self) -> &'static str {
        match self {
            ResourceData::Raster(_) => "raster",
            ResourceData::Elevation(_) => "elevation",
            ResourceData::Symbols(_) => "symbols",
        }
    }
}

// =============================================================================
// GPU Handles
// =============================================================================

/// Opaque handle into GPU memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuHandle {
    /// Backend-specific id
    pub id: u64,
    /// Estimated VRAM usage in bytes
    pub vram_size: usize,
}

impl GpuHandle {
    pub fn new(id: u64, vram_size: usize) -> Self {
        Self { id, vram_size }
    }
}

/// GPU-side representation of an uploaded resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuResource {
    /// A single texture or buffer for a tiled resource
    Tile(GpuHandle),
    /// One handle per uploaded symbol
    Symbols(Vec<GpuHandle>),
}

impl GpuResource {
    /// All handles held by this resource
    pub fn handles(&self) -> &[GpuHandle] {
        match self {
            GpuResource::Tile(handle) => std::slice::from_ref(handle),
            GpuResource::Symbols(handles) => handles,
        }
    }

    /// Total estimated VRAM usage
    pub fn vram_size(&self) -> usize {
        self.handles().iter().map(|h| h.vram_size).sum()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solid_raster_size() {
        let tile = RasterTile::solid(4, 2, [1, 2, 3, 4]);
        assert_eq!(tile.pixels.len(), 32);
        assert_eq!(&tile.pixels[..8], &[1, 2, 3, 4, 1, 2, 3, 4]);
        assert_eq!(tile.density_factor, 1.0);
    }

    #[test]
    fn test_payload_size() {
        let elevation = ResourceData::Elevation(ElevationTile::new(2, vec![0.0; 4]));
        assert_eq!(elevation.size_bytes(), 16);
        assert_eq!(elevation.kind_name(), "elevation");

        let symbols = ResourceData::Symbols(SymbolsData {
            symbols: vec![
                SymbolBitmap {
                    id: 1,
                    bitmap: RasterTile::solid(1, 1, [0; 4]),
                },
                SymbolBitmap {
                    id: 2,
                    bitmap: RasterTile::solid(2, 1, [0; 4]),
                },
            ],
        });
        assert_eq!(symbols.size_bytes(), 12);
    }

    #[test]
    fn test_gpu_resource_handles() {
        let tile = GpuResource::Tile(GpuHandle::new(7, 1024));
        assert_eq!(tile.handles().len(), 1);
        assert_eq!(tile.vram_size(), 1024);

        let symbols = GpuResource::Symbols(vec![GpuHandle::new(1, 10), GpuHandle::new(2, 20)]);
        assert_eq!(symbols.handles().len(), 2);
        assert_eq!(symbols.vram_size(), 30);
    }
}
