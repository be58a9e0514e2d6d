//! Embedded Resource Bundle
//!
//! In-memory [`ResourceBundle`] holding encoded bitmaps by name and density.
//! Bitmaps use a minimal container: magic, little-endian width and height,
//! then RGBA pixels.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::domain::data::RasterTile;
use crate::domain::ports::ResourceBundle;

const MAGIC: &[u8; 4] = b"TRES";
const HEADER_LEN: usize = 12;

/// Encode a raster tile into the bundle container format
pub fn encode_bitmap(tile: &RasterTile) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + tile.pixels.len());
    buf.put_slice(MAGIC);
    buf.put_u32_le(tile.width);
    buf.put_u32_le(tile.height);
    buf.put_slice(&tile.pixels);
    buf.freeze()
}

/// Decode the bundle container format. `None` if malformed.
pub fn decode_bitmap(encoded: &[u8]) -> Option<RasterTile> {
    if encoded.len() < HEADER_LEN || &encoded[..4] != MAGIC {
        return None;
    }
    let mut header = &encoded[4..HEADER_LEN];
    let width = header.get_u32_le();
    let height = header.get_u32_le();
    let expected = (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(4)?;
    let pixels = &encoded[HEADER_LEN..];
    if pixels.len() != expected {
        return None;
    }
    Some(RasterTile::new(width, height, Bytes::copy_from_slice(pixels)))
}

/// Named bitmaps, each available at one or more density factors.
#[derive(Debug, Default, Clone)]
pub struct EmbeddedBundle {
    resources: HashMap<String, Vec<(f32, Bytes)>>,
}

impl EmbeddedBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bundle with `processing_tile` and `unavailable_tile` at 1x and 2x
    pub fn with_default_stubs() -> Self {
        let mut bundle = Self::new();
        for density in [1.0f32, 2.0] {
            let size = (16.0 * density) as u32;
            bundle.insert(
                "processing_tile",
                density,
                encode_bitmap(&RasterTile::solid(size, size, [0xc8, 0xc8, 0xc8, 0xff])),
            );
            bundle.insert(
                "unavailable_tile",
                density,
                encode_bitmap(&RasterTile::solid(size, size, [0xe0, 0x40, 0x40, 0xff])),
            );
        }
        bundle
    }

    /// Add an encoded resource at `density_factor`
    pub fn insert(&mut self, name: impl Into<String>, density_factor: f32, encoded: Bytes) {
        self.resources
            .entry(name.into())
            .or_default()
            .push((density_factor, encoded));
    }
}

impl ResourceBundle for EmbeddedBundle {
    /// Closest available density wins
    fn get_resource(&self, name: &str, density_factor: f32) -> Option<Bytes> {
        self.resources
            .get(name)?
            .iter()
            .min_by(|(a, _), (b, _)| {
                (a - density_factor)
                    .abs()
                    .total_cmp(&(b - density_factor).abs())
            })
            .map(|(_, encoded)| encoded.clone())
    }

    fn decode_bitmap(&self, encoded: &[u8]) -> Option<RasterTile> {
        decode_bitmap(encoded)
    }
}
