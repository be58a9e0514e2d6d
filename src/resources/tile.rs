//! Tile Addressing
//!
//! Tile coordinates, zoom levels and the overscale (parent) chain used by the
//! fallback search.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Highest supported zoom level
pub const MAX_ZOOM_LEVEL: u8 = 31;

/// Level of detail. `0` is the whole world in one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ZoomLevel(u8);

impl ZoomLevel {
    pub const MIN: ZoomLevel = ZoomLevel(0);
    pub const MAX: ZoomLevel = ZoomLevel(MAX_ZOOM_LEVEL);

    /// Create a zoom level, clamped to the supported range
    pub fn new(level: u8) -> Self {
        Self(level.min(MAX_ZOOM_LEVEL))
    }

    #[inline]
    pub fn value(self) -> u8 {
        self.0
    }

    /// Absolute distance between two zoom levels
    #[inline]
    pub fn distance(self, other: ZoomLevel) -> u8 {
        self.0.abs_diff(other.0)
    }

    /// The zoom `shift` levels coarser, if it exists
    #[inline]
    pub fn coarser(self, shift: u8) -> Option<ZoomLevel> {
        self.0.checked_sub(shift).map(ZoomLevel)
    }
}

impl fmt::Display for ZoomLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "z{}", self.0)
    }
}

/// Tile coordinate within a zoom level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TileId {
    pub x: i32,
    pub y: i32,
}

impl TileId {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// The tile covering this one `shift` zoom levels up
    #[inline]
    pub fn overscaled_parent(self, shift: u8) -> TileId {
        let shift = u32::from(shift.min(MAX_ZOOM_LEVEL));
        TileId {
            x: self.x >> shift,
            y: self.y >> shift,
        }
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.x, self.y)
    }
}

/// Identity of a tiled resource: coordinate plus zoom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TileKey {
    pub tile: TileId,
    pub zoom: ZoomLevel,
}

impl TileKey {
    pub fn new(tile: TileId, zoom: ZoomLevel) -> Self {
        Self { tile, zoom }
    }

    /// Ancestor `shift` levels coarser, or `None` above zoom 0
    pub fn overscaled_parent(self, shift: u8) -> Option<TileKey> {
        let zoom = self.zoom.coarser(shift)?;
        Some(TileKey {
            tile: self.tile.overscaled_parent(shift),
            zoom,
        })
    }

    /// Ancestors from one level up to `max_shift` levels up, nearest first
    pub fn overscale_chain(self, max_shift: u8) -> impl Iterator<Item = TileKey> {
        (1..=max_shift).map_while(move |shift| self.overscaled_parent(shift))
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.tile, self.zoom)
    }
}

/// Tiles the viewport currently needs, at the active zoom.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveZone {
    pub tiles: BTreeSet<TileId>,
    pub zoom: ZoomLevel,
}

impl ActiveZone {
    pub fn new(tiles: impl IntoIterator<Item = TileId>, zoom: ZoomLevel) -> Self {
        Self {
            tiles: tiles.into_iter().collect(),
            zoom,
        }
    }

    /// Whether `key` is an active tile at the active zoom
    pub fn contains(&self, key: &TileKey) -> bool {
        key.zoom == self.zoom && self.tiles.contains(&key.tile)
    }

    /// Active tile keys
    pub fn keys(&self) -> impl Iterator<Item = TileKey> + '_ {
        self.tiles.iter().map(move |tile| TileKey::new(*tile, self.zoom))
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }
}

impl Default for ZoomLevel {
    fn default() -> Self {
        ZoomLevel::MIN
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zoom_clamp_and_distance() {
        assert_eq!(ZoomLevel::new(200).value(), MAX_ZOOM_LEVEL);
        assert_eq!(ZoomLevel::new(3).distance(ZoomLevel::new(7)), 4);
        assert_eq!(ZoomLevel::new(7).distance(ZoomLevel::new(3)), 4);
        assert_eq!(ZoomLevel::new(2).coarser(3), None);
        assert_eq!(ZoomLevel::new(5).coarser(2), Some(ZoomLevel::new(3)));
    }

    #[test]
    fn test_overscaled_parent() {
        let tile = TileId::new(13, 6);
        assert_eq!(tile.overscaled_parent(1), TileId::new(6, 3));
        assert_eq!(tile.overscaled_parent(2), TileId::new(3, 1));
        assert_eq!(tile.overscaled_parent(0), tile);
    }

    #[test]
    fn test_overscale_chain_stops_at_world_tile() {
        let key = TileKey::new(TileId::new(3, 2), ZoomLevel::new(2));
        let chain: Vec<_> = key.overscale_chain(5).collect();
        assert_eq!(
            chain,
            vec![
                TileKey::new(TileId::new(1, 1), ZoomLevel::new(1)),
                TileKey::new(TileId::new(0, 0), ZoomLevel::new(0)),
            ]
        );
    }

    #[test]
    fn test_active_zone_membership() {
        let zone = ActiveZone::new([TileId::new(1, 1), TileId::new(2, 1)], ZoomLevel::new(4));
        assert!(zone.contains(&TileKey::new(TileId::new(1, 1), ZoomLevel::new(4))));
        assert!(!zone.contains(&TileKey::new(TileId::new(1, 1), ZoomLevel::new(3))));
        assert!(!zone.contains(&TileKey::new(TileId::new(3, 1), ZoomLevel::new(4))));
        assert_eq!(zone.keys().count(), 2);
        assert!(ActiveZone::default().is_empty());
    }

    #[test]
    fn test_display() {
        let key = TileKey::new(TileId::new(4, 9), ZoomLevel::new(12));
        assert_eq!(key.to_string(), "4x9@z12");
    }
}
