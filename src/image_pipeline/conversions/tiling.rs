//! Tile grid planning for big planes.

use serde::Serialize;

use crate::image_pipeline::common::error::{ConversionError, Result};

/// Rectangular region of a plane, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Tile {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Tile {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// The region covering a whole `width` x `height` plane.
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn right(&self) -> u64 {
        u64::from(self.x) + u64::from(self.width)
    }

    pub fn bottom(&self) -> u64 {
        u64::from(self.y) + u64::from(self.height)
    }

    /// Whether this region lies entirely inside a `width` x `height` plane.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.width > 0
            && self.height > 0
            && self.right() <= u64::from(width)
            && self.bottom() <= u64::from(height)
    }
}

/// Number of tiles needed along one axis.
fn tile_count(extent: u32, tile: u32) -> u32 {
    extent.div_ceil(tile)
}

/// Splits a `width` x `height` plane into a row-major grid of tiles.
///
/// Every tile is `tile_width` x `tile_height` except the last column and the
/// last row, which shrink to whatever remains of the plane.
pub fn plan_tiles(width: u32, height: u32, tile_width: u32, tile_height: u32) -> Result<Vec<Tile>> {
    if width == 0 || height == 0 {
        return Err(ConversionError::InvalidDimensions(width, height));
    }
    if tile_width == 0 || tile_height == 0 {
        return Err(ConversionError::InvalidDimensions(tile_width, tile_height));
    }

    let columns = tile_count(width, tile_width);
    let rows = tile_count(height, tile_height);

    let mut tiles = Vec::with_capacity(columns as usize * rows as usize);
    for row in 0..rows {
        let y = row * tile_height;
        let h = if row < rows - 1 { tile_height } else { height - y };
        for column in 0..columns {
            let x = column * tile_width;
            let w = if column < columns - 1 { tile_width } else { width - x };
            tiles.push(Tile::new(x, y, w, h));
        }
    }
    Ok(tiles)
}

/// Whether a plane is big enough to be converted tile by tile.
pub fn is_big_plane(width: u32, height: u32, threshold_pixels: u64) -> bool {
    u64::from(width) * u64::from(height) >= threshold_pixels
}
