use crate::config::TilingConfig;
use crate::error::{Result, TreeTileError};
use crate::raster::Raster;
use log::debug;
use ndarray::{s, Array3};

/// Top-left pixel offset and side length of one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileBounds {
    pub row_offset: usize,
    pub col_offset: usize,
    pub size: usize,
}

impl TileBounds {
    pub fn row_end(&self) -> usize {
        self.row_offset + self.size
    }

    pub fn col_end(&self) -> usize {
        self.col_offset + self.size
    }

    pub fn offset(&self) -> (usize, usize) {
        (self.row_offset, self.col_offset)
    }
}

/// A square `size × size` cut of every band, `(channels, size, size)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    pub row_offset: usize,
    pub col_offset: usize,
    pub pixels: Array3<u16>,
}

impl Window {
    pub fn size(&self) -> usize {
        self.pixels.dim().1
    }

    pub fn channels(&self) -> usize {
        self.pixels.dim().0
    }

    pub fn bounds(&self) -> TileBounds {
        TileBounds {
            row_offset: self.row_offset,
            col_offset: self.col_offset,
            size: self.size(),
        }
    }
}

/// Row-major layout of all windows that fit entirely inside a
/// `raster_height × raster_width` grid. Remainder strips narrower than one
/// window at the bottom and right are dropped, never padded.
#[derive(Debug, Clone)]
pub struct TileGrid {
    raster_height: usize,
    raster_width: usize,
    size: usize,
    stride: usize,
    pub num_tiles_y: usize,
    pub num_tiles_x: usize,
    pub total_tiles: usize,
}

fn positions_along(extent: usize, size: usize, stride: usize) -> usize {
    if extent < size {
        0
    } else {
        (extent - size) / stride + 1
    }
}

impl TileGrid {
    pub fn new(raster_height: usize, raster_width: usize, config: &TilingConfig) -> Self {
        let num_tiles_y = positions_along(raster_height, config.size, config.stride);
        let num_tiles_x = positions_along(raster_width, config.size, config.stride);
        let total_tiles = num_tiles_x * num_tiles_y;

        debug!(
            "TileGrid: {}x{} raster, size={}, stride={} → {}x{} tiles ({} total)",
            raster_height, raster_width, config.size, config.stride, num_tiles_y, num_tiles_x, total_tiles
        );

        Self {
            raster_height,
            raster_width,
            size: config.size,
            stride: config.stride,
            num_tiles_y,
            num_tiles_x,
            total_tiles,
        }
    }

    pub fn for_raster(raster: &Raster, config: &TilingConfig) -> Self {
        Self::new(raster.height(), raster.width(), config)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn raster_shape(&self) -> (usize, usize) {
        (self.raster_height, self.raster_width)
    }

    /// Extent actually touched by at least one window.
    pub fn covered_shape(&self) -> (usize, usize) {
        if self.total_tiles == 0 {
            return (0, 0);
        }
        let covered = |count: usize| {
            if count == 0 {
                0
            } else {
                (count - 1) * self.stride + self.size
            }
        };
        (covered(self.num_tiles_y), covered(self.num_tiles_x))
    }

    pub fn iter(&self) -> TileIterator<'_> {
        TileIterator::new(self)
    }

    /// Bounds of the `tile_idx`-th window in scan order.
    pub fn get_tile_bounds(&self, tile_idx: usize) -> Option<TileBounds> {
        if tile_idx >= self.total_tiles {
            return None;
        }
        let tile_y = tile_idx / self.num_tiles_x;
        let tile_x = tile_idx % self.num_tiles_x;
        Some(TileBounds {
            row_offset: tile_y * self.stride,
            col_offset: tile_x * self.stride,
            size: self.size,
        })
    }

    /// Lazily cut every window out of `raster`, which must have the grid's
    /// dimensions.
    pub fn windows<'a>(&'a self, raster: &'a Raster) -> Result<Windows<'a>> {
        if raster.shape() != self.raster_shape() {
            return Err(TreeTileError::ShapeMismatch(format!(
                "raster is {:?} but the tile grid was laid out for {:?}",
                raster.shape(),
                self.raster_shape()
            )));
        }
        Ok(Windows {
            tiles: self.iter(),
            raster,
        })
    }
}

pub struct TileIterator<'a> {
    grid: &'a TileGrid,
    current_idx: usize,
}

impl<'a> TileIterator<'a> {
    fn new(grid: &'a TileGrid) -> Self {
        Self {
            grid,
            current_idx: 0,
        }
    }
}

impl<'a> Iterator for TileIterator<'a> {
    type Item = (usize, TileBounds);

    fn next(&mut self) -> Option<Self::Item> {
        let bounds = self.grid.get_tile_bounds(self.current_idx)?;
        let idx = self.current_idx;
        self.current_idx += 1;
        Some((idx, bounds))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.grid.total_tiles.saturating_sub(self.current_idx);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for TileIterator<'_> {}

pub struct Windows<'a> {
    tiles: TileIterator<'a>,
    raster: &'a Raster,
}

impl Iterator for Windows<'_> {
    type Item = Window;

    fn next(&mut self) -> Option<Self::Item> {
        let (_, bounds) = self.tiles.next()?;
        Some(extract_window(self.raster, &bounds))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.tiles.size_hint()
    }
}

impl ExactSizeIterator for Windows<'_> {}

pub fn extract_window(raster: &Raster, bounds: &TileBounds) -> Window {
    let pixels = raster
        .data()
        .slice(s![
            ..,
            bounds.row_offset..bounds.row_end(),
            bounds.col_offset..bounds.col_end()
        ])
        .to_owned();
    Window {
        row_offset: bounds.row_offset,
        col_offset: bounds.col_offset,
        pixels,
    }
}

/// Collect every window of `raster` in scan order.
pub fn tile(raster: &Raster, config: &TilingConfig) -> Vec<Window> {
    let grid = TileGrid::for_raster(raster, config);
    grid.iter().map(|(_, bounds)| extract_window(raster, &bounds)).collect()
}
