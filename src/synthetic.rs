//! Small deterministic rasters that mirror the shapes and georeferencing of
//! real hyperspectral/ground-truth inputs. Used by tests and `treetile synthesize`.

use crate::error::Result;
use crate::geo::GeoTransform;
use crate::raster::Raster;
use ndarray::Array3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const ORIGIN_WEST: f64 = 272056.0;
pub const ORIGIN_NORTH: f64 = 3289689.0;
/// NAD83 / UTM zone 15N
pub const EPSG: u16 = 26915;
pub const MAX_CLASS: u16 = 20;

/// `channels` identical bands whose value is the row-major pixel index,
/// so every pixel identifies where it came from.
pub fn index_raster(height: usize, width: usize, channels: usize, pixel_size: f64) -> Result<Raster> {
    let data = Array3::from_shape_fn((channels, height, width), |(_, r, c)| (r * width + c) as u16);
    Raster::new(
        data,
        GeoTransform::from_origin(ORIGIN_WEST, ORIGIN_NORTH, pixel_size, pixel_size),
        Some(EPSG),
    )
}

/// 15×15, 4-band imagery at 1 m.
pub fn training_raster() -> Result<Raster> {
    index_raster(15, 15, 4, 1.0)
}

/// 12×15, 4-band imagery at 1 m; its last two rows do not fill a 5-pixel window.
pub fn prediction_raster() -> Result<Raster> {
    index_raster(12, 15, 4, 1.0)
}

/// 30×30 single-band classes in `1..=MAX_CLASS` at 0.5 m over the same extent
/// as [`training_raster`].
pub fn ground_truth_raster(seed: u64) -> Result<Raster> {
    let mut rng = StdRng::seed_from_u64(seed);
    let data = Array3::from_shape_simple_fn((1, 30, 30), || rng.random_range(1..=MAX_CLASS));
    Raster::new(
        data,
        GeoTransform::from_origin(ORIGIN_WEST, ORIGIN_NORTH, 0.5, 0.5),
        Some(EPSG),
    )
}
