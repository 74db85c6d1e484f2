use crate::error::{Result, TreeTileError};
use crate::geo::GeoTransform;
use ndarray::{Array3, ArrayView2};

/// Decoded multi-band raster: samples laid out `(channels, height, width)`
/// plus its georeferencing.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    data: Array3<u16>,
    transform: GeoTransform,
    epsg: Option<u16>,
}

impl Raster {
    pub fn new(data: Array3<u16>, transform: GeoTransform, epsg: Option<u16>) -> Result<Self> {
        let (channels, height, width) = data.dim();
        if channels == 0 {
            return Err(TreeTileError::ShapeMismatch(
                "raster must have at least one band".to_string(),
            ));
        }
        if height == 0 || width == 0 {
            return Err(TreeTileError::InvalidDimensions(width, height));
        }
        Ok(Self {
            data,
            transform,
            epsg,
        })
    }

    pub fn data(&self) -> &Array3<u16> {
        &self.data
    }

    pub fn transform(&self) -> &GeoTransform {
        &self.transform
    }

    pub fn epsg(&self) -> Option<u16> {
        self.epsg
    }

    pub fn channels(&self) -> usize {
        self.data.dim().0
    }

    pub fn height(&self) -> usize {
        self.data.dim().1
    }

    pub fn width(&self) -> usize {
        self.data.dim().2
    }

    /// `(height, width)`
    pub fn shape(&self) -> (usize, usize) {
        (self.height(), self.width())
    }

    pub fn band(&self, index: usize) -> Option<ArrayView2<'_, u16>> {
        if index < self.channels() {
            Some(self.data.index_axis(ndarray::Axis(0), index))
        } else {
            None
        }
    }
}
