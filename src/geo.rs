use crate::error::{Result, TreeTileError};

/// Affine pixel → map transform in GDAL coefficient order
/// `[x_origin, pixel_width, row_rotation, y_origin, col_rotation, pixel_height]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform(pub [f64; 6]);

impl GeoTransform {
    /// Same convention as `rasterio.transform.from_origin`: the y scale is `-ysize`.
    pub fn from_origin(west: f64, north: f64, xsize: f64, ysize: f64) -> Self {
        Self([west, xsize, 0.0, north, 0.0, -ysize])
    }

    pub fn identity() -> Self {
        Self([0.0, 1.0, 0.0, 0.0, 0.0, 1.0])
    }

    pub fn coefficients(&self) -> [f64; 6] {
        self.0
    }

    /// Absolute pixel width and height in map units.
    pub fn pixel_size(&self) -> (f64, f64) {
        (self.0[1].abs(), self.0[5].abs())
    }

    pub fn is_north_up(&self) -> bool {
        self.0[2] == 0.0 && self.0[4] == 0.0
    }

    /// Map coordinate of the top-left corner of pixel `(row, col)`.
    /// Fractional indices are allowed.
    pub fn pixel_to_geo(&self, row: f64, col: f64) -> (f64, f64) {
        let [x0, dx, rx, y0, ry, dy] = self.0;
        (x0 + col * dx + row * rx, y0 + col * ry + row * dy)
    }

    /// Fractional `(row, col)` of a map coordinate.
    pub fn geo_to_pixel(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        let [x0, dx, rx, y0, ry, dy] = self.0;
        let det = dx * dy - rx * ry;
        if det == 0.0 || !det.is_finite() {
            return Err(TreeTileError::Geometry(format!(
                "geotransform {:?} is not invertible",
                self.0
            )));
        }
        let u = x - x0;
        let v = y - y0;
        let col = (dy * u - rx * v) / det;
        let row = (dx * v - ry * u) / det;
        Ok((row, col))
    }
}

impl Default for GeoTransform {
    fn default() -> Self {
        Self::identity()
    }
}
