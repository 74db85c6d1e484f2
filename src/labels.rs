//! Mapping imagery windows onto a co-registered ground-truth raster and
//! collapsing the mapped region to a single class id.

use crate::config::{LabelConfig, LabelRule};
use crate::error::{Result, TreeTileError};
use crate::raster::Raster;
use crate::tiling::TileBounds;
use log::debug;
use ndarray::{s, ArrayView2};
use rayon::prelude::*;
use std::collections::BTreeMap;

const EDGE_TOLERANCE: f64 = 1e-6;

/// Half-open pixel region `[row_min, row_max) × [col_min, col_max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRegion {
    pub row_min: usize,
    pub row_max: usize,
    pub col_min: usize,
    pub col_max: usize,
}

impl PixelRegion {
    pub fn height(&self) -> usize {
        self.row_max - self.row_min
    }

    pub fn width(&self) -> usize {
        self.col_max - self.col_min
    }
}

/// Project an imagery window into ground-truth pixel space through both
/// geotransforms.
pub fn map_window(imagery: &Raster, ground_truth: &Raster, bounds: &TileBounds) -> Result<PixelRegion> {
    let src = imagery.transform();
    let dst = ground_truth.transform();

    let (x0, y0) = src.pixel_to_geo(bounds.row_offset as f64, bounds.col_offset as f64);
    let (x1, y1) = src.pixel_to_geo(bounds.row_end() as f64, bounds.col_end() as f64);
    let (r0, c0) = dst.geo_to_pixel(x0, y0)?;
    let (r1, c1) = dst.geo_to_pixel(x1, y1)?;

    // Expand outward to whole ground-truth pixels so a window smaller than
    // one ground-truth pixel still covers the pixel it falls in.
    let row_min = snap(r0.min(r1)).floor();
    let row_max = snap(r0.max(r1)).ceil();
    let col_min = snap(c0.min(c1)).floor();
    let col_max = snap(c0.max(c1)).ceil();

    let (gt_height, gt_width) = ground_truth.shape();
    if row_min < 0.0
        || col_min < 0.0
        || row_max > gt_height as f64
        || col_max > gt_width as f64
        || row_max <= row_min
        || col_max <= col_min
    {
        return Err(TreeTileError::Geometry(format!(
            "window at ({}, {}) maps to ground-truth rows [{}, {}) cols [{}, {}) outside {}x{}",
            bounds.row_offset, bounds.col_offset, row_min, row_max, col_min, col_max, gt_height, gt_width
        )));
    }

    Ok(PixelRegion {
        row_min: row_min as usize,
        row_max: row_max as usize,
        col_min: col_min as usize,
        col_max: col_max as usize,
    })
}

/// Pull coordinates within float drift of a pixel edge onto that edge.
fn snap(value: f64) -> f64 {
    let nearest = value.round();
    if (value - nearest).abs() < EDGE_TOLERANCE {
        nearest
    } else {
        value
    }
}

/// Collapse a ground-truth region to one class id.
pub fn reduce_label(region: ArrayView2<'_, u16>, rule: LabelRule) -> Result<u16> {
    let (rows, cols) = region.dim();
    if rows == 0 || cols == 0 {
        return Err(TreeTileError::Geometry(
            "cannot reduce an empty label window".to_string(),
        ));
    }
    let label = match rule {
        LabelRule::Center => region[[rows / 2, cols / 2]],
        LabelRule::Majority => majority_class(region),
    };
    Ok(label)
}

fn majority_class(region: ArrayView2<'_, u16>) -> u16 {
    let mut counts: BTreeMap<u16, usize> = BTreeMap::new();
    for &value in region.iter() {
        *counts.entry(value).or_insert(0) += 1;
    }
    // BTreeMap iterates ascending, so the first maximum is the smallest id.
    let mut best = (0u16, 0usize);
    for (value, count) in counts {
        if count > best.1 {
            best = (value, count);
        }
    }
    best.0
}

/// Label one imagery window from band 0 of the ground truth.
pub fn label_window(
    imagery: &Raster,
    ground_truth: &Raster,
    bounds: &TileBounds,
    rule: LabelRule,
) -> Result<u16> {
    let region = map_window(imagery, ground_truth, bounds)?;
    let band = ground_truth
        .band(0)
        .ok_or_else(|| TreeTileError::ShapeMismatch("ground truth has no bands".to_string()))?;
    let view = band.slice(s![region.row_min..region.row_max, region.col_min..region.col_max]);
    reduce_label(view, rule)
}

/// Label every window in parallel; the result keeps the input order.
pub fn label_windows(
    imagery: &Raster,
    ground_truth: &Raster,
    tiles: &[TileBounds],
    config: &LabelConfig,
) -> Result<Vec<u16>> {
    debug!(
        "Labelling {} windows with {:?} rule",
        tiles.len(),
        config.rule
    );
    tiles
        .par_iter()
        .map(|bounds| label_window(imagery, ground_truth, bounds, config.rule))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::GeoTransform;
    use ndarray::{arr2, Array3};

    fn imagery(height: usize, width: usize, pixel: f64) -> Raster {
        Raster::new(
            Array3::zeros((1, height, width)),
            GeoTransform::from_origin(1000.0, 2000.0, pixel, pixel),
            None,
        )
        .unwrap()
    }

    fn truth_from(values: Vec<u16>, height: usize, width: usize, pixel: f64) -> Raster {
        let data = Array3::from_shape_vec((1, height, width), values).unwrap();
        Raster::new(data, GeoTransform::from_origin(1000.0, 2000.0, pixel, pixel), None).unwrap()
    }

    #[test]
    fn test_map_window_finer_ground_truth() {
        let img = imagery(15, 15, 1.0);
        let gt = truth_from(vec![0; 900], 30, 30, 0.5);
        let bounds = TileBounds {
            row_offset: 5,
            col_offset: 10,
            size: 5,
        };
        let region = map_window(&img, &gt, &bounds).unwrap();
        assert_eq!(
            region,
            PixelRegion {
                row_min: 10,
                row_max: 20,
                col_min: 20,
                col_max: 30
            }
        );
    }

    #[test]
    fn test_coarser_ground_truth_labels_every_window() {
        let img = imagery(20, 20, 1.0);
        let gt = truth_from(vec![7; 4], 2, 2, 10.0);
        for (row, col) in [(0, 0), (5, 0), (15, 15), (10, 5)] {
            let bounds = TileBounds {
                row_offset: row,
                col_offset: col,
                size: 5,
            };
            let label = label_window(&img, &gt, &bounds, LabelRule::Center).unwrap();
            assert_eq!(label, 7, "window at ({}, {})", row, col);
        }

        let inner = TileBounds {
            row_offset: 5,
            col_offset: 15,
            size: 5,
        };
        assert_eq!(
            map_window(&img, &gt, &inner).unwrap(),
            PixelRegion {
                row_min: 0,
                row_max: 1,
                col_min: 1,
                col_max: 2
            }
        );
    }

    #[test]
    fn test_map_window_ignores_float_drift_at_edges() {
        let img = imagery(10, 10, 0.1);
        let gt = truth_from(vec![0; 100], 10, 10, 0.1);
        let bounds = TileBounds {
            row_offset: 3,
            col_offset: 3,
            size: 3,
        };
        // 1000.3 - 1000.0 is not exactly 0.3 in f64
        assert_eq!(
            map_window(&img, &gt, &bounds).unwrap(),
            PixelRegion {
                row_min: 3,
                row_max: 6,
                col_min: 3,
                col_max: 6
            }
        );
    }

    #[test]
    fn test_map_window_out_of_bounds() {
        let img = imagery(15, 15, 1.0);
        let gt = truth_from(vec![0; 100], 10, 10, 1.0);
        let bounds = TileBounds {
            row_offset: 10,
            col_offset: 0,
            size: 5,
        };
        assert!(matches!(
            map_window(&img, &gt, &bounds),
            Err(TreeTileError::Geometry(_))
        ));
    }

    #[test]
    fn test_map_window_disjoint_extent() {
        let img = imagery(10, 10, 1.0);
        let data = Array3::zeros((1, 10, 10));
        let gt = Raster::new(data, GeoTransform::from_origin(5000.0, 2000.0, 1.0, 1.0), None).unwrap();
        let bounds = TileBounds {
            row_offset: 0,
            col_offset: 0,
            size: 5,
        };
        assert!(map_window(&img, &gt, &bounds).is_err());
    }

    #[test]
    fn test_center_rule() {
        let region = arr2(&[[1, 1, 1, 1], [1, 1, 1, 1], [1, 1, 7, 1], [1, 1, 1, 1]]);
        assert_eq!(reduce_label(region.view(), LabelRule::Center).unwrap(), 7);

        let odd = arr2(&[[1, 2, 3], [4, 5, 6], [7, 8, 9]]);
        assert_eq!(reduce_label(odd.view(), LabelRule::Center).unwrap(), 5);
    }

    #[test]
    fn test_majority_rule() {
        let region = arr2(&[[3, 3, 2], [2, 3, 1], [1, 1, 3]]);
        assert_eq!(reduce_label(region.view(), LabelRule::Majority).unwrap(), 3);
    }

    #[test]
    fn test_majority_tie_prefers_smallest() {
        let region = arr2(&[[4, 4], [2, 2]]);
        assert_eq!(reduce_label(region.view(), LabelRule::Majority).unwrap(), 2);
    }

    #[test]
    fn test_label_windows_preserves_order() {
        let img = imagery(4, 4, 1.0);
        let values: Vec<u16> = (0..16).collect();
        let gt = truth_from(values, 4, 4, 1.0);
        let tiles: Vec<TileBounds> = [(0, 0), (0, 2), (2, 0), (2, 2)]
            .iter()
            .map(|&(r, c)| TileBounds {
                row_offset: r,
                col_offset: c,
                size: 2,
            })
            .collect();
        let labels = label_windows(&img, &gt, &tiles, &LabelConfig::default()).unwrap();
        // centre of a 2x2 block is its bottom-right pixel
        assert_eq!(labels, vec![5, 7, 13, 15]);
    }
}
