use ndarray::{s, Array2, Array3, Array4};
use tempfile::tempdir;
use treetile::records::list_chunks;
use treetile::{
    create_raster, generate_prediction, generate_training, io, predict, read_records, reconstruct, synthetic, tile,
    Classifier, GeoTransform, PipelineConfig, Raster, RecordConfig, RecordReader, Result, TileGrid, TilingConfig,
    TreeTileError, WindowLayout,
};

fn config(size: usize, chunk_size: usize, basename: &str) -> PipelineConfig {
    PipelineConfig::new(
        TilingConfig::non_overlapping(size).unwrap(),
        RecordConfig::new(chunk_size, basename).unwrap(),
    )
}

/// Scores the class equal to the window's top-left value modulo `classes`.
struct TopLeftClassifier {
    classes: usize,
    raw: Vec<u16>,
}

impl Classifier for TopLeftClassifier {
    fn predict_batch(&mut self, inputs: &Array4<f32>) -> Result<Array2<f32>> {
        let n = inputs.dim().0;
        let mut scores = Array2::zeros((n, self.classes));
        for i in 0..n {
            let class = self.raw.remove(0) as usize % self.classes;
            scores[[i, class]] = 1.0;
        }
        Ok(scores)
    }
}

#[test]
fn fifteen_by_fifteen_yields_nine_windows_in_scan_order() {
    let raster = synthetic::training_raster().unwrap();
    let windows = tile(&raster, &TilingConfig::non_overlapping(5).unwrap());
    let offsets: Vec<_> = windows.iter().map(|w| (w.row_offset, w.col_offset)).collect();
    assert_eq!(
        offsets,
        vec![
            (0, 0),
            (0, 5),
            (0, 10),
            (5, 0),
            (5, 5),
            (5, 10),
            (10, 0),
            (10, 5),
            (10, 10)
        ]
    );
    assert!(windows.iter().all(|w| w.pixels.dim() == (4, 5, 5)));
}

#[test]
fn window_count_matches_formula_and_stays_in_bounds() {
    for (height, width) in [(1, 1), (5, 5), (12, 15), (17, 9), (30, 31)] {
        let data = Array3::zeros((1, height, width));
        let raster = Raster::new(data, GeoTransform::identity(), None).unwrap();
        for size in 1..=6 {
            for stride in 1..=6 {
                let tiling = TilingConfig::new(size, stride).unwrap();
                let windows = tile(&raster, &tiling);
                let expected = if height < size || width < size {
                    0
                } else {
                    ((height - size) / stride + 1) * ((width - size) / stride + 1)
                };
                assert_eq!(windows.len(), expected, "{}x{} size {} stride {}", height, width, size, stride);
                for w in &windows {
                    assert!(w.row_offset + size <= height);
                    assert!(w.col_offset + size <= width);
                }
                let mut sorted: Vec<_> = windows.iter().map(|w| (w.row_offset, w.col_offset)).collect();
                sorted.sort();
                let scanned: Vec<_> = windows.iter().map(|w| (w.row_offset, w.col_offset)).collect();
                assert_eq!(sorted, scanned);
            }
        }
    }
}

#[test]
fn remainder_rows_are_dropped_when_tiling() {
    let raster = synthetic::prediction_raster().unwrap();
    let grid = TileGrid::for_raster(&raster, &TilingConfig::non_overlapping(5).unwrap());
    let rows: Vec<_> = grid.iter().map(|(_, b)| b.row_offset).collect();
    assert!(rows.iter().all(|&r| r == 0 || r == 5));
    assert_eq!(grid.total_tiles, 6);
    assert_eq!(grid.covered_shape(), (10, 15));
}

#[test]
fn prediction_records_round_trip_exactly() {
    let dir = tempdir().unwrap();
    let raster = synthetic::prediction_raster().unwrap();
    let tiling = TilingConfig::non_overlapping(5).unwrap();
    let windows = tile(&raster, &tiling);

    let paths = generate_prediction(&raster, &config(5, 4, "prediction"), dir.path()).unwrap();
    let records = read_records(&paths).unwrap();

    assert_eq!(records.len(), windows.len());
    for (record, window) in records.iter().zip(&windows) {
        assert_eq!(record.pixels, window.pixels);
        assert_eq!(record.offset(), Some((window.row_offset, window.col_offset)));
    }
}

#[test]
fn chunk_listing_reproduces_write_order() {
    let dir = tempdir().unwrap();
    let raster = synthetic::index_raster(40, 40, 1, 1.0).unwrap();
    // 64 windows over 11 chunks: names must sort numerically
    let written = generate_prediction(&raster, &config(5, 6, "prediction"), dir.path()).unwrap();
    assert_eq!(written.len(), 11);
    assert_eq!(list_chunks(dir.path(), "prediction").unwrap(), written);

    let offsets: Vec<_> = RecordReader::open(&written)
        .map(|r| r.unwrap().offset().unwrap())
        .collect();
    let expected: Vec<_> = (0..8).flat_map(|r| (0..8).map(move |c| (r * 5, c * 5))).collect();
    assert_eq!(offsets, expected);
}

#[test]
fn training_records_from_finer_ground_truth() {
    let dir = tempdir().unwrap();
    let imagery = synthetic::training_raster().unwrap();
    let ground_truth = synthetic::ground_truth_raster(2020).unwrap();

    let paths = generate_training(&imagery, &ground_truth, &config(5, 100, "training"), dir.path()).unwrap();
    let records = read_records(&paths).unwrap();
    assert_eq!(records.len(), 9);
    for record in &records {
        let label = record.label().unwrap();
        assert!((1..=synthetic::MAX_CLASS).contains(&label));
    }
}

#[test]
fn training_fails_when_ground_truth_is_too_small() {
    let dir = tempdir().unwrap();
    let imagery = synthetic::training_raster().unwrap();
    let small = Raster::new(
        Array3::from_elem((1, 10, 10), 1u16),
        GeoTransform::from_origin(synthetic::ORIGIN_WEST, synthetic::ORIGIN_NORTH, 1.0, 1.0),
        None,
    )
    .unwrap();
    let result = generate_training(&imagery, &small, &config(5, 100, "training"), dir.path());
    assert!(matches!(result, Err(TreeTileError::Geometry(_))));
}

#[test]
fn predicted_map_has_source_shape() {
    let dir = tempdir().unwrap();
    let raster = synthetic::prediction_raster().unwrap();
    let paths = generate_prediction(&raster, &config(5, 100, "prediction"), dir.path()).unwrap();

    let mut classifier = TopLeftClassifier {
        classes: 7,
        raw: tile(&raster, &TilingConfig::non_overlapping(5).unwrap())
            .iter()
            .map(|w| w.pixels[[0, 0, 0]])
            .collect(),
    };
    let predictions = predict(RecordReader::open(&paths), &mut classifier, 2).unwrap();
    assert_eq!(predictions.len(), 6);

    let map = create_raster(&predictions, 5, raster.shape()).unwrap();
    assert_eq!(map.dim(), (12, 15));

    for p in &predictions {
        let block = map.slice(s![p.row_offset..p.row_offset + 5, p.col_offset..p.col_offset + 5]);
        assert!(block.iter().all(|&v| v == p.class));
        let top_left = (p.row_offset * 15 + p.col_offset) as u16;
        assert_eq!(p.class, top_left % 7);
    }
    assert!(map.slice(s![10..12, ..]).iter().all(|&v| v == 0));
}

#[test]
fn reconstruction_reads_window_size_from_records() {
    let dir = tempdir().unwrap();
    let raster = synthetic::prediction_raster().unwrap();
    let cfg = PipelineConfig::new(
        TilingConfig::new(4, 3).unwrap(),
        RecordConfig::new(5, "prediction").unwrap(),
    );
    generate_prediction(&raster, &cfg, dir.path()).unwrap();

    let chunks = list_chunks(dir.path(), "prediction").unwrap();
    let layout = WindowLayout::from_records(RecordReader::open(&chunks)).unwrap();
    assert_eq!(layout.window_size, Some(4));
    // rows 0,3,6 and cols 0,3,6,9
    assert_eq!(layout.offsets.len(), 12);

    let classes = vec![1u16; layout.offsets.len()];
    let map = layout.reconstruct(&classes, None, raster.shape()).unwrap();
    assert_eq!(map.dim(), (12, 15));
    assert!(matches!(
        layout.reconstruct(&classes, Some(5), raster.shape()),
        Err(TreeTileError::Config(_))
    ));
}

#[test]
fn grid_refuses_a_raster_of_another_shape() {
    let training = synthetic::training_raster().unwrap();
    let prediction = synthetic::prediction_raster().unwrap();
    let grid = TileGrid::for_raster(&training, &TilingConfig::non_overlapping(5).unwrap());
    assert_eq!(grid.windows(&training).unwrap().len(), 9);
    assert!(matches!(grid.windows(&prediction), Err(TreeTileError::ShapeMismatch(_))));
}

#[test]
fn reconstruct_rejects_mismatched_lengths() {
    let result = reconstruct(&[1, 2, 3], &[(0, 0), (0, 5)], 5, (10, 10));
    assert!(matches!(result, Err(TreeTileError::ShapeMismatch(_))));
}

#[test]
fn class_map_written_as_geotiff_keeps_georeferencing() {
    let dir = tempdir().unwrap();
    let raster = synthetic::prediction_raster().unwrap();
    let offsets: Vec<_> = tile(&raster, &TilingConfig::non_overlapping(5).unwrap())
        .iter()
        .map(|w| (w.row_offset, w.col_offset))
        .collect();
    let classes: Vec<u16> = (1..=offsets.len() as u16).collect();
    let map = reconstruct(&classes, &offsets, 5, raster.shape()).unwrap();

    let path = dir.path().join("predicted.tif");
    io::write_class_map(&path, &map, raster.transform(), raster.epsg()).unwrap();
    let back = io::read_raster(&path).unwrap();

    assert_eq!(back.shape(), (12, 15));
    assert_eq!(back.band(0).unwrap(), map.view());
    assert_eq!(back.transform(), raster.transform());
    assert_eq!(back.epsg(), Some(synthetic::EPSG));
}

#[test]
fn imagery_survives_geotiff_round_trip_before_tiling() {
    let dir = tempdir().unwrap();
    let raster = synthetic::training_raster().unwrap();
    let path = dir.path().join("training.tif");
    io::write_raster(&path, &raster).unwrap();

    let back = io::read_raster(&path).unwrap();
    let tiling = TilingConfig::non_overlapping(5).unwrap();
    assert_eq!(tile(&back, &tiling), tile(&raster, &tiling));
}
