use crate::config::{PipelineConfig, ValidationSplit};
use crate::error::{Result, TreeTileError};
use crate::labels::label_windows;
use crate::raster::Raster;
use crate::reconstruct::Prediction;
use crate::records::{write_prediction, write_records, Record};
use crate::tiling::{extract_window, TileBounds, TileGrid};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Where the label index for the `basename` training records is saved.
pub fn label_index_path(savedir: &Path, basename: &str) -> PathBuf {
    savedir.join(format!("{}_class_labels.csv", basename))
}

/// Contiguous indices `0..K` for the raw class ids found in training labels,
/// assigned in ascending class order. Classifiers train and predict on the
/// indices; records keep the raw ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelIndex {
    classes: Vec<u16>,
}

impl LabelIndex {
    pub fn from_labels<I: IntoIterator<Item = u16>>(labels: I) -> Self {
        let classes: BTreeSet<u16> = labels.into_iter().collect();
        Self {
            classes: classes.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Raw class ids, position `i` holds the class of index `i`.
    pub fn classes(&self) -> &[u16] {
        &self.classes
    }

    pub fn index_of(&self, class: u16) -> Result<usize> {
        self.classes.binary_search(&class).map_err(|_| {
            TreeTileError::ShapeMismatch(format!("class {} is not in the label index", class))
        })
    }

    pub fn class_of(&self, index: usize) -> Result<u16> {
        self.classes.get(index).copied().ok_or_else(|| {
            TreeTileError::ShapeMismatch(format!(
                "class index {} out of range for {} classes",
                index,
                self.classes.len()
            ))
        })
    }

    /// Turn predicted class indices back into raw class ids.
    pub fn restore(&self, predictions: &mut [Prediction]) -> Result<()> {
        for prediction in predictions.iter_mut() {
            prediction.class = self.class_of(prediction.class as usize)?;
        }
        Ok(())
    }

    /// Two columns, `class,label`: raw id and its index.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(["class", "label"])?;
        for (index, class) in self.classes.iter().enumerate() {
            writer.write_record([class.to_string(), index.to_string()])?;
        }
        writer.flush()?;
        debug!("Wrote {} class labels to {}", self.classes.len(), path.display());
        Ok(())
    }

    pub fn read_csv(path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut classes = Vec::new();
        for (row, record) in reader.records().enumerate() {
            let record = record?;
            let field = |i: usize| {
                record.get(i).map(str::trim).ok_or_else(|| {
                    TreeTileError::InvalidRecord(format!("{} row {} has no column {}", path.display(), row + 1, i))
                })
            };
            let class: u16 = field(0)?.parse().map_err(|e| {
                TreeTileError::InvalidRecord(format!("{} row {}: bad class ({})", path.display(), row + 1, e))
            })?;
            let label: usize = field(1)?.parse().map_err(|e| {
                TreeTileError::InvalidRecord(format!("{} row {}: bad label ({})", path.display(), row + 1, e))
            })?;
            if label != row || classes.last().is_some_and(|&last| last >= class) {
                return Err(TreeTileError::InvalidRecord(format!(
                    "{} row {}: labels must be 0..K over ascending classes",
                    path.display(),
                    row + 1
                )));
            }
            classes.push(class);
        }
        Ok(Self { classes })
    }
}

/// Deterministically divide a training record stream into
/// `(training, validation)` sets.
pub fn split_validation<I>(records: I, split: ValidationSplit) -> Result<(Vec<Record>, Vec<Record>)>
where
    I: IntoIterator<Item = Result<Record>>,
{
    let mut training = Vec::new();
    let mut validation = Vec::new();
    for (index, record) in records.into_iter().enumerate() {
        let record = record?;
        if split.is_validation(index) {
            validation.push(record);
        } else {
            training.push(record);
        }
    }
    info!(
        "Split {} records into {} training and {} validation",
        training.len() + validation.len(),
        training.len(),
        validation.len()
    );
    Ok((training, validation))
}

/// Tile `imagery`, label every window from `ground_truth` and write training
/// chunks into `savedir`, along with the [`LabelIndex`] of the labels written
/// (see [`label_index_path`]).
pub fn generate_training(
    imagery: &Raster,
    ground_truth: &Raster,
    config: &PipelineConfig,
    savedir: &Path,
) -> Result<Vec<PathBuf>> {
    let grid = TileGrid::for_raster(imagery, &config.tiling);
    info!(
        "Generating training records: {}x{} imagery, {} windows of {} px",
        imagery.height(),
        imagery.width(),
        grid.total_tiles,
        grid.size()
    );

    let tiles: Vec<TileBounds> = grid.iter().map(|(_, bounds)| bounds).collect();
    let labels = label_windows(imagery, ground_truth, &tiles, &config.labels)?;

    let mut samples: Vec<(TileBounds, u16)> = tiles.into_iter().zip(labels).collect();
    if let Some(ignored) = config.labels.ignore_class {
        let before = samples.len();
        samples.retain(|&(_, label)| label != ignored);
        if samples.len() < before {
            info!(
                "Skipped {} windows labelled with ignored class {}",
                before - samples.len(),
                ignored
            );
        }
    }
    if samples.is_empty() {
        warn!("No training windows left to write");
    }

    let index = LabelIndex::from_labels(samples.iter().map(|&(_, label)| label));
    fs::create_dir_all(savedir)?;
    index.write_csv(&label_index_path(savedir, &config.records.basename))?;
    info!("Found {} distinct classes", index.len());

    if let Some(seed) = config.shuffle_seed {
        let mut rng = StdRng::seed_from_u64(seed);
        samples.shuffle(&mut rng);
        info!("Shuffled training windows with seed {}", seed);
    }

    let records = samples
        .into_iter()
        .map(|(bounds, label)| Record::training(extract_window(imagery, &bounds), label));
    write_records(records, &config.records, savedir)
}

/// Tile `raster` in scan order and write prediction chunks (with offsets)
/// into `savedir`.
pub fn generate_prediction(raster: &Raster, config: &PipelineConfig, savedir: &Path) -> Result<Vec<PathBuf>> {
    let grid = TileGrid::for_raster(raster, &config.tiling);
    info!(
        "Generating prediction records: {}x{} raster, {} windows of {} px (covered {:?})",
        raster.height(),
        raster.width(),
        grid.total_tiles,
        grid.size(),
        grid.covered_shape()
    );
    if config.shuffle_seed.is_some() {
        warn!("Ignoring shuffle seed for prediction records");
    }
    write_prediction(grid.windows(raster)?, &config.records, savedir)
}
