//! Framework-neutral seam between tile records and an external classifier.
//!
//! The network itself lives elsewhere; this module turns records into
//! standardized input batches, hands them to a [`Classifier`] and reduces the
//! returned class scores to per-window [`Prediction`]s.

use crate::dataset::LabelIndex;
use crate::error::{Result, TreeTileError};
use crate::reconstruct::Prediction;
use crate::records::{Record, RecordTarget};
use log::{debug, info};
use ndarray::{Array1, Array2, Array3, Array4, ArrayView2, ArrayView3, Axis};
use rand::Rng;

/// Backend that scores a batch of channel-last windows `(N, S, S, C)` and
/// returns one row of class scores per window `(N, K)`.
pub trait Classifier {
    fn predict_batch(&mut self, inputs: &Array4<f32>) -> Result<Array2<f32>>;
}

/// Per-window standardization to zero mean and unit variance, with the
/// standard deviation floored at `1/sqrt(N)`. Output is channel-last.
pub fn standardize(pixels: &Array3<u16>) -> Array3<f32> {
    let channel_last = pixels.view().permuted_axes([1, 2, 0]);
    let values = channel_last.mapv(|v| v as f32);
    let count = values.len().max(1) as f32;

    let mean = values.sum() / count;
    let variance = values.mapv(|v| (v - mean).powi(2)).sum() / count;
    let adjusted_std = variance.sqrt().max(1.0 / count.sqrt());

    values.mapv(|v| (v - mean) / adjusted_std)
}

pub fn one_hot(label: u16, classes: usize) -> Result<Array1<f32>> {
    let index = label as usize;
    if index >= classes {
        return Err(TreeTileError::ShapeMismatch(format!(
            "label {} does not fit {} classes",
            label, classes
        )));
    }
    let mut encoded = Array1::zeros(classes);
    encoded[index] = 1.0;
    Ok(encoded)
}

/// Quarter turn counter-clockwise of a channel-last window.
fn rotate_quarter(window: ArrayView3<'_, f32>) -> ArrayView3<'_, f32> {
    let mut turned = window.permuted_axes([1, 0, 2]);
    turned.invert_axis(Axis(0));
    turned
}

/// Random left-right flip, up-down flip and `0..4` quarter turns of one
/// channel-last window `(S, S, C)`.
pub fn augment<R: Rng + ?Sized>(window: ArrayView3<'_, f32>, rng: &mut R) -> Array3<f32> {
    let mut view = window;
    if rng.random_bool(0.5) {
        view.invert_axis(Axis(1));
    }
    if rng.random_bool(0.5) {
        view.invert_axis(Axis(0));
    }
    for _ in 0..rng.random_range(0..4) {
        view = rotate_quarter(view);
    }
    view.to_owned()
}

/// Index of the highest score in every row; the first maximum wins.
pub fn argmax_classes(scores: ArrayView2<'_, f32>) -> Result<Vec<u16>> {
    scores
        .axis_iter(Axis(0))
        .map(|row| {
            let mut best: Option<(usize, f32)> = None;
            for (index, &score) in row.iter().enumerate() {
                match best {
                    Some((_, top)) if score <= top => {}
                    _ => best = Some((index, score)),
                }
            }
            let (index, _) = best.ok_or_else(|| {
                TreeTileError::ShapeMismatch("score row has no classes".to_string())
            })?;
            u16::try_from(index).map_err(|_| {
                TreeTileError::ShapeMismatch(format!("class index {} exceeds u16", index))
            })
        })
        .collect()
}

/// A stack of standardized windows and what each record carried.
#[derive(Debug, Clone)]
pub struct Batch {
    pub inputs: Array4<f32>,
    pub targets: Vec<RecordTarget>,
}

impl Batch {
    pub fn from_records(records: &[Record]) -> Result<Self> {
        let first = records
            .first()
            .ok_or_else(|| TreeTileError::ShapeMismatch("cannot batch zero records".to_string()))?;
        let (channels, rows, cols) = first.pixels.dim();

        let mut inputs = Array4::zeros((records.len(), rows, cols, channels));
        for (i, record) in records.iter().enumerate() {
            if record.pixels.dim() != (channels, rows, cols) {
                return Err(TreeTileError::ShapeMismatch(format!(
                    "record {} has shape {:?}, batch expects {:?}",
                    i,
                    record.pixels.dim(),
                    (channels, rows, cols)
                )));
            }
            inputs
                .index_axis_mut(Axis(0), i)
                .assign(&standardize(&record.pixels));
        }

        Ok(Self {
            inputs,
            targets: records.iter().map(|r| r.target).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Augment every window in place. Windows must be square.
    pub fn augment<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<()> {
        let (_, rows, cols, _) = self.inputs.dim();
        if rows != cols {
            return Err(TreeTileError::ShapeMismatch(format!(
                "cannot rotate {}x{} windows",
                rows, cols
            )));
        }
        for i in 0..self.len() {
            let augmented = augment(self.inputs.index_axis(Axis(0), i), rng);
            self.inputs.index_axis_mut(Axis(0), i).assign(&augmented);
        }
        Ok(())
    }

    /// One-hot targets over the contiguous indices of `index`.
    pub fn indexed_labels(&self, index: &LabelIndex) -> Result<Array2<f32>> {
        let mut labels = Array2::zeros((self.len(), index.len()));
        for (i, target) in self.targets.iter().enumerate() {
            let RecordTarget::Label(label) = *target else {
                return Err(TreeTileError::ShapeMismatch(format!(
                    "record {} in batch has no training label",
                    i
                )));
            };
            let position = index.index_of(label)?;
            labels[[i, position]] = 1.0;
        }
        Ok(labels)
    }

    /// One-hot training targets `(N, classes)`.
    pub fn one_hot_labels(&self, classes: usize) -> Result<Array2<f32>> {
        let mut labels = Array2::zeros((self.len(), classes));
        for (i, target) in self.targets.iter().enumerate() {
            let RecordTarget::Label(label) = *target else {
                return Err(TreeTileError::ShapeMismatch(format!(
                    "record {} in batch has no training label",
                    i
                )));
            };
            labels.index_axis_mut(Axis(0), i).assign(&one_hot(label, classes)?);
        }
        Ok(labels)
    }
}

/// Groups a record stream into batches of `batch_size` (last may be shorter).
pub struct Batches<I> {
    records: I,
    batch_size: usize,
    failed: bool,
}

pub fn batches<I>(records: I, batch_size: usize) -> Result<Batches<I::IntoIter>>
where
    I: IntoIterator<Item = Result<Record>>,
{
    if batch_size == 0 {
        return Err(TreeTileError::Config(
            "batch size must be positive".to_string(),
        ));
    }
    Ok(Batches {
        records: records.into_iter(),
        batch_size,
        failed: false,
    })
}

impl<I> Iterator for Batches<I>
where
    I: Iterator<Item = Result<Record>>,
{
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let mut chunk = Vec::with_capacity(self.batch_size);
        for record in self.records.by_ref() {
            match record {
                Ok(record) => chunk.push(record),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
            if chunk.len() == self.batch_size {
                break;
            }
        }
        if chunk.is_empty() {
            return None;
        }
        let batch = Batch::from_records(&chunk);
        if batch.is_err() {
            self.failed = true;
        }
        Some(batch)
    }
}

/// Score every prediction record and pair each class with its window offset.
pub fn predict<I, C>(records: I, classifier: &mut C, batch_size: usize) -> Result<Vec<Prediction>>
where
    I: IntoIterator<Item = Result<Record>>,
    C: Classifier + ?Sized,
{
    let mut predictions = Vec::new();
    for batch in batches(records, batch_size)? {
        let batch = batch?;
        let scores = classifier.predict_batch(&batch.inputs).map_err(|e| match e {
            TreeTileError::Classifier(_) => e,
            other => TreeTileError::Classifier(other.to_string()),
        })?;
        if scores.nrows() != batch.len() {
            return Err(TreeTileError::ShapeMismatch(format!(
                "classifier returned {} rows for a batch of {}",
                scores.nrows(),
                batch.len()
            )));
        }
        let classes = argmax_classes(scores.view())?;
        for (target, class) in batch.targets.iter().zip(classes) {
            let RecordTarget::Offset {
                row_offset,
                col_offset,
            } = *target
            else {
                return Err(TreeTileError::ShapeMismatch(
                    "prediction needs records with window offsets".to_string(),
                ));
            };
            predictions.push(Prediction {
                row_offset,
                col_offset,
                class,
            });
        }
        debug!("Scored batch of {} windows", batch.len());
    }
    info!("Predicted classes for {} windows", predictions.len());
    Ok(predictions)
}
