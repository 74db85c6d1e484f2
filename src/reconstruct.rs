use crate::error::{Result, TreeTileError};
use crate::records::Record;
use log::{debug, info};
use ndarray::{s, Array2};

/// Class id written to cells no window covers.
pub const FILL_CLASS: u16 = 0;

/// A predicted class for the window whose top-left pixel is
/// `(row_offset, col_offset)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prediction {
    pub row_offset: usize,
    pub col_offset: usize,
    pub class: u16,
}

/// Paint every prediction as a constant `window_size × window_size` block
/// into a `output_shape` grid. Overlapping blocks resolve last-write-wins in
/// the order given.
pub fn reconstruct(
    predictions: &[u16],
    offsets: &[(usize, usize)],
    window_size: usize,
    output_shape: (usize, usize),
) -> Result<Array2<u16>> {
    if predictions.len() != offsets.len() {
        return Err(TreeTileError::ShapeMismatch(format!(
            "{} predictions but {} offsets",
            predictions.len(),
            offsets.len()
        )));
    }
    if window_size == 0 {
        return Err(TreeTileError::Config(
            "window size must be positive".to_string(),
        ));
    }

    let (height, width) = output_shape;
    let mut output = Array2::from_elem((height, width), FILL_CLASS);

    for (&class, &(row, col)) in predictions.iter().zip(offsets) {
        let row_end = row + window_size;
        let col_end = col + window_size;
        if row_end > height || col_end > width {
            return Err(TreeTileError::ShapeMismatch(format!(
                "block at ({}, {}) of size {} overflows output {}x{}",
                row, col, window_size, height, width
            )));
        }
        output.slice_mut(s![row..row_end, col..col_end]).fill(class);
    }

    debug!(
        "Reconstructed {} blocks into {}x{} map",
        predictions.len(),
        height,
        width
    );
    Ok(output)
}

/// Build a class map the size of the source raster from per-window
/// predictions. Cells in the dropped remainder strip keep [`FILL_CLASS`].
pub fn create_raster(
    predictions: &[Prediction],
    window_size: usize,
    source_shape: (usize, usize),
) -> Result<Array2<u16>> {
    let classes: Vec<u16> = predictions.iter().map(|p| p.class).collect();
    let offsets: Vec<(usize, usize)> = predictions
        .iter()
        .map(|p| (p.row_offset, p.col_offset))
        .collect();
    info!(
        "Creating {}x{} prediction raster from {} windows",
        source_shape.0,
        source_shape.1,
        predictions.len()
    );
    reconstruct(&classes, &offsets, window_size, source_shape)
}

/// Window offsets and side length read back from prediction records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowLayout {
    pub offsets: Vec<(usize, usize)>,
    /// `None` when there were no records.
    pub window_size: Option<usize>,
}

impl WindowLayout {
    /// Collect offsets in record order. Every window must be square and of
    /// the same size.
    pub fn from_records<I>(records: I) -> Result<Self>
    where
        I: IntoIterator<Item = Result<Record>>,
    {
        let mut layout = Self::default();
        for (i, record) in records.into_iter().enumerate() {
            let record = record?;
            let offset = record.offset().ok_or_else(|| {
                TreeTileError::InvalidRecord(format!("record {} carries a label, not a window offset", i))
            })?;
            let (_, rows, cols) = record.pixels.dim();
            if rows != cols {
                return Err(TreeTileError::ShapeMismatch(format!(
                    "record {} holds a {}x{} window, expected a square one",
                    i, rows, cols
                )));
            }
            match layout.window_size {
                None => layout.window_size = Some(rows),
                Some(size) if size != rows => {
                    return Err(TreeTileError::ShapeMismatch(format!(
                        "record {} holds a {} px window after {} px windows",
                        i, rows, size
                    )));
                }
                Some(_) => {}
            }
            layout.offsets.push(offset);
        }
        Ok(layout)
    }

    /// The recorded window size, checked against `requested` when both are
    /// known.
    pub fn resolve_window_size(&self, requested: Option<usize>) -> Result<usize> {
        match (self.window_size, requested) {
            (Some(stored), Some(asked)) if stored != asked => Err(TreeTileError::Config(format!(
                "window size {} does not match the {} px windows in the records",
                asked, stored
            ))),
            (Some(size), _) | (None, Some(size)) => Ok(size),
            (None, None) => Err(TreeTileError::Config(
                "no records to take the window size from".to_string(),
            )),
        }
    }

    /// Paint `predictions` (one class per record, in record order) onto an
    /// `output_shape` grid.
    pub fn reconstruct(
        &self,
        predictions: &[u16],
        requested_size: Option<usize>,
        output_shape: (usize, usize),
    ) -> Result<Array2<u16>> {
        let window_size = self.resolve_window_size(requested_size)?;
        reconstruct(predictions, &self.offsets, window_size, output_shape)
    }
}
