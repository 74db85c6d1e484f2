use thiserror::Error;

#[derive(Error, Debug)]
pub enum TreeTileError {
    #[error("Geometry error: {0}")]
    Geometry(String),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Array shape error: {0}")]
    ShapeError(#[from] ndarray::ShapeError),

    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid record file: {0}")]
    InvalidRecord(String),

    #[error("Unsupported sample format: {0}")]
    UnsupportedSampleFormat(String),

    #[error("Classifier failed: {0}")]
    Classifier(String),

    #[error("Input raster has invalid dimensions: {0}x{1}")]
    InvalidDimensions(usize, usize),
}

pub type Result<T> = std::result::Result<T, TreeTileError>;
