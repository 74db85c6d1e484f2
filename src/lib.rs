// Library exports for testing and reuse

pub mod cli;
pub mod config;
pub mod dataset;
pub mod error;
pub mod geo;
pub mod io;
pub mod labels;
pub mod model;
pub mod raster;
pub mod reconstruct;
pub mod records;
pub mod synthetic;
pub mod tiling;

// Re-export commonly used types
pub use config::{LabelConfig, LabelRule, PipelineConfig, RecordConfig, TilingConfig, ValidationSplit};
pub use dataset::{generate_prediction, generate_training, split_validation, LabelIndex};
pub use error::{Result, TreeTileError};
pub use geo::GeoTransform;
pub use model::{augment, predict, Classifier};
pub use raster::Raster;
pub use reconstruct::{create_raster, reconstruct, Prediction, WindowLayout};
pub use records::{read_records, write_prediction, write_training, Record, RecordReader};
pub use tiling::{tile, TileGrid, Window};
