use crate::error::{Result, TreeTileError};
use log::debug;

/// Window geometry used when scanning a raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilingConfig {
    pub size: usize,
    pub stride: usize,
}

impl TilingConfig {
    pub fn new(size: usize, stride: usize) -> Result<Self> {
        if size == 0 {
            return Err(TreeTileError::Config(format!(
                "window size must be positive, got {}",
                size
            )));
        }
        if stride == 0 {
            return Err(TreeTileError::Config(format!(
                "stride must be positive, got {}",
                stride
            )));
        }
        Ok(Self { size, stride })
    }

    /// Non-overlapping tiles: stride equals size.
    pub fn non_overlapping(size: usize) -> Result<Self> {
        Self::new(size, size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordConfig {
    pub chunk_size: usize,
    pub basename: String,
}

impl RecordConfig {
    pub fn new(chunk_size: usize, basename: impl Into<String>) -> Result<Self> {
        if chunk_size == 0 {
            return Err(TreeTileError::Config(format!(
                "chunk size must be positive, got {}",
                chunk_size
            )));
        }
        let basename = basename.into();
        if basename.is_empty() || basename.contains(std::path::is_separator) {
            return Err(TreeTileError::Config(format!(
                "record basename must be a plain file stem, got {:?}",
                basename
            )));
        }
        Ok(Self {
            chunk_size,
            basename,
        })
    }
}

/// How a ground-truth window collapses to one class id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LabelRule {
    /// Value of the pixel at the centre of the mapped region.
    #[default]
    Center,
    /// Most frequent value, ties go to the smallest class id.
    Majority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LabelConfig {
    pub rule: LabelRule,
    /// Training windows reduced to this class are not written.
    pub ignore_class: Option<u16>,
}

/// Fraction of a training record stream held out for validation. Held-out
/// records are spread evenly over the stream: record `i` is held out when
/// `floor((i + 1) * fraction) > floor(i * fraction)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationSplit {
    fraction: f64,
}

impl ValidationSplit {
    /// `fraction` must lie in `(0, 0.5)` so the training side stays larger.
    pub fn new(fraction: f64) -> Result<Self> {
        if !(fraction > 0.0 && fraction < 0.5) {
            return Err(TreeTileError::Config(format!(
                "validation fraction must be in (0, 0.5), got {}",
                fraction
            )));
        }
        Ok(Self { fraction })
    }

    pub fn fraction(&self) -> f64 {
        self.fraction
    }

    pub fn is_validation(&self, index: usize) -> bool {
        let before = (index as f64 * self.fraction).floor();
        let after = ((index + 1) as f64 * self.fraction).floor();
        after > before
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub tiling: TilingConfig,
    pub records: RecordConfig,
    pub labels: LabelConfig,
    /// Shuffle training windows before writing; `None` keeps scan order.
    pub shuffle_seed: Option<u64>,
}

impl PipelineConfig {
    pub fn new(tiling: TilingConfig, records: RecordConfig) -> Self {
        debug!(
            "PipelineConfig: size={}, stride={}, chunk_size={}, basename={}",
            tiling.size, tiling.stride, records.chunk_size, records.basename
        );
        Self {
            tiling,
            records,
            labels: LabelConfig::default(),
            shuffle_seed: None,
        }
    }

    pub fn with_labels(mut self, labels: LabelConfig) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_shuffle_seed(mut self, seed: Option<u64>) -> Self {
        self.shuffle_seed = seed;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiling_rejects_zero() {
        assert!(matches!(
            TilingConfig::new(0, 5),
            Err(TreeTileError::Config(_))
        ));
        assert!(matches!(
            TilingConfig::new(5, 0),
            Err(TreeTileError::Config(_))
        ));
    }

    #[test]
    fn test_non_overlapping() {
        let tiling = TilingConfig::non_overlapping(5).unwrap();
        assert_eq!(tiling.size, 5);
        assert_eq!(tiling.stride, 5);
    }

    #[test]
    fn test_record_config_validation() {
        assert!(RecordConfig::new(0, "tiles").is_err());
        assert!(RecordConfig::new(10, "").is_err());
        assert!(RecordConfig::new(10, "a/b").is_err());
        assert!(RecordConfig::new(10, "tiles").is_ok());
    }

    #[test]
    fn test_validation_split_bounds() {
        for bad in [0.0, 0.5, 0.9, -0.1, f64::NAN] {
            assert!(matches!(
                ValidationSplit::new(bad),
                Err(TreeTileError::Config(_))
            ));
        }
        assert_eq!(ValidationSplit::new(0.25).unwrap().fraction(), 0.25);
    }

    #[test]
    fn test_validation_split_spreads_evenly() {
        let split = ValidationSplit::new(0.2).unwrap();
        let held: Vec<usize> = (0..20).filter(|&i| split.is_validation(i)).collect();
        assert_eq!(held, vec![4, 9, 14, 19]);
    }

    #[test]
    fn test_pipeline_defaults() {
        let config = PipelineConfig::new(
            TilingConfig::non_overlapping(5).unwrap(),
            RecordConfig::new(100, "training").unwrap(),
        );
        assert_eq!(config.labels.rule, LabelRule::Center);
        assert_eq!(config.labels.ignore_class, None);
        assert_eq!(config.shuffle_seed, None);
    }
}
