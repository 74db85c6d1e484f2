use crate::config::LabelRule;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "treetile")]
#[command(about = "Tile rasters into training/prediction records and rebuild per-tile class maps")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Number of threads (default: all available)
    #[arg(short, long, value_name = "N", global = true)]
    pub threads: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Write labelled training records from imagery and a ground-truth raster
    Training {
        /// Imagery GeoTIFF (unsigned 16-bit)
        #[arg(long, value_name = "FILE")]
        imagery: PathBuf,

        /// Ground-truth class GeoTIFF, may differ in resolution
        #[arg(long, value_name = "FILE")]
        ground_truth: PathBuf,

        #[command(flatten)]
        tiling: TilingArgs,

        /// Label reduction rule
        #[arg(long, value_enum, default_value_t = LabelRule::Center)]
        label_rule: LabelRule,

        /// Drop windows whose label equals this class (e.g. 0 = unclassified)
        #[arg(long, value_name = "CLASS")]
        ignore_class: Option<u16>,

        /// Shuffle windows before writing with this seed
        #[arg(long, value_name = "SEED")]
        shuffle_seed: Option<u64>,
    },

    /// Write prediction records (with window offsets) from a raster
    Prediction {
        /// Raster GeoTIFF (unsigned 16-bit)
        #[arg(long, value_name = "FILE")]
        raster: PathBuf,

        #[command(flatten)]
        tiling: TilingArgs,
    },

    /// Rebuild a class map from per-window predictions
    Reconstruct {
        /// Directory holding the prediction records
        #[arg(long, value_name = "DIR")]
        records: PathBuf,

        /// Record file basename
        #[arg(long, default_value = "prediction")]
        basename: String,

        /// Text file with one class id per line, in record order
        #[arg(long, value_name = "FILE")]
        predictions: PathBuf,

        /// Raster the records were cut from (shape and georeferencing)
        #[arg(long, value_name = "FILE")]
        reference: PathBuf,

        /// Window side length in pixels (default: read from the records)
        #[arg(long)]
        size: Option<usize>,

        /// Output class map GeoTIFF
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
    },

    /// Write small synthetic imagery and ground-truth rasters
    Synthesize {
        /// Output directory
        #[arg(long, value_name = "DIR")]
        savedir: PathBuf,

        /// Seed for the ground-truth classes
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
}

#[derive(ClapArgs, Debug, Clone)]
pub struct TilingArgs {
    /// Output directory for record chunks
    #[arg(long, value_name = "DIR")]
    pub savedir: PathBuf,

    /// Window side length in pixels
    #[arg(long, default_value_t = 5)]
    pub size: usize,

    /// Step between windows (default: window size)
    #[arg(long)]
    pub stride: Option<usize>,

    /// Records per chunk file
    #[arg(long, default_value_t = 1000)]
    pub chunk_size: usize,

    /// Record file basename (default: "training" or "prediction")
    #[arg(long)]
    pub basename: Option<String>,
}
