use clap::Parser;
use env_logger::Env;
use log::{info, warn};
use std::fs;
use std::path::Path;

use treetile::cli::{Args, Command, TilingArgs};
use treetile::config::{LabelConfig, PipelineConfig, RecordConfig, TilingConfig};
use treetile::error::{Result, TreeTileError};
use treetile::reconstruct::WindowLayout;
use treetile::records::{list_chunks, RecordReader};
use treetile::{dataset, io, synthetic};

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logger
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    info!("=== Raster Tile Records ===");

    // Set thread pool size if specified
    if let Some(n_threads) = args.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .build_global()
            .map_err(|e| TreeTileError::Config(format!("failed to build thread pool: {}", e)))?;
        info!("Using {} threads", n_threads);
    } else {
        info!("Using all available threads");
    }

    match args.command {
        Command::Training {
            imagery,
            ground_truth,
            tiling,
            label_rule,
            ignore_class,
            shuffle_seed,
        } => {
            let config = pipeline_config(&tiling, "training")?
                .with_labels(LabelConfig {
                    rule: label_rule,
                    ignore_class,
                })
                .with_shuffle_seed(shuffle_seed);
            let imagery = io::read_raster(&imagery)?;
            let ground_truth = io::read_raster(&ground_truth)?;
            if imagery.epsg() != ground_truth.epsg() {
                warn!(
                    "Imagery EPSG {:?} differs from ground truth EPSG {:?}; assuming shared coordinates",
                    imagery.epsg(),
                    ground_truth.epsg()
                );
            }
            let paths = dataset::generate_training(&imagery, &ground_truth, &config, &tiling.savedir)?;
            info!("Wrote {} training chunk files", paths.len());
        }
        Command::Prediction { raster, tiling } => {
            let config = pipeline_config(&tiling, "prediction")?;
            let raster = io::read_raster(&raster)?;
            let paths = dataset::generate_prediction(&raster, &config, &tiling.savedir)?;
            info!("Wrote {} prediction chunk files", paths.len());
        }
        Command::Reconstruct {
            records,
            basename,
            predictions,
            reference,
            size,
            output,
        } => {
            run_reconstruct(&records, &basename, &predictions, &reference, size, &output)?;
        }
        Command::Synthesize { savedir, seed } => {
            fs::create_dir_all(&savedir)?;
            io::write_raster(savedir.join("training.tif"), &synthetic::training_raster()?)?;
            io::write_raster(savedir.join("prediction.tif"), &synthetic::prediction_raster()?)?;
            io::write_raster(
                savedir.join("ground_truth.tif"),
                &synthetic::ground_truth_raster(seed)?,
            )?;
            info!("Wrote synthetic rasters to {}", savedir.display());
        }
    }

    info!("=== Done! ===");
    Ok(())
}

fn pipeline_config(tiling: &TilingArgs, default_basename: &str) -> Result<PipelineConfig> {
    let tiling_config = TilingConfig::new(tiling.size, tiling.stride.unwrap_or(tiling.size))?;
    let basename = tiling.basename.as_deref().unwrap_or(default_basename);
    let record_config = RecordConfig::new(tiling.chunk_size, basename)?;
    Ok(PipelineConfig::new(tiling_config, record_config))
}

fn read_prediction_classes(path: &Path) -> Result<Vec<u16>> {
    fs::read_to_string(path)?
        .lines()
        .enumerate()
        .map(|(i, line)| (i, line.trim()))
        .filter(|(_, line)| !line.is_empty())
        .map(|(i, line)| {
            line.parse::<u16>().map_err(|e| {
                TreeTileError::ShapeMismatch(format!(
                    "{} line {}: {:?} is not a class id ({})",
                    path.display(),
                    i + 1,
                    line,
                    e
                ))
            })
        })
        .collect()
}

fn run_reconstruct(
    records_dir: &Path,
    basename: &str,
    predictions: &Path,
    reference: &Path,
    size: Option<usize>,
    output: &Path,
) -> Result<()> {
    let classes = read_prediction_classes(predictions)?;
    let chunks = list_chunks(records_dir, basename)?;
    let layout = WindowLayout::from_records(RecordReader::open(&chunks))?;
    info!(
        "Read {} offsets from {} chunk files and {} predictions",
        layout.offsets.len(),
        chunks.len(),
        classes.len()
    );

    let reference = io::read_raster(reference)?;
    let map = layout.reconstruct(&classes, size, reference.shape())?;
    io::write_class_map(output, &map, reference.transform(), reference.epsg())
}
