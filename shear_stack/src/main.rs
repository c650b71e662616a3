use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use common::log_setup::setup_logging;
use shear_stack::{
    ColumnTable, MatchFile, MatchSource, RunLayout, StackConfig, StackDriver, StackError,
};

#[derive(Parser, Debug)]
#[command(name = "shear_stack", version, about = "Stack lens/source matches into sliced radial profiles")]
struct Cli {
    /// Directory of lens catalog columns (`<column>.npy`).
    lens_catalog: PathBuf,
    /// Directory of source catalog columns (`<column>.npy`).
    source_catalog: PathBuf,
    /// Photometric band, substituted into `{band}` column templates.
    band: String,
    /// Output label; the run lives in `<scratch_dir>/<label>`.
    label: String,
    #[arg(default_value = "/tmp")]
    scratch_dir: PathBuf,

    /// JSON or YAML run configuration.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Continue from the last checkpoint of this run.
    #[arg(long)]
    resume: bool,
    /// Replace an existing finalized stack.
    #[arg(long)]
    overwrite: bool,
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    run(Cli::parse())
}

fn run(cli: Cli) -> Result<()> {
    let layout = RunLayout::new(cli.scratch_dir.join(&cli.label));
    setup_logging(&cli.log_level, &layout.run_dir().join("logs"), "shear_stack");

    if layout.is_finalized() && !cli.overwrite {
        tracing::info!(
            path = %layout.final_dir().display(),
            "Stack already exists; delete it or use a different label to rerun"
        );
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => StackConfig::from_file(path)?,
        None => StackConfig::default(),
    };

    let match_path = layout.match_file(&cli.band);
    let mut matches = MatchFile::open(&match_path)
        .with_context(|| format!("Match file for band '{}' is required", cli.band))?;
    let lenses = ColumnTable::from_npy_dir(&cli.lens_catalog).context("Failed to load lens catalog")?;
    let sources =
        ColumnTable::from_npy_dir(&cli.source_catalog).context("Failed to load source catalog")?;
    let total = matches.total_matches();

    let mut driver = if cli.resume && layout.has_checkpoint() {
        StackDriver::resume(layout, &config, &cli.band, &lenses, &sources, total)?
    } else {
        if cli.resume {
            tracing::warn!("No checkpoint to resume from, starting a new run");
        }
        StackDriver::plan(layout, &config, &cli.band, &lenses, &sources, total)?
    };

    let report = driver.accumulate(&mut matches)?;
    tracing::info!(
        groups = report.groups,
        pairs = report.pairs,
        skipped = report.skipped,
        "Accumulation done"
    );

    match driver.finalize(cli.overwrite) {
        Ok(summary) => {
            for (key, counts) in &summary.slice_counts {
                tracing::info!(key = %key, ?counts, "Slice occupancy");
            }
            tracing::info!(
                path = %summary.final_dir.display(),
                pairs = summary.pair_count,
                skipped = summary.skipped_pairs,
                profiles = summary.profiles.len(),
                "Saved stack"
            );
            Ok(())
        }
        Err(StackError::OutputAlreadyExists { path }) => {
            tracing::info!(path = %path.display(), "Stack already exists, leaving it untouched");
            Ok(())
        }
        Err(e) => Err(e).context("Failed to finalize stack"),
    }
}
