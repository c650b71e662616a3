//! Shear stack - sliced radial-profile stacking of lens/source matches.
//!
//! A run consumes a precomputed match stream (one group of matched sources per
//! lens) and accumulates, for every pair:
//! - a calibrated tangential signal and cross signal (or a raw scalar)
//! - a weight and a radius
//!
//! Every pair is also recorded in at most one slice per configured key, so
//! profiles can be built for any sub-population after the run.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use shear_stack::{ColumnTable, MatchFile, MatchSource, RunLayout, StackConfig, StackDriver};
//!
//! let config = StackConfig::from_file("stack.yaml".as_ref())?;
//! let lenses = ColumnTable::from_npy_dir("lenses".as_ref())?;
//! let sources = ColumnTable::from_npy_dir("sources".as_ref())?;
//! let layout = RunLayout::new("/scratch/run1");
//! let mut matches = MatchFile::open(&layout.match_file("r"))?;
//!
//! let mut driver = StackDriver::plan(
//!     layout, &config, "r", &lenses, &sources, matches.total_matches(),
//! )?;
//! driver.accumulate(&mut matches)?;
//! let summary = driver.finalize(false)?;
//! ```

pub mod accumulator;
pub mod calibration;
pub mod catalog;
pub mod config;
pub mod driver;
pub mod error;
pub mod growable;
pub mod matches;
pub mod npy;
pub mod planner;
pub mod profile;
pub mod progress;
pub mod reducer;
pub mod store;

#[cfg(test)]
mod tests;

// ============================================================================
// Inputs
// ============================================================================

pub use catalog::{Catalog, ColumnTable, KeyColumn, SliceKey};
pub use matches::{MatchFile, MatchFileWriter, MatchGroup, MatchPair, MatchSource, VecMatchSource};

// ============================================================================
// Configuration and collaborators
// ============================================================================

pub use calibration::{
    Calibration, ConstantCalibration, Cosmology, DistanceRatioCalibration, FlatLambdaCdm,
};
pub use config::{CheckpointPolicy, Coords, ProfileConfig, SignalConfig, SliceConfig, StackConfig};
pub use planner::{PlannedKey, PlannerOptions, SliceSpec};

// ============================================================================
// Run
// ============================================================================

pub use driver::{AccumulateReport, DriverSettings, DriverStage, RunSummary, StackDriver};
pub use error::{StackError, StackResult};
pub use progress::{ProgressCallback, StackProgress};
pub use reducer::{PairOutput, PairReducer};
pub use store::{RunLayout, StackArrays, StackStore};
