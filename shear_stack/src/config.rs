//! Run configuration.
//!
//! Loaded from JSON or YAML (chosen by file extension). Every field has a
//! default, so an empty document is a valid configuration. Column names may
//! contain `{band}` or `{BAND}`, replaced by the lower- or upper-case band.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use common::file_format::load_from_file;

use crate::calibration::{Calibration, ConstantCalibration, DistanceRatioCalibration, FlatLambdaCdm};
use crate::catalog::{select_rows, Catalog, SliceKey};
use crate::error::{StackError, StackResult};
use crate::planner::{validate_spec, PlannerOptions, SliceSpec, DEFAULT_PERCENTILE_TRIM};

/// Built-in derived key: bulge flux over disc flux.
pub const BULGE_TO_DISC: &str = "bulge_to_disc";

/// Unit of the stored radius.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Coords {
    /// Degrees during accumulation, arcmin in the final output.
    #[default]
    Angular,
    /// Mpc/h at the lens redshift.
    Physical,
}

impl Coords {
    /// Factor applied to the radius array once, at finalization.
    pub fn radius_unit_factor(self) -> f32 {
        match self {
            Coords::Angular => 60.0,
            Coords::Physical => 1.0,
        }
    }
}

/// What is stacked per pair.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalConfig {
    /// Sigma_crit-scaled tangential and cross shear.
    #[default]
    Shear,
    /// A source column stacked as-is with unit weight.
    Scalar { key: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CalibrationConfig {
    DistanceRatio,
    Constant { sigma_crit: f64 },
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self::DistanceRatio
    }
}

impl CalibrationConfig {
    pub fn build(&self, cosmology: FlatLambdaCdm) -> Arc<dyn Calibration> {
        match self {
            CalibrationConfig::DistanceRatio => Arc::new(DistanceRatioCalibration::new(cosmology)),
            CalibrationConfig::Constant { sigma_crit } => Arc::new(ConstantCalibration(*sigma_crit)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LensColumnNames {
    pub ra: String,
    pub dec: String,
    pub z: String,
}

impl Default for LensColumnNames {
    fn default() -> Self {
        Self {
            ra: "ra".into(),
            dec: "dec".into(),
            z: "z".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceColumnNames {
    pub ra: String,
    pub dec: String,
    pub z: String,
    pub e1: String,
    pub e2: String,
    pub snr: String,
    pub bulge_flux: String,
    pub disc_flux: String,
}

impl Default for SourceColumnNames {
    fn default() -> Self {
        Self {
            ra: "ra_{band}".into(),
            dec: "dec_{band}".into(),
            z: "z".into(),
            e1: "e1_{band}".into(),
            e2: "e2_{band}".into(),
            snr: "snr_{band}".into(),
            bulge_flux: "bulge_flux_{band}".into(),
            disc_flux: "disc_flux_{band}".into(),
        }
    }
}

/// Ratio of two source columns used as a derived key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatioKey {
    pub numerator: String,
    pub denominator: String,
}

/// One slicing dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceConfig {
    /// Column template, or the name of a derived key.
    pub key: String,
    pub split: SliceSpec,
    /// Turns `key` into a derived ratio key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ratio: Option<RatioKey>,
}

/// Sources are stacked only where `column` equals `equals`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnRequirement {
    /// Column template.
    pub column: String,
    pub equals: f64,
}

/// When to write intermediate checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointPolicy {
    /// Checkpoint every this fraction of the total match count.
    pub cadence_fraction: f64,
    /// Checkpoints are only written for runs with more matches than this.
    pub large_run_threshold: u64,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            cadence_fraction: 0.1,
            large_run_threshold: 500_000_000,
        }
    }
}

impl CheckpointPolicy {
    pub fn is_enabled(&self, total_matches: u64) -> bool {
        total_matches > self.large_run_threshold
    }

    /// Pairs between two checkpoints, at least one.
    pub fn interval(&self, total_matches: u64) -> u64 {
        ((total_matches as f64 * self.cadence_fraction).ceil() as u64).max(1)
    }
}

/// Logarithmic radial binning of the profiles.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// In final radius units (arcmin or Mpc/h).
    pub r_min: f64,
    pub r_max: f64,
    pub bins: usize,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            r_min: 0.5,
            r_max: 60.0,
            bins: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    pub coords: Coords,
    pub lens: LensColumnNames,
    pub source: SourceColumnNames,
    /// Negate e2 before rotating into the lens frame.
    pub flip_e2: bool,
    pub signal: SignalConfig,
    pub cosmology: FlatLambdaCdm,
    pub calibration: CalibrationConfig,
    /// Quality cuts; rejected sources neither shape percentile edges nor
    /// contribute pairs.
    pub source_selection: Vec<ColumnRequirement>,
    pub slices: Vec<SliceConfig>,
    pub percentile_trim: f64,
    pub sample_limit: Option<usize>,
    pub sample_seed: u64,
    pub checkpoint: CheckpointPolicy,
    /// Groups with at least this many pairs are reduced in parallel.
    pub parallel_group_threshold: usize,
    pub profile: Option<ProfileConfig>,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            coords: Coords::default(),
            lens: LensColumnNames::default(),
            source: SourceColumnNames::default(),
            flip_e2: true,
            signal: SignalConfig::default(),
            cosmology: FlatLambdaCdm::default(),
            calibration: CalibrationConfig::default(),
            source_selection: Vec::new(),
            slices: Vec::new(),
            percentile_trim: DEFAULT_PERCENTILE_TRIM,
            sample_limit: None,
            sample_seed: 0,
            checkpoint: CheckpointPolicy::default(),
            parallel_group_threshold: 4096,
            profile: Some(ProfileConfig::default()),
        }
    }
}

impl StackConfig {
    pub fn from_file(path: &Path) -> StackResult<Self> {
        let config: Self = load_from_file(path).map_err(|e| {
            StackError::InvalidConfig(format!("failed to load '{}': {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Substitute the band into a column template.
    pub fn expand(template: &str, band: &str) -> String {
        template
            .replace("{band}", &band.to_ascii_lowercase())
            .replace("{BAND}", &band.to_ascii_uppercase())
    }

    pub fn validate(&self) -> StackResult<()> {
        if !(0.0..50.0).contains(&self.percentile_trim) {
            return Err(StackError::InvalidConfig(format!(
                "percentile_trim must be in [0, 50), got {}",
                self.percentile_trim
            )));
        }
        let cadence = self.checkpoint.cadence_fraction;
        if !(cadence > 0.0 && cadence <= 1.0) {
            return Err(StackError::InvalidConfig(format!(
                "checkpoint.cadence_fraction must be in (0, 1], got {}",
                cadence
            )));
        }
        if !(0.0..=1.0).contains(&self.cosmology.omega_m) {
            return Err(StackError::InvalidConfig(format!(
                "cosmology.omega_m must be in [0, 1], got {}",
                self.cosmology.omega_m
            )));
        }
        if let CalibrationConfig::Constant { sigma_crit } = self.calibration {
            if !(sigma_crit.is_finite() && sigma_crit > 0.0) {
                return Err(StackError::InvalidConfig(format!(
                    "constant sigma_crit must be positive, got {}",
                    sigma_crit
                )));
            }
        }
        if let Some(profile) = &self.profile {
            if !(profile.r_min > 0.0 && profile.r_max > profile.r_min) || profile.bins == 0 {
                return Err(StackError::InvalidConfig(format!(
                    "profile binning needs 0 < r_min < r_max and bins > 0, got {:?}",
                    profile
                )));
            }
        }

        let mut seen = BTreeSet::new();
        for slice in &self.slices {
            let name = &slice.key;
            if name.is_empty() || name.contains(['/', '\\']) {
                return Err(StackError::InvalidConfig(format!(
                    "slice key '{}' is not a valid file name",
                    name
                )));
            }
            if !seen.insert(name.as_str()) {
                return Err(StackError::InvalidConfig(format!(
                    "slice key '{}' is listed twice",
                    name
                )));
            }
            validate_spec(name, &slice.split)?;
        }
        Ok(())
    }

    /// [`validate`](Self::validate), then check that the keys stay distinct
    /// once `band` is substituted.
    pub fn validate_for_band(&self, band: &str) -> StackResult<()> {
        self.validate()?;
        let mut seen = BTreeSet::new();
        for key in self.slice_keys(band) {
            let name = key.name();
            if name.contains(['/', '\\']) {
                return Err(StackError::InvalidConfig(format!(
                    "slice key '{}' is not a valid file name",
                    name
                )));
            }
            if !seen.insert(name.to_string()) {
                return Err(StackError::InvalidConfig(format!(
                    "slice key '{}' is listed twice for band '{}'",
                    name, band
                )));
            }
        }
        Ok(())
    }

    /// Rows of `sources` that pass [`source_selection`](Self::source_selection),
    /// or `None` when no cut is configured.
    pub fn source_mask(&self, band: &str, sources: &dyn Catalog) -> StackResult<Option<Vec<bool>>> {
        if self.source_selection.is_empty() {
            return Ok(None);
        }
        let requirements: Vec<(String, f64)> = self
            .source_selection
            .iter()
            .map(|r| (Self::expand(&r.column, band), r.equals))
            .collect();
        let mask = select_rows(sources, &requirements)?;
        tracing::info!(
            selected = mask.iter().filter(|k| **k).count(),
            rows = mask.len(),
            "Applied source selection"
        );
        Ok(Some(mask))
    }

    pub fn planner_options(&self) -> PlannerOptions {
        PlannerOptions {
            trim_percent: self.percentile_trim,
            sample_limit: self.sample_limit,
            sample_seed: self.sample_seed,
        }
    }

    /// Slice keys in configuration order, with templates expanded for `band`.
    pub fn slice_keys(&self, band: &str) -> Vec<SliceKey> {
        self.slices
            .iter()
            .map(|slice| {
                let name = Self::expand(&slice.key, band);
                match &slice.ratio {
                    Some(ratio) => SliceKey::ratio(
                        name,
                        &Self::expand(&ratio.numerator, band),
                        &Self::expand(&ratio.denominator, band),
                    ),
                    None if slice.key == BULGE_TO_DISC => SliceKey::ratio(
                        name,
                        &Self::expand(&self.source.bulge_flux, band),
                        &Self::expand(&self.source.disc_flux, band),
                    ),
                    None => SliceKey::Field(name),
                }
            })
            .collect()
    }

    pub fn slice_specs(&self) -> Vec<SliceSpec> {
        self.slices.iter().map(|s| s.split.clone()).collect()
    }

    pub fn radius_unit_factor(&self) -> f32 {
        self.coords.radius_unit_factor()
    }
}
