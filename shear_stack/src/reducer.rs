//! Per-pair reduction: turns one (lens, source, separation) match into the
//! signal, cross signal, weight and radius stored in the primary arrays.

use std::sync::Arc;

use rayon::prelude::*;

use crate::calibration::{Calibration, Cosmology, HUBBLE_DISTANCE_MPC_H};
use crate::catalog::Catalog;
use crate::config::{Coords, SignalConfig, StackConfig};
use crate::error::{StackError, StackResult};
use crate::matches::{MatchGroup, MatchPair};

/// Intrinsic shape noise per component.
const SHAPE_NOISE: f64 = 0.2;
/// Measurement noise is `SNR_NOISE_SCALE / snr`.
const SNR_NOISE_SCALE: f64 = 0.1 * 20.0;

/// Values written to the primary arrays for one pair.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PairOutput {
    pub signal: f32,
    pub signal_cross: f32,
    pub weight: f32,
    /// Separation in degrees (angular) or Mpc/h (physical), before the
    /// final unit factor.
    pub radius: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LensColumns {
    pub ra: Vec<f64>,
    pub dec: Vec<f64>,
    pub z: Option<Vec<f64>>,
}

impl LensColumns {
    pub fn len(&self) -> usize {
        self.ra.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ra.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceColumns {
    Shear {
        ra: Vec<f64>,
        dec: Vec<f64>,
        z: Vec<f64>,
        e1: Vec<f64>,
        e2: Vec<f64>,
        snr: Vec<f64>,
    },
    /// A raw scalar observable, stacked with unit weight.
    Scalar { values: Vec<f64> },
}

impl SourceColumns {
    pub fn len(&self) -> usize {
        match self {
            SourceColumns::Shear { ra, .. } => ra.len(),
            SourceColumns::Scalar { values } => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn column_lengths(&self) -> Vec<usize> {
        match self {
            SourceColumns::Shear {
                ra,
                dec,
                z,
                e1,
                e2,
                snr,
            } => [ra, dec, z, e1, e2, snr].iter().map(|c| c.len()).collect(),
            SourceColumns::Scalar { values } => vec![values.len()],
        }
    }
}

/// Inverse-variance style shape weight, before the Sigma_crit^-2 factor.
///
/// Finite and positive for every positive finite `snr`.
pub fn shape_weight(snr: f64) -> f64 {
    let noise = SNR_NOISE_SCALE / snr;
    SHAPE_NOISE / (SHAPE_NOISE * SHAPE_NOISE + noise * noise).sqrt()
}

/// Rotate `(e1, e2)` into the tangential/cross frame around the lens.
///
/// Positions in degrees, flat-sky around the lens.
pub fn tangential_shear(
    lens_ra: f64,
    lens_dec: f64,
    ra: f64,
    dec: f64,
    e1: f64,
    e2: f64,
) -> (f64, f64) {
    let mut dra = ra - lens_ra;
    if dra > 180.0 {
        dra -= 360.0;
    } else if dra < -180.0 {
        dra += 360.0;
    }
    let dx = dra * lens_dec.to_radians().cos();
    let dy = dec - lens_dec;
    let phi = dy.atan2(dx);
    let (sin2, cos2) = (2.0 * phi).sin_cos();

    let tangential = -(e1 * cos2 + e2 * sin2);
    let cross = e1 * sin2 - e2 * cos2;
    (tangential, cross)
}

/// Pure per-pair computation over immutable catalog columns and collaborators.
pub struct PairReducer {
    coords: Coords,
    flip_e2: bool,
    lens: LensColumns,
    source: SourceColumns,
    calibration: Arc<dyn Calibration>,
    cosmology: Arc<dyn Cosmology>,
    /// Sources rejected by the quality cuts are never reduced.
    selection: Option<Vec<bool>>,
}

impl std::fmt::Debug for PairReducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairReducer")
            .field("coords", &self.coords)
            .field("flip_e2", &self.flip_e2)
            .field("lenses", &self.lens.len())
            .field("sources", &self.source.len())
            .finish()
    }
}

impl PairReducer {
    pub fn new(
        coords: Coords,
        flip_e2: bool,
        lens: LensColumns,
        source: SourceColumns,
        calibration: Arc<dyn Calibration>,
        cosmology: Arc<dyn Cosmology>,
    ) -> StackResult<Self> {
        if lens.dec.len() != lens.len() || lens.z.as_ref().is_some_and(|z| z.len() != lens.len()) {
            return Err(StackError::InvalidConfig(
                "lens columns differ in length".into(),
            ));
        }
        if source.column_lengths().iter().any(|&n| n != source.len()) {
            return Err(StackError::InvalidConfig(
                "source columns differ in length".into(),
            ));
        }
        let needs_lens_z = coords == Coords::Physical || matches!(source, SourceColumns::Shear { .. });
        if needs_lens_z && lens.z.is_none() {
            return Err(StackError::InvalidConfig(
                "lens redshifts are required for shear signal or physical coordinates".into(),
            ));
        }

        Ok(Self {
            coords,
            flip_e2,
            lens,
            source,
            calibration,
            cosmology,
            selection: None,
        })
    }

    /// Restrict reduction to sources where `mask` is set.
    pub fn with_selection(mut self, mask: Vec<bool>) -> StackResult<Self> {
        if mask.len() != self.source.len() {
            return Err(StackError::InvalidConfig(format!(
                "source selection covers {} rows, catalog has {}",
                mask.len(),
                self.source.len()
            )));
        }
        self.selection = Some(mask);
        Ok(self)
    }

    /// Read the columns named by `config` for `band` from both catalogs.
    pub fn from_config(
        config: &StackConfig,
        band: &str,
        lenses: &dyn Catalog,
        sources: &dyn Catalog,
    ) -> StackResult<Self> {
        let needs_lens_z =
            config.coords == Coords::Physical || matches!(config.signal, SignalConfig::Shear);
        let lens = LensColumns {
            ra: lenses.require_column(&config.lens.ra)?.to_vec(),
            dec: lenses.require_column(&config.lens.dec)?.to_vec(),
            z: if needs_lens_z {
                Some(lenses.require_column(&config.lens.z)?.to_vec())
            } else {
                None
            },
        };

        let column = |template: &str| -> StackResult<Vec<f64>> {
            Ok(sources
                .require_column(&StackConfig::expand(template, band))?
                .to_vec())
        };
        let source = match &config.signal {
            SignalConfig::Shear => SourceColumns::Shear {
                ra: column(&config.source.ra)?,
                dec: column(&config.source.dec)?,
                z: column(&config.source.z)?,
                e1: column(&config.source.e1)?,
                e2: column(&config.source.e2)?,
                snr: column(&config.source.snr)?,
            },
            SignalConfig::Scalar { key } => SourceColumns::Scalar {
                values: column(key)?,
            },
        };

        let reducer = Self::new(
            config.coords,
            config.flip_e2,
            lens,
            source,
            config.calibration.build(config.cosmology),
            Arc::new(config.cosmology),
        )?;
        match config.source_mask(band, sources)? {
            Some(mask) => reducer.with_selection(mask),
            None => Ok(reducer),
        }
    }

    pub fn lens_count(&self) -> usize {
        self.lens.len()
    }

    pub fn source_count(&self) -> usize {
        self.source.len()
    }

    fn lens_z(&self, lens: usize) -> f64 {
        self.lens.z.as_ref().map_or(f64::NAN, |z| z[lens])
    }

    fn radius(&self, lens: usize, source: usize, separation: f64) -> StackResult<f64> {
        if !(separation.is_finite() && separation >= 0.0) {
            return Err(StackError::invalid_measurement(
                source,
                format!("separation {} is not a finite non-negative angle", separation),
            ));
        }
        match self.coords {
            Coords::Angular => Ok(separation),
            Coords::Physical => {
                let distance = self.cosmology.angular_diameter_distance(self.lens_z(lens));
                let radius = separation.to_radians() * distance * HUBBLE_DISTANCE_MPC_H;
                if radius.is_finite() {
                    Ok(radius)
                } else {
                    Err(StackError::invalid_measurement(
                        source,
                        "physical separation is undefined for this lens redshift",
                    ))
                }
            }
        }
    }

    /// Reduce one pair. Indices must be in range for the catalogs.
    pub fn reduce(&self, lens: usize, source: usize, separation: f64) -> StackResult<PairOutput> {
        if self.selection.as_ref().is_some_and(|mask| !mask[source]) {
            return Err(StackError::invalid_measurement(source, "rejected by source selection"));
        }
        let radius = self.radius(lens, source, separation)?;

        match &self.source {
            SourceColumns::Scalar { values } => {
                let value = values[source];
                if !value.is_finite() {
                    return Err(StackError::invalid_measurement(source, "scalar value is not finite"));
                }
                Ok(PairOutput {
                    signal: value as f32,
                    signal_cross: 0.0,
                    weight: 1.0,
                    radius: radius as f32,
                })
            }
            SourceColumns::Shear {
                ra,
                dec,
                z,
                e1,
                e2,
                snr,
            } => {
                let snr = snr[source];
                if !(snr.is_finite() && snr > 0.0) {
                    return Err(StackError::invalid_measurement(
                        source,
                        format!("snr {} is not positive", snr),
                    ));
                }

                let sigma_crit = self
                    .calibration
                    .sigma_crit(self.lens_z(lens), z[source])
                    .filter(|s| s.is_finite() && *s > 0.0)
                    .ok_or_else(|| {
                        StackError::invalid_measurement(source, "critical surface density is undefined")
                    })?;

                let e2 = if self.flip_e2 { -e2[source] } else { e2[source] };
                let (tangential, cross) = tangential_shear(
                    self.lens.ra[lens],
                    self.lens.dec[lens],
                    ra[source],
                    dec[source],
                    e1[source],
                    e2,
                );
                if !(tangential.is_finite() && cross.is_finite()) {
                    return Err(StackError::invalid_measurement(source, "ellipticity is not finite"));
                }

                Ok(PairOutput {
                    signal: (sigma_crit * tangential) as f32,
                    signal_cross: (sigma_crit * cross) as f32,
                    weight: (shape_weight(snr) / (sigma_crit * sigma_crit)) as f32,
                    radius: radius as f32,
                })
            }
        }
    }

    /// Reduce every pair of a group, in group order.
    pub fn reduce_group(&self, group: &MatchGroup, parallel: bool) -> Vec<StackResult<PairOutput>> {
        let reduce =
            |pair: &MatchPair| self.reduce(group.lens_index, pair.source_index, pair.separation);
        if parallel {
            group.pairs.par_iter().map(reduce).collect()
        } else {
            group.pairs.iter().map(reduce).collect()
        }
    }
}
