//! Distance and critical-surface-density collaborators used by the reducer.
//!
//! Distances are in units of the Hubble distance c/H0; multiply by
//! [`HUBBLE_DISTANCE_MPC_H`] for Mpc/h.

use serde::{Deserialize, Serialize};

/// c/H0 in Mpc/h.
pub const HUBBLE_DISTANCE_MPC_H: f64 = 3000.0;

/// c^2 / (4 pi G) in h Msun / pc^2 times Mpc/h.
pub const SIGMA_CRIT_SCALE: f64 = 1.6625e6;

const SIMPSON_INTERVALS: usize = 256;

pub trait Cosmology: Send + Sync {
    /// Angular diameter distance to redshift `z`.
    fn angular_diameter_distance(&self, z: f64) -> f64;

    /// Angular diameter distance from `z1` to `z2` (`z1 < z2`).
    fn angular_diameter_distance_between(&self, z1: f64, z2: f64) -> f64;
}

pub trait Calibration: Send + Sync {
    /// Effective critical surface density for a lens/source redshift pair, or
    /// `None` when it is undefined (e.g. the source is not behind the lens).
    fn sigma_crit(&self, lens_z: f64, source_z: f64) -> Option<f64>;
}

/// Spatially flat Lambda-CDM.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlatLambdaCdm {
    pub omega_m: f64,
}

impl Default for FlatLambdaCdm {
    fn default() -> Self {
        Self { omega_m: 0.3 }
    }
}

impl FlatLambdaCdm {
    pub fn new(omega_m: f64) -> Self {
        assert!((0.0..=1.0).contains(&omega_m), "omega_m must be in [0, 1]");
        Self { omega_m }
    }

    fn inverse_e(&self, z: f64) -> f64 {
        let a = 1.0 + z;
        1.0 / (self.omega_m * a * a * a + (1.0 - self.omega_m)).sqrt()
    }

    /// Line-of-sight comoving distance, Simpson's rule.
    pub fn comoving_distance(&self, z: f64) -> f64 {
        if z <= 0.0 {
            return 0.0;
        }
        let n = SIMPSON_INTERVALS;
        let h = z / n as f64;
        let mut sum = self.inverse_e(0.0) + self.inverse_e(z);
        for i in 1..n {
            let weight = if i % 2 == 1 { 4.0 } else { 2.0 };
            sum += weight * self.inverse_e(i as f64 * h);
        }
        sum * h / 3.0
    }
}

impl Cosmology for FlatLambdaCdm {
    fn angular_diameter_distance(&self, z: f64) -> f64 {
        self.comoving_distance(z) / (1.0 + z)
    }

    fn angular_diameter_distance_between(&self, z1: f64, z2: f64) -> f64 {
        (self.comoving_distance(z2) - self.comoving_distance(z1)) / (1.0 + z2)
    }
}

/// Sigma_crit from the distance ratio D_s / (D_l D_ls).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceRatioCalibration<C> {
    cosmology: C,
}

impl<C: Cosmology> DistanceRatioCalibration<C> {
    pub fn new(cosmology: C) -> Self {
        Self { cosmology }
    }
}

impl<C: Cosmology> Calibration for DistanceRatioCalibration<C> {
    fn sigma_crit(&self, lens_z: f64, source_z: f64) -> Option<f64> {
        if !(lens_z.is_finite() && source_z.is_finite()) || lens_z <= 0.0 || source_z <= lens_z {
            return None;
        }
        let d_l = self.cosmology.angular_diameter_distance(lens_z);
        let d_s = self.cosmology.angular_diameter_distance(source_z);
        let d_ls = self
            .cosmology
            .angular_diameter_distance_between(lens_z, source_z);
        if d_l <= 0.0 || d_ls <= 0.0 {
            return None;
        }
        Some(SIGMA_CRIT_SCALE * d_s / (d_l * d_ls * HUBBLE_DISTANCE_MPC_H))
    }
}

/// The same Sigma_crit for every pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstantCalibration(pub f64);

impl Calibration for ConstantCalibration {
    fn sigma_crit(&self, _lens_z: f64, _source_z: f64) -> Option<f64> {
        Some(self.0)
    }
}
