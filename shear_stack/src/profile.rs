//! Weighted radial profiles of the full stack and of every slice.
//!
//! Each profile bins its pairs on logarithmic radial bins and reports per bin
//! the pair count, weighted mean radius, weighted mean signal and cross signal,
//! the error of the weighted mean and the weight sum.

use std::fs;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::Serialize;

use crate::accumulator::find_slice;
use crate::config::ProfileConfig;
use crate::error::{StackError, StackResult};
use crate::store::{StackArrays, StackStore};

pub const ALL_PROFILE: &str = "all";

/// Borrowed primary arrays plus named slice index lists.
#[derive(Debug, Clone)]
pub struct StackView<'a> {
    pub signal: &'a [f32],
    pub signal_cross: &'a [f32],
    pub radius: &'a [f32],
    pub weight: &'a [f32],
    pub slices: Vec<(String, &'a [i64])>,
}

impl<'a> StackView<'a> {
    pub fn from_store(store: &'a StackStore) -> Self {
        let slices = store
            .keys()
            .iter()
            .enumerate()
            .flat_map(|(k, key)| {
                (0..key.slice_count())
                    .map(move |s| (format!("{}_{}", key.name, s), store.slice_indices(k, s)))
            })
            .collect();
        Self {
            signal: store.signal(),
            signal_cross: store.signal_cross(),
            radius: store.radius(),
            weight: store.weight(),
            slices,
        }
    }

    pub fn from_arrays(arrays: &'a StackArrays) -> Self {
        let slices = arrays
            .keys
            .iter()
            .flat_map(|key| {
                key.slices
                    .iter()
                    .enumerate()
                    .map(move |(s, indices)| (format!("{}_{}", key.name, s), indices.as_slice()))
            })
            .collect();
        Self {
            signal: &arrays.signal,
            signal_cross: &arrays.signal_cross,
            radius: &arrays.radius,
            weight: &arrays.weight,
            slices,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Profile {
    pub name: String,
    /// Radial bin edges.
    pub edges: Vec<f64>,
    pub n: Vec<u64>,
    pub mean_r: Vec<f64>,
    pub mean_q: Vec<f64>,
    pub mean_q_cross: Vec<f64>,
    pub std_q: Vec<f64>,
    pub sum_w: Vec<f64>,
}

/// `bins + 1` logarithmically spaced edges from `r_min` to `r_max`.
pub fn radial_edges(binning: &ProfileConfig) -> Vec<f64> {
    let (lo, hi) = (binning.r_min.ln(), binning.r_max.ln());
    let step = (hi - lo) / binning.bins as f64;
    (0..=binning.bins)
        .map(|i| {
            if i == binning.bins {
                binning.r_max
            } else {
                (lo + i as f64 * step).exp()
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
struct BinSums {
    n: u64,
    w: f64,
    wr: f64,
    wq: f64,
    wqx: f64,
    w2dq2: f64,
}

/// Profile over the pairs at `indices`, or over every pair when `None`.
pub fn profile_of(name: &str, view: &StackView<'_>, indices: Option<&[i64]>, edges: &[f64]) -> Profile {
    let bins = edges.len().saturating_sub(1);
    let mut sums = vec![BinSums::default(); bins];
    let mut bin_of = Vec::new();

    let mut visit = |i: usize| {
        let bin = find_slice(edges, view.radius[i] as f64);
        bin_of.push(bin);
        if let Some(b) = bin {
            let w = view.weight[i] as f64;
            let s = &mut sums[b];
            s.n += 1;
            s.w += w;
            s.wr += w * view.radius[i] as f64;
            s.wq += w * view.signal[i] as f64;
            s.wqx += w * view.signal_cross[i] as f64;
        }
    };
    match indices {
        Some(indices) => indices.iter().for_each(|&i| visit(i as usize)),
        None => (0..view.signal.len()).for_each(&mut visit),
    }

    // Second pass for the scatter about the weighted mean.
    let mean = |s: &BinSums, v: f64| if s.w > 0.0 { v / s.w } else { f64::NAN };
    let means: Vec<f64> = sums.iter().map(|s| mean(s, s.wq)).collect();
    let pair_indices: Box<dyn Iterator<Item = usize>> = match indices {
        Some(indices) => Box::new(indices.iter().map(|&i| i as usize)),
        None => Box::new(0..view.signal.len()),
    };
    for (i, bin) in pair_indices.zip(&bin_of) {
        if let Some(b) = *bin {
            let w = view.weight[i] as f64;
            let dq = view.signal[i] as f64 - means[b];
            sums[b].w2dq2 += w * w * dq * dq;
        }
    }

    Profile {
        name: name.to_string(),
        edges: edges.to_vec(),
        n: sums.iter().map(|s| s.n).collect(),
        mean_r: sums.iter().map(|s| mean(s, s.wr)).collect(),
        mean_q: means,
        mean_q_cross: sums.iter().map(|s| mean(s, s.wqx)).collect(),
        std_q: sums.iter().map(|s| mean(s, s.w2dq2.sqrt())).collect(),
        sum_w: sums.iter().map(|s| s.w).collect(),
    }
}

/// The `all` profile followed by one profile per slice, in key order.
pub fn compute_profiles(view: &StackView<'_>, binning: &ProfileConfig) -> Vec<Profile> {
    let edges = radial_edges(binning);
    let mut profiles = vec![profile_of(ALL_PROFILE, view, None, &edges)];
    profiles.par_extend(
        view.slices
            .par_iter()
            .map(|(name, indices)| profile_of(name, view, Some(*indices), &edges)),
    );
    profiles
}

/// Write each profile to `dir/profile_<name>.json`.
pub fn write_profiles(dir: &Path, profiles: &[Profile]) -> StackResult<Vec<PathBuf>> {
    fs::create_dir_all(dir).map_err(|source| StackError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut paths = Vec::with_capacity(profiles.len());
    for profile in profiles {
        let path = dir.join(format!("profile_{}.json", profile.name));
        let json = serde_json::to_vec_pretty(profile).map_err(|e| StackError::WriteArray {
            path: path.clone(),
            source: std::io::Error::other(e),
        })?;
        fs::write(&path, json).map_err(|source| StackError::WriteArray {
            path: path.clone(),
            source,
        })?;
        paths.push(path);
    }

    tracing::info!(path = %dir.display(), count = paths.len(), "Wrote radial profiles");
    Ok(paths)
}
