//! Slice planning: turns per-key split specifications into final bin edges.
//!
//! Fixed edges pass through after validation. Percentile splits place `N + 1`
//! cut points evenly between the `trim` and `100 - trim` percentiles of the
//! key's values over the whole source catalog, i.e. at
//! `trim + k * (100 - 2 * trim) / N` (2.5 + k * 95 / N by default).

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::accumulator::find_slice;
use crate::catalog::KeyColumn;
use crate::error::{StackError, StackResult};

pub const DEFAULT_PERCENTILE_TRIM: f64 = 2.5;

/// How a key is split into slices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SliceSpec {
    /// Explicit ascending bin edges.
    Edges(Vec<f64>),
    /// Number of equal-occupancy bins derived from the data.
    Percentile(usize),
}

/// Options shared by every key of a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlannerOptions {
    /// Percent trimmed from each tail in percentile mode.
    pub trim_percent: f64,
    /// Draw at most this many values per key for percentile estimation.
    pub sample_limit: Option<usize>,
    pub sample_seed: u64,
}

impl Default for PlannerOptions {
    fn default() -> Self {
        Self {
            trim_percent: DEFAULT_PERCENTILE_TRIM,
            sample_limit: None,
            sample_seed: 0,
        }
    }
}

/// Finalized slicing for one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedKey {
    pub name: String,
    pub edges: Vec<f64>,
    /// Expected pair count per slice; only used to pre-size buffers.
    pub expected_occupancy: Vec<usize>,
}

impl PlannedKey {
    pub fn slice_count(&self) -> usize {
        self.edges.len().saturating_sub(1)
    }
}

pub fn validate_edges(key: &str, edges: &[f64]) -> StackResult<()> {
    if edges.len() < 2 {
        return Err(StackError::InvalidConfig(format!(
            "key '{}': need at least 2 edges, got {}",
            key,
            edges.len()
        )));
    }
    if edges.iter().any(|e| !e.is_finite()) {
        return Err(StackError::InvalidConfig(format!(
            "key '{}': edges must be finite",
            key
        )));
    }
    if edges.windows(2).any(|w| w[0] >= w[1]) {
        return Err(StackError::InvalidConfig(format!(
            "key '{}': edges must be strictly ascending: {:?}",
            key, edges
        )));
    }
    Ok(())
}

pub fn validate_spec(key: &str, spec: &SliceSpec) -> StackResult<()> {
    match spec {
        SliceSpec::Edges(edges) => validate_edges(key, edges),
        SliceSpec::Percentile(0) => Err(StackError::InvalidConfig(format!(
            "key '{}': percentile split needs at least one bin",
            key
        ))),
        SliceSpec::Percentile(_) => Ok(()),
    }
}

/// Percentile with linear interpolation between closest ranks.
///
/// `sorted` must be ascending and non-empty; `percent` is in `[0, 100]`.
pub fn percentile_sorted(sorted: &[f64], percent: f64) -> f64 {
    debug_assert!(!sorted.is_empty());

    let position = percent / 100.0 * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let lower_value = sorted[lower];
    let upper_value = sorted[upper.min(sorted.len() - 1)];
    lower_value + (upper_value - lower_value) * (position - lower as f64)
}

/// Cut-point percentiles for `bins` equal-occupancy bins.
pub fn percentile_cut_points(bins: usize, trim_percent: f64) -> Vec<f64> {
    let delta = (100.0 - 2.0 * trim_percent) / bins as f64;
    (0..=bins).map(|k| trim_percent + k as f64 * delta).collect()
}

fn sample_values(column: &KeyColumn, options: &PlannerOptions) -> Vec<f64> {
    let finite = column.values.iter().copied().filter(|v| v.is_finite());
    match options.sample_limit {
        Some(limit) if limit < column.values.len() => {
            let all: Vec<f64> = finite.collect();
            if limit >= all.len() {
                return all;
            }
            let mut rng = StdRng::seed_from_u64(options.sample_seed);
            let mut picked = rand::seq::index::sample(&mut rng, all.len(), limit).into_vec();
            picked.sort_unstable();
            picked.into_iter().map(|i| all[i]).collect()
        }
        _ => finite.collect(),
    }
}

fn percentile_edges(
    column: &KeyColumn,
    bins: usize,
    options: &PlannerOptions,
) -> StackResult<Vec<f64>> {
    let mut values = sample_values(column, options);
    if values.len() < bins {
        return Err(StackError::InsufficientData {
            key: column.name.clone(),
            available: values.len(),
            bins,
        });
    }
    values.sort_unstable_by(f64::total_cmp);

    Ok(percentile_cut_points(bins, options.trim_percent)
        .into_iter()
        .map(|p| percentile_sorted(&values, p))
        .collect())
}

/// Scale each bin's share of the source catalog to the global match count.
fn expected_occupancy(column: &KeyColumn, edges: &[f64], total_matches: u64) -> Vec<usize> {
    let bins = edges.len() - 1;
    let mut counts = vec![0usize; bins];
    for &value in &column.values {
        if let Some(s) = find_slice(edges, value) {
            counts[s] += 1;
        }
    }

    let rows = column.values.len();
    if rows == 0 {
        return counts;
    }
    counts
        .into_iter()
        .map(|c| (c as f64 * total_matches as f64 / rows as f64) as usize)
        .collect()
}

/// Plan a single key.
pub fn plan_key(
    column: &KeyColumn,
    spec: &SliceSpec,
    total_matches: u64,
    options: &PlannerOptions,
) -> StackResult<PlannedKey> {
    validate_spec(&column.name, spec)?;

    let edges = match spec {
        SliceSpec::Edges(edges) => edges.clone(),
        SliceSpec::Percentile(bins) => percentile_edges(column, *bins, options)?,
    };
    let expected_occupancy = expected_occupancy(column, &edges, total_matches);

    tracing::info!(key = %column.name, ?edges, ?expected_occupancy, "Planned slices");

    Ok(PlannedKey {
        name: column.name.clone(),
        edges,
        expected_occupancy,
    })
}

/// Plan every key; `columns` and `specs` are parallel lists.
pub fn plan_slices(
    columns: &[KeyColumn],
    specs: &[SliceSpec],
    total_matches: u64,
    options: &PlannerOptions,
) -> StackResult<Vec<PlannedKey>> {
    if columns.len() != specs.len() {
        return Err(StackError::InvalidConfig(format!(
            "{} keys but {} split specifications",
            columns.len(),
            specs.len()
        )));
    }
    if !(0.0..50.0).contains(&options.trim_percent) {
        return Err(StackError::InvalidConfig(format!(
            "percentile trim must be in [0, 50), got {}",
            options.trim_percent
        )));
    }

    columns
        .iter()
        .zip(specs)
        .map(|(column, spec)| plan_key(column, spec, total_matches, options))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, values: Vec<f64>) -> KeyColumn {
        KeyColumn {
            name: name.into(),
            values,
        }
    }

    #[test]
    fn test_fixed_edges_pass_through() {
        let col = column("mask_fraction", vec![0.1, 0.3, 0.5, 0.9]);
        let planned = plan_key(
            &col,
            &SliceSpec::Edges(vec![0.0, 0.2, 0.4, 1.0]),
            400,
            &PlannerOptions::default(),
        )
        .unwrap();
        assert_eq!(planned.edges, vec![0.0, 0.2, 0.4, 1.0]);
        assert_eq!(planned.slice_count(), 3);
        // one of four rows per bin below 0.4, two in the last: scaled by 400 / 4
        assert_eq!(planned.expected_occupancy, vec![100, 100, 200]);
    }

    #[test]
    fn test_invalid_edges() {
        let opts = PlannerOptions::default();
        let col = column("k", vec![1.0]);
        for edges in [vec![1.0], vec![], vec![0.0, 0.0, 1.0], vec![2.0, 1.0], vec![0.0, f64::NAN]] {
            let result = plan_key(&col, &SliceSpec::Edges(edges), 1, &opts);
            assert!(matches!(result, Err(StackError::InvalidConfig(_))));
        }
    }

    #[test]
    fn test_zero_percentile_bins_is_invalid() {
        let col = column("k", vec![1.0, 2.0]);
        let result = plan_key(&col, &SliceSpec::Percentile(0), 1, &PlannerOptions::default());
        assert!(matches!(result, Err(StackError::InvalidConfig(_))));
    }

    #[test]
    fn test_percentile_insufficient_data() {
        let col = column("snr", vec![1.0, f64::NAN, 3.0]);
        let result = plan_key(&col, &SliceSpec::Percentile(3), 10, &PlannerOptions::default());
        match result {
            Err(StackError::InsufficientData {
                key,
                available,
                bins,
            }) => {
                assert_eq!(key, "snr");
                assert_eq!(available, 2);
                assert_eq!(bins, 3);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_cut_points_follow_trimmed_convention() {
        let cuts = percentile_cut_points(3, DEFAULT_PERCENTILE_TRIM);
        let expected = [2.5, 34.166666, 65.833333, 97.5];
        for (c, e) in cuts.iter().zip(expected) {
            assert!((c - e).abs() < 1e-5, "{} vs {}", c, e);
        }
    }

    #[test]
    fn test_percentile_interpolates() {
        let sorted = [0.0, 10.0, 20.0, 30.0, 40.0];
        assert_eq!(percentile_sorted(&sorted, 0.0), 0.0);
        assert_eq!(percentile_sorted(&sorted, 100.0), 40.0);
        assert!((percentile_sorted(&sorted, 50.0) - 20.0).abs() < 1e-12);
        assert!((percentile_sorted(&sorted, 12.5) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_percentile_bins_are_equally_occupied_for_uniform_data() {
        let n = 100_000usize;
        let values: Vec<f64> = (0..n).map(|i| i as f64 / n as f64).collect();
        let col = column("u", values.clone());
        let bins = 4;
        let planned = plan_key(
            &col,
            &SliceSpec::Percentile(bins),
            n as u64,
            &PlannerOptions::default(),
        )
        .unwrap();

        assert_eq!(planned.edges.len(), bins + 1);
        assert!((planned.edges[0] - 0.025).abs() < 1e-3);
        assert!((planned.edges[bins] - 0.975).abs() < 1e-3);

        let trimmed = n as f64 * 0.95;
        let mut counts = vec![0usize; bins];
        for v in values {
            if let Some(s) = find_slice(&planned.edges, v) {
                counts[s] += 1;
            }
        }
        for count in counts {
            let expected = trimmed / bins as f64;
            assert!(
                (count as f64 - expected).abs() / expected < 0.01,
                "count {} expected {}",
                count,
                expected
            );
        }
    }

    #[test]
    fn test_sampling_is_reproducible() {
        let values: Vec<f64> = (0..10_000).map(|i| ((i * 7919) % 10_000) as f64).collect();
        let col = column("k", values);
        let opts = PlannerOptions {
            sample_limit: Some(500),
            sample_seed: 42,
            ..Default::default()
        };
        let a = plan_key(&col, &SliceSpec::Percentile(5), 1000, &opts).unwrap();
        let b = plan_key(&col, &SliceSpec::Percentile(5), 1000, &opts).unwrap();
        assert_eq!(a, b);
        // A 5% sample of a uniform grid stays close to the full-data edges.
        assert!((a.edges[0] - 250.0).abs() < 400.0);
        assert!((a.edges[5] - 9750.0).abs() < 400.0);
    }

    #[test]
    fn test_plan_slices_rejects_bad_trim_and_mismatched_lists() {
        let col = column("k", vec![1.0, 2.0]);
        let opts = PlannerOptions {
            trim_percent: 50.0,
            ..Default::default()
        };
        assert!(plan_slices(&[col.clone()], &[SliceSpec::Percentile(1)], 1, &opts).is_err());
        assert!(plan_slices(&[col], &[], 1, &PlannerOptions::default()).is_err());
    }

    #[test]
    fn test_spec_deserializes_from_number_or_list() {
        let specs: Vec<SliceSpec> = serde_json::from_str("[3, [0.0, 0.2, 0.4, 1]]").unwrap();
        assert_eq!(
            specs,
            vec![
                SliceSpec::Percentile(3),
                SliceSpec::Edges(vec![0.0, 0.2, 0.4, 1.0])
            ]
        );
    }
}
