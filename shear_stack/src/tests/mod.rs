
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::catalog::ColumnTable;
use crate::config::{SignalConfig, SliceConfig, StackConfig};
use crate::matches::{MatchGroup, MatchPair};
use crate::planner::SliceSpec;

/// Lens and source catalogs plus a match stream, all generated from a seed.
pub(crate) struct Synthetic {
    pub lenses: ColumnTable,
    pub sources: ColumnTable,
    pub groups: Vec<MatchGroup>,
}

impl Synthetic {
    pub fn total_matches(&self) -> u64 {
        self.groups.iter().map(|g| g.pairs.len() as u64).sum()
    }
}

/// Shear catalogs in the `r` band. Some sources have zero snr or sit in
/// front of their lens, so a few pairs are always skipped.
pub(crate) fn synthetic(seed: u64, lens_count: usize, source_count: usize, max_matches: usize) -> Synthetic {
    let mut rng = StdRng::seed_from_u64(seed);

    let mut uniform = |n: usize, lo: f64, hi: f64| -> Vec<f64> {
        (0..n).map(|_| rng.random_range(lo..hi)).collect()
    };
    let lenses = ColumnTable::new()
        .with_column("ra", uniform(lens_count, 10.0, 20.0))
        .unwrap()
        .with_column("dec", uniform(lens_count, -5.0, 5.0))
        .unwrap()
        .with_column("z", uniform(lens_count, 0.1, 0.5))
        .unwrap();

    let mut snr = uniform(source_count, 5.0, 100.0);
    for value in snr.iter_mut().step_by(17) {
        *value = 0.0;
    }
    let sources = ColumnTable::new()
        .with_column("ra_r", uniform(source_count, 10.0, 20.0))
        .unwrap()
        .with_column("dec_r", uniform(source_count, -5.0, 5.0))
        .unwrap()
        .with_column("z", uniform(source_count, 0.2, 1.2))
        .unwrap()
        .with_column("e1_r", uniform(source_count, -0.3, 0.3))
        .unwrap()
        .with_column("e2_r", uniform(source_count, -0.3, 0.3))
        .unwrap()
        .with_column("snr_r", snr)
        .unwrap()
        .with_column("mag_r", uniform(source_count, 18.0, 24.0))
        .unwrap()
        .with_column("bulge_flux_r", uniform(source_count, 0.1, 10.0))
        .unwrap()
        .with_column("disc_flux_r", uniform(source_count, 0.1, 10.0))
        .unwrap();

    let groups = (0..lens_count)
        .map(|lens_index| {
            let n = rng.random_range(0..=max_matches);
            MatchGroup {
                lens_index,
                pairs: (0..n)
                    .map(|_| MatchPair {
                        source_index: rng.random_range(0..source_count),
                        separation: rng.random_range(0.0..0.5),
                    })
                    .collect(),
            }
        })
        .collect();

    Synthetic {
        lenses,
        sources,
        groups,
    }
}

pub(crate) fn shear_config() -> StackConfig {
    StackConfig {
        slices: vec![
            SliceConfig {
                key: "mag_{band}".into(),
                split: SliceSpec::Percentile(4),
                ratio: None,
            },
            SliceConfig {
                key: "bulge_to_disc".into(),
                split: SliceSpec::Percentile(3),
                ratio: None,
            },
            SliceConfig {
                key: "snr_{band}".into(),
                split: SliceSpec::Edges(vec![0.0, 20.0, 50.0, 1000.0]),
                ratio: None,
            },
        ],
        ..Default::default()
    }
}

/// Scalar stacking of the source column `value`, sliced on itself.
pub(crate) fn scalar_config(edges: &[f64]) -> StackConfig {
    StackConfig {
        signal: SignalConfig::Scalar {
            key: "value".into(),
        },
        slices: vec![SliceConfig {
            key: "value".into(),
            split: SliceSpec::Edges(edges.to_vec()),
            ratio: None,
        }],
        profile: None,
        ..Default::default()
    }
}

pub(crate) fn lens_table(count: usize) -> ColumnTable {
    ColumnTable::new()
        .with_column("ra", vec![0.0; count])
        .unwrap()
        .with_column("dec", vec![0.0; count])
        .unwrap()
}

pub(crate) fn pair(source_index: usize, separation: f64) -> MatchPair {
    MatchPair {
        source_index,
        separation,
    }
}
