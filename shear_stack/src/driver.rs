//! Run orchestration: `Planning -> Accumulating -> Finalized`.
//!
//! [`StackDriver::plan`] runs the slice planner and allocates the store,
//! [`StackDriver::accumulate`] consumes the match stream once, and
//! [`StackDriver::finalize`] consumes the driver.

use std::path::PathBuf;

use strum_macros::Display;

use crate::accumulator::{AcceptedPair, SliceAccumulator};
use crate::catalog::{Catalog, KeyColumn};
use crate::config::{CheckpointPolicy, ProfileConfig, StackConfig};
use crate::error::{StackError, StackResult};
use crate::matches::{MatchGroup, MatchSource};
use crate::planner::{plan_slices, PlannedKey};
use crate::profile::{compute_profiles, write_profiles, StackView};
use crate::progress::{report_progress, ProgressCallback, StackProgress};
use crate::reducer::PairReducer;
use crate::store::{RunLayout, StackStore};

const PROGRESS_EVERY_GROUPS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum DriverStage {
    Planning,
    Accumulating,
    Finalized,
}

/// Run-wide knobs that are not part of the slicing or the reduction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriverSettings {
    pub checkpoint: CheckpointPolicy,
    pub parallel_group_threshold: usize,
    pub profile: Option<ProfileConfig>,
}

impl DriverSettings {
    pub fn from_config(config: &StackConfig) -> Self {
        Self {
            checkpoint: config.checkpoint,
            parallel_group_threshold: config.parallel_group_threshold,
            profile: config.profile,
        }
    }
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self::from_config(&StackConfig::default())
    }
}

/// Outcome of one accumulation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccumulateReport {
    pub groups: u64,
    pub pairs: u64,
    pub skipped: u64,
    pub checkpoints_written: u32,
    pub checkpoints_failed: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub final_dir: PathBuf,
    pub pair_count: u64,
    pub skipped_pairs: u64,
    pub groups_done: u64,
    /// `(key, per-slice occupancy)` in key order.
    pub slice_counts: Vec<(String, Vec<usize>)>,
    pub profiles: Vec<PathBuf>,
}

pub struct StackDriver {
    stage: DriverStage,
    reducer: PairReducer,
    accumulator: SliceAccumulator,
    store: StackStore,
    settings: DriverSettings,
    progress: Option<ProgressCallback>,
    accepted: Vec<AcceptedPair>,
}

impl std::fmt::Debug for StackDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackDriver")
            .field("stage", &self.stage)
            .field("pairs", &self.store.pair_count())
            .field("groups_done", &self.store.groups_done())
            .finish()
    }
}

fn resolve_keys(config: &StackConfig, band: &str, sources: &dyn Catalog) -> StackResult<Vec<KeyColumn>> {
    config
        .slice_keys(band)
        .iter()
        .map(|key| key.resolve(sources))
        .collect()
}

impl StackDriver {
    /// Assemble a driver from already planned parts.
    pub fn from_parts(
        reducer: PairReducer,
        planned: &[PlannedKey],
        columns: Vec<KeyColumn>,
        store: StackStore,
        settings: DriverSettings,
    ) -> StackResult<Self> {
        if columns.iter().any(|c| c.values.len() != reducer.source_count()) {
            return Err(StackError::InvalidConfig(
                "key columns and source catalog differ in length".into(),
            ));
        }
        let accumulator = SliceAccumulator::new(planned, columns)?;
        Ok(Self {
            stage: DriverStage::Accumulating,
            reducer,
            accumulator,
            store,
            settings,
            progress: None,
            accepted: Vec::new(),
        })
    }

    /// Plan slice edges for `total_matches` and allocate a fresh store.
    pub fn plan(
        layout: RunLayout,
        config: &StackConfig,
        band: &str,
        lenses: &dyn Catalog,
        sources: &dyn Catalog,
        total_matches: u64,
    ) -> StackResult<Self> {
        config.validate_for_band(band)?;
        tracing::info!(stage = %DriverStage::Planning, band, total_matches, keys = config.slices.len(), "Planning slices");

        let columns = resolve_keys(config, band, sources)?;
        let selected: Vec<KeyColumn> = match config.source_mask(band, sources)? {
            Some(mask) => columns.iter().map(|c| c.select(&mask)).collect(),
            None => columns.clone(),
        };
        let planned = plan_slices(
            &selected,
            &config.slice_specs(),
            total_matches,
            &config.planner_options(),
        )?;
        let reducer = PairReducer::from_config(config, band, lenses, sources)?;
        let store = StackStore::new(layout, &planned, total_matches, config.radius_unit_factor())?;

        Self::from_parts(reducer, &planned, columns, store, DriverSettings::from_config(config))
    }

    /// Continue a run from its last checkpoint, keeping the checkpoint's edges.
    pub fn resume(
        layout: RunLayout,
        config: &StackConfig,
        band: &str,
        lenses: &dyn Catalog,
        sources: &dyn Catalog,
        total_matches: u64,
    ) -> StackResult<Self> {
        config.validate_for_band(band)?;
        let store = StackStore::restore(layout, total_matches)?;

        let columns = resolve_keys(config, band, sources)?;
        let stored: Vec<&str> = store.key_names().collect();
        let configured: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        if stored != configured {
            return Err(StackError::InvalidConfig(format!(
                "checkpoint keys {:?} differ from configured keys {:?}",
                stored, configured
            )));
        }

        let planned: Vec<PlannedKey> = store
            .keys()
            .iter()
            .map(|key| PlannedKey {
                name: key.name.clone(),
                edges: key.edges.clone(),
                expected_occupancy: Vec::new(),
            })
            .collect();
        let reducer = PairReducer::from_config(config, band, lenses, sources)?;

        tracing::info!(
            groups_done = store.groups_done(),
            pairs = store.pair_count(),
            "Resuming accumulation"
        );
        Self::from_parts(reducer, &planned, columns, store, DriverSettings::from_config(config))
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn stage(&self) -> DriverStage {
        self.stage
    }

    pub fn store(&self) -> &StackStore {
        &self.store
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    /// Consume every remaining group of `source`.
    pub fn accumulate(&mut self, source: &mut dyn MatchSource) -> StackResult<AccumulateReport> {
        self.accumulate_groups(source, None)
    }

    /// Consume at most `max_groups` groups past those already done.
    ///
    /// Groups recorded as done in the store (after [`resume`](Self::resume) or
    /// an earlier limited call) are skipped, never reprocessed.
    pub fn accumulate_groups(
        &mut self,
        source: &mut dyn MatchSource,
        max_groups: Option<u64>,
    ) -> StackResult<AccumulateReport> {
        assert_eq!(self.stage, DriverStage::Accumulating, "accumulate after finalize");

        let total_matches = source.total_matches();
        let policy = self.settings.checkpoint;
        let checkpoint_every = policy
            .is_enabled(total_matches)
            .then(|| policy.interval(total_matches));
        let mut next_checkpoint = checkpoint_every.map(|every| (self.pairs_seen() / every + 1) * every);

        let mut report = AccumulateReport::default();
        let skip = self.store.groups_done() as usize;
        let mut groups = source.groups()?.skip(skip);

        while max_groups.map_or(true, |max| report.groups < max) {
            let Some(group) = groups.next() else {
                break;
            };
            let group = group?;

            let groups_done = self.store.groups_done();
            if groups_done % PROGRESS_EVERY_GROUPS == 0 {
                let progress = StackProgress {
                    groups_done,
                    pairs_seen: self.pairs_seen(),
                    total_matches,
                };
                tracing::info!(
                    lens = groups_done,
                    percent_matched = progress.percent(),
                    "Stacking lenses"
                );
                report_progress(self.progress.as_ref(), progress);
            }

            let (pairs, skipped) = self.process_group(&group)?;
            report.groups += 1;
            report.pairs += pairs;
            report.skipped += skipped;

            if let (Some(every), Some(next)) = (checkpoint_every, next_checkpoint.as_mut()) {
                let seen = self.pairs_seen();
                if seen >= *next {
                    match self.store.checkpoint() {
                        Ok(_) => report.checkpoints_written += 1,
                        Err(e) => {
                            report.checkpoints_failed += 1;
                            tracing::error!(error = %e, "Checkpoint failed, retrying at next boundary");
                        }
                    }
                    *next = (seen / every + 1) * every;
                }
            }
        }

        if report.skipped > 0 {
            tracing::warn!(
                skipped = report.skipped,
                total_skipped = self.store.skipped_pairs(),
                "Skipped pairs with invalid measurements"
            );
        }
        Ok(report)
    }

    /// Pairs consumed so far, accepted or skipped.
    fn pairs_seen(&self) -> u64 {
        self.store.pair_count() + self.store.skipped_pairs()
    }

    fn check_indices(&self, group: &MatchGroup) -> StackResult<()> {
        let run_dir = self.store.layout().run_dir();
        if group.lens_index >= self.reducer.lens_count() {
            return Err(StackError::source_unavailable(
                run_dir,
                format!(
                    "lens index {} outside catalog of {} lenses",
                    group.lens_index,
                    self.reducer.lens_count()
                ),
            ));
        }
        let sources = self.reducer.source_count();
        if let Some(pair) = group.pairs.iter().find(|p| p.source_index >= sources) {
            return Err(StackError::source_unavailable(
                run_dir,
                format!(
                    "source index {} outside catalog of {} sources",
                    pair.source_index, sources
                ),
            ));
        }
        Ok(())
    }

    /// Reduce, append and slice one group. Returns `(accepted, skipped)`.
    fn process_group(&mut self, group: &MatchGroup) -> StackResult<(u64, u64)> {
        self.check_indices(group)?;

        let parallel = group.pairs.len() >= self.settings.parallel_group_threshold;
        let outputs = self.reducer.reduce_group(group, parallel);

        self.accepted.clear();
        let mut skipped = 0u64;
        for (pair, output) in group.pairs.iter().zip(outputs) {
            match output {
                Ok(output) => {
                    let global_index = self.store.append_pair(&output)?;
                    self.accepted.push(AcceptedPair {
                        global_index,
                        source_index: pair.source_index,
                    });
                }
                Err(e) if e.is_recoverable() => {
                    tracing::trace!(lens = group.lens_index, error = %e, "Skipping pair");
                    skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        self.accumulator.record_group(&mut self.store, &self.accepted)?;
        self.store.add_skipped(skipped);
        self.store.mark_group_done();
        Ok((self.accepted.len() as u64, skipped))
    }

    /// Write a checkpoint now, regardless of cadence.
    pub fn checkpoint(&self) -> StackResult<PathBuf> {
        self.store.checkpoint()
    }

    /// Compact and publish the stack, then write the radial profiles.
    pub fn finalize(mut self, overwrite: bool) -> StackResult<RunSummary> {
        let final_dir = self.store.finalize(overwrite)?;
        self.stage = DriverStage::Finalized;

        let profiles = match &self.settings.profile {
            Some(binning) => {
                let profiles = compute_profiles(&StackView::from_store(&self.store), binning);
                write_profiles(&self.store.layout().profile_dir(), &profiles)?
            }
            None => Vec::new(),
        };

        let slice_counts = self
            .store
            .keys()
            .iter()
            .enumerate()
            .map(|(k, key)| {
                let counts = (0..key.slice_count())
                    .map(|s| self.store.slice_indices(k, s).len())
                    .collect();
                (key.name.clone(), counts)
            })
            .collect();

        Ok(RunSummary {
            final_dir,
            pair_count: self.store.pair_count(),
            skipped_pairs: self.store.skipped_pairs(),
            groups_done: self.store.groups_done(),
            slice_counts,
            profiles,
        })
    }
}
