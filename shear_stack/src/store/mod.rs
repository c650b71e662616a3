//! Stack store: the primary per-pair arrays plus every slice's index buffer.
//!
//! Run directory layout:
//! - `checkpoint/` latest resumable snapshot (unscaled radius)
//! - `stack/` finalized, immutable artifact set
//! - `<dir>.tmp` staging directories, renamed into place once complete
//! - `checkpoint.old` the previous snapshot, only while a new one is published

mod io;
#[cfg(test)]
mod tests;

use std::path::{Path, PathBuf};

use common::file_utils::displaced_path;

pub use io::{KeyArrays, KeyEdges, Manifest, Stage, StackArrays};

use crate::error::{StackError, StackResult};
use crate::growable::GrowableBuffer;
use crate::planner::PlannedKey;
use crate::reducer::PairOutput;

/// Paths of one run's artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    run_dir: PathBuf,
}

impl RunLayout {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.run_dir.join("checkpoint")
    }

    pub fn final_dir(&self) -> PathBuf {
        self.run_dir.join("stack")
    }

    pub fn profile_dir(&self) -> PathBuf {
        self.run_dir.join("profiles")
    }

    pub fn match_file(&self, band: &str) -> PathBuf {
        self.run_dir
            .join(format!("matches_{}.bin", band.to_ascii_lowercase()))
    }

    pub fn is_finalized(&self) -> bool {
        self.final_dir().exists()
    }

    /// The previous checkpoint while a newer one is being published.
    pub fn displaced_checkpoint_dir(&self) -> PathBuf {
        displaced_path(&self.checkpoint_dir())
    }

    /// The newest complete checkpoint. Falls back to the displaced copy when
    /// a publish stopped between moving the old checkpoint aside and moving
    /// the new one in.
    pub fn resumable_checkpoint(&self) -> Option<PathBuf> {
        [self.checkpoint_dir(), self.displaced_checkpoint_dir()]
            .into_iter()
            .find(|dir| dir.join(io::MANIFEST_FILE).exists())
    }

    pub fn has_checkpoint(&self) -> bool {
        self.resumable_checkpoint().is_some()
    }
}

/// Slice index buffers for one key.
#[derive(Debug, Clone, PartialEq)]
pub struct KeySlices {
    pub name: String,
    pub edges: Vec<f64>,
    slices: Vec<GrowableBuffer<i64>>,
}

impl KeySlices {
    pub fn slice_count(&self) -> usize {
        self.slices.len()
    }
}

fn growth_failure(buffer: impl Into<String>, requested: usize) -> StackError {
    StackError::BufferGrowthFailure {
        buffer: buffer.into(),
        requested,
    }
}

/// All mutable state of a run.
#[derive(Debug)]
pub struct StackStore {
    layout: RunLayout,
    signal: GrowableBuffer<f32>,
    signal_cross: GrowableBuffer<f32>,
    radius: GrowableBuffer<f32>,
    weight: GrowableBuffer<f32>,
    keys: Vec<KeySlices>,
    groups_done: u64,
    skipped_pairs: u64,
    radius_unit_factor: f32,
    radius_scaled: bool,
}

impl StackStore {
    /// Allocate primary arrays for `expected_pairs` and slice buffers sized by
    /// each slice's expected occupancy.
    pub fn new(
        layout: RunLayout,
        planned: &[PlannedKey],
        expected_pairs: u64,
        radius_unit_factor: f32,
    ) -> StackResult<Self> {
        let capacity = expected_pairs as usize;
        let primary = |name: &str| {
            GrowableBuffer::with_capacity(capacity).map_err(|_| growth_failure(name, capacity))
        };

        let keys = planned
            .iter()
            .map(|plan| {
                let slices = (0..plan.slice_count())
                    .map(|s| {
                        let expected = plan.expected_occupancy.get(s).copied().unwrap_or(0);
                        GrowableBuffer::with_capacity(expected)
                            .map_err(|_| growth_failure(format!("{}[{}]", plan.name, s), expected))
                    })
                    .collect::<StackResult<Vec<_>>>()?;
                Ok(KeySlices {
                    name: plan.name.clone(),
                    edges: plan.edges.clone(),
                    slices,
                })
            })
            .collect::<StackResult<Vec<_>>>()?;

        Ok(Self {
            layout,
            signal: primary("signal")?,
            signal_cross: primary("signal_cross")?,
            radius: primary("radius")?,
            weight: primary("weight")?,
            keys,
            groups_done: 0,
            skipped_pairs: 0,
            radius_unit_factor,
            radius_scaled: false,
        })
    }

    /// Rebuild the state saved by the last successful [`checkpoint`](Self::checkpoint).
    ///
    /// Every buffer is cut back to the counters recorded in the checkpoint
    /// manifest so nothing past the snapshot can be counted twice.
    pub fn restore(layout: RunLayout, expected_pairs: u64) -> StackResult<Self> {
        let Some(dir) = layout.resumable_checkpoint() else {
            return Err(StackError::CheckpointMissing {
                path: layout.checkpoint_dir(),
            });
        };
        if dir != layout.checkpoint_dir() {
            tracing::warn!(path = %dir.display(), "Resuming from the displaced checkpoint");
        }

        let arrays = StackArrays::read(&dir)?;
        let manifest = &arrays.manifest;
        if manifest.stage != Stage::Checkpoint || manifest.radius_scaled {
            return Err(StackError::InvalidArrayFile {
                path: dir,
                reason: format!("manifest stage is '{}', not a checkpoint", manifest.stage),
            });
        }

        let pair_count = manifest.pair_count as usize;
        let restore_primary = |name: &str, data: Vec<f32>| -> StackResult<GrowableBuffer<f32>> {
            let buffer = truncated(&dir, name, data, pair_count)?;
            Ok(buffer)
        };
        let mut signal = restore_primary("signal", arrays.signal)?;
        let mut signal_cross = restore_primary("signal_cross", arrays.signal_cross)?;
        let mut radius = restore_primary("radius", arrays.radius)?;
        let mut weight = restore_primary("weight", arrays.weight)?;

        let headroom = (expected_pairs as usize).saturating_sub(pair_count);
        for (name, buffer) in [
            ("signal", &mut signal),
            ("signal_cross", &mut signal_cross),
            ("radius", &mut radius),
            ("weight", &mut weight),
        ] {
            buffer
                .ensure_room(headroom)
                .map_err(|_| growth_failure(name, pair_count + headroom))?;
        }

        if manifest.slice_counts.len() != arrays.keys.len() {
            return Err(StackError::InvalidArrayFile {
                path: dir,
                reason: "slice counts do not match key list".into(),
            });
        }

        let mut keys = Vec::with_capacity(arrays.keys.len());
        for (key, counts) in arrays.keys.into_iter().zip(&manifest.slice_counts) {
            if counts.len() != key.slices.len() {
                return Err(StackError::InvalidArrayFile {
                    path: dir,
                    reason: format!("slice counts do not match slices of '{}'", key.name),
                });
            }
            let mut slices = Vec::with_capacity(key.slices.len());
            for (s, (data, &count)) in key.slices.into_iter().zip(counts).enumerate() {
                let name = format!("{}[{}]", key.name, s);
                slices.push(truncated(&dir, &name, data, count as usize)?);
            }
            keys.push(KeySlices {
                name: key.name,
                edges: key.edges,
                slices,
            });
        }

        tracing::info!(
            path = %dir.display(),
            pairs = pair_count,
            groups_done = manifest.groups_done,
            "Restored stack from checkpoint"
        );

        Ok(Self {
            layout,
            signal,
            signal_cross,
            radius,
            weight,
            keys,
            groups_done: manifest.groups_done,
            skipped_pairs: manifest.skipped_pairs,
            radius_unit_factor: manifest.radius_unit_factor,
            radius_scaled: false,
        })
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    /// Number of accumulated pairs (the primary arrays' logical length).
    pub fn pair_count(&self) -> u64 {
        self.signal.len() as u64
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn keys(&self) -> &[KeySlices] {
        &self.keys
    }

    pub fn key_names(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(|k| k.name.as_str())
    }

    pub fn slice_indices(&self, key: usize, slice: usize) -> &[i64] {
        self.keys[key].slices[slice].as_slice()
    }

    pub fn slice_capacity(&self, key: usize, slice: usize) -> usize {
        self.keys[key].slices[slice].capacity()
    }

    pub fn signal(&self) -> &[f32] {
        self.signal.as_slice()
    }

    pub fn signal_cross(&self) -> &[f32] {
        self.signal_cross.as_slice()
    }

    pub fn radius(&self) -> &[f32] {
        self.radius.as_slice()
    }

    pub fn weight(&self) -> &[f32] {
        self.weight.as_slice()
    }

    pub fn groups_done(&self) -> u64 {
        self.groups_done
    }

    pub fn skipped_pairs(&self) -> u64 {
        self.skipped_pairs
    }

    pub fn radius_unit_factor(&self) -> f32 {
        self.radius_unit_factor
    }

    pub fn is_finalized(&self) -> bool {
        self.radius_scaled
    }

    pub(crate) fn mark_group_done(&mut self) {
        self.groups_done += 1;
    }

    pub(crate) fn add_skipped(&mut self, count: u64) {
        self.skipped_pairs += count;
    }

    /// Append one pair to the primary arrays and return its global index.
    pub fn append_pair(&mut self, pair: &PairOutput) -> StackResult<u64> {
        assert!(!self.radius_scaled, "append to a finalized stack");

        let index = self.signal.len();
        let grown = [
            ("signal", self.signal.push(pair.signal)),
            ("signal_cross", self.signal_cross.push(pair.signal_cross)),
            ("radius", self.radius.push(pair.radius)),
            ("weight", self.weight.push(pair.weight)),
        ];
        for (name, result) in grown {
            match result {
                Ok(Some(capacity)) => {
                    tracing::warn!(buffer = name, capacity, "Primary array outgrew the match count");
                }
                Ok(None) => {}
                Err(_) => return Err(growth_failure(name, index + 1)),
            }
        }
        Ok(index as u64)
    }

    /// Record that pair `global_index` belongs to `slice` of `key`.
    ///
    /// # Panics
    ///
    /// If `global_index` is not an appended pair or does not exceed every
    /// index already recorded in the slice.
    pub fn record_slice_membership(
        &mut self,
        key: usize,
        slice: usize,
        global_index: u64,
    ) -> StackResult<()> {
        self.record_slice_batch(key, slice, &[global_index as i64])
    }

    /// Append indices to one slice buffer, growing it first if they do not fit.
    ///
    /// Indices must be valid primary-array positions greater than every index
    /// already in the slice, and strictly increasing.
    pub(crate) fn record_slice_batch(&mut self, key: usize, slice: usize, indices: &[i64]) -> StackResult<()> {
        let pair_count = self.signal.len() as i64;
        let key_slices = &mut self.keys[key];
        let buffer = &mut key_slices.slices[slice];

        if let (Some(&first), Some(&last)) = (indices.first(), indices.last()) {
            let previous = buffer.last().copied().unwrap_or(-1);
            assert!(
                first > previous && last < pair_count,
                "slice {}[{}]: indices {}..={} out of order or range (previous {}, pairs {})",
                key_slices.name,
                slice,
                first,
                last,
                previous,
                pair_count
            );
            debug_assert!(indices.windows(2).all(|w| w[0] < w[1]));
        }

        let requested = buffer.len() + indices.len();
        match buffer.extend_from_slice(indices) {
            Ok(Some(capacity)) => {
                tracing::debug!(
                    key = %key_slices.name,
                    slice,
                    capacity,
                    "Extended slice index buffer"
                );
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(_) => Err(growth_failure(
                format!("{}[{}]", key_slices.name, slice),
                requested,
            )),
        }
    }

    fn manifest(&self, stage: Stage) -> Manifest {
        Manifest {
            stage,
            pair_count: self.pair_count(),
            slice_counts: self
                .keys
                .iter()
                .map(|k| k.slices.iter().map(|s| s.len() as u64).collect())
                .collect(),
            groups_done: self.groups_done,
            skipped_pairs: self.skipped_pairs,
            radius_unit_factor: self.radius_unit_factor,
            radius_scaled: self.radius_scaled,
        }
    }

    /// Write a resumable snapshot without touching any counter.
    pub fn checkpoint(&self) -> StackResult<PathBuf> {
        assert!(!self.radius_scaled, "checkpoint of a finalized stack");

        let dir = self.layout.checkpoint_dir();
        io::write_artifacts(&dir, self, &self.manifest(Stage::Checkpoint))?;
        tracing::info!(
            path = %dir.display(),
            pairs = self.pair_count(),
            groups_done = self.groups_done,
            "Checkpoint written"
        );
        Ok(dir)
    }

    /// Shrink every buffer to its occupancy, apply the deferred radius unit
    /// factor and publish the final artifact set.
    ///
    /// Repeating the call writes byte-identical output, but an existing
    /// final directory is only replaced when `overwrite` is set.
    pub fn finalize(&mut self, overwrite: bool) -> StackResult<PathBuf> {
        let target = self.layout.final_dir();
        if target.exists() && !overwrite {
            return Err(StackError::OutputAlreadyExists { path: target });
        }

        for buffer in [
            &mut self.signal,
            &mut self.signal_cross,
            &mut self.radius,
            &mut self.weight,
        ] {
            buffer.shrink_to_len();
        }
        for key in &mut self.keys {
            for slice in &mut key.slices {
                slice.shrink_to_len();
            }
        }

        if !self.radius_scaled {
            let factor = self.radius_unit_factor;
            for r in self.radius.as_mut_slice() {
                *r *= factor;
            }
            self.radius_scaled = true;
        }

        io::write_artifacts(&target, self, &self.manifest(Stage::Final))?;

        for checkpoint in [self.layout.checkpoint_dir(), self.layout.displaced_checkpoint_dir()] {
            if checkpoint.exists() {
                if let Err(e) = std::fs::remove_dir_all(&checkpoint) {
                    tracing::warn!(path = %checkpoint.display(), "Failed to remove checkpoint: {}", e);
                }
            }
        }

        tracing::info!(
            path = %target.display(),
            pairs = self.pair_count(),
            skipped = self.skipped_pairs,
            "Stack finalized"
        );
        Ok(target)
    }
}

fn truncated<T: Copy + Default>(
    dir: &Path,
    name: &str,
    data: Vec<T>,
    count: usize,
) -> StackResult<GrowableBuffer<T>> {
    if data.len() < count {
        return Err(StackError::InvalidArrayFile {
            path: dir.to_path_buf(),
            reason: format!(
                "'{}' holds {} entries, manifest records {}",
                name,
                data.len(),
                count
            ),
        });
    }
    let mut buffer = GrowableBuffer::from_vec(data);
    buffer.truncate(count);
    Ok(buffer)
}
