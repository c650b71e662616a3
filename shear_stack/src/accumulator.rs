//! Slice membership: maps each accumulated pair to at most one slice per key.

use crate::catalog::KeyColumn;
use crate::error::{StackError, StackResult};
use crate::planner::PlannedKey;
use crate::store::StackStore;

/// Index `s` with `edges[s] <= value < edges[s + 1]`.
///
/// Bins are strictly half-open: a value equal to the last edge, below the
/// first edge, or NaN belongs to no slice.
#[inline]
pub fn find_slice(edges: &[f64], value: f64) -> Option<usize> {
    let (&first, &last) = (edges.first()?, edges.last()?);
    if !(value >= first && value < last) {
        return None;
    }
    Some(edges.partition_point(|&e| e <= value) - 1)
}

#[derive(Debug)]
struct KeyBinning {
    name: String,
    edges: Vec<f64>,
    values: Vec<f64>,
}

/// A pair that was appended to the primary arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptedPair {
    pub global_index: u64,
    pub source_index: usize,
}

/// Routes accepted pairs into the per-(key, slice) index buffers.
#[derive(Debug)]
pub struct SliceAccumulator {
    keys: Vec<KeyBinning>,
    // Per-slice staging for the current group, reused across groups.
    scratch: Vec<Vec<i64>>,
}

impl SliceAccumulator {
    /// `columns` must be in the same order as `planned`.
    pub fn new(planned: &[PlannedKey], columns: Vec<KeyColumn>) -> StackResult<Self> {
        if planned.len() != columns.len() {
            return Err(StackError::InvalidConfig(format!(
                "{} planned keys but {} key columns",
                planned.len(),
                columns.len()
            )));
        }

        let keys = planned
            .iter()
            .zip(columns)
            .map(|(plan, column)| {
                if plan.name != column.name {
                    return Err(StackError::InvalidConfig(format!(
                        "key order mismatch: planned '{}', column '{}'",
                        plan.name, column.name
                    )));
                }
                Ok(KeyBinning {
                    name: column.name,
                    edges: plan.edges.clone(),
                    values: column.values,
                })
            })
            .collect::<StackResult<Vec<_>>>()?;

        Ok(Self {
            keys,
            scratch: Vec::new(),
        })
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn key_name(&self, key: usize) -> &str {
        &self.keys[key].name
    }

    /// Slice of `source_index` for `key`, if its value falls inside the edges.
    pub fn slice_of(&self, key: usize, source_index: usize) -> Option<usize> {
        let binning = &self.keys[key];
        find_slice(&binning.edges, binning.values[source_index])
    }

    /// Record slice membership for one match group's accepted pairs.
    ///
    /// `pairs` must be in ascending `global_index` order; each slice's indices
    /// are then appended in one batch so the buffer grows at most once.
    pub fn record_group(&mut self, store: &mut StackStore, pairs: &[AcceptedPair]) -> StackResult<()> {
        debug_assert!(pairs
            .windows(2)
            .all(|w| w[0].global_index < w[1].global_index));

        for key in 0..self.keys.len() {
            let slice_count = self.keys[key].edges.len() - 1;
            self.scratch.resize_with(slice_count.max(self.scratch.len()), Vec::new);
            for staged in &mut self.scratch {
                staged.clear();
            }

            for pair in pairs {
                if let Some(slice) = self.slice_of(key, pair.source_index) {
                    self.scratch[slice].push(pair.global_index as i64);
                }
            }

            for (slice, staged) in self.scratch[..slice_count].iter().enumerate() {
                if !staged.is_empty() {
                    store.record_slice_batch(key, slice, staged)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_slice_half_open() {
        let edges = [0.0, 10.0, 20.0, 30.0];
        assert_eq!(find_slice(&edges, 0.0), Some(0));
        assert_eq!(find_slice(&edges, 5.0), Some(0));
        assert_eq!(find_slice(&edges, 10.0), Some(1));
        assert_eq!(find_slice(&edges, 29.999), Some(2));
        assert_eq!(find_slice(&edges, 30.0), None);
        assert_eq!(find_slice(&edges, -0.1), None);
        assert_eq!(find_slice(&edges, f64::NAN), None);
        assert_eq!(find_slice(&edges, f64::INFINITY), None);
    }

    #[test]
    fn test_find_slice_with_tied_edges() {
        // Percentile planning on discrete data can produce repeated edges.
        let edges = [1.0, 1.0, 2.0];
        assert_eq!(find_slice(&edges, 1.0), Some(1));
        assert_eq!(find_slice(&edges, 1.5), Some(1));
    }

    #[test]
    fn test_find_slice_degenerate_edges() {
        assert_eq!(find_slice(&[], 1.0), None);
        assert_eq!(find_slice(&[1.0], 1.0), None);
    }

    #[test]
    fn test_new_rejects_misaligned_columns() {
        let planned = vec![PlannedKey {
            name: "a".into(),
            edges: vec![0.0, 1.0],
            expected_occupancy: vec![0],
        }];
        let columns = vec![KeyColumn {
            name: "b".into(),
            values: vec![0.5],
        }];
        assert!(SliceAccumulator::new(&planned, columns).is_err());
        assert!(SliceAccumulator::new(&planned, Vec::new()).is_err());
    }
}
