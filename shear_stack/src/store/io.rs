//! On-disk artifact set shared by checkpoints and the final stack.
//!
//! One directory holds:
//! - `signal.npy`, `signal_cross.npy`, `radius.npy`, `weight.npy` (`<f4`)
//! - `<key>_<slice>.npy` global pair indices per slice (`<i8`)
//! - `edges.json` ordered `[{key, edges}]`
//! - `keynames.txt` one key name per line, in slicing order
//! - `manifest.json` counters, written last

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use strum_macros::Display;

use common::file_utils::{fresh_staging_dir, publish_dir};

use crate::error::{StackError, StackResult};
use crate::npy::{read_npy, write_npy};
use crate::store::StackStore;

pub(crate) const MANIFEST_FILE: &str = "manifest.json";
const EDGES_FILE: &str = "edges.json";
const KEYNAMES_FILE: &str = "keynames.txt";
const SIGNAL_FILE: &str = "signal.npy";
const SIGNAL_CROSS_FILE: &str = "signal_cross.npy";
const RADIUS_FILE: &str = "radius.npy";
const WEIGHT_FILE: &str = "weight.npy";

fn slice_file_name(key: &str, slice: usize) -> String {
    format!("{}_{}.npy", key, slice)
}

/// Whether an artifact directory is a resumable snapshot or the final output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Stage {
    Checkpoint,
    Final,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub stage: Stage,
    pub pair_count: u64,
    /// Populated entries per slice, keys in `keynames.txt` order.
    pub slice_counts: Vec<Vec<u64>>,
    pub groups_done: u64,
    pub skipped_pairs: u64,
    pub radius_unit_factor: f32,
    pub radius_scaled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyEdges {
    pub key: String,
    pub edges: Vec<f64>,
}

fn write_text(path: &Path, contents: &[u8]) -> StackResult<()> {
    fs::write(path, contents).map_err(|source| StackError::WriteArray {
        path: path.to_path_buf(),
        source,
    })
}

fn to_json<T: Serialize>(path: &Path, value: &T) -> StackResult<Vec<u8>> {
    serde_json::to_vec_pretty(value).map_err(|e| StackError::WriteArray {
        path: path.to_path_buf(),
        source: std::io::Error::other(e),
    })
}

fn from_json<T: DeserializeOwned>(path: &Path) -> StackResult<T> {
    let bytes = fs::read(path).map_err(|source| StackError::ReadArray {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|e| StackError::InvalidArrayFile {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Write the full artifact set to a staging directory and move it to `target`.
pub(crate) fn write_artifacts(target: &Path, store: &StackStore, manifest: &Manifest) -> StackResult<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|source| StackError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let staging = fresh_staging_dir(target).map_err(|source| StackError::CreateDir {
        path: target.to_path_buf(),
        source,
    })?;

    write_npy(&staging.join(SIGNAL_FILE), store.signal())?;
    write_npy(&staging.join(SIGNAL_CROSS_FILE), store.signal_cross())?;
    write_npy(&staging.join(RADIUS_FILE), store.radius())?;
    write_npy(&staging.join(WEIGHT_FILE), store.weight())?;

    let mut edges = Vec::with_capacity(store.key_count());
    let mut keynames = String::new();
    for (k, key) in store.keys().iter().enumerate() {
        for s in 0..key.slice_count() {
            write_npy(
                &staging.join(slice_file_name(&key.name, s)),
                store.slice_indices(k, s),
            )?;
        }
        edges.push(KeyEdges {
            key: key.name.clone(),
            edges: key.edges.clone(),
        });
        keynames.push_str(&key.name);
        keynames.push('\n');
    }

    let edges_path = staging.join(EDGES_FILE);
    write_text(&edges_path, &to_json(&edges_path, &edges)?)?;
    write_text(&staging.join(KEYNAMES_FILE), keynames.as_bytes())?;
    let manifest_path = staging.join(MANIFEST_FILE);
    write_text(&manifest_path, &to_json(&manifest_path, manifest)?)?;

    publish_dir(&staging, target).map_err(|source| StackError::Publish {
        path: target.to_path_buf(),
        source,
    })
}

/// Slice index arrays of one key as read back from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyArrays {
    pub name: String,
    pub edges: Vec<f64>,
    pub slices: Vec<Vec<i64>>,
}

/// A complete artifact directory loaded into memory.
#[derive(Debug, Clone, PartialEq)]
pub struct StackArrays {
    pub manifest: Manifest,
    pub signal: Vec<f32>,
    pub signal_cross: Vec<f32>,
    pub radius: Vec<f32>,
    pub weight: Vec<f32>,
    pub keys: Vec<KeyArrays>,
}

impl StackArrays {
    pub fn read(dir: &Path) -> StackResult<Self> {
        let manifest: Manifest = from_json(&dir.join(MANIFEST_FILE))?;
        let edges: Vec<KeyEdges> = from_json(&dir.join(EDGES_FILE))?;

        let keys = edges
            .into_iter()
            .map(|KeyEdges { key, edges }| {
                let slices = (0..edges.len().saturating_sub(1))
                    .map(|s| read_npy::<i64>(&dir.join(slice_file_name(&key, s))))
                    .collect::<StackResult<Vec<_>>>()?;
                Ok(KeyArrays {
                    name: key,
                    edges,
                    slices,
                })
            })
            .collect::<StackResult<Vec<_>>>()?;

        Ok(Self {
            manifest,
            signal: read_npy(&dir.join(SIGNAL_FILE))?,
            signal_cross: read_npy(&dir.join(SIGNAL_CROSS_FILE))?,
            radius: read_npy(&dir.join(RADIUS_FILE))?,
            weight: read_npy(&dir.join(WEIGHT_FILE))?,
            keys,
        })
    }

    pub fn pair_count(&self) -> usize {
        self.signal.len()
    }

    /// Global indices of `slice` of the key called `key`.
    pub fn slice(&self, key: &str, slice: usize) -> Option<&[i64]> {
        self.keys
            .iter()
            .find(|k| k.name == key)
            .and_then(|k| k.slices.get(slice))
            .map(Vec::as_slice)
    }
}
