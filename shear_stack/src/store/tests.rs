use std::fs;
use std::path::Path;

use common::test_utils::test_output_dir;

use super::*;
use crate::npy::write_npy;

fn planned(name: &str, edges: &[f64], occupancy: &[usize]) -> PlannedKey {
    PlannedKey {
        name: name.into(),
        edges: edges.to_vec(),
        expected_occupancy: occupancy.to_vec(),
    }
}

fn pair(value: f32) -> PairOutput {
    PairOutput {
        signal: value,
        signal_cross: -value,
        weight: 1.0,
        radius: value / 10.0,
    }
}

fn dir_contents(dir: &Path) -> Vec<(String, Vec<u8>)> {
    let mut entries: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .map(|e| {
            let path = e.unwrap().path();
            (
                path.file_name().unwrap().to_string_lossy().into_owned(),
                fs::read(&path).unwrap(),
            )
        })
        .collect();
    entries.sort();
    entries
}

fn filled_store(name: &str) -> StackStore {
    let layout = RunLayout::new(test_output_dir(name));
    let mut store = StackStore::new(
        layout,
        &[planned("snr", &[0.0, 10.0, 20.0], &[2, 2])],
        4,
        60.0,
    )
    .unwrap();
    for v in [1.0, 2.0, 3.0] {
        store.append_pair(&pair(v)).unwrap();
    }
    store.record_slice_batch(0, 0, &[0, 2]).unwrap();
    store.record_slice_membership(0, 1, 1).unwrap();
    store.mark_group_done();
    store
}

#[test]
fn test_slice_buffer_grows_from_capacity_one() {
    let layout = RunLayout::new(test_output_dir("store_growth"));
    let mut store = StackStore::new(layout, &[planned("k", &[0.0, 1.0], &[1])], 5, 1.0).unwrap();
    assert_eq!(store.slice_capacity(0, 0), 1);

    for i in 0..5 {
        let index = store.append_pair(&pair(i as f32)).unwrap();
        assert_eq!(index, i);
        store.record_slice_membership(0, 0, index).unwrap();
    }

    assert!(store.slice_capacity(0, 0) >= 5);
    assert_eq!(store.slice_indices(0, 0), &[0, 1, 2, 3, 4]);
}

#[test]
fn test_primary_arrays_stay_parallel() {
    let layout = RunLayout::new(test_output_dir("store_parallel"));
    // Undersized on purpose: the primary arrays grow past the match count.
    let mut store = StackStore::new(layout, &[], 1, 1.0).unwrap();
    for v in [1.0, 2.0, 3.0] {
        store.append_pair(&pair(v)).unwrap();
    }
    assert_eq!(store.pair_count(), 3);
    assert_eq!(store.signal(), &[1.0, 2.0, 3.0]);
    assert_eq!(store.signal_cross(), &[-1.0, -2.0, -3.0]);
    assert_eq!(store.weight().len(), 3);
    assert_eq!(store.radius().len(), 3);
}

#[test]
#[should_panic(expected = "out of order or range")]
fn test_slice_indices_must_increase() {
    let mut store = filled_store("store_order");
    store.record_slice_membership(0, 0, 1).unwrap();
}

#[test]
#[should_panic(expected = "out of order or range")]
fn test_slice_indices_must_index_a_pair() {
    let mut store = filled_store("store_range");
    store.record_slice_membership(0, 1, 3).unwrap();
}

#[test]
fn test_checkpoint_keeps_counters_and_restores() {
    let store = filled_store("store_checkpoint");
    let dir = store.checkpoint().unwrap();
    // Repeatable.
    store.checkpoint().unwrap();
    assert_eq!(dir, store.layout().checkpoint_dir());
    assert_eq!(store.pair_count(), 3);
    assert_eq!(store.groups_done(), 1);

    let restored = StackStore::restore(store.layout().clone(), 4).unwrap();
    assert_eq!(restored.pair_count(), 3);
    assert_eq!(restored.signal(), store.signal());
    assert_eq!(restored.radius(), store.radius());
    assert_eq!(restored.slice_indices(0, 0), &[0, 2]);
    assert_eq!(restored.slice_indices(0, 1), &[1]);
    assert_eq!(restored.groups_done(), 1);
    assert_eq!(restored.radius_unit_factor(), 60.0);
    assert!(!restored.is_finalized());
}

#[test]
fn test_restore_truncates_to_manifest_counters() {
    let store = filled_store("store_truncate");
    let dir = store.checkpoint().unwrap();

    // Arrays written past the manifest must not come back.
    write_npy(&dir.join("signal.npy"), &[1.0f32, 2.0, 3.0, 99.0, 98.0]).unwrap();
    write_npy(&dir.join("snr_0.npy"), &[0i64, 2, 3]).unwrap();

    let mut restored = StackStore::restore(store.layout().clone(), 4).unwrap();
    assert_eq!(restored.signal(), &[1.0, 2.0, 3.0]);
    assert_eq!(restored.slice_indices(0, 0), &[0, 2]);

    // Appending continues right after the checkpoint.
    assert_eq!(restored.append_pair(&pair(4.0)).unwrap(), 3);
    restored.record_slice_membership(0, 0, 3).unwrap();
    assert_eq!(restored.slice_indices(0, 0), &[0, 2, 3]);
}

#[test]
fn test_restore_rejects_short_arrays() {
    let store = filled_store("store_short");
    let dir = store.checkpoint().unwrap();
    write_npy(&dir.join("weight.npy"), &[1.0f32]).unwrap();

    let err = StackStore::restore(store.layout().clone(), 4).unwrap_err();
    assert!(matches!(err, StackError::InvalidArrayFile { .. }));
}

#[test]
fn test_restore_falls_back_to_displaced_checkpoint() {
    let store = filled_store("store_displaced");
    let layout = store.layout().clone();
    store.checkpoint().unwrap();

    // Interrupted publish: the old snapshot was moved aside, the new one never landed.
    fs::rename(layout.checkpoint_dir(), layout.displaced_checkpoint_dir()).unwrap();
    assert!(layout.has_checkpoint());
    assert_eq!(layout.resumable_checkpoint(), Some(layout.displaced_checkpoint_dir()));

    let mut restored = StackStore::restore(layout.clone(), 4).unwrap();
    assert_eq!(restored.pair_count(), 3);
    assert_eq!(restored.slice_indices(0, 0), &[0, 2]);
    assert_eq!(restored.groups_done(), 1);

    restored.checkpoint().unwrap();
    assert_eq!(layout.resumable_checkpoint(), Some(layout.checkpoint_dir()));

    restored.finalize(false).unwrap();
    assert!(!layout.has_checkpoint());
    assert!(!layout.displaced_checkpoint_dir().exists());
}

#[test]
fn test_restore_rejects_truncated_array_body() {
    let store = filled_store("store_truncated_body");
    let dir = store.checkpoint().unwrap();

    // Header still declares three elements, the body holds one.
    let path = dir.join("radius.npy");
    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() - 8]).unwrap();

    let err = StackStore::restore(store.layout().clone(), 4).unwrap_err();
    assert!(matches!(err, StackError::InvalidArrayFile { .. }));
}

#[test]
fn test_restore_without_checkpoint() {
    let layout = RunLayout::new(test_output_dir("store_no_checkpoint"));
    let err = StackStore::restore(layout, 10).unwrap_err();
    assert!(matches!(err, StackError::CheckpointMissing { .. }));
}

#[test]
fn test_finalize_scales_radius_once_and_is_idempotent() {
    let mut store = filled_store("store_finalize");
    store.checkpoint().unwrap();

    let target = store.finalize(false).unwrap();
    assert_eq!(target, store.layout().final_dir());
    assert!(store.is_finalized());
    assert!(!store.layout().checkpoint_dir().exists());
    assert!((store.radius()[0] - 6.0).abs() < 1e-6);
    let first = dir_contents(&target);

    let err = store.finalize(false).unwrap_err();
    assert!(matches!(err, StackError::OutputAlreadyExists { .. }));
    assert_eq!(dir_contents(&target), first);

    store.finalize(true).unwrap();
    assert!((store.radius()[0] - 6.0).abs() < 1e-6);
    assert_eq!(dir_contents(&target), first);

    let names: Vec<&str> = first.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(
        names,
        [
            "edges.json",
            "keynames.txt",
            "manifest.json",
            "radius.npy",
            "signal.npy",
            "signal_cross.npy",
            "snr_0.npy",
            "snr_1.npy",
            "weight.npy",
        ]
    );
}

#[test]
fn test_finalize_shrinks_buffers() {
    let mut store = filled_store("store_shrink");
    assert_eq!(store.slice_capacity(0, 1), 2);
    store.finalize(false).unwrap();
    assert_eq!(store.slice_capacity(0, 0), 2);
    assert_eq!(store.slice_capacity(0, 1), 1);
}

#[test]
fn test_final_arrays_read_back() {
    let mut store = filled_store("store_read_back");
    let target = store.finalize(false).unwrap();

    let arrays = StackArrays::read(&target).unwrap();
    assert_eq!(arrays.manifest.stage, Stage::Final);
    assert!(arrays.manifest.radius_scaled);
    assert_eq!(arrays.pair_count(), 3);
    assert_eq!(arrays.signal, vec![1.0, 2.0, 3.0]);
    assert_eq!(arrays.slice("snr", 0), Some(&[0i64, 2][..]));
    assert_eq!(arrays.slice("snr", 1), Some(&[1i64][..]));
    assert_eq!(arrays.slice("snr", 2), None);
    assert_eq!(arrays.keys[0].edges, vec![0.0, 10.0, 20.0]);

    let keynames = fs::read_to_string(target.join("keynames.txt")).unwrap();
    assert_eq!(keynames, "snr\n");

    // A finalized directory is not a checkpoint.
    fs::rename(&target, store.layout().checkpoint_dir()).unwrap();
    let err = StackStore::restore(store.layout().clone(), 3).unwrap_err();
    assert!(matches!(err, StackError::InvalidArrayFile { .. }));
}

#[test]
fn test_run_layout_paths() {
    let layout = RunLayout::new("/scratch/run");
    assert_eq!(layout.checkpoint_dir(), Path::new("/scratch/run/checkpoint"));
    assert_eq!(layout.displaced_checkpoint_dir(), Path::new("/scratch/run/checkpoint.old"));
    assert_eq!(layout.final_dir(), Path::new("/scratch/run/stack"));
    assert_eq!(layout.profile_dir(), Path::new("/scratch/run/profiles"));
    assert_eq!(layout.match_file("R"), Path::new("/scratch/run/matches_r.bin"));
}
