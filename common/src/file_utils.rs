//! File utility functions for listing files and publishing directories atomically.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Returns paths to all files in a directory matching the given extensions,
/// sorted by file name. Extensions are matched case-insensitively.
pub fn files_with_extensions(dir: &Path, extensions: &[&str]) -> io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|path| {
            if !path.is_file() {
                return false;
            }
            let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
            extensions.iter().any(|e| e.eq_ignore_ascii_case(ext))
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Sibling path used while a directory is being written.
pub fn staging_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    target.with_file_name(name)
}

/// Creates an empty staging directory next to `target`, removing leftovers
/// from an interrupted earlier attempt.
pub fn fresh_staging_dir(target: &Path) -> io::Result<PathBuf> {
    let staging = staging_path(target);
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    fs::create_dir_all(&staging)?;
    Ok(staging)
}

/// Sibling path holding the previous `target` while a new one is published.
pub fn displaced_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".old");
    target.with_file_name(name)
}

/// Moves a fully written `staging` directory into place at `target`.
///
/// An existing `target` is first renamed aside and only removed once the new
/// directory is visible, so readers see either the old or the new content.
pub fn publish_dir(staging: &Path, target: &Path) -> io::Result<()> {
    if target.exists() {
        let old = displaced_path(target);
        if old.exists() {
            fs::remove_dir_all(&old)?;
        }
        fs::rename(target, &old)?;
        fs::rename(staging, target)?;
        fs::remove_dir_all(&old)?;
    } else {
        fs::rename(staging, target)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_output_dir;

    #[test]
    fn lists_matching_files_sorted() {
        let dir = test_output_dir("file_utils_list");
        fs::write(dir.join("b.npy"), b"").unwrap();
        fs::write(dir.join("a.NPY"), b"").unwrap();
        fs::write(dir.join("c.txt"), b"").unwrap();

        let files = files_with_extensions(&dir, &["npy"]).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.NPY", "b.npy"]);
    }

    #[test]
    fn publish_replaces_existing_directory() {
        let root = test_output_dir("file_utils_publish");
        let target = root.join("stack");

        let staging = fresh_staging_dir(&target).unwrap();
        fs::write(staging.join("v.txt"), b"1").unwrap();
        publish_dir(&staging, &target).unwrap();
        assert_eq!(fs::read(target.join("v.txt")).unwrap(), b"1");
        assert!(!staging.exists());

        let staging = fresh_staging_dir(&target).unwrap();
        fs::write(staging.join("v.txt"), b"2").unwrap();
        publish_dir(&staging, &target).unwrap();
        assert_eq!(fs::read(target.join("v.txt")).unwrap(), b"2");
        assert!(!root.join("stack.old").exists());
    }

    #[test]
    fn sibling_paths() {
        let target = Path::new("/run/checkpoint");
        assert_eq!(staging_path(target), Path::new("/run/checkpoint.tmp"));
        assert_eq!(displaced_path(target), Path::new("/run/checkpoint.old"));
    }
}
