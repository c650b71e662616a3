//! One-dimensional NumPy `.npy` arrays on top of `ndarray-npy`.
//!
//! Reads map the file and view the data in place, so a header that claims
//! more elements than the file holds is rejected before anything is copied.

use std::fs::File;
use std::io::{self, BufWriter};
use std::path::Path;

use memmap2::Mmap;
use ndarray::ArrayView1;
use ndarray_npy::{ViewElement, ViewNpyError, ViewNpyExt, WritableElement, WriteNpyError, WriteNpyExt};

use crate::error::{StackError, StackResult};

/// Element types stored in stack and catalog arrays.
pub trait NpyElement: ViewElement + WritableElement + Copy {}

impl<T: ViewElement + WritableElement + Copy> NpyElement for T {}

fn invalid(path: &Path, reason: impl Into<String>) -> StackError {
    StackError::InvalidArrayFile {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn write_error(path: &Path, e: WriteNpyError) -> StackError {
    let source = match e {
        WriteNpyError::Io(source) => source,
        other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
    };
    StackError::WriteArray {
        path: path.to_path_buf(),
        source,
    }
}

/// Write `data` as a 1-D array and fsync the file.
pub fn write_npy<T: NpyElement>(path: &Path, data: &[T]) -> StackResult<()> {
    let to_err = |source| StackError::WriteArray {
        path: path.to_path_buf(),
        source,
    };

    let file = File::create(path).map_err(to_err)?;
    let mut writer = BufWriter::new(file);
    ArrayView1::from(data)
        .write_npy(&mut writer)
        .map_err(|e| write_error(path, e))?;
    let file = writer.into_inner().map_err(|e| to_err(e.into_error()))?;
    file.sync_all().map_err(to_err)?;
    Ok(())
}

fn map_file(path: &Path) -> StackResult<Mmap> {
    let to_err = |source| StackError::ReadArray {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(to_err)?;
    // SAFETY: array files are not modified while a run reads them.
    unsafe { Mmap::map(&file) }.map_err(to_err)
}

fn view<T: NpyElement>(bytes: &[u8]) -> Result<Vec<T>, ViewNpyError> {
    Ok(ArrayView1::<T>::view_npy(bytes)?.to_vec())
}

/// Read a 1-D array whose dtype must be exactly `T`.
pub fn read_npy<T: NpyElement>(path: &Path) -> StackResult<Vec<T>> {
    let mmap = map_file(path)?;
    view(&mmap).map_err(|e| invalid(path, e.to_string()))
}

/// Read a 1-D numeric array of any supported dtype, widened to f64.
pub fn read_npy_as_f64(path: &Path) -> StackResult<Vec<f64>> {
    let mmap = map_file(path)?;
    let bytes: &[u8] = &mmap;

    let attempts: [fn(&[u8]) -> Result<Vec<f64>, ViewNpyError>; 6] = [
        view::<f64>,
        |b| view::<f32>(b).map(widen),
        |b| view::<i64>(b).map(|v| v.into_iter().map(|x| x as f64).collect()),
        |b| view::<i32>(b).map(widen),
        |b| view::<u8>(b).map(widen),
        |b| view::<bool>(b).map(|v| v.into_iter().map(|x| if x { 1.0 } else { 0.0 }).collect()),
    ];
    for attempt in attempts {
        match attempt(bytes) {
            Err(ViewNpyError::WrongDescriptor(_)) => continue,
            result => return result.map_err(|e| invalid(path, e.to_string())),
        }
    }
    Err(invalid(path, "unsupported dtype"))
}

fn widen<T: Into<f64>>(values: Vec<T>) -> Vec<f64> {
    values.into_iter().map(Into::into).collect()
}
