//! Columnar catalogs and the slice keys evaluated over them.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::error::{StackError, StackResult};
use crate::npy::read_npy_as_f64;

/// Read access to a tabular catalog, one numeric column per field.
pub trait Catalog: Send + Sync {
    fn len(&self) -> usize;

    fn column(&self, name: &str) -> Option<&[f64]>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn require_column(&self, name: &str) -> StackResult<&[f64]> {
        self.column(name)
            .ok_or_else(|| StackError::InvalidConfig(format!("catalog has no column '{}'", name)))
    }
}

/// In-memory catalog with equally long f64 columns.
#[derive(Debug, Clone, Default)]
pub struct ColumnTable {
    columns: BTreeMap<String, Vec<f64>>,
    len: usize,
}

impl ColumnTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_column(mut self, name: impl Into<String>, values: Vec<f64>) -> StackResult<Self> {
        self.insert(name, values)?;
        Ok(self)
    }

    pub fn insert(&mut self, name: impl Into<String>, values: Vec<f64>) -> StackResult<()> {
        let name = name.into();
        if !self.columns.is_empty() && values.len() != self.len {
            return Err(StackError::InvalidConfig(format!(
                "column '{}' has {} rows, catalog has {}",
                name,
                values.len(),
                self.len
            )));
        }
        self.len = values.len();
        self.columns.insert(name, values);
        Ok(())
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    /// Load a catalog stored as one `<column>.npy` file per column.
    pub fn from_npy_dir(dir: &Path) -> StackResult<Self> {
        let files = common::file_utils::files_with_extensions(dir, &["npy"]).map_err(|source| {
            StackError::ReadArray {
                path: dir.to_path_buf(),
                source,
            }
        })?;
        if files.is_empty() {
            return Err(StackError::InvalidConfig(format!(
                "no .npy columns found in '{}'",
                dir.display()
            )));
        }

        let mut table = Self::new();
        for path in files {
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            table.insert(name, read_npy_as_f64(&path)?)?;
        }

        tracing::info!(
            path = %dir.display(),
            rows = table.len(),
            columns = table.columns.len(),
            "Loaded catalog"
        );
        Ok(table)
    }
}

impl Catalog for ColumnTable {
    fn len(&self) -> usize {
        self.len
    }

    fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(Vec::as_slice)
    }
}

/// Computes one value per catalog row.
pub type Extractor = Arc<dyn Fn(&dyn Catalog) -> StackResult<Vec<f64>> + Send + Sync>;

/// Quantity used to slice matched pairs.
#[derive(Clone)]
pub enum SliceKey {
    /// A catalog column used as-is.
    Field(String),
    /// A named quantity derived from one or more columns.
    Derived { name: String, extractor: Extractor },
}

impl fmt::Debug for SliceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SliceKey::Field(name) => write!(f, "Field({})", name),
            SliceKey::Derived { name, .. } => write!(f, "Derived({})", name),
        }
    }
}

impl SliceKey {
    pub fn derived<F>(name: impl Into<String>, extractor: F) -> Self
    where
        F: Fn(&dyn Catalog) -> StackResult<Vec<f64>> + Send + Sync + 'static,
    {
        SliceKey::Derived {
            name: name.into(),
            extractor: Arc::new(extractor),
        }
    }

    /// Row-wise `numerator / denominator`, e.g. a bulge-to-disc flux ratio.
    pub fn ratio(name: impl Into<String>, numerator: &str, denominator: &str) -> Self {
        let numerator = numerator.to_string();
        let denominator = denominator.to_string();
        Self::derived(name, move |catalog| {
            let num = catalog.require_column(&numerator)?;
            let den = catalog.require_column(&denominator)?;
            Ok(num.iter().zip(den).map(|(n, d)| n / d).collect())
        })
    }

    pub fn name(&self) -> &str {
        match self {
            SliceKey::Field(name) => name,
            SliceKey::Derived { name, .. } => name,
        }
    }

    /// Evaluate the key over every row of `catalog`.
    pub fn resolve(&self, catalog: &dyn Catalog) -> StackResult<KeyColumn> {
        let values = match self {
            SliceKey::Field(name) => catalog.require_column(name)?.to_vec(),
            SliceKey::Derived { name, extractor } => {
                let values = extractor(catalog)?;
                if values.len() != catalog.len() {
                    return Err(StackError::InvalidConfig(format!(
                        "derived key '{}' produced {} values for {} rows",
                        name,
                        values.len(),
                        catalog.len()
                    )));
                }
                values
            }
        };
        Ok(KeyColumn {
            name: self.name().to_string(),
            values,
        })
    }
}

/// A resolved key: one value per source record.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyColumn {
    pub name: String,
    pub values: Vec<f64>,
}

impl KeyColumn {
    /// The values of rows where `mask` is set.
    pub fn select(&self, mask: &[bool]) -> KeyColumn {
        KeyColumn {
            name: self.name.clone(),
            values: self
                .values
                .iter()
                .zip(mask)
                .filter(|(_, keep)| **keep)
                .map(|(v, _)| *v)
                .collect(),
        }
    }
}

/// Rows of `catalog` where every `(column, value)` requirement holds exactly.
pub fn select_rows(catalog: &dyn Catalog, requirements: &[(String, f64)]) -> StackResult<Vec<bool>> {
    let mut mask = vec![true; catalog.len()];
    for (name, required) in requirements {
        let column = catalog.require_column(name)?;
        for (keep, value) in mask.iter_mut().zip(column) {
            *keep &= *value == *required;
        }
    }
    Ok(mask)
}
