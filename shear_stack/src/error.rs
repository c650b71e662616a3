//! Error types for stacking operations.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while planning, accumulating or writing a stack.
#[derive(Debug, Error)]
pub enum StackError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Insufficient data for key '{key}': {available} values for {bins} bins")]
    InsufficientData {
        key: String,
        available: usize,
        bins: usize,
    },

    #[error("Match source '{path}' unavailable: {reason}")]
    SourceUnavailable { path: PathBuf, reason: String },

    #[error("Invalid measurement for source {source_index}: {reason}")]
    InvalidMeasurement { source_index: usize, reason: String },

    #[error("Failed to grow buffer '{buffer}' to {requested} elements")]
    BufferGrowthFailure { buffer: String, requested: usize },

    #[error("Finalized output '{path}' already exists")]
    OutputAlreadyExists { path: PathBuf },

    #[error("No checkpoint found at '{path}'")]
    CheckpointMissing { path: PathBuf },

    #[error("Malformed array file '{path}': {reason}")]
    InvalidArrayFile { path: PathBuf, reason: String },

    #[error("Failed to create directory '{path}': {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write '{path}': {source}")]
    WriteArray {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read '{path}': {source}")]
    ReadArray {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to publish '{path}': {source}")]
    Publish {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StackError {
    /// Only a single pair's measurement failure lets the run continue.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StackError::InvalidMeasurement { .. })
    }

    pub(crate) fn source_unavailable(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        StackError::SourceUnavailable {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_measurement(source_index: usize, reason: impl Into<String>) -> Self {
        StackError::InvalidMeasurement {
            source_index,
            reason: reason.into(),
        }
    }
}

pub type StackResult<T> = Result<T, StackError>;
