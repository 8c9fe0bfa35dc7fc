//! Error taxonomy for the pipeline
//!
//! Data-quality rejections (micro gaps, jitter, self-loops) are not errors and
//! never appear here; they are counted and dropped.

use crate::domain::types::CorridorId;
use thiserror::Error;

/// A malformed fix. Rejects the whole batch before any state is touched.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("fix {index}: latitude {value} outside [-90, 90]")]
    LatitudeOutOfRange { index: usize, value: f64 },

    #[error("fix {index}: longitude {value} outside [-180, 180]")]
    LongitudeOutOfRange { index: usize, value: f64 },

    #[error("fix {index}: coordinate is not a finite number")]
    NonFiniteCoordinate { index: usize },

    #[error("fix {index}: unparsable timestamp {value:?}")]
    InvalidTimestamp { index: usize, value: String },

    #[error("fix {index}: empty vehicle id")]
    EmptyVehicleId { index: usize },

    #[error("malformed batch: {0}")]
    MalformedBatch(String),
}

/// Optimistic write rejected by the corridor repository
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("version conflict: expected {expected:?}, found {actual:?}")]
    Conflict { expected: Option<u64>, actual: Option<u64> },
}

/// Failure surfaced to the ingestion caller
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Retry budget exhausted; the traversal may be redelivered safely
    #[error("corridor {corridor}: write not applied after {attempts} attempts")]
    Transient { corridor: CorridorId, attempts: u32 },
}
