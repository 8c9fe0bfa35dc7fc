//! Domain models - core data types and error taxonomy
//!
//! This module contains the canonical data types used throughout the system:
//! - `Fix` - one validated position sample
//! - `Trip` - a vehicle's run of fixes bounded by inactivity
//! - `GapEvent` - a classified drop between two fixes
//! - `CorridorKey` / `Traversal` / `CorridorBaseline` - corridor learning
//! - `Alert` - delay and overspeed decisions

pub mod error;
pub mod types;

pub use error::{PipelineError, StoreError, ValidationError};
