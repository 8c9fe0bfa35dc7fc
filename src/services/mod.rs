//! Services - pipeline stages and shared corridor state
//!
//! - `stats` - median and percentile
//! - `drop_detector` - classifies inter-fix gaps of one trip
//! - `corridor_resolver` - maps transit gaps to corridors and traversals
//! - `corridor_repository` - versioned corridor storage boundary
//! - `baseline_store` - hour-of-day baselines with per-corridor serialization
//! - `alert_repository` - unresolved-alert uniqueness boundary
//! - `alert_engine` - delay/overspeed checks, dedupe, publish
//! - `trip_segmenter` - per-vehicle trips by inactivity
//! - `ingest` - batch coordinator driving the stages in order
//! - `lane_worker` - parallel ingest lanes keyed by vehicle

pub mod alert_engine;
pub mod alert_repository;
pub mod baseline_store;
pub mod corridor_repository;
pub mod corridor_resolver;
pub mod drop_detector;
pub mod ingest;
pub mod lane_worker;
pub mod stats;
pub mod trip_segmenter;

// Re-export commonly used types
pub use alert_engine::{AlertEngine, AlertPublisher};
pub use alert_repository::{AlertRepository, MemoryAlertRepository};
pub use baseline_store::BaselineStore;
pub use corridor_repository::{CorridorRepository, MemoryCorridorRepository};
pub use ingest::{IngestCoordinator, IngestReport, TripReport};
pub use lane_worker::{create_lanes, LaneRouter, LaneWorker};
