//! Transfer engine - segmented, resumable retrieval
//!
//! - Range probing and segment planning
//! - Per-segment streaming workers with positioned writes
//! - Sliding-window throughput metering and per-segment throttling
//! - Cooperative pause/cancel through the store and cancellation tokens

mod meter;
mod orchestrator;
mod ordering;
mod planner;
mod probe;
mod registry;
mod segment_worker;
mod throttle;

pub use meter::*;
pub use orchestrator::*;
pub use ordering::*;
pub use planner::*;
pub use probe::*;
pub use registry::*;
pub use segment_worker::*;
pub use throttle::*;
