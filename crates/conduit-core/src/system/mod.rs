//! System resource monitoring.

mod resources;

pub use resources::{ResourceSample, ResourceTracker};
