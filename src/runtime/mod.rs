//! Execution context assignment.

pub mod lanes;

pub use lanes::LanePool;
