//! Scheduled message repeaters.

pub mod model;
pub mod registry;
pub mod runner;
pub mod schedule;
pub mod store;

pub use model::{NewRepeater, Repeater};
pub use registry::{RepeaterInfo, RepeaterRegistry};
pub use runner::{FireOutcome, RunnerDeps};
