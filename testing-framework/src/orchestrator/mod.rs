// File: testing-framework/src/orchestrator/mod.rs
//
// Orchestrator Module
//
// Timing and parallelism primitives shared by provisioning and the scenario
// runner: the injectable clock and the spawn/join task group.

/// Clock abstraction for scenario waits
pub mod clock;
/// Spawn-then-join task group for parallel phases
pub mod task_group;

pub use clock::{Clock, PausedClock, SystemClock};
pub use task_group::{PhaseFailure, TaskFailure, TaskGroup};
