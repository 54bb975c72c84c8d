// File: testing-framework/src/utilities/mod.rs
//
// Scenario reporting utilities

/// JSON artifacts of scenario runs
pub mod artifacts;

/// Boxed text summaries
pub mod summary;

pub use artifacts::{ArtifactMetadata, ScenarioArtifact};
pub use summary::{print_result_summary, render_result_summary, render_run_summary};
