//! Incremental rebuild analysis.
//!
//! Compares the current input digest with the build state of the last
//! successful build and partitions the graph into steps to execute and
//! steps whose previous outputs can be reused.

mod analyzer;
mod state;

pub use analyzer::{RebuildAnalyzer, RebuildPlan};
pub use state::{BuildRecord, BuildState, InputDigest, MAX_HISTORY};
