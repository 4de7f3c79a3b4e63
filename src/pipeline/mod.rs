// src/pipeline/mod.rs
pub mod batches;
pub mod coordinator;

pub use batches::{merge, split, MergeOutcome};
pub use coordinator::{BulkCoordinator, CoordinatorConfig, DivisionStrategy, RunReport, RunStats};
