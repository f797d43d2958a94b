//! Batch spike sorting: one cached, concurrently scheduled pipeline run per
//! recording unit.

pub mod app;
pub mod autotune;
pub mod cache;
pub mod config;
pub mod error;
pub mod fs_scan;
pub mod hw;
pub mod logging;
pub mod pipeline;
pub mod scheduler;
pub mod snapshot;
pub mod stage_runner;
pub mod types;
pub mod workspace;

pub use error::{JobError, StageStatus};
pub use scheduler::{JobQueue, UnitRunner};
pub use types::{BatchReport, Job, JobResult};
