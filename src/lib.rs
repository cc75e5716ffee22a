//! retempo - batch media transcoding engine
//!
//! Runs an external encoder over many files with a bounded worker pool,
//! per-job pause/resume/cancel, destination conflict policies and weighted
//! progress reporting.

pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod job;
pub mod media;
pub mod overwrite;
pub mod process;
pub mod progress;
pub mod report;
pub mod scan;
pub mod scheduler;
