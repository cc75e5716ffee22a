// Progress reporting pipeline
//
// - Parser: pure translation of encoder progress lines into elapsed metrics
// - Tracker: per-job normalization into a monotonic fraction
// - Aggregator: weighted batch progress and throttled publication

pub mod aggregator;
pub mod parser;
pub mod tracker;

use serde::{Deserialize, Serialize};

pub use aggregator::*;
pub use parser::*;
pub use tracker::*;

/// Unit in which a job's progress is measured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressMetric {
    /// Seconds of output produced
    Time,
    /// Bytes of output written
    Size,
}
