use super::{ProgressMetric, ProgressSignal, parse_line};

/// Per-job progress normalizer.
///
/// Turns elapsed metrics into a fraction of the job's reference total. Elapsed
/// values lower than the best one already seen are dropped, so duplicate or
/// out-of-order lines and restarted encoders never move progress backwards.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    metric: ProgressMetric,
    reference: Option<f64>,
    elapsed: f64,
}

impl ProgressTracker {
    pub fn new(metric: ProgressMetric, reference: Option<f64>) -> Self {
        let reference = reference.filter(|total| total.is_finite() && *total > 0.0);
        Self {
            metric,
            reference,
            elapsed: 0.0,
        }
    }

    /// Current fraction in [0, 1], `None` when progress is indeterminate
    pub fn fraction(&self) -> Option<f64> {
        self.reference
            .map(|total| (self.elapsed / total).clamp(0.0, 1.0))
    }

    /// Record a new elapsed metric; returns true when it advanced progress
    pub fn advance(&mut self, elapsed: f64) -> bool {
        if !elapsed.is_finite() || elapsed <= self.elapsed {
            return false;
        }
        self.elapsed = elapsed;
        true
    }

    /// Feed one raw output line; returns true when progress advanced
    pub fn observe_line(&mut self, line: &str) -> bool {
        match parse_line(line, self.metric) {
            Some(ProgressSignal::Elapsed(elapsed)) => self.advance(elapsed),
            // Completion is decided by the exit status
            Some(ProgressSignal::End) | None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fraction_is_clamped() {
        let mut tracker = ProgressTracker::new(ProgressMetric::Time, Some(10.0));
        assert_eq!(tracker.fraction(), Some(0.0));
        assert!(tracker.observe_line("out_time_us=5000000"));
        assert_eq!(tracker.fraction(), Some(0.5));
        assert!(tracker.observe_line("out_time_us=12000000"));
        assert_eq!(tracker.fraction(), Some(1.0));
    }

    #[test]
    fn test_out_of_order_lines_are_ignored() {
        let mut tracker = ProgressTracker::new(ProgressMetric::Time, Some(10.0));
        assert!(tracker.observe_line("out_time_us=4000000"));
        assert!(!tracker.observe_line("out_time_us=3000000"));
        assert!(!tracker.observe_line("out_time_ms=4000000"));
        assert_eq!(tracker.fraction(), Some(0.4));
        assert!(tracker.observe_line("out_time_us=5000000"));
        assert_eq!(tracker.fraction(), Some(0.5));
    }

    #[test]
    fn test_unknown_reference_never_divides() {
        for reference in [None, Some(0.0), Some(-3.0), Some(f64::NAN)] {
            let mut tracker = ProgressTracker::new(ProgressMetric::Size, reference);
            assert!(tracker.observe_line("total_size=4096"));
            assert_eq!(tracker.fraction(), None);
            assert!(!tracker.observe_line("total_size=1024"));
        }
    }

    #[test]
    fn test_end_sentinel_does_not_complete_progress() {
        let mut tracker = ProgressTracker::new(ProgressMetric::Time, Some(10.0));
        assert!(tracker.observe_line("out_time_us=3000000"));
        assert!(!tracker.observe_line("progress=end"));
        assert_eq!(tracker.fraction(), Some(0.3));
    }
}
