//! Per-job stage timing collector.
//!
//! A [`JobMetrics`] records a monotonic timestamp per stage label. Derived
//! entries are keyed `previous__current`; the label sequence is part of the
//! public metric contract consumed by the aggregator.

use std::time::{Duration, Instant};

/// Stage timings for one snapshot job.
#[derive(Debug, Clone)]
pub struct JobMetrics {
    points: Vec<(String, Instant)>,
    success: bool,
    running: bool,
}

impl JobMetrics {
    /// Start a collector; the clock begins at the reserved `init` label.
    pub fn new() -> Self {
        Self {
            points: vec![("init".to_string(), Instant::now())],
            success: false,
            running: true,
        }
    }

    /// Record the end of a stage. Ignored once the collector is stopped.
    pub fn add(&mut self, label: &str) {
        if !self.running {
            return;
        }
        self.points.push((label.to_string(), Instant::now()));
    }

    /// Record the terminal `final` stage, freeze the total, and set the
    /// success flag. Idempotent: later calls change nothing.
    pub fn stop(&mut self, success: bool) {
        if !self.running {
            return;
        }
        self.points.push(("final".to_string(), Instant::now()));
        self.success = success;
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn success(&self) -> bool {
        self.success
    }

    /// Stop with the current success flag if the job never stopped itself.
    pub(crate) fn finish_if_running(&mut self) {
        if self.running {
            let success = self.success;
            self.stop(success);
        }
    }

    /// Inter-stage entries in chronological order, keyed `previous__current`.
    pub fn entries(&self) -> Vec<(String, Duration)> {
        self.points
            .windows(2)
            .map(|pair| {
                let (previous_label, previous_at) = &pair[0];
                let (current_label, current_at) = &pair[1];
                (
                    format!("{previous_label}__{current_label}"),
                    current_at.duration_since(*previous_at),
                )
            })
            .collect()
    }

    /// Wall time between the first and last recorded stage.
    pub fn total(&self) -> Duration {
        match (self.points.first(), self.points.last()) {
            (Some((_, first)), Some((_, last))) => last.duration_since(*first),
            _ => Duration::ZERO,
        }
    }

    /// Build a collector with fabricated stage durations.
    #[cfg(test)]
    pub(crate) fn synthetic(stages: &[(&str, Duration)], success: bool) -> Self {
        let mut at = Instant::now();
        let mut points = vec![("init".to_string(), at)];
        for (label, duration) in stages {
            at += *duration;
            points.push((label.to_string(), at));
        }
        Self {
            points,
            success,
            running: false,
        }
    }
}

impl Default for JobMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_follow_add_order() {
        let mut metrics = JobMetrics::new();
        metrics.add("setup");
        metrics.add("start");
        metrics.stop(true);

        let labels: Vec<String> = metrics.entries().into_iter().map(|(label, _)| label).collect();
        assert_eq!(labels, vec!["init__setup", "setup__start", "start__final"]);
        assert!(metrics.success());
        assert!(!metrics.is_running());
    }

    #[test]
    fn durations_are_non_negative_and_total_spans_all_stages() {
        let metrics = JobMetrics::synthetic(
            &[
                ("setup", Duration::from_millis(10)),
                ("final", Duration::from_millis(40)),
            ],
            true,
        );

        for (_, duration) in metrics.entries() {
            assert!(duration >= Duration::ZERO);
        }
        assert_eq!(metrics.total(), Duration::from_millis(50));
    }

    #[test]
    fn stop_is_idempotent() {
        let mut metrics = JobMetrics::new();
        metrics.add("setup");
        metrics.stop(false);

        let frozen = metrics.entries().len();
        metrics.stop(true);
        metrics.add("late");

        assert_eq!(metrics.entries().len(), frozen);
        assert!(!metrics.success(), "second stop must not flip the outcome");
    }
}
