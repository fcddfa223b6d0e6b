//! Histogram aggregation and percentile reporting over job metrics.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{select, tick, Receiver};
use serde::Serialize;
use tracing::info;

use crate::metrics::JobMetrics;
use crate::telemetry;

/// Fixed bucket ladder for stage latencies: 100 ms steps below one second,
/// widening up to the 210 s ceiling.
pub const BUCKET_BOUNDS: [Duration; 58] = [
    Duration::from_millis(100),
    Duration::from_millis(200),
    Duration::from_millis(300),
    Duration::from_millis(400),
    Duration::from_millis(500),
    Duration::from_millis(600),
    Duration::from_millis(700),
    Duration::from_millis(800),
    Duration::from_millis(900),
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(3),
    Duration::from_secs(4),
    Duration::from_secs(5),
    Duration::from_secs(6),
    Duration::from_secs(7),
    Duration::from_secs(8),
    Duration::from_secs(9),
    Duration::from_secs(10),
    Duration::from_secs(12),
    Duration::from_secs(14),
    Duration::from_secs(16),
    Duration::from_secs(18),
    Duration::from_secs(20),
    Duration::from_secs(22),
    Duration::from_secs(24),
    Duration::from_secs(26),
    Duration::from_secs(28),
    Duration::from_secs(30),
    Duration::from_secs(32),
    Duration::from_secs(35),
    Duration::from_secs(37),
    Duration::from_secs(40),
    Duration::from_secs(42),
    Duration::from_secs(45),
    Duration::from_secs(47),
    Duration::from_secs(50),
    Duration::from_secs(55),
    Duration::from_secs(60),
    Duration::from_secs(65),
    Duration::from_secs(70),
    Duration::from_secs(75),
    Duration::from_secs(80),
    Duration::from_secs(85),
    Duration::from_secs(90),
    Duration::from_secs(95),
    Duration::from_secs(100),
    Duration::from_secs(110),
    Duration::from_secs(120),
    Duration::from_secs(130),
    Duration::from_secs(140),
    Duration::from_secs(150),
    Duration::from_secs(160),
    Duration::from_secs(170),
    Duration::from_secs(180),
    Duration::from_secs(190),
    Duration::from_secs(200),
    Duration::from_secs(210),
];

/// Greatest bucket bound not exceeding `duration`, clipped to the ladder:
/// durations below the first bound land in the first bucket, durations past
/// the ceiling in the last.
pub fn bucket(duration: Duration) -> Duration {
    BUCKET_BOUNDS
        .iter()
        .rev()
        .find(|bound| **bound <= duration)
        .copied()
        .unwrap_or(BUCKET_BOUNDS[0])
}

/// Value pair split by job outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeSplit<T> {
    pub success: T,
    pub error: T,
}

type StageHistograms = BTreeMap<String, BTreeMap<Duration, u64>>;

#[derive(Default)]
struct AggregateState {
    processed: OutcomeSplit<u64>,
    time_processing: OutcomeSplit<Duration>,
    stages: OutcomeSplit<StageHistograms>,
}

/// Point-in-time percentile summary for one stage, in milliseconds.
#[derive(Debug, Serialize)]
pub struct StageSummary {
    pub stage: String,
    pub p50_ms: OutcomeSplit<u128>,
    pub p95_ms: OutcomeSplit<u128>,
    pub p99_ms: OutcomeSplit<u128>,
}

/// Snapshot of the aggregator served by the diagnostics endpoint.
#[derive(Debug, Serialize)]
pub struct AggregateSummary {
    pub processed: OutcomeSplit<u64>,
    pub time_processing_s: OutcomeSplit<f64>,
    pub stages: Vec<StageSummary>,
}

/// Thread-safe histogram aggregation over streams of [`JobMetrics`].
#[derive(Default)]
pub struct MetricsAggregator {
    state: RwLock<AggregateState>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest a batch of job metrics. Entries that were never stopped are
    /// force-stopped first, keeping their success flag.
    pub fn add_metrics(&self, batch: Vec<JobMetrics>) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        for mut job in batch {
            job.finish_if_running();

            let total = job.total();
            let mut entries = job.entries();
            entries.push(("total".to_string(), total));

            let stages = if job.success() {
                state.processed.success += 1;
                state.time_processing.success += total;
                &mut state.stages.success
            } else {
                state.processed.error += 1;
                state.time_processing.error += total;
                &mut state.stages.error
            };

            for (label, duration) in entries {
                let histogram = stages.entry(label).or_insert_with(zeroed_histogram);
                *histogram.entry(bucket(duration)).or_insert(0) += 1;
            }
        }
    }

    /// Per-outcome `p`-th percentile for one stage. Stages or outcomes with
    /// no samples report zero.
    pub fn percentile(&self, stage: &str, p: u8) -> OutcomeSplit<Duration> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        OutcomeSplit {
            success: percentile_of(state.stages.success.get(stage), p),
            error: percentile_of(state.stages.error.get(stage), p),
        }
    }

    /// Log P10/P25/P50/P75/P95/P99 for every known stage plus the global
    /// outcome counters.
    pub fn print_percentiles(&self) {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let stages = known_stages(&state);

        for p in [10u8, 25, 50, 75, 95, 99] {
            for stage in &stages {
                let success = percentile_of(state.stages.success.get(stage), p);
                let error = percentile_of(state.stages.error.get(stage), p);
                info!("{stage} P{p} success: {success:?} err: {error:?}");
            }
        }

        info!("processed snapshots success: {}", state.processed.success);
        info!(
            "time processing success: {:.2}s",
            state.time_processing.success.as_secs_f64()
        );
        if state.processed.success > 0 {
            info!(
                "avg time processing success: {:.2}s",
                state.time_processing.success.as_secs_f64() / state.processed.success as f64
            );
        }
        info!("processed snapshots err: {}", state.processed.error);
        info!(
            "time processing err: {:.2}s",
            state.time_processing.error.as_secs_f64()
        );
        if state.processed.error > 0 {
            info!(
                "avg time processing err: {:.2}s",
                state.time_processing.error.as_secs_f64() / state.processed.error as f64
            );
        }
    }

    /// Snapshot for the diagnostics endpoint.
    pub fn summary(&self) -> AggregateSummary {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let stages = known_stages(&state)
            .into_iter()
            .map(|stage| {
                let split = |p: u8| OutcomeSplit {
                    success: percentile_of(state.stages.success.get(&stage), p).as_millis(),
                    error: percentile_of(state.stages.error.get(&stage), p).as_millis(),
                };
                StageSummary {
                    p50_ms: split(50),
                    p95_ms: split(95),
                    p99_ms: split(99),
                    stage,
                }
            })
            .collect();

        AggregateSummary {
            processed: state.processed,
            time_processing_s: OutcomeSplit {
                success: state.time_processing.success.as_secs_f64(),
                error: state.time_processing.error.as_secs_f64(),
            },
            stages,
        }
    }
}

fn zeroed_histogram() -> BTreeMap<Duration, u64> {
    BUCKET_BOUNDS.iter().map(|bound| (*bound, 0)).collect()
}

fn known_stages(state: &AggregateState) -> Vec<String> {
    let mut stages: Vec<String> = state.stages.success.keys().cloned().collect();
    for stage in state.stages.error.keys() {
        if !stages.contains(stage) {
            stages.push(stage.clone());
        }
    }
    stages.sort();
    stages
}

/// Percentile with linear interpolation between bucket bounds.
///
/// `q = (p/100) * (N-1) + 1`; the walk stops at the first bucket whose
/// cumulative count exceeds `floor(q)`. When no bucket does (the p=100
/// boundary) the last nonempty bucket bound is returned.
fn percentile_of(histogram: Option<&BTreeMap<Duration, u64>>, p: u8) -> Duration {
    let Some(histogram) = histogram else {
        return Duration::ZERO;
    };
    let n: u64 = histogram.values().sum();
    if n == 0 {
        return Duration::ZERO;
    }

    let q = (p as f64 / 100.0) * ((n - 1) as f64) + 1.0;
    let q_floor = q.floor();
    let q_frac = q - q_floor;

    let bounds: Vec<Duration> = histogram.keys().copied().collect();
    let mut cumulative = 0u64;
    for (index, bound) in bounds.iter().enumerate() {
        cumulative += histogram[bound];
        if (cumulative as f64) > q_floor {
            let low = *bound;
            let high = if (cumulative as f64) - q_floor <= q_frac {
                bounds.get(index + 1).copied().unwrap_or(low)
            } else {
                low
            };
            let interpolated = q_frac * high.saturating_sub(low).as_secs_f64();
            return low + Duration::from_secs_f64(interpolated);
        }
    }

    bounds
        .iter()
        .rev()
        .find(|bound| histogram[*bound] > 0)
        .copied()
        .unwrap_or(Duration::ZERO)
}

/// Drain the worker pool's metrics sink: batch in memory, flush to the
/// aggregator and print percentiles once per `flush_interval`, and flush a
/// final time when the sink closes.
pub fn spawn_metrics_drain(
    aggregator: Arc<MetricsAggregator>,
    sink: Receiver<JobMetrics>,
    flush_interval: Duration,
) -> JoinHandle<()> {
    telemetry::spawn_thread("metrics-drain", move || {
        let ticker = tick(flush_interval);
        let mut pending: Vec<JobMetrics> = Vec::new();

        loop {
            select! {
                recv(sink) -> message => match message {
                    Ok(metrics) => pending.push(metrics),
                    Err(_) => break,
                },
                recv(ticker) -> _ => {
                    if !pending.is_empty() {
                        aggregator.add_metrics(std::mem::take(&mut pending));
                    }
                    aggregator.print_percentiles();
                }
            }
        }

        if !pending.is_empty() {
            aggregator.add_metrics(std::mem::take(&mut pending));
        }
        aggregator.print_percentiles();
        info!("metrics drain flushed all pending job metrics; exiting");
    })
    .expect("failed to spawn metrics drain thread")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn bucket_is_greatest_bound_not_exceeding_duration() {
        assert_eq!(bucket(Duration::ZERO), ms(100));
        assert_eq!(bucket(ms(99)), ms(100));
        assert_eq!(bucket(ms(100)), ms(100));
        assert_eq!(bucket(ms(150)), ms(100));
        assert_eq!(bucket(ms(200)), ms(200));
        assert_eq!(bucket(Duration::from_secs(11)), Duration::from_secs(10));
        assert_eq!(bucket(Duration::from_secs(500)), Duration::from_secs(210));
    }

    #[test]
    fn bucket_is_monotonic() {
        let mut previous = bucket(Duration::ZERO);
        for step in 0..2_200 {
            let current = bucket(ms(step * 100));
            assert!(current >= previous);
            previous = current;
        }
    }

    #[test]
    fn percentile_of_synthetic_stage_counts() {
        let aggregator = MetricsAggregator::new();
        let mut batch = Vec::new();
        for bound_ms in [100u64, 200, 300] {
            for _ in 0..10 {
                batch.push(JobMetrics::synthetic(&[("grab", ms(bound_ms))], true));
            }
        }
        aggregator.add_metrics(batch);

        let p50 = aggregator.percentile("init__grab", 50).success;
        assert!((ms(200)..=ms(300)).contains(&p50), "p50 was {p50:?}");

        let p100 = aggregator.percentile("init__grab", 100).success;
        assert_eq!(p100, ms(300), "p100 must hit the last nonempty bucket");

        let empty = aggregator.percentile("init__grab", 50).error;
        assert_eq!(empty, Duration::ZERO);
    }

    #[test]
    fn uniform_totals_put_p50_near_the_middle() {
        let aggregator = MetricsAggregator::new();
        let batch: Vec<JobMetrics> = (0..1_000)
            .map(|index| JobMetrics::synthetic(&[("grab", ms(index * 10))], true))
            .collect();
        aggregator.add_metrics(batch);

        let p50 = aggregator.percentile("total", 50).success;
        assert!(
            (Duration::from_secs(4)..=Duration::from_secs(6)).contains(&p50),
            "p50 {p50:?} should be within one bucket of 5s"
        );
    }

    #[test]
    fn unstopped_jobs_are_force_stopped_as_errors() {
        let aggregator = MetricsAggregator::new();
        let mut job = JobMetrics::new();
        job.add("setup");
        assert!(job.is_running());

        aggregator.add_metrics(vec![job]);
        let summary = aggregator.summary();
        assert_eq!(summary.processed.error, 1);
        assert_eq!(summary.processed.success, 0);
    }

    #[test]
    fn outcomes_are_counted_separately() {
        let aggregator = MetricsAggregator::new();
        aggregator.add_metrics(vec![
            JobMetrics::synthetic(&[("grab", ms(100))], true),
            JobMetrics::synthetic(&[("grab", ms(300))], false),
        ]);

        let summary = aggregator.summary();
        assert_eq!(summary.processed, OutcomeSplit { success: 1, error: 1 });
        assert!(summary.stages.iter().any(|stage| stage.stage == "total"));
    }
}
