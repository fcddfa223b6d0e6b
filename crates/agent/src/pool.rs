//! Bounded worker pool consuming activations from the job queue.
//!
//! The pool owns the queue; the scheduler only holds a write handle. Exactly
//! `W` long-lived workers run jobs to completion and publish their metrics
//! into the sink. Stop ordering is load-bearing: cancel first, then close
//! the dispatcher so workers see EOF, await the workers, and only then close
//! the metrics sink so no metrics are dropped.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use thiserror::Error;
use tracing::{error, warn};

use crate::metrics::JobMetrics;
use crate::scheduler::Activation;
use crate::telemetry;

/// Snapshot job executed by each worker: returns the stage metrics and the
/// job outcome. The metrics are published either way.
pub type Job = Arc<dyn Fn(&Activation) -> (JobMetrics, anyhow::Result<()>) + Send + Sync>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool already consuming")]
    AlreadyConsuming,
}

struct PoolStop {
    // Workers observe cancellation as this sender being dropped.
    _cancel: Sender<()>,
    cancelled: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

/// Fixed-size worker pool over the bounded activation queue.
pub struct WorkerPool {
    queue_tx: Mutex<Option<Sender<Activation>>>,
    queue_rx: Receiver<Activation>,
    metrics_tx: Mutex<Option<Sender<JobMetrics>>>,
    consuming: AtomicBool,
    stop: Mutex<Option<PoolStop>>,
}

impl WorkerPool {
    /// Create the pool and its activation queue. Returns the receive side of
    /// the metrics sink for the drain task.
    pub fn new(queue_capacity: usize) -> (Self, Receiver<JobMetrics>) {
        let (queue_tx, queue_rx) = bounded(queue_capacity);
        let (metrics_tx, metrics_rx) = unbounded();
        (
            Self {
                queue_tx: Mutex::new(Some(queue_tx)),
                queue_rx,
                metrics_tx: Mutex::new(Some(metrics_tx)),
                consuming: AtomicBool::new(false),
                stop: Mutex::new(None),
            },
            metrics_rx,
        )
    }

    /// Write handle to the activation queue for the scheduler.
    pub fn sender(&self) -> Sender<Activation> {
        self.queue_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .expect("worker pool queue already closed")
            .clone()
    }

    /// Spawn exactly `workers` long-lived worker threads.
    pub fn start(&self, workers: usize, job: Job) -> Result<(), PoolError> {
        if self
            .consuming
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(PoolError::AlreadyConsuming);
        }

        let (cancel_tx, cancel_rx) = bounded::<()>(0);
        let cancelled = Arc::new(AtomicBool::new(false));
        let metrics_tx = self
            .metrics_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .expect("worker pool metrics sink already closed")
            .clone();

        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let queue = self.queue_rx.clone();
            let cancel = cancel_rx.clone();
            let cancelled = Arc::clone(&cancelled);
            let metrics_tx = metrics_tx.clone();
            let job = Arc::clone(&job);

            let handle = telemetry::spawn_thread(format!("snapshot-worker-{index}"), move || {
                worker_loop(index, &queue, &cancel, &cancelled, &metrics_tx, &job);
            })
            .expect("failed to spawn snapshot worker thread");
            handles.push(handle);
        }

        let mut stop = self.stop.lock().unwrap_or_else(PoisonError::into_inner);
        *stop = Some(PoolStop {
            _cancel: cancel_tx,
            cancelled,
            workers: handles,
        });
        Ok(())
    }

    /// Cooperative shutdown: cancel, close the dispatcher, await workers,
    /// close the metrics sink.
    pub fn stop(&self) {
        let handle = {
            let mut stop = self.stop.lock().unwrap_or_else(PoisonError::into_inner);
            stop.take()
        };

        if let Some(handle) = handle {
            handle.cancelled.store(true, Ordering::SeqCst);
            drop(handle._cancel);

            let mut queue_tx = self.queue_tx.lock().unwrap_or_else(PoisonError::into_inner);
            drop(queue_tx.take());
            drop(queue_tx);

            for worker in handle.workers {
                let _ = worker.join();
            }
        }

        let mut metrics_tx = self
            .metrics_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        drop(metrics_tx.take());

        self.consuming.store(false, Ordering::SeqCst);
    }
}

fn worker_loop(
    index: usize,
    queue: &Receiver<Activation>,
    cancel: &Receiver<()>,
    cancelled: &AtomicBool,
    metrics_tx: &Sender<JobMetrics>,
    job: &Job,
) {
    loop {
        // Finish the current job on cancellation, but never pick up another.
        if cancelled.load(Ordering::SeqCst) {
            return;
        }

        let activation = select! {
            recv(cancel) -> _ => return,
            recv(queue) -> message => match message {
                Ok(activation) => activation,
                Err(_) => return,
            }
        };

        metrics::gauge!("snap_agent_queue_depth").set(queue.len() as f64);

        match catch_unwind(AssertUnwindSafe(|| job(&activation))) {
            Ok((job_metrics, outcome)) => {
                let camera_id = activation.camera.id.as_str();
                match outcome {
                    Ok(()) => {
                        metrics::counter!("snap_agent_jobs_total", "outcome" => "success")
                            .increment(1);
                    }
                    Err(err) => {
                        metrics::counter!("snap_agent_jobs_total", "outcome" => "error")
                            .increment(1);
                        warn!(camera = camera_id, "snapshot job failed: {err:#}");
                    }
                }
                let _ = metrics_tx.send(job_metrics);
            }
            Err(panic) => {
                error!(
                    worker = index,
                    camera = activation.camera.id.as_str(),
                    "snapshot job panicked: {}; worker exiting",
                    panic_message(&panic)
                );
                return;
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roster::camera;
    use chrono::Utc;
    use std::time::Duration;

    fn activation(id: &str) -> Activation {
        Activation {
            camera: camera(id, 10),
            scheduled_at: Utc::now(),
        }
    }

    fn job_with(success: bool, delay: Duration) -> Job {
        Arc::new(move |_activation| {
            let mut metrics = JobMetrics::new();
            std::thread::sleep(delay);
            metrics.add("work");
            metrics.stop(success);
            let outcome = if success {
                Ok(())
            } else {
                Err(anyhow::anyhow!("camera unreachable"))
            };
            (metrics, outcome)
        })
    }

    #[test]
    fn runs_jobs_and_publishes_metrics_for_both_outcomes() {
        let (pool, metrics_rx) = WorkerPool::new(4);
        let flag = Arc::new(AtomicBool::new(true));
        let toggler = Arc::clone(&flag);
        let job: Job = Arc::new(move |_| {
            let mut metrics = JobMetrics::new();
            let success = toggler.swap(false, Ordering::SeqCst);
            metrics.stop(success);
            let outcome = if success {
                Ok(())
            } else {
                Err(anyhow::anyhow!("boom"))
            };
            (metrics, outcome)
        });

        pool.start(2, job).expect("pool starts");
        let sender = pool.sender();
        sender.send(activation("a")).unwrap();
        sender.send(activation("b")).unwrap();
        drop(sender);

        let mut outcomes: Vec<bool> = (0..2)
            .map(|_| {
                metrics_rx
                    .recv_timeout(Duration::from_secs(1))
                    .expect("metrics for every job")
                    .success()
            })
            .collect();
        outcomes.sort();
        assert_eq!(outcomes, vec![false, true], "failed jobs still publish");

        pool.stop();
    }

    #[test]
    fn second_start_is_rejected() {
        let (pool, _metrics_rx) = WorkerPool::new(1);
        pool.start(1, job_with(true, Duration::ZERO)).unwrap();
        assert!(matches!(
            pool.start(1, job_with(true, Duration::ZERO)),
            Err(PoolError::AlreadyConsuming)
        ));
        pool.stop();
    }

    #[test]
    fn stop_closes_the_metrics_sink_after_workers_quiesce() {
        let (pool, metrics_rx) = WorkerPool::new(2);
        pool.start(1, job_with(true, Duration::from_millis(20)))
            .unwrap();

        let sender = pool.sender();
        sender.send(activation("a")).unwrap();
        drop(sender);

        // Give the worker time to pick the job up, then stop mid-flight.
        std::thread::sleep(Duration::from_millis(5));
        pool.stop();
        let first = metrics_rx.recv_timeout(Duration::from_millis(500));
        assert!(first.is_ok(), "in-flight metrics must not be dropped");
        assert!(
            metrics_rx.recv_timeout(Duration::from_millis(100)).is_err(),
            "sink must be closed after stop"
        );
    }

    #[test]
    fn single_worker_applies_backpressure_without_drops() {
        let (pool, metrics_rx) = WorkerPool::new(1);
        pool.start(1, job_with(true, Duration::from_millis(10)))
            .unwrap();

        let sender = pool.sender();
        let feeder = std::thread::spawn(move || {
            for index in 0..10 {
                sender.send(activation(&format!("cam-{index}"))).unwrap();
            }
        });

        let received = (0..10)
            .filter(|_| metrics_rx.recv_timeout(Duration::from_secs(2)).is_ok())
            .count();
        assert_eq!(received, 10, "every activation is processed exactly once");

        feeder.join().unwrap();
        pool.stop();
    }

    #[test]
    fn panicking_job_is_contained_at_the_worker_boundary() {
        let (pool, metrics_rx) = WorkerPool::new(2);
        let job: Job = Arc::new(|activation| {
            if activation.camera.id == "bad" {
                panic!("decoder blew up");
            }
            let mut metrics = JobMetrics::new();
            metrics.stop(true);
            (metrics, Ok(()))
        });

        pool.start(2, job).unwrap();
        let sender = pool.sender();
        sender.send(activation("bad")).unwrap();
        sender.send(activation("good")).unwrap();
        drop(sender);

        // The surviving worker still drains the queue.
        assert!(metrics_rx.recv_timeout(Duration::from_secs(1)).is_ok());
        pool.stop();
    }
}
