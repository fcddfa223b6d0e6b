//! Per-interval activation producers feeding the bounded work queue.
//!
//! One producer thread runs per distinct refresh interval. Each cycle it
//! copies its bucket out of the roster, emits one activation per camera in
//! roster order (blocking on queue backpressure), then waits for whichever
//! of cancellation or the interval tick fires first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, select, tick, Receiver, Sender, TryRecvError};
use thiserror::Error;
use tracing::debug;

use crate::roster::{CameraDescriptor, Roster};
use crate::telemetry;

/// A scheduled intent to snapshot one camera.
#[derive(Debug, Clone)]
pub struct Activation {
    pub camera: CameraDescriptor,
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler already started")]
    AlreadyStarted,
}

struct StopHandle {
    // Producers observe cancellation as this sender being dropped.
    _cancel: Sender<()>,
    producers: Vec<JoinHandle<()>>,
}

/// Fans the roster into the activation queue, one producer per interval.
pub struct Scheduler {
    roster: Arc<Roster>,
    queue: Sender<Activation>,
    started: AtomicBool,
    stop: Mutex<Option<StopHandle>>,
}

impl Scheduler {
    pub fn new(roster: Arc<Roster>, queue: Sender<Activation>) -> Self {
        Self {
            roster,
            queue,
            started: AtomicBool::new(false),
            stop: Mutex::new(None),
        }
    }

    /// Spawn one producer per distinct interval currently in the roster.
    pub fn start(&self) -> Result<(), SchedulerError> {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SchedulerError::AlreadyStarted);
        }

        let (cancel_tx, cancel_rx) = bounded::<()>(0);
        let intervals = self.roster.intervals();
        let mut producers = Vec::with_capacity(intervals.len());

        for interval_s in intervals {
            let roster = Arc::clone(&self.roster);
            let queue = self.queue.clone();
            let cancel = cancel_rx.clone();
            let producer = telemetry::spawn_thread(format!("producer-{interval_s}s"), move || {
                produce(&roster, &queue, &cancel, interval_s);
            })
            .expect("failed to spawn scheduler producer thread");
            producers.push(producer);
        }

        let mut stop = self.stop.lock().unwrap_or_else(PoisonError::into_inner);
        *stop = Some(StopHandle {
            _cancel: cancel_tx,
            producers,
        });
        Ok(())
    }

    /// Signal cancellation and join every producer before returning.
    pub fn stop(&self) {
        let handle = {
            let mut stop = self.stop.lock().unwrap_or_else(PoisonError::into_inner);
            stop.take()
        };

        if let Some(handle) = handle {
            drop(handle._cancel);
            for producer in handle.producers {
                let _ = producer.join();
            }
        }
        self.started.store(false, Ordering::SeqCst);
    }

    /// The only supported update path after a roster change.
    pub fn restart(&self) -> Result<(), SchedulerError> {
        self.stop();
        self.start()
    }
}

fn produce(
    roster: &Roster,
    queue: &Sender<Activation>,
    cancel: &Receiver<()>,
    interval_s: u64,
) {
    let ticker = tick(Duration::from_secs(interval_s));
    debug!(interval_s, "activation producer started");

    loop {
        for camera in roster.bucket(interval_s) {
            // Never emit once cancellation has been observed, even if the
            // queue would accept the send.
            if matches!(cancel.try_recv(), Err(TryRecvError::Disconnected)) {
                return;
            }

            let activation = Activation {
                camera,
                scheduled_at: Utc::now(),
            };
            select! {
                recv(cancel) -> _ => return,
                send(queue, activation) -> sent => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }

        select! {
            recv(cancel) -> _ => return,
            recv(ticker) -> _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roster::camera;

    fn activation_ids(receiver: &Receiver<Activation>, count: usize) -> Vec<String> {
        (0..count)
            .map(|_| {
                receiver
                    .recv_timeout(Duration::from_secs(1))
                    .expect("activation within a second")
                    .camera
                    .id
            })
            .collect()
    }

    #[test]
    fn emits_each_camera_in_roster_order_per_window() {
        let roster = Arc::new(Roster::new());
        roster.replace(vec![camera("a", 60), camera("b", 60), camera("c", 60)]);

        let (queue_tx, queue_rx) = bounded(8);
        let scheduler = Scheduler::new(Arc::clone(&roster), queue_tx);
        scheduler.start().expect("fresh scheduler starts");

        assert_eq!(activation_ids(&queue_rx, 3), vec!["a", "b", "c"]);
        // The next window is a minute out; nothing else shows up now.
        assert!(queue_rx
            .recv_timeout(Duration::from_millis(50))
            .is_err());

        scheduler.stop();
    }

    #[test]
    fn second_start_is_rejected_until_stop() {
        let roster = Arc::new(Roster::new());
        let (queue_tx, _queue_rx) = bounded(1);
        let scheduler = Scheduler::new(roster, queue_tx);

        scheduler.start().expect("first start succeeds");
        assert!(matches!(
            scheduler.start(),
            Err(SchedulerError::AlreadyStarted)
        ));

        scheduler.stop();
        scheduler.start().expect("start allowed again after stop");
        scheduler.stop();
    }

    #[test]
    fn no_activation_is_emitted_after_stop_returns() {
        let roster = Arc::new(Roster::new());
        roster.replace(vec![camera("a", 1), camera("b", 1)]);

        let (queue_tx, queue_rx) = bounded(16);
        let scheduler = Scheduler::new(Arc::clone(&roster), queue_tx);
        scheduler.start().unwrap();

        // Let at least one window through, then stop and drain.
        let _ = activation_ids(&queue_rx, 2);
        scheduler.stop();
        while queue_rx.try_recv().is_ok() {}

        std::thread::sleep(Duration::from_millis(1_200));
        assert!(
            queue_rx.try_recv().is_err(),
            "stopped producers must not emit another window"
        );
    }

    #[test]
    fn blocked_producer_unblocks_and_joins_on_stop() {
        let roster = Arc::new(Roster::new());
        roster.replace(vec![camera("a", 60), camera("b", 60)]);

        // Queue capacity 1: the producer blocks on the second send.
        let (queue_tx, queue_rx) = bounded(1);
        let scheduler = Scheduler::new(Arc::clone(&roster), queue_tx);
        scheduler.start().unwrap();

        let first = queue_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(first.camera.id, "a");

        // Stop while the producer is parked inside the blocking send.
        scheduler.stop();
    }
}
