//! Agent lifecycle: startup ordering, the roster poll + heartbeat loop, and
//! graceful teardown.
//!
//! Teardown order is load-bearing: scheduler first (producers stop emitting
//! and release their queue handles), then the worker pool (queue EOF, join
//! workers, close the metrics sink), then the metrics drain joins after its
//! final flush.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, select, tick};
use tracing::{info, warn};

use rtsp_ingest::FfmpegDecoderProvider;

use crate::aggregate::{self, MetricsAggregator};
use crate::api::ApiClient;
use crate::auth::{self, AccessToken};
use crate::config::Config;
use crate::pool::WorkerPool;
use crate::roster::Roster;
use crate::scheduler::{Activation, Scheduler};
use crate::server;
use crate::snapshot::SnapshotRunner;

const METRICS_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Run the agent until a termination signal arrives.
pub fn run(config: Config) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })
    .context("installing signal handler")?;

    let http = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("building API HTTP client")?;

    // Credential first: nothing else can talk to the API without it.
    let token = Arc::new(AccessToken::default());
    let renewer = auth::spawn_renewer(http.clone(), config.credentials.clone(), Arc::clone(&token));
    info!("waiting for the first valid access token");
    while !token.valid() {
        if shutdown_rx
            .recv_timeout(Duration::from_millis(200))
            .is_ok()
        {
            renewer.stop();
            info!("shutdown requested before startup completed");
            return Ok(());
        }
    }

    let api = Arc::new(ApiClient::new(
        http,
        Arc::clone(&token),
        &config.api_base_url,
        &config.agent_id,
    ));

    let roster = Arc::new(Roster::new());
    let (pool, metrics_rx) = WorkerPool::new(config.queue_buffer);
    let scheduler = Scheduler::new(Arc::clone(&roster), pool.sender());

    let aggregator = Arc::new(MetricsAggregator::new());
    let drain = aggregate::spawn_metrics_drain(
        Arc::clone(&aggregator),
        metrics_rx,
        METRICS_FLUSH_INTERVAL,
    );

    let runner = Arc::new(SnapshotRunner::new(
        Arc::clone(&api),
        Arc::new(FfmpegDecoderProvider),
        config.deadline_divisor,
    ));
    let job_runner = Arc::clone(&runner);
    pool.start(
        config.parallel_snapshots,
        Arc::new(move |activation: &Activation| job_runner.run(activation)),
    )
    .context("starting worker pool")?;

    scheduler.start().context("starting scheduler")?;
    let diagnostics = server::spawn_diagnostics_server(Arc::clone(&aggregator))?;

    info!(
        workers = config.parallel_snapshots,
        queue = config.queue_buffer,
        "snapshot agent initialized"
    );

    let heartbeat = tick(config.heartbeat);
    loop {
        let fetched = api.list_cameras();
        let healthy = fetched.is_ok();

        match fetched {
            Ok(cameras) => {
                if !roster.equals(&cameras) {
                    info!("camera roster changed; replacing");
                    roster.replace(cameras);
                    if let Err(err) = scheduler.restart() {
                        warn!("error restarting scheduler: {err}");
                    }
                    info!(
                        "running {} cameras across {} refresh intervals",
                        roster.len(),
                        roster.snapshot_buckets().len()
                    );
                }
            }
            Err(err) => warn!("error fetching camera roster: {err}"),
        }

        if let Err(err) = api.send_heartbeat(healthy) {
            warn!("error sending heartbeat: {err}");
        }

        select! {
            recv(shutdown_rx) -> _ => break,
            recv(heartbeat) -> _ => {}
        }
    }

    info!("shutdown signal received; waiting for in-flight snapshots");
    scheduler.stop();
    pool.stop();
    let _ = drain.join();
    renewer.stop();
    diagnostics.stop();
    info!("snapshot agent stopped");

    Ok(())
}
