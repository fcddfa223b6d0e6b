//! Diagnostics HTTP server on a fixed local port.
//!
//! Runs on a dedicated thread so the snapshot hot path never touches the
//! Actix runtime. Non-contractual surface: health probe, Prometheus render,
//! and a JSON percentile snapshot.

use std::sync::Arc;

use actix_web::{web, App, HttpResponse, HttpServer};
use anyhow::{Context, Result};
use tokio::sync::oneshot;
use tracing::error;

use crate::aggregate::MetricsAggregator;
use crate::telemetry;

const DIAGNOSTICS_ADDR: (&str, u16) = ("127.0.0.1", 6060);

/// Handle for the diagnostics server thread.
#[derive(Default)]
pub struct DiagnosticsServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl DiagnosticsServer {
    /// Signal the server to stop and block until the thread exits.
    pub fn stop(self) {
        if let Some(shutdown) = self.shutdown {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle {
            let _ = handle.join();
        }
    }
}

/// Spawn the diagnostics server thread and return a handle that can stop it.
pub fn spawn_diagnostics_server(aggregator: Arc<MetricsAggregator>) -> Result<DiagnosticsServer> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = std::thread::Builder::new()
        .name("diagnostics-server".into())
        .spawn(move || {
            if let Err(err) = actix_web::rt::System::new().block_on(async move {
                let server = HttpServer::new(move || {
                    App::new()
                        .app_data(web::Data::new(Arc::clone(&aggregator)))
                        .route("/healthz", web::get().to(healthz_handler))
                        .route("/metrics", web::get().to(metrics_handler))
                        .route("/percentiles", web::get().to(percentiles_handler))
                })
                .bind(DIAGNOSTICS_ADDR)?
                .workers(1)
                .run();

                let srv_handle = server.handle();
                actix_web::rt::spawn(async move {
                    let _ = shutdown_rx.await;
                    srv_handle.stop(true).await;
                });

                server.await
            }) {
                error!("diagnostics server error: {err}");
            }
        })
        .context("failed to spawn diagnostics server thread")?;

    Ok(DiagnosticsServer {
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    })
}

async fn healthz_handler() -> HttpResponse {
    HttpResponse::Ok().content_type("text/plain").body("ok")
}

async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().finish(),
    }
}

async fn percentiles_handler(aggregator: web::Data<Arc<MetricsAggregator>>) -> HttpResponse {
    HttpResponse::Ok().json(aggregator.summary())
}
