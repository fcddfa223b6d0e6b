//! Fleet-scale camera snapshot agent.
//!
//! Periodically pulls one decoded still from every camera in a dynamic
//! roster, uploads it with its fingerprint to the central API, and triggers
//! the downstream prediction step. The library is split into focused
//! modules:
//! - `roster`: the authoritative camera set, grouped by refresh interval.
//! - `scheduler`: per-interval producers feeding the bounded queue.
//! - `pool`: the fixed-size worker pool running snapshot jobs.
//! - `snapshot`: one activation end to end (grab, upload, predict).
//! - `metrics` / `aggregate`: per-job stage timings and fleet histograms.
//! - `api` / `auth` / `secrets` / `config`: API client, OIDC credential,
//!   secret store, validated startup configuration.
//! - `supervisor`: lifecycle orchestration and the heartbeat loop.
//! - `server` / `telemetry`: diagnostics endpoint and tracing/metrics setup.

pub mod aggregate;
pub mod api;
pub mod auth;
pub mod config;
pub mod metrics;
pub mod pool;
pub mod roster;
pub mod scheduler;
pub mod secrets;
pub mod server;
pub mod snapshot;
pub mod supervisor;
pub mod telemetry;
