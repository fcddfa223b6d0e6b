//! Startup configuration: required environment, secret-store contents, and
//! the documented tunables. Everything is validated once; downstream stages
//! never re-read the environment.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::auth::OidcCredentials;
use crate::secrets::{self, InfisicalConfig};

const REQUIRED_ENV: [&str; 5] = [
    "INFISICAL_ADDRESS",
    "INFISICAL_TOKEN",
    "INFISICAL_ENVIRONMENT",
    "API_BASE_URL",
    "AGENT_ID",
];

const REQUIRED_SECRETS: [&str; 5] = [
    "OIDC_TOKEN_URL",
    "OIDC_USERNAME",
    "OIDC_PASSWORD",
    "HEARTBEAT_SECONDS",
    "PARALLEL_SNAPSHOTS",
];

/// Canonical configuration shared by every component of the agent.
#[derive(Debug, Clone)]
pub struct Config {
    /// API root; agent, camera, and heartbeat URLs derive from it.
    pub api_base_url: String,
    /// This agent's identity under `<api>/agents/<id>`.
    pub agent_id: String,
    /// Token-endpoint credentials for the auto-renewer.
    pub credentials: OidcCredentials,
    /// Cadence of the roster poll + heartbeat loop.
    pub heartbeat: Duration,
    /// Worker count `W` of the snapshot pool.
    pub parallel_snapshots: usize,
    /// Activation queue capacity; defaults to `W` to preserve backpressure.
    pub queue_buffer: usize,
    /// Per-job deadline is `refresh_interval / deadline_divisor`.
    pub deadline_divisor: u32,
}

impl Config {
    /// Read the environment, pull secrets from the store, and validate.
    pub fn load() -> Result<Self> {
        let empty: Vec<&str> = REQUIRED_ENV
            .iter()
            .copied()
            .filter(|name| std::env::var(name).unwrap_or_default().is_empty())
            .collect();
        if !empty.is_empty() {
            bail!(
                "the following environment variables are empty: {}",
                empty.join(", ")
            );
        }

        let infisical = InfisicalConfig {
            address: std::env::var("INFISICAL_ADDRESS")?,
            token: std::env::var("INFISICAL_TOKEN")?,
            environment: std::env::var("INFISICAL_ENVIRONMENT")?,
        };
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("building secret store HTTP client")?;
        let store = secrets::fetch_secrets(&http, &infisical)
            .context("fetching secrets from the store")?;

        Self::from_sources(
            std::env::var("API_BASE_URL")?,
            std::env::var("AGENT_ID")?,
            &store,
        )
    }

    /// Validate and assemble a config from already-acquired sources.
    fn from_sources(
        api_base_url: String,
        agent_id: String,
        store: &HashMap<String, String>,
    ) -> Result<Self> {
        let missing: Vec<&str> = REQUIRED_SECRETS
            .iter()
            .copied()
            .filter(|name| store.get(*name).map(String::as_str).unwrap_or("").is_empty())
            .collect();
        if !missing.is_empty() {
            bail!("the following secrets are empty: {}", missing.join(", "));
        }

        let heartbeat_seconds = parse_positive(store, "HEARTBEAT_SECONDS")?;
        let parallel_snapshots = parse_positive(store, "PARALLEL_SNAPSHOTS")? as usize;
        let queue_buffer = match store.get("QUEUE_BUFFER") {
            Some(_) => parse_positive(store, "QUEUE_BUFFER")? as usize,
            None => parallel_snapshots,
        };
        let deadline_divisor = match store.get("SNAPSHOT_DEADLINE_DIVISOR") {
            Some(_) => parse_positive(store, "SNAPSHOT_DEADLINE_DIVISOR")? as u32,
            None => 2,
        };

        Ok(Self {
            api_base_url,
            agent_id,
            credentials: OidcCredentials {
                token_url: store["OIDC_TOKEN_URL"].clone(),
                username: store["OIDC_USERNAME"].clone(),
                password: store["OIDC_PASSWORD"].clone(),
            },
            heartbeat: Duration::from_secs(heartbeat_seconds),
            parallel_snapshots,
            queue_buffer,
            deadline_divisor,
        })
    }
}

fn parse_positive(store: &HashMap<String, String>, name: &str) -> Result<u64> {
    let value = store
        .get(name)
        .with_context(|| format!("{name} is not set"))?
        .trim()
        .parse::<u64>()
        .with_context(|| format!("{name} must be an integer"))?;
    if value == 0 {
        bail!("{name} must be greater than zero");
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_store() -> HashMap<String, String> {
        [
            ("OIDC_TOKEN_URL", "https://sso.test/token"),
            ("OIDC_USERNAME", "agent"),
            ("OIDC_PASSWORD", "hunter2"),
            ("HEARTBEAT_SECONDS", "60"),
            ("PARALLEL_SNAPSHOTS", "30"),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
    }

    fn build(store: &HashMap<String, String>) -> Result<Config> {
        Config::from_sources(
            "https://api.test".to_string(),
            "agent-1".to_string(),
            store,
        )
    }

    #[test]
    fn tunables_default_when_absent() {
        let config = build(&full_store()).expect("complete store validates");
        assert_eq!(config.heartbeat, Duration::from_secs(60));
        assert_eq!(config.parallel_snapshots, 30);
        assert_eq!(config.queue_buffer, 30, "queue defaults to W");
        assert_eq!(config.deadline_divisor, 2);
    }

    #[test]
    fn tunables_can_be_overridden() {
        let mut store = full_store();
        store.insert("QUEUE_BUFFER".to_string(), "64".to_string());
        store.insert("SNAPSHOT_DEADLINE_DIVISOR".to_string(), "4".to_string());

        let config = build(&store).unwrap();
        assert_eq!(config.queue_buffer, 64);
        assert_eq!(config.deadline_divisor, 4);
    }

    #[test]
    fn missing_secrets_are_reported_together() {
        let mut store = full_store();
        store.remove("OIDC_PASSWORD");
        store.insert("HEARTBEAT_SECONDS".to_string(), String::new());

        let err = build(&store).unwrap_err().to_string();
        assert!(err.contains("OIDC_PASSWORD"));
        assert!(err.contains("HEARTBEAT_SECONDS"));
    }

    #[test]
    fn zero_or_garbage_counts_are_rejected() {
        let mut store = full_store();
        store.insert("PARALLEL_SNAPSHOTS".to_string(), "0".to_string());
        assert!(build(&store).is_err());

        store.insert("PARALLEL_SNAPSHOTS".to_string(), "many".to_string());
        assert!(build(&store).is_err());
    }
}
