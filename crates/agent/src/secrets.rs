//! Secret acquisition from the Infisical store.
//!
//! Contract-level collaborator: the agent fetches the environment's secrets
//! once at startup and validates the required keys in `config`.

use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecretsError {
    #[error("error requesting secrets from {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("secret store returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("error parsing secret store response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Connection parameters for the secret store, sourced from the environment.
#[derive(Debug, Clone)]
pub struct InfisicalConfig {
    pub address: String,
    pub token: String,
    pub environment: String,
}

#[derive(Debug, Deserialize)]
struct RawSecret {
    #[serde(rename = "secretKey")]
    key: String,
    #[serde(rename = "secretValue")]
    value: String,
}

#[derive(Debug, Deserialize)]
struct RawSecrets {
    secrets: Vec<RawSecret>,
}

/// Fetch all secrets for the configured environment as a key/value map.
pub fn fetch_secrets(
    http: &reqwest::blocking::Client,
    config: &InfisicalConfig,
) -> Result<HashMap<String, String>, SecretsError> {
    let url = format!(
        "{}/api/v3/secrets/raw?environment={}",
        config.address.trim_end_matches('/'),
        config.environment
    );

    let response = http
        .get(&url)
        .bearer_auth(&config.token)
        .send()
        .map_err(|source| SecretsError::Transport {
            url: url.clone(),
            source,
        })?;

    let status = response.status().as_u16();
    let body = response.text().map_err(|source| SecretsError::Transport {
        url: url.clone(),
        source,
    })?;
    if !(200..300).contains(&status) {
        return Err(SecretsError::Status { status, body });
    }

    let raw: RawSecrets = serde_json::from_str(&body)?;
    Ok(raw
        .secrets
        .into_iter()
        .map(|secret| (secret.key, secret.value))
        .collect())
}
