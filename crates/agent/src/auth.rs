//! OIDC client-credentials token with background auto-renewal.

use std::sync::{Arc, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{after, bounded, select, Sender};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::api::ApiError;

/// Credentials for the token endpoint, sourced from the secret store.
#[derive(Debug, Clone)]
pub struct OidcCredentials {
    pub token_url: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Default)]
struct TokenState {
    access_token: String,
    token_type: String,
}

/// Shared bearer token. Reads take a short read lock; the renewer takes the
/// write lock only for the final swap.
#[derive(Debug, Default)]
pub struct AccessToken {
    state: RwLock<TokenState>,
}

impl AccessToken {
    /// `"<type> <token>"` authorization header value, if a token is held.
    pub fn header(&self) -> Option<String> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        if state.access_token.is_empty() || state.token_type.is_empty() {
            return None;
        }
        Some(format!("{} {}", state.token_type, state.access_token))
    }

    pub fn valid(&self) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        !state.access_token.is_empty() && !state.token_type.is_empty()
    }

    fn store(&self, access_token: String, token_type: String) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.access_token = access_token;
        state.token_type = token_type;
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    token_type: String,
    expires_in: u64,
}

/// Handle to the renewer thread; dropping it does not stop the thread,
/// [`CredentialRenewer::stop`] does.
pub struct CredentialRenewer {
    cancel: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl CredentialRenewer {
    /// Signal the renewer and join it.
    pub fn stop(mut self) {
        drop(self.cancel.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Spawn the auto-renew loop: retry every second until a token is obtained,
/// then renew at 90% of the reported lifetime; fall back to the one-second
/// cadence whenever a renewal fails.
pub fn spawn_renewer(
    http: reqwest::blocking::Client,
    credentials: OidcCredentials,
    token: Arc<AccessToken>,
) -> CredentialRenewer {
    let (cancel_tx, cancel_rx) = bounded::<()>(0);

    let handle = crate::telemetry::spawn_thread("credential-renewer", move || {
        loop {
            let wait = match renew(&http, &credentials, &token) {
                Ok(expires_in) => {
                    debug!("access token renewed; next renewal in {:?}", expires_in * 9 / 10);
                    expires_in * 9 / 10
                }
                Err(err) => {
                    warn!("error renewing access token: {err}");
                    Duration::from_secs(1)
                }
            };

            select! {
                recv(cancel_rx) -> _ => return,
                recv(after(wait)) -> _ => {}
            }
        }
    })
    .expect("failed to spawn credential renewer thread");

    CredentialRenewer {
        cancel: Some(cancel_tx),
        handle: Some(handle),
    }
}

fn renew(
    http: &reqwest::blocking::Client,
    credentials: &OidcCredentials,
    token: &AccessToken,
) -> Result<Duration, ApiError> {
    let form = [
        ("grant_type", "client_credentials"),
        ("username", credentials.username.as_str()),
        ("password", credentials.password.as_str()),
        ("scope", "profile"),
    ];

    let response = http
        .post(&credentials.token_url)
        .form(&form)
        .send()
        .map_err(|source| ApiError::transport(&credentials.token_url, source))?;

    let status = response.status().as_u16();
    let body = response
        .text()
        .map_err(|source| ApiError::transport(&credentials.token_url, source))?;
    if !(200..300).contains(&status) {
        return Err(ApiError::Status {
            url: credentials.token_url.clone(),
            status,
            body,
        });
    }

    let parsed: TokenResponse = serde_json::from_str(&body)
        .map_err(|source| ApiError::decode(&credentials.token_url, source))?;
    token.store(parsed.access_token, parsed.token_type);

    Ok(Duration::from_secs(parsed.expires_in))
}
