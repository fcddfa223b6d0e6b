//! Typed client for the central snapshot API.

use std::sync::Arc;

use reqwest::blocking::Client;
use reqwest::header::{CONTENT_TYPE, AUTHORIZATION};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::auth::AccessToken;
use crate::roster::CameraDescriptor;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("error making request to {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("invalid status code {status} from {url}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
    #[error("error parsing response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ApiError {
    pub(crate) fn transport(url: &str, source: reqwest::Error) -> Self {
        ApiError::Transport {
            url: url.to_string(),
            source,
        }
    }

    pub(crate) fn decode(url: &str, source: serde_json::Error) -> Self {
        ApiError::Decode {
            url: url.to_string(),
            source,
        }
    }
}

/// Snapshot record returned by the snapshot-create call.
#[derive(Debug, Deserialize)]
pub struct SnapshotRecord {
    pub id: String,
    pub camera_id: String,
    pub image_url: String,
}

#[derive(Debug, Deserialize)]
struct CameraPage {
    items: Vec<CameraDescriptor>,
    page: u32,
    pages: u32,
}

/// Blocking API client carrying the shared credential.
pub struct ApiClient {
    http: Client,
    token: Arc<AccessToken>,
    agent_url: String,
    cameras_url: String,
}

impl ApiClient {
    pub fn new(http: Client, token: Arc<AccessToken>, api_base_url: &str, agent_id: &str) -> Self {
        let base = api_base_url.trim_end_matches('/');
        Self {
            http,
            token,
            agent_url: format!("{base}/agents/{agent_id}"),
            cameras_url: format!("{base}/cameras"),
        }
    }

    /// Fetch the agent's camera list, following pagination until
    /// `page == pages`, and derive each camera's snapshot endpoint.
    pub fn list_cameras(&self) -> Result<Vec<CameraDescriptor>, ApiError> {
        let base = format!("{}/cameras", self.agent_url);
        let mut cameras = Vec::new();

        let mut page: CameraPage = self.get_json(&base)?;
        cameras.append(&mut page.items);

        while page.page < page.pages {
            let url = format!("{base}?page={}", page.page + 1);
            page = self.get_json(&url)?;
            cameras.append(&mut page.items);
        }

        for camera in &mut cameras {
            camera.snapshot_url = format!("{}/{}/snapshots", self.cameras_url, camera.id);
        }
        Ok(cameras)
    }

    /// Report liveness; `healthy` mirrors the latest roster fetch outcome.
    pub fn send_heartbeat(&self, healthy: bool) -> Result<(), ApiError> {
        let url = format!("{}/heartbeat", self.agent_url);
        self.post_json(&url, &json!({ "healthy": healthy }))
            .map(|_| ())
    }

    /// Register a snapshot body by hash and length; the API answers with the
    /// upload target.
    pub fn create_snapshot(
        &self,
        snapshot_url: &str,
        hash_md5: &str,
        content_length: usize,
    ) -> Result<SnapshotRecord, ApiError> {
        let body = self.post_json(
            snapshot_url,
            &json!({ "hash_md5": hash_md5, "content_length": content_length }),
        )?;
        serde_json::from_str(&body).map_err(|source| ApiError::decode(snapshot_url, source))
    }

    /// PUT the encoded image to the presigned upload URL.
    pub fn send_snapshot(
        &self,
        image_url: &str,
        image: Vec<u8>,
        hash_md5: &str,
    ) -> Result<(), ApiError> {
        let response = self
            .http
            .put(image_url)
            .header(CONTENT_TYPE, "image/png")
            .header("Content-MD5", hash_md5)
            .body(image)
            .send()
            .map_err(|source| ApiError::transport(image_url, source))?;
        Self::check_status(image_url, response).map(|_| ())
    }

    /// Trigger the inference step for an uploaded snapshot.
    pub fn create_predictions(
        &self,
        snapshot_url: &str,
        snapshot_id: &str,
    ) -> Result<(), ApiError> {
        let url = format!("{snapshot_url}/{snapshot_id}/predict");
        let mut request = self
            .http
            .post(&url)
            .header(CONTENT_TYPE, "application/json");
        if let Some(header) = self.token.header() {
            request = request.header(AUTHORIZATION, header);
        }
        let response = request
            .send()
            .map_err(|source| ApiError::transport(&url, source))?;
        Self::check_status(&url, response).map(|_| ())
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, ApiError> {
        let mut request = self.http.get(url);
        if let Some(header) = self.token.header() {
            request = request.header(AUTHORIZATION, header);
        }
        let response = request
            .send()
            .map_err(|source| ApiError::transport(url, source))?;
        let body = Self::check_status(url, response)?;
        serde_json::from_str(&body).map_err(|source| ApiError::decode(url, source))
    }

    fn post_json(&self, url: &str, body: &serde_json::Value) -> Result<String, ApiError> {
        let mut request = self
            .http
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .json(body);
        if let Some(header) = self.token.header() {
            request = request.header(AUTHORIZATION, header);
        }
        let response = request
            .send()
            .map_err(|source| ApiError::transport(url, source))?;
        Self::check_status(url, response)
    }

    fn check_status(url: &str, response: reqwest::blocking::Response) -> Result<String, ApiError> {
        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|source| ApiError::transport(url, source))?;
        if !(200..300).contains(&status) {
            return Err(ApiError::Status {
                url: url.to_string(),
                status,
                body,
            });
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_page_deserializes_api_shape() {
        let page: CameraPage = serde_json::from_str(
            r#"{
                "items": [
                    {"id": "cam-1", "rtsp_url": "rtsp://10.0.0.5/live", "update_interval": 10}
                ],
                "total": 1, "page": 1, "size": 50, "pages": 1
            }"#,
        )
        .expect("page parses");

        assert_eq!(page.page, 1);
        assert_eq!(page.pages, 1);
        assert_eq!(page.items[0].id, "cam-1");
        assert_eq!(page.items[0].refresh_interval_s, 10);
        assert!(page.items[0].snapshot_url.is_empty(), "derived later");
    }

    #[test]
    fn snapshot_record_deserializes() {
        let record: SnapshotRecord = serde_json::from_str(
            r#"{"id": "snap-9", "camera_id": "cam-1", "image_url": "https://bucket/snap-9.png"}"#,
        )
        .unwrap();
        assert_eq!(record.id, "snap-9");
        assert_eq!(record.camera_id, "cam-1");
    }
}
