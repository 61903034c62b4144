//! Transport to the remote sync service.

use crate::wire::{PullRequest, PullResponse, PushRequest, PushResponse};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use std::time::Duration;
use tether_core::{DeviceId, SyncError};

/// Device identifier header sent with every request.
pub const DEVICE_ID_HEADER: &str = "x-device-id";

/// Batch pull/push against the remote service.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn pull(&self, request: &PullRequest) -> Result<PullResponse, SyncError>;
    async fn push(&self, request: &PushRequest) -> Result<PushResponse, SyncError>;
}

// ============================================================================
// HTTP IMPLEMENTATION
// ============================================================================

/// HTTPS transport. Every call carries the bearer credential and the device
/// identifier header; credential issuance is a separate concern.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(
        base_url: &str,
        credential: &str,
        device_id: DeviceId,
        request_timeout: Duration,
    ) -> Result<Self, SyncError> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {credential}")).map_err(|err| {
            SyncError::Network {
                reason: format!("invalid credential header: {err}"),
            }
        })?;
        headers.insert(AUTHORIZATION, bearer);
        let device = HeaderValue::from_str(&device_id.to_string()).map_err(|err| {
            SyncError::Network {
                reason: format!("invalid device id header: {err}"),
            }
        })?;
        headers.insert(DEVICE_ID_HEADER, device);

        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .default_headers(headers)
            .build()
            .map_err(|err| SyncError::Network {
                reason: format!("failed to build http client: {err}"),
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post_json<Req, Resp>(&self, path: &str, request: &Req) -> Result<Resp, SyncError>
    where
        Req: serde::Serialize + Sync,
        Resp: serde::de::DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|err| SyncError::Network {
                reason: format!("{path}: {err}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Network {
                reason: format!("{path}: server returned {status}"),
            });
        }

        response.json().await.map_err(|err| SyncError::Network {
            reason: format!("{path}: invalid response body: {err}"),
        })
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn pull(&self, request: &PullRequest) -> Result<PullResponse, SyncError> {
        self.post_json("/api/v1/sync/pull", request).await
    }

    async fn push(&self, request: &PushRequest) -> Result<PushResponse, SyncError> {
        self.post_json("/api/v1/sync/push", request).await
    }
}

// ============================================================================
// TESTS
// ============================================================================
