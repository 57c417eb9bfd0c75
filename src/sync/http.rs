//! HTTP backend for the device sync exchange.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::time::timeout;

use super::{BackendApi, DeviceRequest, DeviceResponse, SyncError};
use crate::config::BackendConfig;

pub struct HttpBackend {
    url: String,
    auth_token: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            url: Self::device_request_url(&config.endpoint),
            auth_token: config.auth_token.clone(),
            timeout: Duration::from_secs(config.timeout_seconds),
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn device_request_url(endpoint: &str) -> String {
        format!("{}/device_request", endpoint.trim_end_matches('/'))
    }
}

#[async_trait]
impl BackendApi for HttpBackend {
    async fn device_request(&self, request: &DeviceRequest) -> Result<DeviceResponse, SyncError> {
        debug!("POST {}", self.url);
        let mut builder = self.client.post(&self.url).json(request);
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }

        let response = timeout(self.timeout, builder.send())
            .await
            .map_err(|_| SyncError::Transport(format!("request timeout after {:?}", self.timeout)))?
            .map_err(|e| SyncError::Transport(format!("HTTP request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(SyncError::Transport(format!(
                "backend returned status: {}",
                response.status()
            )));
        }

        response
            .json::<DeviceResponse>()
            .await
            .map_err(|e| SyncError::Malformed(format!("failed to parse JSON response: {}", e)))
    }
}
