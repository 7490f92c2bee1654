//! ============================================================================
//! HTTP Remote - reqwest client for the shelter REST API
//! ============================================================================

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};

use super::{ApiRequest, HttpMethod, RemoteApi, RemoteFailure};
use crate::types::ApiResponse;

/// Shelter API client used by the coordinator when draining
pub struct HttpRemoteApi {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpRemoteApi {
    /// Create a client for `base_url` (e.g. "http://localhost:5000/api")
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, RemoteFailure> {
        let url = self.url(&request.path);
        debug!("{} {}", request.method, url);

        let mut builder = match request.method {
            HttpMethod::Put => self.client.put(&url),
            HttpMethod::Post => self.client.post(&url),
        };
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder = builder.header("Idempotency-Key", &request.idempotency_key);

        let response = builder.json(&request.body).send().await.map_err(|e| {
            if e.is_builder() {
                RemoteFailure::InvalidRequest(e.to_string())
            } else {
                RemoteFailure::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // Prefer the envelope's message when the backend sent one
            let message = serde_json::from_str::<ApiResponse>(&body)
                .ok()
                .and_then(|r| r.message)
                .unwrap_or(body);
            warn!("Shelter API error {} for {}: {}", status, request, message);
            return Err(RemoteFailure::Status {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<ApiResponse>()
            .await
            .map_err(|e| RemoteFailure::Malformed(e.to_string()))
    }
}
