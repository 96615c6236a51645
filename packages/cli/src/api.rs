//! API Client
//!
//! HTTP client for the Outpost server's relay API.

use anyhow::{bail, Context, Result};
use outpost_protocol::{MessageType, Payload};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Response;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::Config;

/// Error body returned by the server
#[derive(Debug, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
struct RelayRequest {
    #[serde(rename = "type")]
    kind: MessageType,
    data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RelayResponse {
    #[serde(rename = "type")]
    kind: MessageType,
    #[serde(default)]
    data: Value,
}

pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    /// Create from saved config
    pub fn from_config() -> Result<Self> {
        let config = Config::load()?;
        Self::new(config.server_url(), config.api_key.as_deref())
    }

    pub fn new(base_url: &str, api_key: Option<&str>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(key) = api_key {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", key))
                    .context("API key contains invalid header characters")?,
            );
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "GET");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;
        parse(response).await
    }

    /// POST request
    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "POST");
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;
        parse(response).await
    }

    /// Send a typed request to an agent and decode its typed reply.
    pub async fn relay(
        &self,
        agent_id: &str,
        payload: Payload,
        timeout_secs: Option<u64>,
    ) -> Result<Payload> {
        let body = RelayRequest {
            kind: payload.kind(),
            data: payload.to_data()?,
            timeout_secs,
        };
        let reply: RelayResponse = self
            .post(&format!("/api/agents/{}/request", agent_id), &body)
            .await?;
        Ok(Payload::decode(reply.kind, reply.data)?)
    }
}

async fn parse<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .context("Unexpected response body from server");
    }

    let text = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&text) {
        Ok(err) => bail!("[{}] {}", err.code, err.message),
        Err(_) => bail!("Request failed with status {}", status),
    }
}
