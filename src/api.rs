//! Remote catalog API client.
//!
//! [`RemoteCatalog`] is the seam the engine talks through; [`HttpCatalogClient`]
//! is the production implementation over the catalog service's REST API.
//! Write calls hand back the raw status and body as a [`RemoteResponse`] so
//! the response handler decides success or failure; only calls that produce
//! no response at all fail with [`RemoteError`].

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Instant;
use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::error::RemoteError;
use crate::models::{QuantityChange, Resource};
use crate::storage::ApiCredentials;

/// One page of a list call.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub items: Vec<Value>,
    /// `ItemCountFetched` as reported by the server.
    pub fetched: usize,
    /// `ItemCountTotal`, when the server reports it.
    pub total: Option<usize>,
}

impl ListPage {
    /// Parse a `{"Items": [...], "ItemCountFetched": n, "ItemCountTotal": m}`
    /// body.
    pub fn from_body(body: Value) -> Result<Self, RemoteError> {
        let Value::Object(mut map) = body else {
            return Err(RemoteError::Malformed("list response is not an object".into()));
        };
        let items = match map.remove("Items") {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => Vec::new(),
            Some(_) => return Err(RemoteError::Malformed("Items is not an array".into())),
        };
        let count = |v: Option<&Value>| v.and_then(Value::as_u64).map(|n| n as usize);
        let fetched = count(map.get("ItemCountFetched")).unwrap_or(items.len());
        let total = count(map.get("ItemCountTotal"));
        Ok(Self {
            items,
            fetched,
            total,
        })
    }
}

/// Status and body of a write call.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse {
    pub status: u16,
    pub body: Value,
}

impl RemoteResponse {
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status)
    }
}

#[async_trait]
pub trait RemoteCatalog: Send + Sync {
    /// `GET /{resource}?fetch={page_size}&offset={offset}`
    async fn list(
        &self,
        resource: Resource,
        page_size: usize,
        offset: usize,
    ) -> Result<ListPage, RemoteError>;

    /// `POST /{resource}` with a JSON body.
    async fn create(&self, resource: Resource, body: Value) -> Result<RemoteResponse, RemoteError>;

    /// `PUT /{resource}` with a JSON body carrying the `Id`.
    async fn update(&self, resource: Resource, body: Value) -> Result<RemoteResponse, RemoteError>;

    /// `DELETE /{resource}/{remote_id}`
    async fn delete(
        &self,
        resource: Resource,
        remote_id: &str,
    ) -> Result<RemoteResponse, RemoteError>;

    /// `POST /inventoryitem/{remote_id}` with a form body.
    async fn adjust_quantity(
        &self,
        remote_id: &str,
        change: QuantityChange,
    ) -> Result<RemoteResponse, RemoteError>;
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the API base URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
pub fn normalize_api_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a [`RemoteError`] with a readable message.
fn friendly_error(url: &str, err: &reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        return RemoteError::Timeout(url.to_string());
    }
    if err.is_connect() {
        return RemoteError::Connect(url.to_string());
    }
    if err.is_builder() {
        return RemoteError::Config(format!("invalid catalog API URL: {url}"));
    }
    RemoteError::Transport {
        url: url.to_string(),
        message: err.to_string(),
    }
}

/// Convert an HTTP status code into a readable message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API keys are invalid".to_string(),
        403 => "Machine not authorized for this integrator".to_string(),
        404 => "Catalog API endpoint not found".to_string(),
        s if s >= 500 => format!("Catalog API server error (HTTP {s})"),
        s => format!("Unexpected response from catalog API (HTTP {s})"),
    }
}

fn parse_body(text: &str) -> Value {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

pub struct HttpCatalogClient {
    client: Client,
    base_url: String,
    credentials: ApiCredentials,
}

impl HttpCatalogClient {
    pub fn new(config: &SyncConfig, credentials: ApiCredentials) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| RemoteError::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: normalize_api_url(&config.api_url),
            credentials,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> (String, reqwest::RequestBuilder) {
        let url = format!("{}/{}", self.base_url, path);
        let builder = self
            .client
            .request(method, &url)
            .header("MachineId", self.credentials.machine_id.as_str())
            .header("MachineKey", self.credentials.machine_key.as_str())
            .header("IntegratorId", self.credentials.integrator_id.as_str())
            .header(ACCEPT, "application/json");
        (url, builder)
    }

    async fn send(
        &self,
        url: &str,
        builder: reqwest::RequestBuilder,
    ) -> Result<RemoteResponse, RemoteError> {
        let resp = builder.send().await.map_err(|e| friendly_error(url, &e))?;
        let status = resp.status().as_u16();
        let text = resp.text().await.map_err(|e| friendly_error(url, &e))?;
        debug!(url, status, "catalog API response");
        Ok(RemoteResponse {
            status,
            body: parse_body(&text),
        })
    }

    /// Issue `GET /inventoryitem?fetch=1` with the configured keys.
    pub async fn test_connectivity(&self) -> ConnectivityResult {
        let start = Instant::now();
        match self.list(Resource::InventoryItem, 1, 0).await {
            Ok(_) => {
                let latency = start.elapsed().as_millis() as u64;
                info!(latency_ms = latency, "connectivity test passed");
                ConnectivityResult {
                    success: true,
                    latency_ms: Some(latency),
                    error: None,
                }
            }
            Err(e) => ConnectivityResult {
                success: false,
                latency_ms: matches!(e, RemoteError::Status { .. })
                    .then(|| start.elapsed().as_millis() as u64),
                error: Some(e.to_string()),
            },
        }
    }
}

#[async_trait]
impl RemoteCatalog for HttpCatalogClient {
    async fn list(
        &self,
        resource: Resource,
        page_size: usize,
        offset: usize,
    ) -> Result<ListPage, RemoteError> {
        let path = format!("{}?fetch={page_size}&offset={offset}", resource.path());
        let (url, builder) = self.request(Method::GET, &path);
        let response = self.send(&url, builder).await?;
        if !response.is_success() {
            let status = StatusCode::from_u16(response.status)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            return Err(RemoteError::Status {
                status: response.status,
                message: status_error(status),
            });
        }
        ListPage::from_body(response.body)
    }

    async fn create(&self, resource: Resource, body: Value) -> Result<RemoteResponse, RemoteError> {
        let (url, builder) = self.request(Method::POST, resource.path());
        self.send(&url, builder.json(&body)).await
    }

    async fn update(&self, resource: Resource, body: Value) -> Result<RemoteResponse, RemoteError> {
        let (url, builder) = self.request(Method::PUT, resource.path());
        self.send(&url, builder.json(&body)).await
    }

    async fn delete(
        &self,
        resource: Resource,
        remote_id: &str,
    ) -> Result<RemoteResponse, RemoteError> {
        let path = format!("{}/{remote_id}", resource.path());
        let (url, builder) = self.request(Method::DELETE, &path);
        self.send(&url, builder).await
    }

    async fn adjust_quantity(
        &self,
        remote_id: &str,
        change: QuantityChange,
    ) -> Result<RemoteResponse, RemoteError> {
        let path = format!("{}/{remote_id}", Resource::InventoryItem.path());
        let (url, builder) = self.request(Method::POST, &path);
        let builder = builder
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(change.to_form());
        self.send(&url, builder).await
    }
}

// ---------------------------------------------------------------------------
// Connectivity test
// ---------------------------------------------------------------------------

/// Result of a connectivity test.
#[derive(Debug, serde::Serialize)]
pub struct ConnectivityResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
