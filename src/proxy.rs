//! Same-origin image proxy. Provider URLs are not always fetchable from the
//! operator's network context, so image bytes are pulled through
//! `GET /fetch-image?url=...` on this service.

use crate::config::HttpSettings;
use crate::http::build_client;
use crate::models::ApiError;
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};
use urlencoding::encode;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("empty image body")]
    Empty,
    #[error("invalid image url: {0}")]
    InvalidUrl(String),
    #[error("image exceeds {0} bytes")]
    TooLarge(usize),
}

#[async_trait]
pub trait ImageProxy: Send + Sync {
    async fn fetch_bytes(&self, remote_url: &str) -> Result<Vec<u8>, ProxyError>;
}

#[derive(Debug, Clone)]
pub struct HttpImageProxy {
    base_url: String,
    http: Client,
}

impl HttpImageProxy {
    pub fn new(base_url: &str, settings: HttpSettings) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: build_client(settings),
        }
    }

    fn proxied(&self, remote_url: &str) -> String {
        format!("{}/fetch-image?url={}", self.base_url, encode(remote_url))
    }
}

#[async_trait]
impl ImageProxy for HttpImageProxy {
    async fn fetch_bytes(&self, remote_url: &str) -> Result<Vec<u8>, ProxyError> {
        let response = self
            .http
            .get(self.proxied(remote_url))
            .send()
            .await
            .map_err(|err| ProxyError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(ProxyError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| ProxyError::Request(err.to_string()))?;
        if bytes.is_empty() {
            return Err(ProxyError::Empty);
        }
        Ok(bytes.to_vec())
    }
}

#[derive(Clone)]
struct ProxyState {
    http: Client,
    max_bytes: usize,
}

/// Server side of the proxy, mounted at `/fetch-image`. Upstream bodies larger
/// than `max_bytes` are refused.
pub fn router<S>(http: Client, max_bytes: usize) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/fetch-image", get(fetch_image))
        .with_state(ProxyState { http, max_bytes })
}

#[derive(Debug, Deserialize)]
struct FetchImageQuery {
    url: String,
}

async fn fetch_image(
    State(proxy): State<ProxyState>,
    Query(query): Query<FetchImageQuery>,
) -> Response {
    crate::metrics::inc_requests("/fetch-image");
    if let Err(err) = validate_remote_url(&query.url) {
        return error_response(StatusCode::BAD_REQUEST, err.to_string());
    }

    info!(target = "promo.proxy", url = %query.url, "fetching remote image");
    match download(&proxy.http, &query.url, proxy.max_bytes).await {
        Ok(bytes) => {
            info!(target = "promo.proxy", bytes = bytes.len(), "fetched remote image");
            ([(header::CONTENT_TYPE, "image/png")], bytes).into_response()
        }
        Err(err) => {
            warn!(target = "promo.proxy", url = %query.url, error = %err, "remote_image_fetch_failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

async fn download(http: &Client, url: &str, max_bytes: usize) -> Result<Vec<u8>, ProxyError> {
    let mut response = http
        .get(url)
        .send()
        .await
        .map_err(|err| ProxyError::Request(err.to_string()))?;
    if !response.status().is_success() {
        return Err(ProxyError::Request(format!(
            "HTTP {}",
            response.status()
        )));
    }
    if let Some(len) = response.content_length()
        && len > max_bytes as u64
    {
        return Err(ProxyError::TooLarge(max_bytes));
    }

    // Content-Length may be absent or wrong, so the cap also applies while reading.
    let mut body = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|err| ProxyError::Request(err.to_string()))?
    {
        if body.len() + chunk.len() > max_bytes {
            return Err(ProxyError::TooLarge(max_bytes));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

fn validate_remote_url(url: &str) -> Result<(), ProxyError> {
    match reqwest::Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        _ => Err(ProxyError::InvalidUrl(url.to_string())),
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (
        status,
        Json(ApiError {
            error: message,
            detail: None,
        }),
    )
        .into_response()
}
