use crate::config::{HttpSettings, ImageApiConfig};
use crate::http::build_client;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use thiserror::Error;

/// Banners are always generated one at a time.
pub const IMAGE_COUNT: u8 = 1;

#[derive(Debug, Error)]
pub enum ImageGenError {
    #[error("missing image api endpoint")]
    MissingEndpoint,
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Turns a prompt into a short-lived URL of the generated image.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, ImageGenError>;
}

pub struct OpenAiImageClient {
    http: Client,
    config: ImageApiConfig,
}

impl OpenAiImageClient {
    pub fn new(config: ImageApiConfig, settings: HttpSettings) -> Self {
        Self {
            http: build_client(settings),
            config,
        }
    }
}

#[async_trait]
impl ImageGenerator for OpenAiImageClient {
    async fn generate(&self, prompt: &str) -> Result<String, ImageGenError> {
        let endpoint = self.config.endpoint.trim();
        if endpoint.is_empty() {
            return Err(ImageGenError::MissingEndpoint);
        }

        let body = GenerationRequest {
            model: &self.config.model,
            prompt,
            n: IMAGE_COUNT,
            size: &self.config.size,
            quality: self.config.quality.as_deref(),
        };

        let mut request = self.http.post(endpoint).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| ImageGenError::Http(err.to_string()))?;

        if !response.status().is_success() {
            return Err(ImageGenError::Http(format!("HTTP {}", response.status())));
        }

        let payload: GenerationResponse = response
            .json()
            .await
            .map_err(|err| ImageGenError::InvalidResponse(err.to_string()))?;

        first_image_url(payload)
    }
}

fn first_image_url(payload: GenerationResponse) -> Result<String, ImageGenError> {
    payload
        .data
        .into_iter()
        .find_map(|item| item.url.filter(|url| !url.trim().is_empty()))
        .ok_or_else(|| ImageGenError::InvalidResponse("missing image url".into()))
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
struct GenerationRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u8,
    size: &'a str,
    quality: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct GenerationResponse {
    #[serde(default)]
    data: Vec<GeneratedImage>,
}

#[derive(Debug, Deserialize)]
struct GeneratedImage {
    #[serde(default)]
    url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::tests::upstream;
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    fn config(endpoint: String) -> ImageApiConfig {
        ImageApiConfig {
            endpoint,
            api_key: Some("sk-test".into()),
            model: "dall-e-3".into(),
            size: "1024x1024".into(),
            quality: None,
        }
    }

    #[test]
    fn request_omits_unset_quality() {
        let body = GenerationRequest {
            model: "dall-e-3",
            prompt: "banner",
            n: IMAGE_COUNT,
            size: "1024x1024",
            quality: None,
        };
        let value = serde_json::to_value(&body).expect("json");
        assert_eq!(
            value,
            json!({"model": "dall-e-3", "prompt": "banner", "n": 1, "size": "1024x1024"})
        );
    }

    #[test]
    fn first_url_is_returned() {
        let payload: GenerationResponse = serde_json::from_value(json!({
            "created": 1,
            "data": [{"revised_prompt": "x", "url": "https://provider/img.png"}]
        }))
        .expect("payload");
        assert_eq!(first_image_url(payload).unwrap(), "https://provider/img.png");
    }

    #[test]
    fn empty_data_is_invalid() {
        let payload: GenerationResponse =
            serde_json::from_value(json!({"data": [{"b64_json": "AAAA"}]})).expect("payload");
        let err = first_image_url(payload).unwrap_err();
        assert!(matches!(err, ImageGenError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn blank_endpoint_fails_without_request() {
        let client = OpenAiImageClient::new(
            ImageApiConfig {
                endpoint: "  ".into(),
                api_key: None,
                model: "dall-e-3".into(),
                size: "1024x1024".into(),
                quality: None,
            },
            HttpSettings::default(),
        );
        let err = client.generate("banner").await.unwrap_err();
        assert!(matches!(err, ImageGenError::MissingEndpoint));
    }

    #[tokio::test]
    async fn client_posts_single_image_request_with_bearer_key() {
        let (base, upstream) = upstream(
            StatusCode::OK,
            r#"{"created":1,"data":[{"url":"https://provider.example/img.png"}]}"#,
        )
        .await;
        let client = OpenAiImageClient::new(
            config(format!("{base}/v1/images/generations")),
            HttpSettings::default(),
        );

        let url = client.generate("Promote Widget").await.expect("url");
        assert_eq!(url, "https://provider.example/img.png");

        let seen = upstream.requests();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].method, Method::POST);
        assert_eq!(seen[0].uri, "/v1/images/generations");
        assert_eq!(seen[0].header("authorization"), Some("Bearer sk-test"));
        assert_eq!(
            seen[0].json(),
            json!({"model": "dall-e-3", "prompt": "Promote Widget", "n": 1, "size": "1024x1024"})
        );
    }

    #[tokio::test]
    async fn provider_error_status_is_http_error() {
        let (base, _) = upstream(StatusCode::TOO_MANY_REQUESTS, r#"{"error":{"message":"slow down"}}"#).await;
        let client = OpenAiImageClient::new(config(base), HttpSettings::default());
        let err = client.generate("banner").await.unwrap_err();
        assert!(matches!(&err, ImageGenError::Http(detail) if detail.contains("429")));
    }

    #[tokio::test]
    async fn response_without_url_is_invalid() {
        let (base, _) = upstream(StatusCode::OK, r#"{"data":[]}"#).await;
        let client = OpenAiImageClient::new(config(base), HttpSettings::default());
        let err = client.generate("banner").await.unwrap_err();
        assert!(matches!(err, ImageGenError::InvalidResponse(_)));
    }
}
