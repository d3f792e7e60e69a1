//! Language-model invocation.
//!
//! The engine only needs text plus token usage back. [`GatewayInvoker`]
//! talks to an internal gateway that fronts the actual providers, so no
//! provider-specific request format lives here.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_GATEWAY_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("Model gateway request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Model gateway returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Malformed model response: {0}")]
    Malformed(String),
    #[error("Model call failed: {0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRequest {
    pub model: String,
    pub system_prompt: String,
    pub user_message: String,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModelResponse {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[async_trait]
pub trait ModelInvoker: Send + Sync {
    async fn invoke(&self, request: ModelRequest) -> Result<ModelResponse, InvokeError>;
}

#[derive(Debug, Serialize)]
struct GatewayRequest<'a> {
    model: &'a str,
    system: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

/// HTTP client for the model gateway.
#[derive(Clone)]
pub struct GatewayInvoker {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl GatewayInvoker {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, InvokeError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/v1/invoke", base_url.trim_end_matches('/')),
            api_key,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl std::fmt::Debug for GatewayInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayInvoker")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "[redacted]"))
            .finish()
    }
}

#[async_trait]
impl ModelInvoker for GatewayInvoker {
    async fn invoke(&self, request: ModelRequest) -> Result<ModelResponse, InvokeError> {
        let payload = GatewayRequest {
            model: &request.model,
            system: &request.system_prompt,
            message: &request.user_message,
            max_tokens: request.max_tokens,
        };

        let mut builder = self.client.post(&self.endpoint).json(&payload);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        tracing::debug!("[MODEL_GATEWAY] Response status: {}", response.status());

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InvokeError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<ModelResponse>()
            .await
            .map_err(|e| InvokeError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, http::HeaderMap, http::StatusCode, routing::post};
    use serde_json::{Value, json};

    async fn spawn_gateway(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn test_invoke_posts_gateway_contract() {
        let app = Router::new().route(
            "/v1/invoke",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                assert_eq!(body["model"], "claude-sonnet-4");
                assert_eq!(body["system"], "Be brief.");
                assert_eq!(body["message"], "Hello");
                assert_eq!(body["max_tokens"], 256);
                assert_eq!(
                    headers.get("authorization").unwrap().to_str().unwrap(),
                    "Bearer test-key"
                );
                Json(json!({"text": "Hi!", "input_tokens": 12, "output_tokens": 3}))
            }),
        );
        let base = spawn_gateway(app).await;

        let invoker =
            GatewayInvoker::new(&base, Some("test-key".into()), Duration::from_secs(5)).unwrap();
        let response = invoker
            .invoke(ModelRequest {
                model: "claude-sonnet-4".into(),
                system_prompt: "Be brief.".into(),
                user_message: "Hello".into(),
                max_tokens: Some(256),
            })
            .await
            .unwrap();

        assert_eq!(
            response,
            ModelResponse {
                text: "Hi!".into(),
                input_tokens: 12,
                output_tokens: 3,
            }
        );
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let app = Router::new().route(
            "/v1/invoke",
            post(|| async { (StatusCode::TOO_MANY_REQUESTS, "slow down") }),
        );
        let base = spawn_gateway(app).await;

        let invoker = GatewayInvoker::new(&base, None, Duration::from_secs(5)).unwrap();
        let err = invoker
            .invoke(ModelRequest {
                model: "gpt-4o".into(),
                system_prompt: String::new(),
                user_message: "x".into(),
                max_tokens: None,
            })
            .await
            .unwrap_err();

        match err {
            InvokeError::Status { status, body } => {
                assert_eq!(status, 429);
                assert_eq!(body, "slow down");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_debug_hides_api_key() {
        let invoker =
            GatewayInvoker::new("http://gateway", Some("sk-live".into()), Duration::from_secs(1))
                .unwrap();
        assert_eq!(invoker.endpoint(), "http://gateway/v1/invoke");
        assert!(!format!("{invoker:?}").contains("sk-live"));
    }
}
