//! Session service collaborator.
//!
//! The service creates sessions, reports their status and hands out the
//! ICE/RTC configuration. Endpoints reach it through [`SessionApi`]; the
//! HTTP implementation lives behind the `http-api` feature.

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::rtc_config::{ConfigSource, RtcConfig};

/// Session service errors (the configuration-fetch family included).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// Request could not be sent or the response not read
    #[error("http error: {0}")]
    Http(String),

    /// Non-success status code
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    /// Response body did not have the expected shape
    #[error("bad response: {0}")]
    BadResponse(String),

    /// Unknown session
    #[error("session '{0}' not found")]
    NotFound(String),
}

/// Request/response session service.
#[async_trait]
pub trait SessionApi: Send + Sync {
    /// Create a session for a device; returns the new session id.
    async fn create_session(&self, device_id: &str) -> Result<String, ApiError>;

    /// Opaque status document for a session.
    async fn session_status(&self, session_id: &str) -> Result<serde_json::Value, ApiError>;

    /// ICE/RTC configuration for a session.
    async fn session_config(&self, session_id: &str) -> Result<RtcConfig, ApiError>;
}

/// Strip an optional `{"data": {...}}` wrapper.
pub fn unwrap_data(body: serde_json::Value) -> serde_json::Value {
    match body {
        serde_json::Value::Object(mut map) if map.get("data").is_some_and(|d| d.is_object()) => {
            map.remove("data").unwrap_or_default()
        }
        other => other,
    }
}

/// Extract the session id from a create-session response.
pub fn parse_session_id(body: serde_json::Value) -> Result<String, ApiError> {
    match unwrap_data(body).get("sessionId") {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
        _ => Err(ApiError::BadResponse("missing sessionId".into())),
    }
}

/// Parse a config response, wrapped or bare.
pub fn parse_config(body: serde_json::Value) -> Result<RtcConfig, ApiError> {
    let config: RtcConfig =
        serde_json::from_value(unwrap_data(body)).map_err(|e| ApiError::BadResponse(e.to_string()))?;
    if !config.is_usable() {
        return Err(ApiError::BadResponse("no STUN or TURN servers".into()));
    }
    Ok(config)
}

/// Fetch the session's configuration, substituting the built-in one on any
/// failure.
pub async fn fetch_config_or_fallback(api: &dyn SessionApi, session_id: &str) -> (RtcConfig, ConfigSource) {
    match api.session_config(session_id).await {
        Ok(config) if config.is_usable() => {
            info!(
                session_id,
                stun = ?config.stun_servers,
                turn = ?config.turn_servers,
                "configuration fetched"
            );
            (config, ConfigSource::Service)
        }
        Ok(_) => {
            warn!(session_id, "configuration response without servers, using fallback");
            (RtcConfig::fallback(), ConfigSource::Fallback)
        }
        Err(e) => {
            warn!(session_id, error = %e, "configuration fetch failed, using fallback");
            (RtcConfig::fallback(), ConfigSource::Fallback)
        }
    }
}

// ============================================================================
// HTTP client
// ============================================================================

/// Optional request headers expected by deployed session services.
#[derive(Clone, Debug, Default)]
pub struct ApiCredentials {
    /// Sent as `Authorization: Bearer <value>`
    pub bearer: Option<String>,
    /// Sent as the `token` header
    pub token: Option<String>,
    /// Sent as the `source` header
    pub source: Option<String>,
}

#[cfg(feature = "http-api")]
pub use http::HttpSessionApi;

#[cfg(feature = "http-api")]
mod http {
    use std::time::Duration;

    use async_trait::async_trait;
    use reqwest::{RequestBuilder, Response};
    use tracing::debug;

    use super::{parse_config, parse_session_id, unwrap_data, ApiCredentials, ApiError, SessionApi};
    use crate::rtc_config::RtcConfig;

    /// [`SessionApi`] over HTTP/JSON.
    #[derive(Clone)]
    pub struct HttpSessionApi {
        base_url: String,
        credentials: ApiCredentials,
        client: reqwest::Client,
    }

    impl HttpSessionApi {
        pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
            let client = reqwest::Client::builder()
                .use_rustls_tls()
                .timeout(timeout)
                .build()
                .map_err(|e| ApiError::Http(e.to_string()))?;
            Ok(Self {
                base_url: base_url.into().trim_end_matches('/').to_string(),
                credentials: ApiCredentials::default(),
                client,
            })
        }

        pub fn with_credentials(mut self, credentials: ApiCredentials) -> Self {
            self.credentials = credentials;
            self
        }

        pub fn base_url(&self) -> &str {
            &self.base_url
        }

        fn decorate(&self, mut req: RequestBuilder) -> RequestBuilder {
            if let Some(bearer) = &self.credentials.bearer {
                req = req.bearer_auth(bearer);
            }
            if let Some(token) = &self.credentials.token {
                req = req.header("token", token);
            }
            if let Some(source) = &self.credentials.source {
                req = req.header("source", source);
            }
            req
        }

        async fn json_body(resp: Response) -> Result<serde_json::Value, ApiError> {
            let status = resp.status();
            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(ApiError::NotFound(resp.url().path().to_string()));
            }
            if !status.is_success() {
                return Err(ApiError::Status {
                    status: status.as_u16(),
                    body: resp.text().await.unwrap_or_default(),
                });
            }
            resp.json::<serde_json::Value>()
                .await
                .map_err(|e| ApiError::BadResponse(e.to_string()))
        }

        async fn get(&self, path: &str) -> Result<serde_json::Value, ApiError> {
            let url = format!("{}{}", self.base_url, path);
            debug!(%url, "GET");
            let resp = self
                .decorate(self.client.get(url))
                .send()
                .await
                .map_err(|e| ApiError::Http(e.to_string()))?;
            Self::json_body(resp).await
        }
    }

    #[async_trait]
    impl SessionApi for HttpSessionApi {
        async fn create_session(&self, device_id: &str) -> Result<String, ApiError> {
            let url = format!("{}/session", self.base_url);
            debug!(%url, device_id, "POST");
            // `deviceSn` is what older deployments read
            let body = serde_json::json!({ "deviceId": device_id, "deviceSn": device_id });
            let resp = self
                .decorate(self.client.post(url))
                .json(&body)
                .send()
                .await
                .map_err(|e| ApiError::Http(e.to_string()))?;
            parse_session_id(Self::json_body(resp).await?)
        }

        async fn session_status(&self, session_id: &str) -> Result<serde_json::Value, ApiError> {
            Ok(unwrap_data(self.get(&format!("/session/{session_id}/status")).await?))
        }

        async fn session_config(&self, session_id: &str) -> Result<RtcConfig, ApiError> {
            parse_config(self.get(&format!("/session/{session_id}/config")).await?)
        }
    }
}
