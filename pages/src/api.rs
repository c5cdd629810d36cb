//! Client for the remote dev session API.

use async_trait::async_trait;
use pages_core::{DevSessionStart, DevSessionStop};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::config::ApiConfig;

const START_SESSION_PATH: &str = "/pkgr/dev/start-session";
const STOP_SESSION_PATH: &str = "/pkgr/dev/stop-session";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from the remote dev session API
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("No API token configured (set PAGES_API_TOKEN or api.token in config.toml)")]
    MissingToken,

    #[error("No API server configured (set PAGES_API_SERVER or api.server in config.toml)")]
    MissingServer,

    #[error("Request to {path} failed: {source}")]
    Http {
        path: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{path} returned {status}: {body}")]
    Status {
        path: &'static str,
        status: u16,
        body: String,
    },
}

/// Registration calls the session controller makes.
///
/// Both calls must be safe to repeat with an identical payload.
#[async_trait]
pub trait DevSessionApi: Send + Sync {
    async fn start_session(&self, session: &DevSessionStart) -> Result<(), ApiError>;
    async fn stop_session(&self, session: &DevSessionStop) -> Result<(), ApiError>;
}

/// HTTP implementation of [`DevSessionApi`] (bearer auth, JSON bodies).
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    server: String,
    token: String,
}

impl ApiClient {
    pub fn new(server: impl Into<String>, token: impl Into<String>) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("pages/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|source| ApiError::Http { path: "", source })?;
        Ok(Self {
            http,
            server: server.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    pub fn from_config(config: &ApiConfig) -> Result<Self, ApiError> {
        let server = config
            .server
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or(ApiError::MissingServer)?;
        let token = config
            .token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or(ApiError::MissingToken)?;
        Self::new(server, token)
    }

    async fn post<T>(&self, path: &'static str, body: &T) -> Result<(), ApiError>
    where
        T: Serialize + Sync,
    {
        let url = format!("{}{}", self.server, path);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .map_err(|source| ApiError::Http { path, source })?;

        let status = resp.status();
        if status.is_success() {
            tracing::debug!(path, status = status.as_u16(), "session API call succeeded");
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(ApiError::Status {
            path,
            status: status.as_u16(),
            body: body.trim().to_string(),
        })
    }
}

#[async_trait]
impl DevSessionApi for ApiClient {
    async fn start_session(&self, session: &DevSessionStart) -> Result<(), ApiError> {
        self.post(START_SESSION_PATH, session).await
    }

    async fn stop_session(&self, session: &DevSessionStop) -> Result<(), ApiError> {
        self.post(STOP_SESSION_PATH, session).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http_body_util::{BodyExt, Full};
    use hyper::body::Incoming;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use pages_core::ProjectType;
    use parking_lot::Mutex;
    use std::convert::Infallible;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    #[derive(Debug, Clone)]
    struct Seen {
        path: String,
        auth: Option<String>,
        body: serde_json::Value,
    }

    /// Serve `status` for every request and record what was received.
    async fn mock_server(status: StatusCode) -> (String, Arc<Mutex<Vec<Seen>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_server = seen.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let seen = seen_by_server.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let seen = seen.clone();
                        async move {
                            let path = req.uri().path().to_string();
                            let auth = req
                                .headers()
                                .get("authorization")
                                .and_then(|v| v.to_str().ok())
                                .map(str::to_string);
                            let bytes = req.into_body().collect().await.unwrap().to_bytes();
                            let body = serde_json::from_slice(&bytes).unwrap_or_default();
                            seen.lock().push(Seen { path, auth, body });
                            let mut resp = Response::new(Full::new(Bytes::from("nope")));
                            *resp.status_mut() = status;
                            Ok::<_, Infallible>(resp)
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        (format!("http://{addr}/"), seen)
    }

    fn start_payload() -> DevSessionStart {
        DevSessionStart {
            url: "https://abc.ngrok.io".to_string(),
            name: "demo".to_string(),
            project_type: ProjectType::Function,
            metadata: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn start_session_posts_json_with_bearer_token() {
        let (server, seen) = mock_server(StatusCode::OK).await;
        let client = ApiClient::new(server, "secret").unwrap();

        client.start_session(&start_payload()).await.unwrap();

        let seen = seen.lock().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].path, START_SESSION_PATH);
        assert_eq!(seen[0].auth.as_deref(), Some("Bearer secret"));
        assert_eq!(seen[0].body["url"], "https://abc.ngrok.io");
        assert_eq!(seen[0].body["type"], "function");
    }

    #[tokio::test]
    async fn stop_session_hits_stop_path() {
        let (server, seen) = mock_server(StatusCode::NO_CONTENT).await;
        let client = ApiClient::new(server, "secret").unwrap();

        client
            .stop_session(&DevSessionStop {
                url: "https://abc.ngrok.io".to_string(),
            })
            .await
            .unwrap();

        let seen = seen.lock().clone();
        assert_eq!(seen[0].path, STOP_SESSION_PATH);
        assert_eq!(seen[0].body, serde_json::json!({"url": "https://abc.ngrok.io"}));
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let (server, _) = mock_server(StatusCode::SERVICE_UNAVAILABLE).await;
        let client = ApiClient::new(server, "secret").unwrap();

        match client.start_session(&start_payload()).await {
            Err(ApiError::Status { status, body, .. }) => {
                assert_eq!(status, 503);
                assert_eq!(body, "nope");
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[test]
    fn from_config_requires_token_and_server() {
        let missing_token = ApiConfig {
            server: Some("https://api.example.com".to_string()),
            token: None,
        };
        assert!(matches!(
            ApiClient::from_config(&missing_token),
            Err(ApiError::MissingToken)
        ));

        let missing_server = ApiConfig {
            server: None,
            token: Some("t".to_string()),
        };
        assert!(matches!(
            ApiClient::from_config(&missing_server),
            Err(ApiError::MissingServer)
        ));
    }
}
