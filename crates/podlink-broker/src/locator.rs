//! Workload locator backed by the hub REST API
//!
//! The hub owns the user's workload. The broker only asks it to start the
//! workload, waits for it to report ready, and derives where it runs from
//! the username.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

use podlink_common::{IdentityProof, WorkloadLocation, WorkloadStatus};

/// Failures talking to the orchestration collaborator
#[derive(Debug, thiserror::Error)]
pub enum LocatorError {
    /// The workload did not become ready in time
    #[error("workload unavailable: {0}")]
    WorkloadUnavailable(String),

    /// Non-success response or transport failure
    #[error("orchestration service error: {0}")]
    UpstreamError(String),

    /// Client could not be built
    #[error("locator configuration error: {0}")]
    Config(String),
}

/// Asks the orchestration collaborator for a user's workload
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkloadLocator: Send + Sync {
    /// Start the workload if needed and wait until it is ready
    async fn ensure_running(&self, username: &str) -> Result<WorkloadLocation, LocatorError>;

    /// Stop the workload
    async fn stop(&self, username: &str) -> Result<(), LocatorError>;
}

/// Hub connection settings
#[derive(Clone)]
pub struct HubConfig {
    /// API base, e.g. `https://hub.example.org/hub/api`
    pub api_url: String,
    /// API token sent as `Authorization: token ...`
    pub api_token: Option<Zeroizing<String>>,
    /// Workload namespace is this prefix plus the username
    pub namespace_prefix: String,
    /// Workload name is this prefix plus the username
    pub workload_prefix: String,
    /// Upper bound on the readiness wait
    pub ready_timeout: Duration,
    /// Delay between readiness checks
    pub poll_interval: Duration,
    /// Bound on each hub call
    pub request_timeout: Duration,
}

impl fmt::Debug for HubConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubConfig")
            .field("api_url", &self.api_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .field("namespace_prefix", &self.namespace_prefix)
            .field("workload_prefix", &self.workload_prefix)
            .field("ready_timeout", &self.ready_timeout)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

/// Hub username for a validated identity
///
/// Local part of the email (or the name claim when no email was released),
/// lowercased, with every character outside `[a-z0-9-]` replaced by `-`.
pub fn username_for(identity: &IdentityProof) -> Option<String> {
    let raw = identity
        .email
        .as_deref()
        .map(|email| email.split('@').next().unwrap_or(email))
        .or(identity.name.as_deref())
        .unwrap_or(identity.subject.as_str());

    let username: String = raw
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();

    let trimmed = username.trim_matches('-');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct HubUser {
    #[serde(default)]
    servers: HashMap<String, HubServer>,
}

#[derive(Debug, Deserialize)]
struct HubServer {
    #[serde(default)]
    ready: bool,
    #[serde(default)]
    pending: Option<String>,
}

impl HubUser {
    fn default_server(&self) -> Option<&HubServer> {
        self.servers.get("")
    }

    fn status(&self) -> WorkloadStatus {
        match self.default_server() {
            Some(server) if server.ready => WorkloadStatus::Running,
            Some(_) => WorkloadStatus::Pending,
            None => WorkloadStatus::Stopped,
        }
    }
}

/// [`WorkloadLocator`] speaking the hub REST API
pub struct HubWorkloadLocator {
    config: HubConfig,
    http: reqwest::Client,
}

impl HubWorkloadLocator {
    /// Create a locator with its own HTTP client
    pub fn new(config: HubConfig) -> Result<Self, LocatorError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| LocatorError::Config(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { config, http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_url.trim_end_matches('/'), path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_token {
            Some(token) => request.header("Authorization", format!("token {}", token.as_str())),
            None => request,
        }
    }

    fn location(&self, username: &str, status: WorkloadStatus) -> WorkloadLocation {
        WorkloadLocation {
            name: format!("{}{}", self.config.workload_prefix, username),
            namespace: format!("{}{}", self.config.namespace_prefix, username),
            status,
        }
    }

    async fn get_user(&self, username: &str) -> Result<HubUser, LocatorError> {
        let response = self
            .authorize(self.http.get(self.url(&format!("/users/{}", username))))
            .send()
            .await
            .map_err(|e| LocatorError::UpstreamError(e.to_string()))?;

        if response.status() != StatusCode::OK {
            return Err(LocatorError::UpstreamError(format!(
                "user lookup returned {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| LocatorError::UpstreamError(format!("invalid user response: {}", e)))
    }

    async fn start_server(&self, username: &str) -> Result<(), LocatorError> {
        let response = self
            .authorize(self.http.post(self.url(&format!("/users/{}/server", username))))
            .send()
            .await
            .map_err(|e| LocatorError::UpstreamError(e.to_string()))?;

        match response.status() {
            StatusCode::CREATED | StatusCode::ACCEPTED => Ok(()),
            // Another request already started it
            StatusCode::BAD_REQUEST => {
                debug!(username = %username, "Server start already in progress");
                Ok(())
            }
            status => Err(LocatorError::UpstreamError(format!(
                "server start returned {}",
                status
            ))),
        }
    }

    async fn wait_until_ready(&self, username: &str) -> Result<(), LocatorError> {
        let deadline = Instant::now() + self.config.ready_timeout;
        loop {
            tokio::time::sleep(self.config.poll_interval).await;

            match self.get_user(username).await {
                Ok(user) if user.status() == WorkloadStatus::Running => return Ok(()),
                Ok(user) => {
                    debug!(username = %username, status = %user.status(), "Workload not ready yet")
                }
                Err(e) => warn!(username = %username, error = %e, "Readiness check failed"),
            }

            if Instant::now() >= deadline {
                return Err(LocatorError::WorkloadUnavailable(format!(
                    "workload for {} not ready after {}s",
                    username,
                    self.config.ready_timeout.as_secs()
                )));
            }
        }
    }
}

#[async_trait]
impl WorkloadLocator for HubWorkloadLocator {
    #[instrument(skip(self))]
    async fn ensure_running(&self, username: &str) -> Result<WorkloadLocation, LocatorError> {
        let user = self.get_user(username).await?;

        if user.status() != WorkloadStatus::Running {
            if user.default_server().and_then(|s| s.pending.as_ref()).is_none() {
                info!(username = %username, "Starting workload");
                self.start_server(username).await?;
            }
            self.wait_until_ready(username).await?;
        }

        Ok(self.location(username, WorkloadStatus::Running))
    }

    #[instrument(skip(self))]
    async fn stop(&self, username: &str) -> Result<(), LocatorError> {
        let response = self
            .authorize(
                self.http
                    .delete(self.url(&format!("/users/{}/server", username))),
            )
            .send()
            .await
            .map_err(|e| LocatorError::UpstreamError(e.to_string()))?;

        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::ACCEPTED => {
                info!(username = %username, "Stopped workload");
                Ok(())
            }
            status => Err(LocatorError::UpstreamError(format!(
                "server stop returned {}",
                status
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::extract::{Path, State};
    use axum::http::HeaderMap;
    use axum::routing::{get, post};
    use axum::{Json, Router};

    /// Hub that reports the server ready after a number of polls
    #[derive(Clone)]
    struct FakeHub {
        polls_until_ready: usize,
        polls: Arc<AtomicUsize>,
        started: Arc<AtomicUsize>,
        start_status: u16,
    }

    async fn get_user(
        State(hub): State<FakeHub>,
        Path(name): Path<String>,
        headers: HeaderMap,
    ) -> axum::response::Response {
        use axum::response::IntoResponse;

        if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("token hub-secret") {
            return axum::http::StatusCode::FORBIDDEN.into_response();
        }
        if name == "ghost" {
            return axum::http::StatusCode::NOT_FOUND.into_response();
        }

        let polls = hub.polls.fetch_add(1, Ordering::SeqCst);
        let body = if hub.started.load(Ordering::SeqCst) == 0 && hub.polls_until_ready > 0 {
            serde_json::json!({"name": name, "servers": {}})
        } else {
            let ready = polls >= hub.polls_until_ready;
            let pending: Option<&str> = if ready { None } else { Some("spawn") };
            serde_json::json!({
                "name": name,
                "servers": {"": {"ready": ready, "pending": pending}}
            })
        };
        Json(body).into_response()
    }

    async fn start(State(hub): State<FakeHub>) -> axum::http::StatusCode {
        hub.started.fetch_add(1, Ordering::SeqCst);
        axum::http::StatusCode::from_u16(hub.start_status).unwrap()
    }

    async fn stop() -> axum::http::StatusCode {
        axum::http::StatusCode::NO_CONTENT
    }

    async fn start_fake_hub(polls_until_ready: usize, start_status: u16) -> (SocketAddr, FakeHub) {
        let hub = FakeHub {
            polls_until_ready,
            polls: Arc::new(AtomicUsize::new(0)),
            started: Arc::new(AtomicUsize::new(0)),
            start_status,
        };
        let app = Router::new()
            .route("/users/{name}", get(get_user))
            .route("/users/{name}/server", post(start).delete(stop))
            .with_state(hub.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, hub)
    }

    fn locator(addr: SocketAddr, ready_timeout: Duration) -> HubWorkloadLocator {
        HubWorkloadLocator::new(HubConfig {
            api_url: format!("http://{}/", addr),
            api_token: Some(Zeroizing::new("hub-secret".into())),
            namespace_prefix: "user-".into(),
            workload_prefix: "nb-".into(),
            ready_timeout,
            poll_interval: Duration::from_millis(10),
            request_timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    fn identity(email: Option<&str>, name: Option<&str>) -> IdentityProof {
        IdentityProof {
            subject: email.or(name).unwrap_or("sub").to_string(),
            email: email.map(String::from),
            name: name.map(String::from),
            assertion: serde_json::Value::Null,
        }
    }

    #[test]
    fn username_is_sanitized_email_local_part() {
        assert_eq!(
            username_for(&identity(Some("Alice.Smith@Example.org"), None)).as_deref(),
            Some("alice-smith")
        );
        assert_eq!(
            username_for(&identity(Some("bob_99@uni.edu"), Some("Bob"))).as_deref(),
            Some("bob-99")
        );
    }

    #[test]
    fn username_falls_back_to_name() {
        assert_eq!(
            username_for(&identity(None, Some("Carol Jones"))).as_deref(),
            Some("carol-jones")
        );
    }

    #[test]
    fn username_rejects_empty_result() {
        assert_eq!(username_for(&identity(Some("@@@"), None)), None);
    }

    #[tokio::test]
    async fn running_workload_is_located_without_starting() {
        let (addr, hub) = start_fake_hub(0, 202).await;
        let loc = locator(addr, Duration::from_secs(1))
            .ensure_running("alice")
            .await
            .unwrap();

        assert_eq!(loc.name, "nb-alice");
        assert_eq!(loc.namespace, "user-alice");
        assert!(loc.is_running());
        assert_eq!(hub.started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stopped_workload_is_started_and_polled() {
        let (addr, hub) = start_fake_hub(3, 202).await;
        let loc = locator(addr, Duration::from_secs(5))
            .ensure_running("alice")
            .await
            .unwrap();

        assert!(loc.is_running());
        assert_eq!(hub.started.load(Ordering::SeqCst), 1);
        assert!(hub.polls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn readiness_wait_is_bounded() {
        let (addr, _hub) = start_fake_hub(usize::MAX, 202).await;
        let err = locator(addr, Duration::from_millis(50))
            .ensure_running("alice")
            .await
            .unwrap_err();
        assert!(matches!(err, LocatorError::WorkloadUnavailable(_)));
    }

    #[tokio::test]
    async fn unknown_user_is_upstream_error() {
        let (addr, _hub) = start_fake_hub(0, 202).await;
        let err = locator(addr, Duration::from_secs(1))
            .ensure_running("ghost")
            .await
            .unwrap_err();
        assert!(matches!(err, LocatorError::UpstreamError(_)));
    }

    #[tokio::test]
    async fn failed_start_is_upstream_error() {
        let (addr, _hub) = start_fake_hub(1, 500).await;
        let err = locator(addr, Duration::from_secs(1))
            .ensure_running("alice")
            .await
            .unwrap_err();
        assert!(matches!(err, LocatorError::UpstreamError(_)));
    }

    #[tokio::test]
    async fn stop_accepts_no_content() {
        let (addr, _hub) = start_fake_hub(0, 202).await;
        locator(addr, Duration::from_secs(1))
            .stop("alice")
            .await
            .unwrap();
    }
}
