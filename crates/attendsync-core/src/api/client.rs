//! HTTP client for the hosted attendance service.
//!
//! This module provides the `ApiClient` struct, which implements the
//! [`AttendanceRemote`] and [`UserDirectory`] contracts over REST.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, Response, Url};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::models::CachedUser;

use super::remote::{ApplyOutcome, ApplyRequest, AttendanceRemote, UserDirectory};
use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds when none is configured.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Header carrying the idempotency token so the service can dedupe before
/// parsing the body.
const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Deserialize)]
struct ApplyResponse {
    result: ApplyResult,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum ApplyResult {
    Accepted,
    AlreadyApplied,
    Rejected,
}

impl ApplyResponse {
    fn into_outcome(self) -> ApplyOutcome {
        match self.result {
            ApplyResult::Accepted => ApplyOutcome::Accepted,
            ApplyResult::AlreadyApplied => ApplyOutcome::AlreadyApplied,
            ApplyResult::Rejected => ApplyOutcome::Rejected {
                reason: self
                    .reason
                    .unwrap_or_else(|| "rejected without reason".to_string()),
            },
        }
    }
}

/// API client for the attendance service.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: Url,
    token: Option<String>,
    timeout: Duration,
}

impl ApiClient {
    /// Create a new API client with the default request timeout
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        Self::with_timeout(base_url, Duration::from_secs(REQUEST_TIMEOUT_SECS))
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ApiError::InvalidUrl(format!("{}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(ApiError::InvalidUrl(base_url.to_string()));
        }

        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url,
            token: None,
            timeout,
        })
    }

    /// Set the bearer token for authenticated requests
    pub fn set_token(&mut self, token: String) {
        self.token = Some(token);
    }

    /// Create a new ApiClient with the given token, sharing the connection pool.
    pub fn with_token(&self, token: String) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: Some(token),
            timeout: self.timeout,
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn auth_headers(&self) -> Result<header::HeaderMap, ApiError> {
        let mut headers = header::HeaderMap::new();
        if let Some(ref token) = self.token {
            let value = header::HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| ApiError::Unauthorized)?;
            headers.insert(header::AUTHORIZATION, value);
        }
        Ok(headers)
    }

    fn send_error(&self, err: reqwest::Error) -> ApiError {
        if err.is_timeout() {
            ApiError::Timeout(self.timeout)
        } else {
            ApiError::NetworkError(err)
        }
    }

    /// Send a request, backing off and resending while the service answers
    /// 429. Any other response is returned for the caller to classify.
    async fn send<F>(&self, build: F) -> Result<Response, ApiError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = build().send().await.map_err(|e| self.send_error(e))?;

            if response.status() != reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }

            retries += 1;
            if retries > MAX_RATE_LIMIT_RETRIES {
                return Err(ApiError::RateLimited);
            }
            warn!(
                url = %response.url(),
                retry = retries,
                backoff_ms = backoff_ms,
                "Rate limited, backing off"
            );
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms *= 2; // Exponential backoff
        }
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    // ===== Attendance =====

    /// Submit one attendance entry. Idempotent on the request's token.
    pub async fn apply_attendance(&self, request: &ApplyRequest) -> Result<ApplyOutcome, ApiError> {
        let url = self.endpoint(&["miqaats", &request.miqaat_id, "attendance"]);
        let headers = self.auth_headers()?;

        let response = self
            .send(|| {
                self.client
                    .post(url.clone())
                    .headers(headers.clone())
                    .header(IDEMPOTENCY_HEADER, &request.idempotency_token)
                    .json(request)
            })
            .await?;

        let status = response.status();
        match status.as_u16() {
            200..=299 => {
                let body: ApplyResponse = response
                    .json()
                    .await
                    .map_err(|e| ApiError::InvalidResponse(format!("apply response: {}", e)))?;
                let outcome = body.into_outcome();
                debug!(token = %request.idempotency_token, ?outcome, "Attendance applied");
                Ok(outcome)
            }
            // The service reports a replayed token as a conflict
            409 => Ok(ApplyOutcome::AlreadyApplied),
            400 | 422 => {
                let body = response.text().await.unwrap_or_default();
                Ok(ApplyOutcome::Rejected {
                    reason: ApiError::truncate_body(&body),
                })
            }
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(ApiError::from_status(status, &body))
            }
        }
    }

    // ===== User Directory =====

    /// Fetch the full user directory
    pub async fn fetch_users(&self) -> Result<Vec<CachedUser>, ApiError> {
        let url = self.endpoint(&["users"]);
        let headers = self.auth_headers()?;

        let response = self
            .send(|| self.client.get(url.clone()).headers(headers.clone()))
            .await?;
        let response = Self::check_response(response).await?;

        let users: Vec<CachedUser> = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("user directory: {}", e)))?;
        debug!(count = users.len(), "User directory fetched");
        Ok(users)
    }

    // ===== Connectivity =====

    /// Whether the service answers its health endpoint.
    pub async fn ping(&self) -> bool {
        let url = self.endpoint(&["health"]);
        match self.client.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(error = %e, "Health check failed");
                false
            }
        }
    }
}

#[async_trait]
impl AttendanceRemote for ApiClient {
    async fn apply(&self, request: &ApplyRequest) -> Result<ApplyOutcome, ApiError> {
        self.apply_attendance(request).await
    }
}

#[async_trait]
impl UserDirectory for ApiClient {
    async fn fetch_users(&self) -> Result<Vec<CachedUser>, ApiError> {
        ApiClient::fetch_users(self).await
    }
}
