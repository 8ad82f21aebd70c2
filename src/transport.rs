//! HTTP transport for GCP REST APIs.
//!
//! One [`GcpClient`] serves every service family: requests carry the bearer
//! token, user agent and quota headers from [`ProviderConfig`], transient
//! failures are retried per [`crate::retry`], and non-2xx bodies are decoded
//! into [`GcpError::Api`].

use std::time::Duration;

use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::ProviderConfig;
use crate::error::GcpError;
use crate::operation::{Operation, OperationKind, OperationQuery, OperationWaiter, PollOptions};
use crate::retry::{RetryOptions, RetryPredicate, retry};

/// Tokens from gcloud live an hour; refresh well before that.
const GCLOUD_TOKEN_TTL: Duration = Duration::from_secs(45 * 60);

/// Where bearer tokens come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSource {
    /// Fixed OAuth access token.
    Static(String),
    /// `gcloud auth print-access-token`, cached for a while.
    Gcloud,
    /// Send requests unauthenticated (local fakes and emulators).
    Anonymous,
}

/// A single API call.
#[derive(Debug, Clone)]
pub struct SendRequestOptions {
    pub method: Method,
    pub url: String,
    pub body: Option<Value>,
    /// Per-attempt timeout; the config's request timeout when `None`.
    pub timeout: Option<Duration>,
    /// Total retry budget for transient errors; `None` sends exactly once.
    pub retry_timeout: Option<Duration>,
    /// Predicates beyond the defaults.
    pub predicates: Vec<RetryPredicate>,
}

impl SendRequestOptions {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body: None,
            timeout: None,
            retry_timeout: Some(Duration::from_secs(4 * 60)),
            predicates: Vec::new(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, url).with_body(body)
    }

    pub fn put(url: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PUT, url).with_body(body)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry_timeout(mut self, budget: Duration) -> Self {
        self.retry_timeout = Some(budget);
        self
    }

    pub fn without_retry(mut self) -> Self {
        self.retry_timeout = None;
        self
    }

    pub fn with_predicate(mut self, predicate: RetryPredicate) -> Self {
        self.predicates.push(predicate);
        self
    }
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

/// Build an API error from a non-success response.
pub fn decode_error(status: u16, body: String) -> GcpError {
    let message = serde_json::from_str::<ErrorEnvelope>(&body)
        .map(|envelope| envelope.error.message)
        .ok()
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                reqwest::StatusCode::from_u16(status)
                    .ok()
                    .and_then(|s| s.canonical_reason())
                    .unwrap_or("unknown error")
                    .to_string()
            } else {
                trimmed.to_string()
            }
        });
    GcpError::Api {
        status,
        message,
        body,
    }
}

/// Turn a 404 into `Ok(None)` so the caller can forget the resource.
pub fn handle_not_found<T>(result: crate::Result<T>, description: &str) -> crate::Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_not_found() => {
            tracing::warn!(resource = %description, "removing from tracked state because it's gone");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// Authenticated JSON client shared by every service family.
pub struct GcpClient {
    http: reqwest::Client,
    config: ProviderConfig,
    token_source: TokenSource,
    cached_token: Mutex<Option<(String, Instant)>>,
    user_agent: String,
}

impl GcpClient {
    /// Validate `config` and pick the token source: the configured access
    /// token when it resolves, otherwise gcloud.
    pub fn new(config: ProviderConfig) -> crate::Result<Self> {
        let token_source = match config.resolve_access_token() {
            Some(token) => TokenSource::Static(token),
            None => TokenSource::Gcloud,
        };
        Self::with_token_source(config, token_source)
    }

    pub fn with_token_source(config: ProviderConfig, token_source: TokenSource) -> crate::Result<Self> {
        config.validate()?;
        let user_agent = config.user_agent.clone().unwrap_or_else(|| {
            format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
        });
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| GcpError::InvalidConfig("http client".to_string(), e.to_string()))?;
        Ok(Self {
            http,
            config,
            token_source,
            cached_token: Mutex::new(None),
            user_agent,
        })
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn base_path(&self, service: &str) -> crate::Result<String> {
        self.config.base_path(service)
    }

    async fn access_token(&self) -> crate::Result<Option<String>> {
        match &self.token_source {
            TokenSource::Anonymous => Ok(None),
            TokenSource::Static(token) => Ok(Some(token.clone())),
            TokenSource::Gcloud => {
                let mut cached = self.cached_token.lock().await;
                if let Some((token, fetched_at)) = cached.as_ref() {
                    if fetched_at.elapsed() < GCLOUD_TOKEN_TTL {
                        return Ok(Some(token.clone()));
                    }
                }
                let token = gcloud_access_token().await?;
                *cached = Some((token.clone(), Instant::now()));
                Ok(Some(token))
            }
        }
    }

    async fn send_once(&self, options: &SendRequestOptions) -> crate::Result<Value> {
        let mut request = self
            .http
            .request(options.method.clone(), &options.url)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .timeout(options.timeout.unwrap_or_else(|| self.config.request_timeout()));

        if let Some(token) = self.access_token().await? {
            request = request.bearer_auth(token);
        }
        if let Some(project) = self.config.quota_project() {
            request = request.header("X-Goog-User-Project", project);
        }
        if let Some(reason) = &self.config.request_reason {
            request = request.header("X-Goog-Request-Reason", reason);
        }
        if let Some(body) = &options.body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(decode_error(status.as_u16(), text));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| GcpError::Decode(format!("{} {}", options.method, options.url), e.to_string()))
    }

    /// Send one API call, retrying transient failures within its retry budget.
    pub async fn send_request(&self, options: SendRequestOptions) -> crate::Result<Value> {
        tracing::debug!(method = %options.method, url = %options.url, "sending request");
        let Some(budget) = options.retry_timeout else {
            return self.send_once(&options).await;
        };
        let retry_options = RetryOptions {
            timeout: budget,
            predicates: options.predicates.clone(),
            ..RetryOptions::default()
        };
        retry(&retry_options, || self.send_once(&options)).await
    }

    /// Fetch an operation once by URL.
    pub async fn get_operation(&self, url: &str, kind: OperationKind) -> crate::Result<Operation> {
        let value = self
            .send_request(SendRequestOptions::get(url).without_retry())
            .await?;
        Operation::from_json(kind, value)
    }

    /// Status query for `op`, addressed the way its service family expects.
    ///
    /// Compute and SQL operations are polled through their `selfLink`; common
    /// operations through `{base_path}{name}`.
    pub fn operation_query<'a>(
        &'a self,
        kind: OperationKind,
        base_path: &str,
        op: &Operation,
    ) -> crate::Result<HttpOperationQuery<'a>> {
        let url = match kind {
            OperationKind::Common => format!("{}{}", base_path, op.name),
            OperationKind::Compute => op.self_link.clone().ok_or_else(|| {
                GcpError::Decode(
                    format!("operation {}", op.name),
                    "compute operation has no selfLink".to_string(),
                )
            })?,
            OperationKind::SqlAdmin => match &op.self_link {
                Some(link) => link.clone(),
                None => format!(
                    "{}projects/{}/operations/{}",
                    base_path,
                    self.config.require_project()?,
                    op.name
                ),
            },
        };
        Ok(HttpOperationQuery {
            client: self,
            url,
            kind,
        })
    }

    /// Decode `raw` as an operation of `kind` and wait for it, using the
    /// configured poll settings with `timeout` as the deadline.
    pub async fn wait_operation(
        &self,
        kind: OperationKind,
        service: &str,
        raw: Value,
        activity: &str,
        timeout: Duration,
    ) -> crate::Result<Operation> {
        let op = Operation::from_json(kind, raw)?;
        let base_path = self.base_path(service)?;
        let query = self.operation_query(kind, &base_path, &op)?;
        let options = PollOptions::from_config(&self.config).with_timeout(timeout);
        OperationWaiter::new(activity, options).wait(&query, op).await
    }
}

/// Polls one operation URL.
pub struct HttpOperationQuery<'a> {
    client: &'a GcpClient,
    url: String,
    kind: OperationKind,
}

impl HttpOperationQuery<'_> {
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl OperationQuery for HttpOperationQuery<'_> {
    async fn query_op(&self) -> crate::Result<Operation> {
        self.client.get_operation(&self.url, self.kind).await
    }
}

/// Ask the local gcloud install for an access token.
async fn gcloud_access_token() -> crate::Result<String> {
    let output = tokio::process::Command::new("gcloud")
        .args(["auth", "print-access-token"])
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .output()
        .await
        .map_err(|e| GcpError::Auth(format!("failed to run gcloud: {}", e)))?;

    if !output.status.success() {
        return Err(GcpError::Auth(format!(
            "gcloud auth print-access-token failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if token.is_empty() {
        return Err(GcpError::Auth("gcloud returned an empty access token".to_string()));
    }
    Ok(token)
}
