//! Retry predicates for GCP API errors, and a bounded retry loop built on them.
//!
//! A predicate inspects an error and returns the reason it is worth retrying,
//! or `None`. The default set applies to every request; callers append the
//! service-specific predicates they need.

use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;

use crate::error::GcpError;

/// Returns the reason an error is retryable, or `None`.
pub type RetryPredicate = fn(&GcpError) -> Option<String>;

const CONNECTION_RESET_SUFFIX: &str = ": connection reset by peer";

static QUOTA_PER_MINUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"Quota exceeded for quota metric '(?P<metric>.*)' and limit '(?P<limit>.* per minute)' of service",
    )
    .expect("static regex")
});

const FINGERPRINT_FAIL_ERRORS: &[&str] = &[
    "Invalid fingerprint.",
    "Supplied fingerprint does not match current metadata fingerprint.",
];

/// Predicates applied to every request.
pub const DEFAULT_PREDICATES: &[RetryPredicate] = &[
    is_network_timeout,
    is_connection_reset,
    is_unexpected_eof,
    is_common_retryable_code,
    is_operation_in_progress_409,
    is_subnetwork_unready,
    is_quota_exceeded_per_minute_403,
];

/// Check the default predicates, then `extra`, returning the first reason found.
pub fn is_retryable(err: &GcpError, extra: &[RetryPredicate]) -> Option<String> {
    DEFAULT_PREDICATES
        .iter()
        .chain(extra.iter())
        .find_map(|predicate| predicate(err))
}

pub fn is_network_timeout(err: &GcpError) -> Option<String> {
    match err {
        GcpError::Transport { timeout: true, .. } => Some("marked as timeout".to_string()),
        GcpError::Transport { connect: true, .. } => Some("connection failed".to_string()),
        _ => None,
    }
}

pub fn is_connection_reset(err: &GcpError) -> Option<String> {
    match err {
        GcpError::Transport { message, .. }
            if message.ends_with(CONNECTION_RESET_SUFFIX)
                || message.contains("connection reset") =>
        {
            Some(format!("reset connection error: {}", message))
        }
        _ => None,
    }
}

pub fn is_unexpected_eof(err: &GcpError) -> Option<String> {
    match err {
        GcpError::Transport { message, .. } if message.contains("unexpected EOF") => {
            Some("got unexpected EOF".to_string())
        }
        _ => None,
    }
}

pub fn is_common_retryable_code(err: &GcpError) -> Option<String> {
    match err.status()? {
        code @ (429 | 500 | 502 | 503) => {
            tracing::debug!(status = code, "dismissed an error as retryable based on error code");
            Some(format!("retryable error code {}", code))
        }
        _ => None,
    }
}

/// Some APIs, Cloud SQL in particular, return 409 while a concurrent call is running.
pub fn is_operation_in_progress_409(err: &GcpError) -> Option<String> {
    if err.has_status(409) && err.body().contains("operationInProgress") {
        return Some("operation still in progress".to_string());
    }
    None
}

/// Subnetworks are briefly unready after some operations.
pub fn is_subnetwork_unready(err: &GcpError) -> Option<String> {
    let body = err.body();
    if err.has_status(400) && body.contains("resourceNotReady") && body.contains("subnetworks") {
        return Some("subnetwork not ready".to_string());
    }
    None
}

/// GCE reports per-minute read quota as 403 rather than 429.
pub fn is_quota_exceeded_per_minute_403(err: &GcpError) -> Option<String> {
    if !err.has_status(403) {
        return None;
    }
    let captures = QUOTA_PER_MINUTE.captures(err.body())?;
    let metric = captures.name("metric").map_or("", |m| m.as_str());
    let limit = captures.name("limit").map_or("", |m| m.as_str());
    tracing::debug!(metric, "dismissed 403 as retryable quota error");
    Some(format!("waiting for quota limit {} to refresh", limit))
}

pub fn is_fingerprint_error(err: &GcpError) -> Option<String> {
    if !err.has_status(412) {
        return None;
    }
    let text = err.to_string();
    FINGERPRINT_FAIL_ERRORS
        .iter()
        .any(|msg| text.contains(msg) || err.body().contains(msg))
        .then(|| "fingerprint mismatch".to_string())
}

/// Any Cloud SQL 409 except an already existing instance.
pub fn is_sql_operation_in_progress(err: &GcpError) -> Option<String> {
    if err.has_status(409) && !err.body().contains("instanceAlreadyExists") {
        return Some("waiting for other concurrent Cloud SQL operations to finish".to_string());
    }
    None
}

pub fn is_service_being_activated(err: &GcpError) -> Option<String> {
    if err.has_status(400)
        && err
            .body()
            .contains("Another activation or deactivation is in progress")
    {
        return Some("waiting for same service activation/deactivation to finish".to_string());
    }
    None
}

/// A service account deleted out of band while a policy write was in flight.
pub fn is_iam_service_account_not_found(err: &GcpError) -> Option<String> {
    let body = err.body();
    if err.has_status(400) && body.contains("Service account") && body.contains("does not exist") {
        return Some("service account not found in IAM".to_string());
    }
    None
}

pub fn is_crypto_key_version_pending_generation(err: &GcpError) -> Option<String> {
    if err.has_status(400) && err.body().contains("PENDING_GENERATION") {
        return Some("waiting for pending key generation".to_string());
    }
    None
}

/// Retry settings for [`retry`].
#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Total budget across all attempts.
    pub timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub predicates: Vec<RetryPredicate>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(4 * 60),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            predicates: Vec::new(),
        }
    }
}

/// Run `f` until it succeeds, fails with a non-retryable error, or the budget runs out.
///
/// Backoff doubles from `initial_backoff` up to `max_backoff`. When the budget
/// is exhausted the last retryable error is returned.
pub async fn retry<T, F, Fut>(options: &RetryOptions, mut f: F) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = crate::Result<T>>,
{
    let deadline = Instant::now() + options.timeout;
    let mut backoff = options.initial_backoff;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let err = match f().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let Some(reason) = is_retryable(&err, &options.predicates) else {
            return Err(err);
        };

        let now = Instant::now();
        if now >= deadline {
            tracing::warn!(attempt, error = %err, "retry budget exhausted");
            return Err(err);
        }

        let sleep_for = backoff.min(deadline - now);
        tracing::debug!(
            attempt,
            reason = %reason,
            backoff_ms = sleep_for.as_millis() as u64,
            "retrying request"
        );
        tokio::time::sleep(sleep_for).await;
        backoff = (backoff * 2).min(options.max_backoff);
    }
}
