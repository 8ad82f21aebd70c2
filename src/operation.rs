//! Long-running operation polling.
//!
//! Mutating GCP calls usually answer with an Operation rather than the final
//! resource. [`OperationWaiter`] polls an [`OperationQuery`] on a fixed
//! interval until the operation is done, fails, or the caller's timeout runs
//! out. Giving up locally never cancels the server-side operation.
//!
//! Three wire shapes are understood, see [`OperationKind`].

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;

use crate::config::ProviderConfig;
use crate::error::GcpError;
use crate::retry::{RetryPredicate, is_retryable};

/// Operation wire format of a service family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// `google.longrunning.Operation`: `done` flag, `error` status, embedded `response`.
    /// Resource Manager, Service Usage, Composer, Privateca and most newer APIs.
    Common,
    /// Compute Engine: `status` PENDING/RUNNING/DONE, `error.errors[]`, `selfLink`.
    Compute,
    /// Cloud SQL Admin: same status/error layout as Compute.
    SqlAdmin,
}

impl std::str::FromStr for OperationKind {
    type Err = GcpError;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "common" => Ok(OperationKind::Common),
            "compute" => Ok(OperationKind::Compute),
            "sql" | "sqladmin" => Ok(OperationKind::SqlAdmin),
            other => Err(GcpError::InvalidConfig(
                "kind".to_string(),
                format!("unknown operation kind '{}'", other),
            )),
        }
    }
}

/// Poll loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Pending,
    Running,
    DoneOk,
    DoneError,
    TimedOut,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationState::DoneOk | OperationState::DoneError | OperationState::TimedOut
        )
    }
}

/// Structured error embedded in a completed operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationError {
    /// Service-specific code: numeric RPC code for `Common`, a string like
    /// `QUOTA_EXCEEDED` for Compute and SQL.
    pub code: String,
    pub message: String,
    pub details: Vec<Value>,
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// A single snapshot of a server-side operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub name: String,
    pub done: bool,
    /// Raw status for Compute/SQL (`PENDING`, `RUNNING`, `DONE`).
    pub status: Option<String>,
    pub error: Option<OperationError>,
    /// Final resource state, when the API embeds one.
    pub response: Option<Value>,
    pub self_link: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommonOperationJson {
    #[serde(default)]
    name: String,
    #[serde(default)]
    done: bool,
    error: Option<CommonStatusJson>,
    response: Option<Value>,
}

#[derive(Deserialize)]
struct CommonStatusJson {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    details: Vec<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusOperationJson {
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: String,
    error: Option<StatusErrorsJson>,
    self_link: Option<String>,
}

#[derive(Deserialize)]
struct StatusErrorsJson {
    #[serde(default)]
    errors: Vec<StatusErrorJson>,
}

#[derive(Deserialize)]
struct StatusErrorJson {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
    location: Option<String>,
}

impl Operation {
    /// Decode an operation body of the given kind.
    pub fn from_json(kind: OperationKind, value: Value) -> crate::Result<Self> {
        match kind {
            OperationKind::Common => {
                let raw: CommonOperationJson = serde_json::from_value(value)
                    .map_err(|e| GcpError::Decode("operation".to_string(), e.to_string()))?;
                Ok(Operation {
                    name: raw.name,
                    done: raw.done,
                    status: None,
                    error: raw.error.map(|e| OperationError {
                        code: e.code.to_string(),
                        message: e.message,
                        details: e.details,
                    }),
                    response: raw.response,
                    self_link: None,
                })
            }
            OperationKind::Compute | OperationKind::SqlAdmin => {
                let raw: StatusOperationJson = serde_json::from_value(value)
                    .map_err(|e| GcpError::Decode("operation".to_string(), e.to_string()))?;
                let error = raw
                    .error
                    .filter(|e| !e.errors.is_empty())
                    .map(|e| join_status_errors(e.errors));
                Ok(Operation {
                    name: raw.name,
                    done: raw.status == "DONE",
                    status: Some(raw.status),
                    error,
                    response: None,
                    self_link: raw.self_link,
                })
            }
        }
    }

    /// Where this snapshot sits in the poll state machine.
    pub fn state(&self) -> OperationState {
        match (self.done, &self.error) {
            (true, None) => OperationState::DoneOk,
            (true, Some(_)) => OperationState::DoneError,
            (false, _) if self.status.as_deref() == Some("PENDING") => OperationState::Pending,
            (false, _) => OperationState::Running,
        }
    }
}

/// Compute and SQL may report several errors; the first code leads.
fn join_status_errors(errors: Vec<StatusErrorJson>) -> OperationError {
    let code = errors
        .first()
        .map(|e| e.code.clone())
        .unwrap_or_default();
    let message = errors
        .iter()
        .enumerate()
        .map(|(i, e)| {
            let text = match &e.location {
                Some(location) => format!("{} (at {})", e.message, location),
                None => e.message.clone(),
            };
            if i == 0 { text } else { format!("{}: {}", e.code, text) }
        })
        .collect::<Vec<_>>()
        .join("\n");
    OperationError {
        code,
        message,
        details: Vec::new(),
    }
}

/// Fetches the current state of one in-flight operation.
pub trait OperationQuery: Send + Sync {
    fn query_op(&self) -> impl Future<Output = crate::Result<Operation>> + Send;
}

/// Poll loop settings for a single wait.
#[derive(Debug, Clone)]
pub struct PollOptions {
    pub interval: Duration,
    pub timeout: Duration,
    /// Consecutive transient query failures tolerated before giving up.
    pub max_transient_retries: u32,
    /// Predicates beyond the defaults that mark a query error transient.
    pub predicates: Vec<RetryPredicate>,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(20 * 60),
            max_transient_retries: 10,
            predicates: Vec::new(),
        }
    }
}

impl PollOptions {
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            interval: config.poll_interval(),
            timeout: config.poll_timeout(),
            max_transient_retries: config.polling.max_transient_retries,
            predicates: Vec::new(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_transient_retries(mut self, retries: u32) -> Self {
        self.max_transient_retries = retries;
        self
    }

    pub fn with_predicate(mut self, predicate: RetryPredicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// Rejects a zero interval, which would poll the endpoint in a tight loop.
    pub fn validate(&self) -> crate::Result<()> {
        if self.interval.is_zero() {
            return Err(GcpError::InvalidConfig(
                "polling.interval".to_string(),
                "must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Drives one operation to a terminal state.
pub struct OperationWaiter {
    activity: String,
    options: PollOptions,
    state: OperationState,
    queries: u32,
}

impl OperationWaiter {
    /// `activity` names what is being waited on, e.g. "Creating Network".
    pub fn new(activity: impl Into<String>, options: PollOptions) -> Self {
        Self {
            activity: activity.into(),
            options,
            state: OperationState::Pending,
            queries: 0,
        }
    }

    pub fn state(&self) -> OperationState {
        self.state
    }

    /// Number of successful status queries issued so far.
    pub fn queries(&self) -> u32 {
        self.queries
    }

    fn transition(&mut self, next: OperationState) {
        if next != self.state {
            tracing::debug!(
                activity = %self.activity,
                from = ?self.state,
                to = ?next,
                "operation state changed"
            );
            self.state = next;
        }
    }

    fn timed_out(&mut self, started: Instant) -> GcpError {
        self.transition(OperationState::TimedOut);
        let elapsed = started.elapsed();
        tracing::warn!(
            activity = %self.activity,
            elapsed_ms = elapsed.as_millis() as u64,
            "gave up waiting for operation; it keeps running server-side"
        );
        GcpError::OperationTimeout {
            activity: self.activity.clone(),
            elapsed,
        }
    }

    /// Poll until `initial` (or its successors) reaches a terminal state.
    ///
    /// An already-done `initial` resolves without querying. Each query is
    /// preceded by one poll interval and bounded by the remaining timeout.
    pub async fn wait<Q: OperationQuery>(
        &mut self,
        query: &Q,
        initial: Operation,
    ) -> crate::Result<Operation> {
        self.options.validate()?;
        let started = Instant::now();
        let deadline = started + self.options.timeout;
        let mut op = initial;
        let mut transient_failures: u32 = 0;

        loop {
            self.transition(op.state());
            if op.done {
                return match op.error.take() {
                    None => {
                        tracing::debug!(activity = %self.activity, name = %op.name, "operation done");
                        Ok(op)
                    }
                    Some(err) => {
                        tracing::debug!(activity = %self.activity, error = %err, "operation failed");
                        Err(GcpError::OperationFailed(err))
                    }
                };
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(self.timed_out(started));
            }
            tokio::time::sleep(self.options.interval.min(deadline - now)).await;

            let remaining = deadline.saturating_duration_since(Instant::now());
            let result = match tokio::time::timeout(remaining, query.query_op()).await {
                Ok(result) => result,
                Err(_elapsed) => return Err(self.timed_out(started)),
            };

            match result {
                Ok(next) => {
                    self.queries += 1;
                    transient_failures = 0;
                    tracing::debug!(
                        activity = %self.activity,
                        query = self.queries,
                        done = next.done,
                        "polled operation"
                    );
                    op = next;
                }
                Err(err) => {
                    let Some(reason) = is_retryable(&err, &self.options.predicates) else {
                        return Err(err);
                    };
                    transient_failures += 1;
                    if transient_failures > self.options.max_transient_retries {
                        tracing::warn!(
                            activity = %self.activity,
                            failures = transient_failures,
                            error = %err,
                            "operation query kept failing"
                        );
                        return Err(err);
                    }
                    tracing::warn!(
                        activity = %self.activity,
                        attempt = transient_failures,
                        reason = %reason,
                        "transient error polling operation, retrying"
                    );
                }
            }
        }
    }

    /// Like [`wait`](Self::wait), then decode the embedded `response` as `T`.
    pub async fn wait_for_response<T, Q>(&mut self, query: &Q, initial: Operation) -> crate::Result<T>
    where
        T: DeserializeOwned,
        Q: OperationQuery,
    {
        let op = self.wait(query, initial).await?;
        let response = op.response.ok_or_else(|| {
            GcpError::Decode(
                format!("response of {}", self.activity),
                "operation finished without an embedded response".to_string(),
            )
        })?;
        serde_json::from_value(response)
            .map_err(|e| GcpError::Decode(format!("response of {}", self.activity), e.to_string()))
    }
}
