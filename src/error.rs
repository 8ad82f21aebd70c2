//! Error types for GCP operation polling, IAM policy edits and bootstrap fixtures.

use std::time::Duration;

use thiserror::Error;

use crate::operation::OperationError;

/// Main error type for gcp-opwait operations
#[derive(Error, Debug)]
pub enum GcpError {
    /// The API answered with a non-success HTTP status
    #[error("googleapi: Error {status}: {message}")]
    Api {
        status: u16,
        message: String,
        /// Raw response body, used by the retry predicates
        body: String,
    },

    /// The request never produced an HTTP response
    #[error("transport error: {message}")]
    Transport {
        message: String,
        timeout: bool,
        connect: bool,
    },

    /// A response body could not be decoded
    #[error("failed to decode {0}: {1}")]
    Decode(String, String),

    /// Invalid configuration for a named field
    #[error("invalid config for '{0}': {1}")]
    InvalidConfig(String, String),

    /// No usable access token
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The operation completed with an embedded error
    #[error("{0}")]
    OperationFailed(OperationError),

    /// The local poll loop gave up waiting
    #[error("timeout while waiting for operation to complete: {activity} (waited {elapsed:?})")]
    OperationTimeout { activity: String, elapsed: Duration },

    /// Too many concurrent writers on one IAM policy
    #[error("error applying IAM policy to {0}: too many conflicts: {1}")]
    PolicyConflict(String, String),

    /// A written IAM policy never showed up on read
    #[error("error applying IAM policy to {0}: waited too long for propagation")]
    PropagationTimeout(String),

    /// A shared test fixture could not be fetched or created
    #[error("unable to bootstrap {0}: {1}")]
    Bootstrap(String, String),
}

impl GcpError {
    /// HTTP status code, if this error came from an API response.
    pub fn status(&self) -> Option<u16> {
        match self {
            GcpError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True for an API error with the given status code.
    pub fn has_status(&self, code: u16) -> bool {
        self.status() == Some(code)
    }

    pub fn is_not_found(&self) -> bool {
        self.has_status(404)
    }

    pub fn is_conflict(&self) -> bool {
        self.has_status(409)
    }

    /// Raw body of an API error, empty otherwise.
    pub fn body(&self) -> &str {
        match self {
            GcpError::Api { body, .. } => body,
            _ => "",
        }
    }
}

impl From<reqwest::Error> for GcpError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return GcpError::Decode("response body".to_string(), err.to_string());
        }
        GcpError::Transport {
            message: err.to_string(),
            timeout: err.is_timeout(),
            connect: err.is_connect(),
        }
    }
}

/// Result type alias for gcp-opwait operations
pub type Result<T> = std::result::Result<T, GcpError>;
