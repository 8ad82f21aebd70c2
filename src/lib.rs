//! gcp-opwait: the reusable core of a Google Cloud provider.
//! Polls long-running operations to completion, merges and diffs IAM policy
//! bindings, classifies retryable API errors, and bootstraps shared test
//! fixtures over the GCP REST APIs.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod iam;
pub mod operation;
pub mod retry;
pub mod transport;

pub use bootstrap::{BootstrapContext, BootstrappedKms, KeyPurpose};
pub use config::{PollingConfig, ProviderConfig, parse_env_ref};
pub use error::{GcpError, Result};
pub use iam::{
    Binding, Expr, IamUpdater, MutexStore, Policy, compare_bindings, merge_bindings,
    missing_bindings, read_modify_write, read_policy_with_retry,
};
pub use operation::{
    Operation, OperationError, OperationKind, OperationQuery, OperationState, OperationWaiter,
    PollOptions,
};
pub use retry::{RetryOptions, RetryPredicate, is_retryable};
pub use transport::{GcpClient, HttpOperationQuery, SendRequestOptions, TokenSource, handle_not_found};
