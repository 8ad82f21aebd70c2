//! IAM policy helpers: binding merge/diff, member normalisation, and a guarded
//! read-modify-write cycle against a resource's policy.
//!
//! A policy is always fetched fresh right before a write, edited in memory and
//! pushed back with a full replace. Bindings are grouped by role and condition;
//! after a merge each group appears once with deduplicated members.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::GcpError;
use crate::retry::{RetryOptions, is_iam_service_account_not_found, retry};

/// Policy format version that supports conditional bindings.
pub const IAM_POLICY_VERSION: i32 = 3;

const MAX_BACKOFF: Duration = Duration::from_secs(30);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const POLICY_READ_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// Consecutive reads that must show the change before a write counts as applied.
const PROPAGATION_CONFIRMATIONS: u32 = 3;

/// Condition attached to a binding.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Expr {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub expression: String,
}

impl Expr {
    fn is_empty(&self) -> bool {
        self.title.is_empty() && self.description.is_empty() && self.expression.is_empty()
    }
}

/// Associates members with a role, optionally under a condition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Binding {
    pub role: String,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Expr>,
}

impl Binding {
    pub fn new<I, S>(role: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            role: role.into(),
            members: members.into_iter().map(Into::into).collect(),
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: Expr) -> Self {
        self.condition = Some(condition);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogConfig {
    pub log_type: String,
    #[serde(default)]
    pub exempted_members: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditConfig {
    pub service: String,
    #[serde(default)]
    pub audit_log_configs: Vec<AuditLogConfig>,
}

/// The full set of bindings governing access to one resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    #[serde(default)]
    pub version: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub etag: String,
    #[serde(default)]
    pub bindings: Vec<Binding>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audit_configs: Vec<AuditConfig>,
}

/// Groups bindings during merge and diff.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BindingKey {
    pub role: String,
    pub condition: Expr,
}

impl BindingKey {
    fn of(binding: &Binding) -> Self {
        Self {
            role: binding.role.clone(),
            condition: binding.condition.clone().unwrap_or_default(),
        }
    }

    fn into_binding(self, members: BTreeSet<String>) -> Binding {
        Binding {
            role: self.role,
            members: members.into_iter().collect(),
            condition: (!self.condition.is_empty()).then_some(self.condition),
        }
    }
}

type BindingMap = BTreeMap<BindingKey, BTreeSet<String>>;

/// `allUsers`, `allAuthenticatedUsers` and principal identifiers keep their case.
fn member_is_case_sensitive(member: &str) -> bool {
    member.contains("allAuthenticatedUsers")
        || member.contains("allUsers")
        || member.starts_with("principalSet:")
        || member.starts_with("principal:")
        || member.starts_with("principalHierarchy:")
}

/// Lowercase the value part of a `type:value` member, as IAM does.
///
/// The type prefix is left alone, as is the whole member when it is case
/// sensitive. A leading `deleted:` marker is skipped over.
pub fn normalize_member_casing(member: &str) -> String {
    if let Some(rest) = member.strip_prefix("deleted:") {
        if member_is_case_sensitive(rest) {
            return member.to_string();
        }
        return match rest.split_once(':') {
            Some((kind, value)) => format!("deleted:{}:{}", kind, value.to_lowercase()),
            None => member.to_string(),
        };
    }
    if member_is_case_sensitive(member) {
        return member.to_string();
    }
    match member.split_once(':') {
        Some((kind, value)) => format!("{}:{}", kind, value.to_lowercase()),
        None => member.to_string(),
    }
}

fn bindings_map(bindings: &[Binding]) -> BindingMap {
    let mut map = BindingMap::new();
    for binding in bindings {
        let members = map.entry(BindingKey::of(binding)).or_default();
        members.extend(binding.members.iter().map(|m| normalize_member_casing(m)));
    }
    map.retain(|_, members| !members.is_empty());
    map
}

fn bindings_from_map(map: BindingMap) -> Vec<Binding> {
    map.into_iter()
        .filter(|(_, members)| !members.is_empty())
        .map(|(key, members)| key.into_binding(members))
        .collect()
}

/// Coalesce bindings so each role and condition appears once.
///
/// Members are normalised and deduplicated; bindings left without members are
/// dropped. Output is sorted by role, then condition, and members are sorted.
pub fn merge_bindings(bindings: &[Binding]) -> Vec<Binding> {
    bindings_from_map(bindings_map(bindings))
}

/// Per role and condition, the members present on exactly one side.
///
/// This is a symmetric difference: a member only in `a` and a member only in
/// `b` are both reported. Groups that exist on one side only are reported in
/// full. Equal inputs yield an empty result.
pub fn missing_bindings(a: &[Binding], b: &[Binding]) -> Vec<Binding> {
    let a_map = bindings_map(a);
    let mut b_map = bindings_map(b);
    let mut result = BindingMap::new();

    for (key, a_members) in a_map {
        match b_map.remove(&key) {
            Some(b_members) => {
                let diff: BTreeSet<String> = a_members
                    .symmetric_difference(&b_members)
                    .cloned()
                    .collect();
                if !diff.is_empty() {
                    result.insert(key, diff);
                }
            }
            None => {
                result.insert(key, a_members);
            }
        }
    }
    result.extend(b_map);

    bindings_from_map(result)
}

/// Remove the given role/member pairs from `bindings`.
pub fn subtract_bindings(bindings: &[Binding], remove: &[Binding]) -> Vec<Binding> {
    let mut current = bindings_map(bindings);
    for (key, removed) in bindings_map(remove) {
        if let Some(members) = current.get_mut(&key) {
            members.retain(|m| !removed.contains(m));
        }
    }
    bindings_from_map(current)
}

/// Drop the whole binding for one role and condition.
pub fn filter_bindings_with_role_and_condition(
    bindings: &[Binding],
    role: &str,
    condition: Option<&Expr>,
) -> Vec<Binding> {
    let mut map = bindings_map(bindings);
    map.remove(&BindingKey {
        role: role.to_string(),
        condition: condition.cloned().unwrap_or_default(),
    });
    bindings_from_map(map)
}

/// Equal as sets once grouped and normalised.
pub fn compare_bindings(a: &[Binding], b: &[Binding]) -> bool {
    bindings_map(a) == bindings_map(b)
}

type AuditConfigMap = BTreeMap<String, BTreeMap<String, BTreeSet<String>>>;

fn audit_configs_map(configs: &[AuditConfig]) -> AuditConfigMap {
    let mut map = AuditConfigMap::new();
    for config in configs {
        let log_types = map.entry(config.service.clone()).or_default();
        for log_config in &config.audit_log_configs {
            log_types
                .entry(log_config.log_type.clone())
                .or_default()
                .extend(log_config.exempted_members.iter().cloned());
        }
    }
    map
}

fn audit_configs_from_map(map: AuditConfigMap) -> Vec<AuditConfig> {
    map.into_iter()
        .filter(|(_, log_types)| !log_types.is_empty())
        .map(|(service, log_types)| AuditConfig {
            service,
            audit_log_configs: log_types
                .into_iter()
                .map(|(log_type, members)| AuditLogConfig {
                    log_type,
                    exempted_members: members.into_iter().collect(),
                })
                .collect(),
        })
        .collect()
}

/// Coalesce audit configs so each service and log type appears once.
pub fn merge_audit_configs(configs: &[AuditConfig]) -> Vec<AuditConfig> {
    audit_configs_from_map(audit_configs_map(configs))
}

pub fn remove_audit_configs_with_service(configs: &[AuditConfig], service: &str) -> Vec<AuditConfig> {
    let mut map = audit_configs_map(configs);
    map.remove(service);
    audit_configs_from_map(map)
}

pub fn compare_audit_configs(a: &[AuditConfig], b: &[AuditConfig]) -> bool {
    audit_configs_map(a) == audit_configs_map(b)
}

/// Etag, version, bindings and audit configs all match.
pub fn compare_policies(a: &Policy, b: &Policy) -> bool {
    if a.etag != b.etag {
        tracing::debug!(a = %a.etag, b = %b.etag, "policies etag differ");
        return false;
    }
    if a.version != b.version {
        tracing::debug!(a = a.version, b = b.version, "policies version differ");
        return false;
    }
    if !compare_bindings(&a.bindings, &b.bindings) {
        tracing::debug!("policies bindings differ");
        return false;
    }
    compare_audit_configs(&a.audit_configs, &b.audit_configs)
}

/// Per-resource IAM policy access.
pub trait IamUpdater: Send + Sync {
    fn get_policy(&self) -> BoxFuture<'_, crate::Result<Policy>>;

    /// Replace the whole policy.
    fn set_policy(&self, policy: Policy) -> BoxFuture<'_, crate::Result<()>>;

    /// Lock key shared by every updater of the same policy, e.g. `iam-project-{id}`.
    fn mutex_key(&self) -> String;

    /// Human readable resource name for logs and errors.
    fn describe(&self) -> String;
}

/// Keyed async locks serialising policy edits within one process.
#[derive(Debug, Default, Clone)]
pub struct MutexStore {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl MutexStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock `key`, creating its mutex on first use.
    pub async fn lock(&self, key: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.entry(key.to_string()).or_default().clone()
        };
        tracing::trace!(key, "acquiring policy lock");
        mutex.lock_owned().await
    }
}

/// Fetch the policy, apply `modify`, and write it back.
///
/// Reads hitting 429 back off and retry. A 409 on write means someone else
/// changed the policy, and a missing service account on write is retried when
/// the policy's etag has moved since the read. Every restart doubles the
/// backoff and gives up once it passes 30s. After a write the policy is re-read
/// until three reads already contain the change, i.e. `modify` leaves them
/// untouched.
///
/// `modify` must be idempotent.
pub async fn read_modify_write<U, F>(
    updater: &U,
    store: &MutexStore,
    modify: F,
) -> crate::Result<()>
where
    U: IamUpdater + ?Sized,
    F: Fn(&mut Policy) -> crate::Result<()>,
{
    let _guard = store.lock(&updater.mutex_key()).await;
    let resource = updater.describe();
    let mut backoff = INITIAL_BACKOFF;

    loop {
        tracing::debug!(resource = %resource, "retrieving policy");
        let mut policy = match updater.get_policy().await {
            Ok(policy) => policy,
            Err(err) if err.has_status(429) => {
                tracing::debug!(resource = %resource, backoff_ms = backoff.as_millis() as u64, "429 reading policy");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                if backoff > MAX_BACKOFF {
                    return Err(err);
                }
                continue;
            }
            Err(err) => return Err(err),
        };

        modify(&mut policy)?;
        policy.version = policy.version.max(IAM_POLICY_VERSION);
        let etag = policy.etag.clone();

        tracing::debug!(resource = %resource, bindings = policy.bindings.len(), "setting policy");
        match updater.set_policy(policy).await {
            Ok(()) => break,
            Err(err) if err.is_conflict() => {
                tracing::debug!(resource = %resource, backoff_ms = backoff.as_millis() as u64, "concurrent policy change, restarting");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                if backoff > MAX_BACKOFF {
                    return Err(GcpError::PolicyConflict(resource, err.to_string()));
                }
            }
            // A member deleted out of band; worth another cycle only if the policy moved
            Err(err) if is_iam_service_account_not_found(&err).is_some() => {
                if backoff > MAX_BACKOFF || !policy_moved(updater, &etag).await {
                    tracing::debug!(resource = %resource, error = %err, "etag unchanged, not retrying IAM policy write");
                    return Err(err);
                }
                tracing::debug!(resource = %resource, "policy etag changed after service account error, retrying");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(err) => {
                tracing::debug!(resource = %resource, error = %err, "not retrying IAM policy write");
                return Err(err);
            }
        }
    }

    confirm_propagation(updater, &resource, &modify).await?;
    tracing::debug!(resource = %resource, "set policy");
    Ok(())
}

/// Fetch the policy under the resource lock, retrying transient errors for up
/// to ten minutes.
pub async fn read_policy_with_retry<U>(updater: &U, store: &MutexStore) -> crate::Result<Policy>
where
    U: IamUpdater + ?Sized,
{
    let _guard = store.lock(&updater.mutex_key()).await;
    read_policy(updater).await
}

async fn read_policy<U>(updater: &U) -> crate::Result<Policy>
where
    U: IamUpdater + ?Sized,
{
    tracing::debug!(resource = %updater.describe(), "retrieving policy");
    let options = RetryOptions {
        timeout: POLICY_READ_TIMEOUT,
        ..RetryOptions::default()
    };
    retry(&options, || updater.get_policy()).await
}

/// True when the current policy carries a different etag than `etag`.
/// A failed lookup counts as unchanged.
async fn policy_moved<U>(updater: &U, etag: &str) -> bool
where
    U: IamUpdater + ?Sized,
{
    match read_policy(updater).await {
        Ok(current) => current.etag != etag,
        Err(err) => {
            tracing::debug!(resource = %updater.describe(), error = %err, "error checking policy etag");
            false
        }
    }
}

async fn confirm_propagation<U, F>(updater: &U, resource: &str, modify: &F) -> crate::Result<()>
where
    U: IamUpdater + ?Sized,
    F: Fn(&mut Policy) -> crate::Result<()>,
{
    let mut backoff = INITIAL_BACKOFF;
    let mut confirmations = 0;

    while confirmations < PROPAGATION_CONFIRMATIONS {
        if backoff > MAX_BACKOFF {
            return Err(GcpError::PropagationTimeout(resource.to_string()));
        }
        tokio::time::sleep(backoff).await;

        let fetched = match updater.get_policy().await {
            Ok(policy) => policy,
            // Read quota is small; back off harder
            Err(err) if err.has_status(429) => {
                backoff *= 2;
                continue;
            }
            Err(err) => return Err(err),
        };

        let mut modified = fetched.clone();
        modify(&mut modified)?;
        modified.version = fetched.version;
        if compare_bindings(&modified.bindings, &fetched.bindings)
            && compare_audit_configs(&modified.audit_configs, &fetched.audit_configs)
        {
            confirmations += 1;
        } else {
            tracing::debug!(resource, "policy change not visible yet");
            backoff *= 2;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn members(binding: &Binding) -> Vec<&str> {
        binding.members.iter().map(String::as_str).collect()
    }

    fn as_set(bindings: &[Binding]) -> BTreeSet<(String, Vec<String>)> {
        bindings
            .iter()
            .map(|b| {
                let mut m = b.members.clone();
                m.sort();
                (b.role.clone(), m)
            })
            .collect()
    }

    fn sample() -> Vec<Binding> {
        vec![
            Binding::new("roles/viewer", ["user:a@example.com", "user:b@example.com"]),
            Binding::new("roles/editor", ["user:c@example.com"]),
            Binding::new("roles/viewer", ["user:b@example.com", "group:g@example.com"]),
            Binding::new("roles/owner", Vec::<String>::new()),
        ]
    }

    #[test]
    fn test_merge_coalesces_roles() {
        let merged = merge_bindings(&sample());
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].role, "roles/editor");
        assert_eq!(merged[1].role, "roles/viewer");
        assert_eq!(
            members(&merged[1]),
            vec!["group:g@example.com", "user:a@example.com", "user:b@example.com"]
        );
    }

    #[test]
    fn test_merge_idempotent() {
        let once = merge_bindings(&sample());
        assert_eq!(merge_bindings(&once), once);
    }

    #[test]
    fn test_merge_order_independent() {
        let mut reversed = sample();
        reversed.reverse();
        assert_eq!(merge_bindings(&reversed), merge_bindings(&sample()));
        let mut rotated = sample();
        rotated.rotate_left(1);
        assert_eq!(as_set(&merge_bindings(&rotated)), as_set(&merge_bindings(&sample())));
    }

    #[test]
    fn test_merge_keeps_conditions_apart() {
        let expiring = Expr {
            title: "expirable access".to_string(),
            description: String::new(),
            expression: "request.time < timestamp('2020-10-01T00:00:00.000Z')".to_string(),
        };
        let merged = merge_bindings(&[
            Binding::new("roles/viewer", ["user:a@example.com"]),
            Binding::new("roles/viewer", ["user:b@example.com"]).with_condition(expiring.clone()),
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].condition, None);
        assert_eq!(merged[1].condition, Some(expiring));
    }

    #[test]
    fn test_missing_bindings_of_self_is_empty() {
        let a = sample();
        assert!(missing_bindings(&a, &a).is_empty());
        assert!(missing_bindings(&[], &[]).is_empty());
    }

    #[test]
    fn test_missing_bindings_example() {
        let a = vec![Binding::new("viewer", ["u1"])];
        let b = vec![Binding::new("viewer", ["u1", "u2"])];
        assert_eq!(missing_bindings(&a, &b), vec![Binding::new("viewer", ["u2"])]);
    }

    #[test]
    fn test_missing_bindings_symmetric() {
        let a = vec![
            Binding::new("roles/viewer", ["user:a@x.com", "user:b@x.com"]),
            Binding::new("roles/owner", ["user:o@x.com"]),
        ];
        let b = vec![
            Binding::new("roles/viewer", ["user:b@x.com", "user:c@x.com"]),
            Binding::new("roles/editor", ["user:e@x.com"]),
        ];
        let expected = vec![
            Binding::new("roles/editor", ["user:e@x.com"]),
            Binding::new("roles/owner", ["user:o@x.com"]),
            Binding::new("roles/viewer", ["user:a@x.com", "user:c@x.com"]),
        ];
        assert_eq!(missing_bindings(&a, &b), expected);
        assert_eq!(missing_bindings(&b, &a), expected);
    }

    #[test]
    fn test_subtract_bindings() {
        let result = subtract_bindings(
            &sample(),
            &[
                Binding::new("roles/viewer", ["user:a@example.com"]),
                Binding::new("roles/editor", ["user:c@example.com"]),
                Binding::new("roles/unknown", ["user:z@example.com"]),
            ],
        );
        assert_eq!(
            result,
            vec![Binding::new(
                "roles/viewer",
                ["group:g@example.com", "user:b@example.com"]
            )]
        );
    }

    #[test]
    fn test_filter_role() {
        let result = filter_bindings_with_role_and_condition(&sample(), "roles/viewer", None);
        assert_eq!(result, vec![Binding::new("roles/editor", ["user:c@example.com"])]);
    }

    #[test]
    fn test_compare_bindings_ignores_order_and_case() {
        let a = vec![Binding::new("roles/viewer", ["user:Alice@Example.com", "user:b@x.com"])];
        let b = vec![
            Binding::new("roles/viewer", ["user:b@x.com"]),
            Binding::new("roles/viewer", ["user:alice@example.com"]),
        ];
        assert!(compare_bindings(&a, &b));
        assert!(!compare_bindings(&a, &[]));
    }

    #[test]
    fn test_normalize_member_casing() {
        assert_eq!(normalize_member_casing("user:Foo@Example.COM"), "user:foo@example.com");
        assert_eq!(normalize_member_casing("allUsers"), "allUsers");
        assert_eq!(normalize_member_casing("allAuthenticatedUsers"), "allAuthenticatedUsers");
        assert_eq!(
            normalize_member_casing("principalSet://iam.googleapis.com/Pool/ABC"),
            "principalSet://iam.googleapis.com/Pool/ABC"
        );
        assert_eq!(
            normalize_member_casing("deleted:serviceAccount:SA@P.iam.gserviceaccount.com?uid=1"),
            "deleted:serviceAccount:sa@p.iam.gserviceaccount.com?uid=1"
        );
        assert_eq!(
            normalize_member_casing("deleted:principal://Foo"),
            "deleted:principal://Foo"
        );
        assert_eq!(normalize_member_casing("nocolon"), "nocolon");
    }

    #[test]
    fn test_audit_configs() {
        let configs = vec![
            AuditConfig {
                service: "allServices".to_string(),
                audit_log_configs: vec![AuditLogConfig {
                    log_type: "DATA_READ".to_string(),
                    exempted_members: vec!["user:a@x.com".to_string()],
                }],
            },
            AuditConfig {
                service: "allServices".to_string(),
                audit_log_configs: vec![AuditLogConfig {
                    log_type: "DATA_READ".to_string(),
                    exempted_members: vec!["user:b@x.com".to_string()],
                }],
            },
            AuditConfig {
                service: "storage.googleapis.com".to_string(),
                audit_log_configs: vec![AuditLogConfig {
                    log_type: "ADMIN_READ".to_string(),
                    exempted_members: vec![],
                }],
            },
        ];
        let merged = merge_audit_configs(&configs);
        assert_eq!(merged.len(), 2);
        assert_eq!(
            merged[0].audit_log_configs[0].exempted_members,
            vec!["user:a@x.com", "user:b@x.com"]
        );
        assert!(compare_audit_configs(&merged, &configs));

        let removed = remove_audit_configs_with_service(&configs, "allServices");
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].service, "storage.googleapis.com");
    }

    #[test]
    fn test_policy_json_shape() {
        let policy: Policy = serde_json::from_str(
            r#"{
                "version": 3,
                "etag": "BwWWja0YfJA=",
                "bindings": [
                    {"role": "roles/viewer", "members": ["user:eve@example.com"],
                     "condition": {"title": "t", "expression": "true"}}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(policy.version, 3);
        assert_eq!(policy.bindings[0].condition.as_ref().unwrap().title, "t");
        let json = serde_json::to_value(&policy).unwrap();
        assert!(json.get("auditConfigs").is_none());
        assert!(json["bindings"][0]["condition"].get("description").is_none());
    }

    #[test]
    fn test_compare_policies() {
        let a = Policy {
            version: 3,
            etag: "e1".to_string(),
            bindings: sample(),
            audit_configs: vec![],
        };
        let mut b = a.clone();
        b.bindings = merge_bindings(&b.bindings);
        assert!(compare_policies(&a, &b));
        b.etag = "e2".to_string();
        assert!(!compare_policies(&a, &b));
    }

    /// In-memory policy with scripted read and write failures.
    struct FakeUpdater {
        policy: Mutex<Policy>,
        /// Popped front to back; `None` serves the policy.
        read_script: Mutex<VecDeque<Option<GcpError>>>,
        write_failures: Mutex<Vec<GcpError>>,
        reads: Mutex<u32>,
        writes: Mutex<u32>,
        /// When false, writes succeed but never become visible.
        persist_writes: bool,
        /// Someone else edits the policy whenever our write fails.
        etag_moves_on_failure: bool,
    }

    impl FakeUpdater {
        fn new(policy: Policy, write_failures: Vec<GcpError>) -> Self {
            Self {
                policy: Mutex::new(policy),
                read_script: Mutex::new(VecDeque::new()),
                write_failures: Mutex::new(write_failures),
                reads: Mutex::new(0),
                writes: Mutex::new(0),
                persist_writes: true,
                etag_moves_on_failure: false,
            }
        }

        fn with_reads(self, script: Vec<Option<GcpError>>) -> Self {
            *self.read_script.lock().unwrap() = script.into();
            self
        }
    }

    impl IamUpdater for FakeUpdater {
        fn get_policy(&self) -> BoxFuture<'_, crate::Result<Policy>> {
            *self.reads.lock().unwrap() += 1;
            let scripted = self.read_script.lock().unwrap().pop_front().flatten();
            let policy = self.policy.lock().unwrap().clone();
            Box::pin(async move {
                match scripted {
                    Some(err) => Err(err),
                    None => Ok(policy),
                }
            })
        }

        fn set_policy(&self, policy: Policy) -> BoxFuture<'_, crate::Result<()>> {
            let failure = self.write_failures.lock().unwrap().pop();
            Box::pin(async move {
                if let Some(err) = failure {
                    if self.etag_moves_on_failure {
                        let mut current = self.policy.lock().unwrap();
                        current.etag = format!("{}+", current.etag);
                    }
                    return Err(err);
                }
                *self.writes.lock().unwrap() += 1;
                if self.persist_writes {
                    *self.policy.lock().unwrap() = policy;
                }
                Ok(())
            })
        }

        fn mutex_key(&self) -> String {
            "iam-project-test".to_string()
        }

        fn describe(&self) -> String {
            "project \"test\"".to_string()
        }
    }

    fn throttled() -> GcpError {
        GcpError::Api {
            status: 429,
            message: "Quota exceeded for getIamPolicy".to_string(),
            body: String::new(),
        }
    }

    fn service_account_gone() -> GcpError {
        GcpError::Api {
            status: 400,
            message: "Service account gone".to_string(),
            body: "Service account sa@test.iam.gserviceaccount.com does not exist.".to_string(),
        }
    }

    fn add_member(policy: &mut Policy) -> crate::Result<()> {
        let mut bindings = policy.bindings.clone();
        bindings.push(Binding::new("roles/viewer", ["user:new@example.com"]));
        policy.bindings = merge_bindings(&bindings);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_modify_write_applies_change() {
        let updater = FakeUpdater::new(
            Policy {
                bindings: vec![Binding::new("roles/viewer", ["user:a@example.com"])],
                ..Policy::default()
            },
            vec![],
        );
        read_modify_write(&updater, &MutexStore::new(), add_member)
            .await
            .unwrap();

        let policy = updater.policy.lock().unwrap().clone();
        assert_eq!(policy.version, IAM_POLICY_VERSION);
        assert_eq!(
            policy.bindings,
            vec![Binding::new(
                "roles/viewer",
                ["user:a@example.com", "user:new@example.com"]
            )]
        );
        assert_eq!(*updater.writes.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_modify_write_restarts_on_conflict() {
        let conflict = || GcpError::Api {
            status: 409,
            message: "There were concurrent policy changes".to_string(),
            body: String::new(),
        };
        let updater = FakeUpdater::new(Policy::default(), vec![conflict(), conflict()]);
        read_modify_write(&updater, &MutexStore::new(), add_member)
            .await
            .unwrap();
        assert_eq!(*updater.writes.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_modify_write_gives_up_on_conflicts() {
        let conflicts = (0..10)
            .map(|_| GcpError::Api {
                status: 409,
                message: "conflict".to_string(),
                body: String::new(),
            })
            .collect();
        let updater = FakeUpdater::new(Policy::default(), conflicts);
        let result = read_modify_write(&updater, &MutexStore::new(), add_member).await;
        assert!(matches!(result, Err(GcpError::PolicyConflict(resource, _)) if resource == "project \"test\""));
        assert_eq!(*updater.writes.lock().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_modify_write_propagates_other_errors() {
        let updater = FakeUpdater::new(
            Policy::default(),
            vec![GcpError::Api {
                status: 400,
                message: "bad member".to_string(),
                body: String::new(),
            }],
        );
        let result = read_modify_write(&updater, &MutexStore::new(), add_member).await;
        assert!(matches!(result, Err(GcpError::Api { status: 400, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_modify_write_waits_out_throttled_read() {
        let updater = FakeUpdater::new(Policy::default(), vec![])
            .with_reads(vec![Some(throttled()), Some(throttled())]);
        read_modify_write(&updater, &MutexStore::new(), add_member)
            .await
            .unwrap();
        assert_eq!(*updater.writes.lock().unwrap(), 1);
        // two throttled, one good read, three confirmations
        assert_eq!(*updater.reads.lock().unwrap(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_modify_write_gives_up_on_persistent_throttling() {
        let updater = FakeUpdater::new(Policy::default(), vec![])
            .with_reads((0..50).map(|_| Some(throttled())).collect());
        let result = tokio::time::timeout(
            Duration::from_secs(3600),
            read_modify_write(&updater, &MutexStore::new(), add_member),
        )
        .await
        .expect("read_modify_write should give up on its own");
        assert!(matches!(result, Err(GcpError::Api { status: 429, .. })));
        // backoff 1s, 2s, 4s, 8s, 16s, then past 30s
        assert_eq!(*updater.reads.lock().unwrap(), 5);
        assert_eq!(*updater.writes.lock().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_propagation_check_backs_off_on_throttling() {
        let updater = FakeUpdater::new(Policy::default(), vec![])
            .with_reads(vec![None, Some(throttled()), Some(throttled())]);
        read_modify_write(&updater, &MutexStore::new(), add_member)
            .await
            .unwrap();
        assert_eq!(*updater.reads.lock().unwrap(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_propagation_timeout_when_change_never_visible() {
        let mut updater = FakeUpdater::new(Policy::default(), vec![]);
        updater.persist_writes = false;
        let result = read_modify_write(&updater, &MutexStore::new(), add_member).await;
        assert!(matches!(result, Err(GcpError::PropagationTimeout(resource)) if resource == "project \"test\""));
        assert_eq!(*updater.writes.lock().unwrap(), 1);
        // one read before the write, then 1s, 2s, 4s, 8s, 16s checks
        assert_eq!(*updater.reads.lock().unwrap(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_service_account_retried_when_etag_moves() {
        let mut updater = FakeUpdater::new(
            Policy {
                etag: "e1".to_string(),
                ..Policy::default()
            },
            vec![service_account_gone()],
        );
        updater.etag_moves_on_failure = true;
        read_modify_write(&updater, &MutexStore::new(), add_member)
            .await
            .unwrap();
        assert_eq!(*updater.writes.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_service_account_fails_when_etag_unchanged() {
        let updater = FakeUpdater::new(
            Policy {
                etag: "e1".to_string(),
                ..Policy::default()
            },
            vec![service_account_gone()],
        );
        let result = read_modify_write(&updater, &MutexStore::new(), add_member).await;
        assert!(matches!(result, Err(GcpError::Api { status: 400, .. })));
        assert_eq!(*updater.writes.lock().unwrap(), 0);
        // initial read plus the etag check
        assert_eq!(*updater.reads.lock().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_policy_with_retry_rides_out_throttling() {
        let updater = FakeUpdater::new(
            Policy {
                etag: "e9".to_string(),
                ..Policy::default()
            },
            vec![],
        )
        .with_reads(vec![Some(throttled()), Some(throttled())]);
        let policy = read_policy_with_retry(&updater, &MutexStore::new())
            .await
            .unwrap();
        assert_eq!(policy.etag, "e9");
        assert_eq!(*updater.reads.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_mutex_store_serialises_same_key() {
        let store = MutexStore::new();
        let guard = store.lock("iam-project-a").await;
        let other = store.lock("iam-project-b").await;
        drop(other);
        let contended = tokio::time::timeout(Duration::from_millis(20), store.lock("iam-project-a")).await;
        assert!(contended.is_err());
        drop(guard);
        assert!(
            tokio::time::timeout(Duration::from_millis(200), store.lock("iam-project-a"))
                .await
                .is_ok()
        );
    }
}
