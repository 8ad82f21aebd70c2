//! Shared long-lived fixtures for acceptance runs.
//!
//! Each fixture is looked up first and only created when missing, so many test
//! runs reuse one network, key or project instead of paying setup time and
//! quota every run. Fixtures are never deleted here.
//!
//! A [`BootstrapContext`] is owned by one test run and passed by reference;
//! resolved fixture names are cached on it rather than in process globals.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::error::GcpError;
use crate::operation::OperationKind;
use crate::transport::{GcpClient, SendRequestOptions, handle_not_found};

pub const SHARED_KEY_RING: &str = "tftest-shared-keyring-1";
pub const SHARED_TEST_NETWORK_PREFIX: &str = "tf-bootstrap-net-";
const BOOTSTRAPPED_PROJECT_NAME: &str = "Bootstrapped Test Project";

const NETWORK_TIMEOUT: Duration = Duration::from_secs(4 * 60);
const PROJECT_TIMEOUT: Duration = Duration::from_secs(4 * 60);
const SERVICES_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const BILLING_READ_TIMEOUT: Duration = Duration::from_secs(30);
const BILLING_UPDATE_TIMEOUT: Duration = Duration::from_secs(2 * 60);
const BILLING_ACCOUNT_PREFIX: &str = "billingAccounts/";

/// Crypto key purpose, with its shared key name and default algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyPurpose {
    EncryptDecrypt,
    AsymmetricSign,
    AsymmetricDecrypt,
}

impl KeyPurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyPurpose::EncryptDecrypt => "ENCRYPT_DECRYPT",
            KeyPurpose::AsymmetricSign => "ASYMMETRIC_SIGN",
            KeyPurpose::AsymmetricDecrypt => "ASYMMETRIC_DECRYPT",
        }
    }

    pub fn shared_key_name(self) -> &'static str {
        match self {
            KeyPurpose::EncryptDecrypt => "tftest-shared-key-1",
            KeyPurpose::AsymmetricSign => "tftest-shared-sign-key-1",
            KeyPurpose::AsymmetricDecrypt => "tftest-shared-decrypt-key-1",
        }
    }

    fn algorithm(self) -> &'static str {
        match self {
            KeyPurpose::EncryptDecrypt => "GOOGLE_SYMMETRIC_ENCRYPTION",
            KeyPurpose::AsymmetricSign => "RSA_SIGN_PKCS1_4096_SHA512",
            KeyPurpose::AsymmetricDecrypt => "RSA_DECRYPT_OAEP_4096_SHA512",
        }
    }
}

/// Full resource names of the shared key ring and crypto key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrappedKms {
    pub key_ring: String,
    pub crypto_key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub project_id: String,
    #[serde(default)]
    pub project_number: String,
    #[serde(default)]
    pub lifecycle_state: String,
}

/// Per-run bootstrap state.
pub struct BootstrapContext {
    client: GcpClient,
    project: String,
    fixtures: Mutex<HashMap<String, String>>,
}

impl BootstrapContext {
    /// Requires the client config to name a project.
    pub fn new(client: GcpClient) -> crate::Result<Self> {
        let project = client.config().require_project()?.to_string();
        Ok(Self {
            client,
            project,
            fixtures: Mutex::new(HashMap::new()),
        })
    }

    pub fn client(&self) -> &GcpClient {
        &self.client
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    async fn cached(&self, key: &str) -> Option<String> {
        self.fixtures.lock().await.get(key).cloned()
    }

    async fn remember(&self, key: String, value: String) {
        self.fixtures.lock().await.insert(key, value);
    }

    async fn get_optional(&self, url: &str, description: &str) -> crate::Result<Option<Value>> {
        let result = self.client.send_request(SendRequestOptions::get(url)).await;
        handle_not_found(result, description)
    }

    /// Get or create the custom-mode VPC network `tf-bootstrap-net-{test_id}`.
    pub async fn shared_network(&self, test_id: &str) -> crate::Result<String> {
        let name = format!("{}{}", SHARED_TEST_NETWORK_PREFIX, test_id);
        let cache_key = format!("network/{}", name);
        if let Some(found) = self.cached(&cache_key).await {
            return Ok(found);
        }

        let base = self.client.base_path("compute")?;
        let collection = format!("{}projects/{}/global/networks", base, self.project);
        let url = format!("{}/{}", collection, name);
        let description = format!("shared test network {:?}", name);

        tracing::debug!(network = %name, "getting shared test network");
        if self.get_optional(&url, &description).await?.is_none() {
            tracing::info!(network = %name, "network not found, bootstrapping");
            let body = json!({"name": name, "autoCreateSubnetworks": false});
            let op = self
                .client
                .send_request(SendRequestOptions::post(&collection, body).with_timeout(NETWORK_TIMEOUT))
                .await
                .map_err(|e| GcpError::Bootstrap(description.clone(), e.to_string()))?;
            self.client
                .wait_operation(
                    OperationKind::Compute,
                    "compute",
                    op,
                    "bootstrapping shared test network",
                    NETWORK_TIMEOUT,
                )
                .await
                .map_err(|e| GcpError::Bootstrap(description.clone(), e.to_string()))?;
        }

        let network = self
            .get_optional(&url, &description)
            .await?
            .ok_or_else(|| GcpError::Bootstrap(description.clone(), "missing after create".to_string()))?;
        let resolved = network
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(name.as_str())
            .to_string();
        self.remember(cache_key, resolved.clone()).await;
        Ok(resolved)
    }

    /// Get or create the shared key ring and the crypto key for `purpose` in `location`.
    pub async fn shared_kms_key(
        &self,
        purpose: KeyPurpose,
        location: &str,
    ) -> crate::Result<BootstrappedKms> {
        let base = self.client.base_path("kms")?;
        let key_ring_parent = format!("projects/{}/locations/{}", self.project, location);
        let key_ring = format!("{}/keyRings/{}", key_ring_parent, SHARED_KEY_RING);
        let crypto_key = format!("{}/cryptoKeys/{}", key_ring, purpose.shared_key_name());

        if let Some(found) = self.cached(&crypto_key).await {
            return Ok(BootstrappedKms {
                key_ring,
                crypto_key: found,
            });
        }

        if self
            .get_optional(&format!("{}{}", base, key_ring), "shared key ring")
            .await?
            .is_none()
        {
            tracing::info!(key_ring = %key_ring, "key ring not found, bootstrapping");
            let url = format!("{}{}/keyRings?keyRingId={}", base, key_ring_parent, SHARED_KEY_RING);
            self.client
                .send_request(SendRequestOptions::post(url, json!({})))
                .await
                .map_err(|e| GcpError::Bootstrap("KMS key ring".to_string(), e.to_string()))?;
        }

        if self
            .get_optional(&format!("{}{}", base, crypto_key), "shared crypto key")
            .await?
            .is_none()
        {
            tracing::info!(crypto_key = %crypto_key, "crypto key not found, bootstrapping");
            let url = format!(
                "{}{}/cryptoKeys?cryptoKeyId={}",
                base,
                key_ring,
                purpose.shared_key_name()
            );
            let body = json!({
                "purpose": purpose.as_str(),
                "versionTemplate": {"algorithm": purpose.algorithm()},
            });
            self.client
                .send_request(
                    SendRequestOptions::post(url, body)
                        .with_predicate(crate::retry::is_crypto_key_version_pending_generation),
                )
                .await
                .map_err(|e| GcpError::Bootstrap("KMS crypto key".to_string(), e.to_string()))?;
        }

        self.remember(crypto_key.clone(), crypto_key.clone()).await;
        Ok(BootstrappedKms {
            key_ring,
            crypto_key,
        })
    }

    /// Get or create a project under `org`, undelete it if pending deletion,
    /// link it to `billing_account` when given, and enable `services` that are
    /// not on yet.
    ///
    /// A 403 on lookup means the project does not exist or is not visible to
    /// the caller yet; either way the create path runs.
    pub async fn ensure_project(
        &self,
        project_id: &str,
        org: &str,
        billing_account: Option<&str>,
        services: &[&str],
    ) -> crate::Result<Project> {
        let base = self.client.base_path("resourcemanager")?;
        let url = format!("{}projects/{}", base, project_id);
        let description = format!("project {:?}", project_id);

        let existing = match self.client.send_request(SendRequestOptions::get(&url)).await {
            Ok(value) => Some(value),
            Err(err) if err.has_status(403) || err.is_not_found() => None,
            Err(err) => return Err(err),
        };

        if existing.is_none() {
            tracing::info!(project = %project_id, "project not found, bootstrapping");
            let body = json!({
                "projectId": project_id,
                "name": BOOTSTRAPPED_PROJECT_NAME,
                "parent": {"type": "organization", "id": org},
            });
            let op = self
                .client
                .send_request(SendRequestOptions::post(format!("{}projects", base), body))
                .await
                .map_err(|e| GcpError::Bootstrap(description.clone(), e.to_string()))?;
            self.client
                .wait_operation(
                    OperationKind::Common,
                    "resourcemanager",
                    op,
                    "creating project",
                    PROJECT_TIMEOUT,
                )
                .await
                .map_err(|e| GcpError::Bootstrap(description.clone(), e.to_string()))?;
        }

        let value = self.client.send_request(SendRequestOptions::get(&url)).await?;
        let project: Project = serde_json::from_value(value)
            .map_err(|e| GcpError::Decode(description.clone(), e.to_string()))?;

        if project.lifecycle_state == "DELETE_REQUESTED" {
            tracing::info!(project = %project_id, "undeleting bootstrapped project");
            self.client
                .send_request(SendRequestOptions::post(
                    format!("{}projects/{}:undelete", base, project_id),
                    json!({}),
                ))
                .await?;
        }

        if let Some(account) = billing_account.filter(|a| !a.is_empty()) {
            self.link_billing(project_id, account).await?;
        }
        if !services.is_empty() {
            self.enable_services(project_id, services).await?;
        }
        Ok(project)
    }

    /// Point the project's billing at `account` (bare id, no `billingAccounts/`).
    async fn link_billing(&self, project_id: &str, account: &str) -> crate::Result<()> {
        let base = self.client.base_path("cloudbilling")?;
        let url = format!("{}projects/{}/billingInfo", base, project_id);

        let mut info = self
            .client
            .send_request(SendRequestOptions::get(&url).with_retry_timeout(BILLING_READ_TIMEOUT))
            .await
            .map_err(|e| GcpError::Bootstrap(format!("billing info for {:?}", project_id), e.to_string()))?;
        let current = info
            .get("billingAccountName")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if current.strip_prefix(BILLING_ACCOUNT_PREFIX).unwrap_or(current) == account {
            tracing::debug!(project = %project_id, account, "billing account already linked");
            return Ok(());
        }

        tracing::info!(project = %project_id, from = current, to = account, "linking billing account");
        let linked = format!("{}{}", BILLING_ACCOUNT_PREFIX, account);
        match info.as_object_mut() {
            Some(fields) => {
                fields.insert("billingAccountName".to_string(), Value::String(linked));
            }
            None => info = json!({"billingAccountName": linked}),
        }
        self.client
            .send_request(SendRequestOptions::put(&url, info).with_retry_timeout(BILLING_UPDATE_TIMEOUT))
            .await
            .map_err(|e| {
                GcpError::Bootstrap(
                    format!("billing account {:?} for project {:?}", account, project_id),
                    e.to_string(),
                )
            })?;
        Ok(())
    }

    async fn enabled_services(&self, project_id: &str) -> crate::Result<Vec<String>> {
        let base = self.client.base_path("serviceusage")?;
        let mut enabled = Vec::new();
        let mut page_token: Option<String> = None;
        let collection = format!("{}projects/{}/services", base, project_id);
        loop {
            let mut url = reqwest::Url::parse(&collection)
                .map_err(|e| GcpError::InvalidConfig("endpoints.serviceusage".to_string(), e.to_string()))?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("filter", "state:ENABLED").append_pair("pageSize", "200");
                if let Some(token) = &page_token {
                    query.append_pair("pageToken", token);
                }
            }
            let page = self.client.send_request(SendRequestOptions::get(url.as_str())).await?;
            if let Some(services) = page.get("services").and_then(Value::as_array) {
                enabled.extend(
                    services
                        .iter()
                        .filter_map(|s| s.pointer("/config/name").and_then(Value::as_str))
                        .map(str::to_string),
                );
            }
            page_token = page
                .get("nextPageToken")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .map(str::to_string);
            if page_token.is_none() {
                return Ok(enabled);
            }
        }
    }

    async fn enable_services(&self, project_id: &str, services: &[&str]) -> crate::Result<()> {
        let enabled = self.enabled_services(project_id).await?;
        let missing: Vec<&str> = services
            .iter()
            .copied()
            .filter(|s| !enabled.iter().any(|e| e.as_str() == *s))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        tracing::info!(project = %project_id, services = ?missing, "enabling services");
        let base = self.client.base_path("serviceusage")?;
        let op = self
            .client
            .send_request(
                SendRequestOptions::post(
                    format!("{}projects/{}/services:batchEnable", base, project_id),
                    json!({"serviceIds": missing}),
                )
                .with_predicate(crate::retry::is_service_being_activated),
            )
            .await?;
        let activity = format!("enable project {:?} services: {:?}", project_id, missing);
        self.client
            .wait_operation(OperationKind::Common, "serviceusage", op, &activity, SERVICES_TIMEOUT)
            .await?;
        Ok(())
    }
}
