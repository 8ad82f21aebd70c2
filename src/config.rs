//! Provider configuration: TOML deserialization, env-var defaults and validation.

use crate::error::GcpError;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

const PROJECT_ENV_VARS: &[&str] = &[
    "GOOGLE_PROJECT",
    "GOOGLE_CLOUD_PROJECT",
    "GCLOUD_PROJECT",
    "CLOUDSDK_CORE_PROJECT",
];
const REGION_ENV_VARS: &[&str] = &["GOOGLE_REGION", "GCLOUD_REGION", "CLOUDSDK_COMPUTE_REGION"];
const ZONE_ENV_VARS: &[&str] = &["GOOGLE_ZONE", "GCLOUD_ZONE", "CLOUDSDK_COMPUTE_ZONE"];
const BILLING_PROJECT_ENV_VARS: &[&str] = &["GOOGLE_BILLING_PROJECT"];
const REQUEST_REASON_ENV_VARS: &[&str] = &["CLOUDSDK_CORE_REQUEST_REASON"];
const ACCESS_TOKEN_ENV_VAR: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

/// Default REST base paths, one per service family. All end with `/`.
const DEFAULT_BASE_PATHS: &[(&str, &str)] = &[
    ("compute", "https://compute.googleapis.com/compute/v1/"),
    ("sql", "https://sqladmin.googleapis.com/sql/v1beta4/"),
    ("resourcemanager", "https://cloudresourcemanager.googleapis.com/v1/"),
    ("resourcemanager_v3", "https://cloudresourcemanager.googleapis.com/v3/"),
    ("serviceusage", "https://serviceusage.googleapis.com/v1/"),
    ("kms", "https://cloudkms.googleapis.com/v1/"),
    ("iam", "https://iam.googleapis.com/v1/"),
    ("privateca", "https://privateca.googleapis.com/v1/"),
    ("composer", "https://composer.googleapis.com/v1/"),
    ("cloudbilling", "https://cloudbilling.googleapis.com/v1/"),
];

/// Strip an env var reference to its variable name.
///
/// Accepts `${VAR_NAME}` syntax only. Returns `None` if the value is not a
/// valid env-var reference.
pub fn parse_env_ref(value: &str) -> Option<&str> {
    value.strip_prefix("${").and_then(|s| s.strip_suffix('}'))
}

/// Env var that overrides the base path of `service`, e.g.
/// `resourcemanager_v3` -> `GOOGLE_RESOURCEMANAGER_V3_CUSTOM_ENDPOINT`.
pub fn custom_endpoint_env_var(service: &str) -> String {
    format!("GOOGLE_{}_CUSTOM_ENDPOINT", service.to_ascii_uppercase())
}

/// Top-level provider configuration, parsed from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub project: Option<String>,
    pub region: Option<String>,
    pub zone: Option<String>,
    /// Project billed for quota when `user_project_override` is set.
    pub billing_project: Option<String>,
    #[serde(default)]
    pub user_project_override: bool,
    pub request_reason: Option<String>,
    pub user_agent: Option<String>,
    /// Must be a `${VAR}` reference, resolved when the client is built.
    pub access_token: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub polling: PollingConfig,
    /// Custom base URL per service family.
    #[serde(default)]
    pub endpoints: HashMap<String, String>,
}

/// Poll-loop settings shared by every operation wait.
#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_poll_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_transient_retries")]
    pub max_transient_retries: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            project: None,
            region: None,
            zone: None,
            billing_project: None,
            user_project_override: false,
            request_reason: None,
            user_agent: None,
            access_token: None,
            request_timeout_secs: default_request_timeout_secs(),
            polling: PollingConfig::default(),
            endpoints: HashMap::new(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval_secs(),
            timeout_secs: default_poll_timeout_secs(),
            max_transient_retries: default_max_transient_retries(),
        }
    }
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_poll_timeout_secs() -> u64 {
    20 * 60
}

fn default_max_transient_retries() -> u32 {
    10
}

fn first_set(lookup: &impl Fn(&str) -> Option<String>, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| lookup(name).filter(|v| !v.is_empty()))
}

impl ProviderConfig {
    /// Load a config file from disk. Does not apply env defaults or validate.
    pub async fn load(path: &Path) -> crate::Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            GcpError::InvalidConfig(path.display().to_string(), format!("failed to read: {}", e))
        })?;
        toml::from_str(&content).map_err(|e| {
            GcpError::InvalidConfig(path.display().to_string(), format!("failed to parse: {}", e))
        })
    }

    /// Fill unset fields from the process environment.
    pub fn apply_env_defaults(&mut self) {
        self.apply_env_defaults_with(|name| std::env::var(name).ok());
    }

    /// Fill unset fields using `lookup` as the environment.
    ///
    /// Values already present in the config win over the environment.
    pub fn apply_env_defaults_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.project.is_none() {
            self.project = first_set(&lookup, PROJECT_ENV_VARS);
        }
        if self.region.is_none() {
            self.region = first_set(&lookup, REGION_ENV_VARS);
        }
        if self.zone.is_none() {
            self.zone = first_set(&lookup, ZONE_ENV_VARS);
        }
        if self.billing_project.is_none() {
            self.billing_project = first_set(&lookup, BILLING_PROJECT_ENV_VARS);
        }
        if self.request_reason.is_none() {
            self.request_reason = first_set(&lookup, REQUEST_REASON_ENV_VARS);
        }
        if self.access_token.is_none() && lookup(ACCESS_TOKEN_ENV_VAR).is_some() {
            self.access_token = Some(format!("${{{}}}", ACCESS_TOKEN_ENV_VAR));
        }
        for (service, _) in DEFAULT_BASE_PATHS {
            if self.endpoints.contains_key(*service) {
                continue;
            }
            if let Some(url) = first_set(&lookup, &[custom_endpoint_env_var(service).as_str()]) {
                self.endpoints.insert(service.to_string(), url);
            }
        }
    }

    /// Resolve the `${VAR}` access token reference against the environment.
    pub fn resolve_access_token(&self) -> Option<String> {
        self.resolve_access_token_with(|name| std::env::var(name).ok())
    }

    pub fn resolve_access_token_with(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Option<String> {
        let reference = self.access_token.as_deref()?;
        parse_env_ref(reference)
            .and_then(lookup)
            .filter(|token| !token.is_empty())
    }

    /// Base path for a service family: custom endpoint if set, else the default.
    pub fn base_path(&self, service: &str) -> crate::Result<String> {
        if let Some(custom) = self.endpoints.get(service) {
            return Ok(custom.clone());
        }
        DEFAULT_BASE_PATHS
            .iter()
            .find(|(name, _)| *name == service)
            .map(|(_, url)| url.to_string())
            .ok_or_else(|| {
                GcpError::InvalidConfig(
                    format!("endpoints.{}", service),
                    "unknown service and no custom endpoint configured".to_string(),
                )
            })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.polling.interval_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.polling.timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Project to bill quota against, when user project override is on.
    pub fn quota_project(&self) -> Option<&str> {
        if !self.user_project_override {
            return None;
        }
        self.billing_project.as_deref().or(self.project.as_deref())
    }

    /// The configured project, or an error naming the env vars that set it.
    pub fn require_project(&self) -> crate::Result<&str> {
        self.project.as_deref().ok_or_else(|| {
            GcpError::InvalidConfig(
                "project".to_string(),
                format!("not set; use one of {}", PROJECT_ENV_VARS.join(", ")),
            )
        })
    }

    /// Validate the config, failing fast before any request is sent.
    pub fn validate(&self) -> crate::Result<()> {
        // 1. Secrets only by reference
        if let Some(token) = &self.access_token {
            if parse_env_ref(token).is_none() {
                return Err(GcpError::InvalidConfig(
                    "access_token".to_string(),
                    format!("must be a ${{VAR}} reference, got '{}'", token),
                ));
            }
        }

        // 2. Poll loop bounds
        if self.polling.interval_secs == 0 {
            return Err(GcpError::InvalidConfig(
                "polling.interval_secs".to_string(),
                "must be greater than zero".to_string(),
            ));
        }
        if self.polling.timeout_secs < self.polling.interval_secs {
            return Err(GcpError::InvalidConfig(
                "polling.timeout_secs".to_string(),
                format!(
                    "timeout {}s is shorter than the poll interval {}s",
                    self.polling.timeout_secs, self.polling.interval_secs
                ),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(GcpError::InvalidConfig(
                "request_timeout_secs".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        // 3. Custom endpoints are joined with relative paths, so they must end in '/'
        for (service, url) in &self.endpoints {
            if !(url.starts_with("https://") || url.starts_with("http://")) || !url.ends_with('/')
            {
                return Err(GcpError::InvalidConfig(
                    format!("endpoints.{}", service),
                    format!("'{}' must be an http(s) URL ending in '/'", url),
                ));
            }
        }

        // 4. Zone belongs to region
        if let (Some(region), Some(zone)) = (&self.region, &self.zone) {
            if !zone.starts_with(&format!("{}-", region)) {
                return Err(GcpError::InvalidConfig(
                    "zone".to_string(),
                    format!("zone '{}' is not in region '{}'", zone, region),
                ));
            }
        }

        Ok(())
    }
}
