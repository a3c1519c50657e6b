use crate::endpoint::SignedEndpoint;
use crate::error::{CbcError, ErrorKind, Result};
use crate::paths;
use crate::sigv4::{Credentials, Signer};
use crate::store::{
    AwsConfigStore, ComplianceStore, FsObjectStore, LocalComplianceStore, ObjectStore,
    S3ObjectStore, UrlReader,
};
use crate::tasks::{InputMode, OrderingTimestamp};
use crate::workflow::definition::DefinitionParams;
use crate::workflow::engine::{EngineSettings, Services};
use crate::workflow::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// EndpointConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Full invoke URL of the evaluation endpoint.
    #[serde(default)]
    pub invoke_url: String,
    /// `Context.EnvironmentEvaluation` sent with every request.
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default)]
    pub input_mode: InputMode,
}

fn default_environment() -> String {
    "Prod".to_string()
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            invoke_url: String::new(),
            environment: default_environment(),
            input_mode: InputMode::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// StorageConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObjectBackend {
    S3 {
        /// Custom endpoint for S3-compatible servers.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },
    /// `{dir}/{bucket}/{key}` on the local filesystem.
    Local {
        #[serde(default = "default_objects_dir")]
        dir: PathBuf,
    },
}

fn default_objects_dir() -> PathBuf {
    PathBuf::from(paths::OBJECTS_DIR)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_raw_input_bucket")]
    pub raw_input_bucket: String,
    /// Bucket the evaluator is expected to write reports to. Informational.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results_bucket: Option<String>,
    #[serde(default = "default_object_backend")]
    pub backend: ObjectBackend,
}

fn default_raw_input_bucket() -> String {
    "cbc-raw-inputs".to_string()
}

fn default_object_backend() -> ObjectBackend {
    ObjectBackend::S3 { endpoint: None }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            raw_input_bucket: default_raw_input_bucket(),
            results_bucket: None,
            backend: default_object_backend(),
        }
    }
}

// ---------------------------------------------------------------------------
// ComplianceConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ComplianceBackend {
    AwsConfig {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },
    Local {
        #[serde(default = "default_compliance_file")]
        path: PathBuf,
    },
}

fn default_compliance_file() -> PathBuf {
    PathBuf::from(paths::COMPLIANCE_FILE)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceConfig {
    #[serde(default = "default_compliance_backend")]
    pub backend: ComplianceBackend,
}

fn default_compliance_backend() -> ComplianceBackend {
    ComplianceBackend::AwsConfig { endpoint: None }
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            backend: default_compliance_backend(),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    pub interval_ms: u64,
    pub backoff_rate: f64,
    pub max_attempts: u32,
}

impl RetryConfig {
    fn policy(&self, kind: ErrorKind) -> RetryPolicy {
        RetryPolicy::on(kind, self.interval_ms, self.backoff_rate, self.max_attempts)
    }
}

fn default_poll_retry() -> RetryConfig {
    RetryConfig {
        interval_ms: 1000,
        backoff_rate: 2.0,
        max_attempts: 8,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_poll_retry")]
    pub poll_retry: RetryConfig,
    /// Re-query the final compliance status on mismatch before failing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_retry: Option<RetryConfig>,
    #[serde(default)]
    pub ordering_timestamp: OrderingTimestamp,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_recovery_max_age_secs")]
    pub recovery_max_age_secs: u64,
    /// Delete finished runs older than this many days. Unset keeps every
    /// run as an audit trail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_days: Option<u32>,
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_recovery_max_age_secs() -> u64 {
    300
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            poll_retry: default_poll_retry(),
            verify_retry: None,
            ordering_timestamp: OrderingTimestamp::default(),
            tick_interval_ms: default_tick_interval_ms(),
            recovery_max_age_secs: default_recovery_max_age_secs(),
            retention_days: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_orchestrator_id")]
    pub orchestrator_id: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub compliance: ComplianceConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
}

fn default_version() -> u32 {
    1
}

fn default_orchestrator_id() -> String {
    "cbc".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            orchestrator_id: default_orchestrator_id(),
            region: default_region(),
            endpoint: EndpointConfig::default(),
            storage: StorageConfig::default(),
            compliance: ComplianceConfig::default(),
            workflow: WorkflowConfig::default(),
        }
    }
}

impl Config {
    /// A config that keeps objects and compliance records under `.cbc/`.
    pub fn local(invoke_url: impl Into<String>) -> Self {
        let mut cfg = Self::default();
        cfg.endpoint.invoke_url = invoke_url.into();
        cfg.storage.backend = ObjectBackend::Local {
            dir: default_objects_dir(),
        };
        cfg.compliance.backend = ComplianceBackend::Local {
            path: default_compliance_file(),
        };
        cfg
    }

    /// Read `.cbc/config.yaml` and apply environment overrides.
    pub fn load(root: &Path) -> Result<Self> {
        let mut cfg = Self::load_file(root)?;
        cfg.apply_overrides(|name| std::env::var(name).ok());
        Ok(cfg)
    }

    /// Read `.cbc/config.yaml` as written, without environment overrides.
    pub fn load_file(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(CbcError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    /// Overrides: `CBC_INVOKE_URL`, `CBC_RAW_INPUT_BUCKET`,
    /// `CBC_RESULTS_BUCKET`, `CBC_ORCHESTRATOR_ID`, `AWS_REGION`.
    /// Empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(v) = get("CBC_INVOKE_URL") {
            self.endpoint.invoke_url = v;
        }
        if let Some(v) = get("CBC_RAW_INPUT_BUCKET") {
            self.storage.raw_input_bucket = v;
        }
        if let Some(v) = get("CBC_RESULTS_BUCKET") {
            self.storage.results_bucket = Some(v);
        }
        if let Some(v) = get("CBC_ORCHESTRATOR_ID") {
            self.orchestrator_id = v;
        }
        if let Some(v) = get("AWS_REGION") {
            self.region = v;
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.workflow.tick_interval_ms.max(1))
    }

    pub fn recovery_max_age(&self) -> Duration {
        Duration::from_secs(self.workflow.recovery_max_age_secs)
    }

    /// How long finished runs are kept, if they are pruned at all.
    pub fn retention(&self) -> Option<Duration> {
        self.workflow
            .retention_days
            .map(|days| Duration::from_secs(u64::from(days) * 24 * 60 * 60))
    }

    // -----------------------------------------------------------------------
    // Wiring
    // -----------------------------------------------------------------------

    pub fn definition_params(&self) -> DefinitionParams {
        DefinitionParams {
            poll_retry: self.workflow.poll_retry.policy(ErrorKind::ObjectDoesNotExist),
            verify_retry: self
                .workflow
                .verify_retry
                .as_ref()
                .map(|r| r.policy(ErrorKind::ComplianceMismatch)),
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            orchestrator_id: self.orchestrator_id.clone(),
            raw_input_bucket: self.storage.raw_input_bucket.clone(),
            results_bucket: self.storage.results_bucket.clone(),
            environment: self.endpoint.environment.clone(),
            input_mode: self.endpoint.input_mode,
            ordering_timestamp: self.workflow.ordering_timestamp,
        }
    }

    /// Build the service clients. Signed clients read credentials from the
    /// environment; local backends need none.
    pub fn services(&self, root: &Path) -> Result<Services> {
        if self.endpoint.invoke_url.trim().is_empty() {
            return Err(CbcError::InvalidConfig(
                "endpoint.invoke_url is not configured (or set CBC_INVOKE_URL)".into(),
            ));
        }
        let credentials = Credentials::from_env()?;
        let signer = |service: &str| Signer::new(credentials.clone(), self.region.clone(), service);

        let objects: Arc<dyn ObjectStore> = match &self.storage.backend {
            ObjectBackend::S3 { endpoint } => Arc::new(S3ObjectStore::new(
                signer("s3"),
                &self.region,
                endpoint.as_deref(),
            )?),
            ObjectBackend::Local { dir } => Arc::new(FsObjectStore::new(paths::resolve(root, dir))),
        };
        let compliance: Arc<dyn ComplianceStore> = match &self.compliance.backend {
            ComplianceBackend::AwsConfig { endpoint } => Arc::new(AwsConfigStore::new(
                signer("config"),
                &self.region,
                endpoint.as_deref(),
            )?),
            ComplianceBackend::Local { path } => {
                Arc::new(LocalComplianceStore::open(paths::resolve(root, path))?)
            }
        };
        let endpoint = Arc::new(SignedEndpoint::new(
            &self.endpoint.invoke_url,
            signer("execute-api"),
        )?);

        Ok(Services {
            objects,
            compliance,
            endpoint,
            urls: Some(Arc::new(UrlReader::new()?)),
        })
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut push = |level, message: String| warnings.push(ConfigWarning { level, message });

        // 1. Endpoint
        let url = self.endpoint.invoke_url.trim();
        if url.is_empty() {
            push(WarnLevel::Error, "endpoint.invoke_url is empty".into());
        } else if !url.starts_with("https://") {
            push(
                WarnLevel::Warning,
                format!("endpoint.invoke_url '{url}' is not https"),
            );
        }
        if self.endpoint.environment.trim().is_empty() {
            push(WarnLevel::Warning, "endpoint.environment is empty".into());
        }

        // 2. Storage and region
        if self.storage.raw_input_bucket.trim().is_empty() {
            push(WarnLevel::Error, "storage.raw_input_bucket is empty".into());
        }
        if self.region.trim().is_empty() {
            push(WarnLevel::Error, "region is empty".into());
        }

        // 3. Retry budgets
        let poll = &self.workflow.poll_retry;
        if poll.max_attempts == 0 {
            push(
                WarnLevel::Warning,
                "workflow.poll_retry.max_attempts is 0: a report that is not ready at the first check fails the run".into(),
            );
        }
        for (name, retry) in [("poll_retry", Some(poll)), ("verify_retry", self.workflow.verify_retry.as_ref())] {
            let Some(retry) = retry else { continue };
            if retry.backoff_rate < 1.0 {
                push(
                    WarnLevel::Error,
                    format!("workflow.{name}.backoff_rate {} is below 1.0", retry.backoff_rate),
                );
            }
            if retry.max_attempts > 12 {
                push(
                    WarnLevel::Warning,
                    format!(
                        "workflow.{name}.max_attempts={} (>12 means hours of waiting)",
                        retry.max_attempts
                    ),
                );
            }
        }

        if self.workflow.retention_days == Some(0) {
            push(
                WarnLevel::Warning,
                "workflow.retention_days is 0: finished runs are deleted at the next prune".into(),
            );
        }

        // 4. Ordering timestamp
        if self.workflow.ordering_timestamp == OrderingTimestamp::Fixed {
            push(
                WarnLevel::Warning,
                "workflow.ordering_timestamp is 'fixed' (2015-01-01): every evaluation gets the same \
                 timestamp, so a later verdict may not supersede an earlier one"
                    .into(),
            );
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
