//! Orchestrator configuration.
//!
//! Defaults reproduce the deployment constants of the ctDNA workflow. A JSON
//! document may override any field; environment variables are applied last.

use crate::errors::ConfigurationError;
use crate::events::PublishFormat;
use crate::pipeline::RetryConfig;
use crate::registry::Capability;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

/// Hierarchical parameter store keys for one workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterPaths {
    /// Root path, ending with `/`.
    pub prefix: String,
}

impl ParameterPaths {
    /// Parameter root for the given workflow.
    #[must_use]
    pub fn for_workflow(workflow_name: &str) -> Self {
        Self {
            prefix: format!("/orcabus/workflows/{workflow_name}/"),
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}{name}", self.prefix)
    }

    /// Workflow name parameter.
    #[must_use]
    pub fn workflow_name(&self) -> String {
        self.key("workflow-name")
    }

    /// Default workflow version parameter.
    #[must_use]
    pub fn default_workflow_version(&self) -> String {
        self.key("default-workflow-version")
    }

    /// Payload version parameter.
    #[must_use]
    pub fn payload_version(&self) -> String {
        self.key("payload-version")
    }

    /// Pipeline id for a workflow version.
    #[must_use]
    pub fn pipeline_id(&self, workflow_version: &str) -> String {
        self.key(&format!("pipeline-ids-by-workflow-version/{workflow_version}"))
    }

    /// Analysis project id parameter.
    #[must_use]
    pub fn project_id(&self) -> String {
        self.key("icav2-project-id")
    }

    /// Logs prefix parameter.
    #[must_use]
    pub fn logs_prefix(&self) -> String {
        self.key("logs-prefix")
    }

    /// Output prefix parameter.
    #[must_use]
    pub fn output_prefix(&self) -> String {
        self.key("output-prefix")
    }

    /// Cache prefix parameter.
    #[must_use]
    pub fn cache_prefix(&self) -> String {
        self.key("cache-prefix")
    }
}

/// Resource limits of the bounded post-processing container task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerTaskConfig {
    /// vCPUs granted to the task.
    #[serde(default = "default_task_cpu")]
    pub cpu: u32,
    /// Memory in MiB.
    #[serde(default = "default_task_memory_mib")]
    pub memory_mib: u32,
    /// Hard wall-clock timeout.
    #[serde(default = "default_task_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Launch retry policy. Logical failures are never retried.
    #[serde(default)]
    pub launch_retry: RetryConfig,
}

const fn default_task_cpu() -> u32 {
    1
}

const fn default_task_memory_mib() -> u32 {
    2048
}

const fn default_task_timeout_seconds() -> u64 {
    3600
}

impl Default for ContainerTaskConfig {
    fn default() -> Self {
        Self {
            cpu: default_task_cpu(),
            memory_mib: default_task_memory_mib(),
            timeout_seconds: default_task_timeout_seconds(),
            launch_retry: RetryConfig::default(),
        }
    }
}

impl ContainerTaskConfig {
    /// Hard timeout as a `Duration`.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Sets the hard timeout.
    #[must_use]
    pub const fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Sets the launch retry policy.
    #[must_use]
    pub fn with_launch_retry(mut self, retry: RetryConfig) -> Self {
        self.launch_retry = retry;
        self
    }
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Workflow name.
    #[serde(default = "default_workflow_name")]
    pub workflow_name: String,
    /// Version used when an event carries none.
    #[serde(default = "default_workflow_version")]
    pub default_workflow_version: String,
    /// Payload version stamped on enriched payloads.
    #[serde(default = "default_payload_version")]
    pub default_payload_version: String,
    /// Payload versions accepted on inbound events.
    #[serde(default = "default_supported_payload_versions")]
    pub supported_payload_versions: Vec<String>,
    /// Source of events emitted by this service.
    #[serde(default = "default_event_source")]
    pub event_source: String,
    /// Source of workflow-manager events.
    #[serde(default = "default_workflow_manager_source")]
    pub workflow_manager_source: String,
    /// Source of external engine events.
    #[serde(default = "default_icav2_wes_source")]
    pub icav2_wes_source: String,
    /// Bus name.
    #[serde(default = "default_event_bus_name")]
    pub event_bus_name: String,
    /// Schema the draft payload is validated against.
    #[serde(default = "default_schema_name")]
    pub draft_schema_name: String,
    /// Per-step invocation timeout.
    #[serde(default = "default_step_timeout_seconds")]
    pub step_timeout_seconds: u64,
    /// Retry policy for transient step failures.
    #[serde(default)]
    pub step_retry: RetryConfig,
    /// Container task limits.
    #[serde(default)]
    pub container_task: ContainerTaskConfig,
    /// Retention of delivery ledger entries.
    #[serde(default = "default_ledger_ttl_seconds")]
    pub ledger_ttl_seconds: u64,
    /// Capabilities the deployment grants.
    #[serde(default = "default_granted_capabilities")]
    pub granted_capabilities: BTreeSet<Capability>,
    /// Parameter store layout.
    #[serde(default)]
    pub parameter_paths: Option<ParameterPaths>,
    /// Fallback pipeline ids keyed by workflow version.
    #[serde(default = "default_pipeline_ids")]
    pub pipeline_ids_by_version: BTreeMap<String, String>,
    /// Lifecycle detail format(s) to publish.
    #[serde(default)]
    pub publish_format: PublishFormat,
}

fn default_workflow_name() -> String {
    "dragen-tso500-ctdna".to_string()
}

fn default_workflow_version() -> String {
    "2.6.0".to_string()
}

fn default_payload_version() -> String {
    "2025.07.29".to_string()
}

fn default_supported_payload_versions() -> Vec<String> {
    vec![default_payload_version()]
}

fn default_event_source() -> String {
    "orcabus.dragentso500ctdna".to_string()
}

fn default_workflow_manager_source() -> String {
    "orcabus.workflowmanager".to_string()
}

fn default_icav2_wes_source() -> String {
    "orcabus.icav2wesmanager".to_string()
}

fn default_event_bus_name() -> String {
    "OrcaBusMain".to_string()
}

fn default_schema_name() -> String {
    "completeDataDraft".to_string()
}

const fn default_step_timeout_seconds() -> u64 {
    60
}

const fn default_ledger_ttl_seconds() -> u64 {
    7 * 24 * 60 * 60
}

fn default_granted_capabilities() -> BTreeSet<Capability> {
    Capability::ALL.into_iter().collect()
}

fn default_pipeline_ids() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("2.6.0".to_string(), "63dc920c-adde-4891-8aae-84a6b9569f37".to_string()),
        ("2.6.1".to_string(), "67675369-6129-4b21-918c-eceb3dced88d".to_string()),
    ])
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workflow_name: default_workflow_name(),
            default_workflow_version: default_workflow_version(),
            default_payload_version: default_payload_version(),
            supported_payload_versions: default_supported_payload_versions(),
            event_source: default_event_source(),
            workflow_manager_source: default_workflow_manager_source(),
            icav2_wes_source: default_icav2_wes_source(),
            event_bus_name: default_event_bus_name(),
            draft_schema_name: default_schema_name(),
            step_timeout_seconds: default_step_timeout_seconds(),
            step_retry: RetryConfig::default(),
            container_task: ContainerTaskConfig::default(),
            ledger_ttl_seconds: default_ledger_ttl_seconds(),
            granted_capabilities: default_granted_capabilities(),
            parameter_paths: None,
            pipeline_ids_by_version: default_pipeline_ids(),
            publish_format: PublishFormat::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document; absent fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `CONFIG-007-INVALID_CONFIG` on malformed JSON.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigurationError> {
        serde_json::from_str(json)
            .map_err(|e| ConfigurationError::invalid_config(format!("malformed configuration: {e}")))
    }

    /// Reads a JSON document from disk.
    ///
    /// # Errors
    ///
    /// Returns `CONFIG-007-INVALID_CONFIG` if the file cannot be read or parsed.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ConfigurationError::invalid_config(format!("cannot read '{}': {e}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }

    /// Applies overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `CONFIG-007-INVALID_CONFIG` if a numeric override does not parse.
    pub fn apply_env_overrides(self) -> Result<Self, ConfigurationError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary lookup.
    ///
    /// # Errors
    ///
    /// Returns `CONFIG-007-INVALID_CONFIG` if a numeric override does not parse.
    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("WORKFLOW_NAME") {
            self.workflow_name = v;
        }
        if let Some(v) = lookup("DEFAULT_WORKFLOW_VERSION") {
            self.default_workflow_version = v;
        }
        if let Some(v) = lookup("DEFAULT_PAYLOAD_VERSION") {
            if !self.supported_payload_versions.contains(&v) {
                self.supported_payload_versions.push(v.clone());
            }
            self.default_payload_version = v;
        }
        if let Some(v) = lookup("EVENT_BUS_NAME") {
            self.event_bus_name = v;
        }
        if let Some(v) = lookup("PUBLISH_FORMAT") {
            self.publish_format = PublishFormat::parse(&v).ok_or_else(|| {
                ConfigurationError::invalid_config(format!("PUBLISH_FORMAT '{v}' is not current, legacy or dual"))
            })?;
        }
        if let Some(v) = lookup("STEP_TIMEOUT_SECONDS") {
            self.step_timeout_seconds = v.parse().map_err(|_| {
                ConfigurationError::invalid_config(format!("STEP_TIMEOUT_SECONDS '{v}' is not a number"))
            })?;
        }
        Ok(self)
    }

    /// Sets the workflow name.
    #[must_use]
    pub fn with_workflow_name(mut self, name: impl Into<String>) -> Self {
        self.workflow_name = name.into();
        self
    }

    /// Sets the step timeout.
    #[must_use]
    pub const fn with_step_timeout_seconds(mut self, seconds: u64) -> Self {
        self.step_timeout_seconds = seconds;
        self
    }

    /// Sets the step retry policy.
    #[must_use]
    pub fn with_step_retry(mut self, retry: RetryConfig) -> Self {
        self.step_retry = retry;
        self
    }

    /// Sets the container task config.
    #[must_use]
    pub fn with_container_task(mut self, task: ContainerTaskConfig) -> Self {
        self.container_task = task;
        self
    }

    /// Sets the granted capabilities.
    #[must_use]
    pub fn with_granted_capabilities(mut self, caps: impl IntoIterator<Item = Capability>) -> Self {
        self.granted_capabilities = caps.into_iter().collect();
        self
    }

    /// Sets the lifecycle publish format.
    #[must_use]
    pub const fn with_publish_format(mut self, format: PublishFormat) -> Self {
        self.publish_format = format;
        self
    }

    /// Step timeout as a `Duration`.
    #[must_use]
    pub const fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_seconds)
    }

    /// Ledger retention as a `Duration`.
    #[must_use]
    pub const fn ledger_ttl(&self) -> Duration {
        Duration::from_secs(self.ledger_ttl_seconds)
    }

    /// Parameter layout, derived from the workflow name unless set.
    #[must_use]
    pub fn parameters(&self) -> ParameterPaths {
        self.parameter_paths
            .clone()
            .unwrap_or_else(|| ParameterPaths::for_workflow(&self.workflow_name))
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `CONFIG-007-INVALID_CONFIG` describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let named = [
            ("workflow_name", &self.workflow_name),
            ("default_workflow_version", &self.default_workflow_version),
            ("default_payload_version", &self.default_payload_version),
            ("event_source", &self.event_source),
            ("workflow_manager_source", &self.workflow_manager_source),
            ("icav2_wes_source", &self.icav2_wes_source),
            ("event_bus_name", &self.event_bus_name),
            ("draft_schema_name", &self.draft_schema_name),
        ];
        if let Some((field, _)) = named.iter().find(|(_, v)| v.trim().is_empty()) {
            return Err(ConfigurationError::invalid_config(format!("{field} must not be empty")));
        }
        if self.event_source == self.workflow_manager_source {
            return Err(ConfigurationError::invalid_config(
                "event_source must differ from workflow_manager_source",
            )
            .with_fix_hint("The two DRAFT stages are told apart by event source."));
        }
        if self.step_timeout_seconds == 0 || self.container_task.timeout_seconds == 0 {
            return Err(ConfigurationError::invalid_config("timeouts must be greater than zero"));
        }
        if self.step_retry.max_attempts == 0 || self.container_task.launch_retry.max_attempts == 0 {
            return Err(ConfigurationError::invalid_config("retry attempts must be at least one"));
        }
        if !self.supported_payload_versions.contains(&self.default_payload_version) {
            return Err(ConfigurationError::invalid_config(format!(
                "default payload version '{}' is not in supported_payload_versions",
                self.default_payload_version
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::codes;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_deployment() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.workflow_name, "dragen-tso500-ctdna");
        assert_eq!(config.default_workflow_version, "2.6.0");
        assert_eq!(config.event_bus_name, "OrcaBusMain");
        assert_eq!(config.step_timeout(), Duration::from_secs(60));
        assert_eq!(config.container_task.cpu, 1);
        assert_eq!(config.container_task.memory_mib, 2048);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parameter_paths() {
        let paths = OrchestratorConfig::default().parameters();
        assert_eq!(paths.project_id(), "/orcabus/workflows/dragen-tso500-ctdna/icav2-project-id");
        assert_eq!(
            paths.pipeline_id("2.6.1"),
            "/orcabus/workflows/dragen-tso500-ctdna/pipeline-ids-by-workflow-version/2.6.1"
        );
    }

    #[test]
    fn test_from_json_partial() {
        let config = OrchestratorConfig::from_json_str(
            r#"{"event_bus_name": "TestBus", "step_retry": {"max_attempts": 5}}"#,
        )
        .unwrap();
        assert_eq!(config.event_bus_name, "TestBus");
        assert_eq!(config.step_retry.max_attempts, 5);
        assert_eq!(config.workflow_name, "dragen-tso500-ctdna");
    }

    #[test]
    fn test_from_json_malformed() {
        let err = OrchestratorConfig::from_json_str("{").unwrap_err();
        assert_eq!(err.code(), codes::INVALID_CONFIG);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> =
            HashMap::from([("EVENT_BUS_NAME", "Other"), ("STEP_TIMEOUT_SECONDS", "90")]);
        let config = OrchestratorConfig::default()
            .apply_overrides(|k| env.get(k).map(ToString::to_string))
            .unwrap();
        assert_eq!(config.event_bus_name, "Other");
        assert_eq!(config.step_timeout_seconds, 90);

        let bad = OrchestratorConfig::default()
            .apply_overrides(|k| (k == "STEP_TIMEOUT_SECONDS").then(|| "soon".to_string()));
        assert!(bad.is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let err = OrchestratorConfig::default()
            .with_workflow_name(" ")
            .validate()
            .unwrap_err();
        assert_eq!(err.code(), codes::INVALID_CONFIG);

        assert!(OrchestratorConfig::default()
            .with_step_timeout_seconds(0)
            .validate()
            .is_err());
        assert!(OrchestratorConfig::default()
            .with_step_retry(RetryConfig::new().with_max_attempts(0))
            .validate()
            .is_err());
    }
}
