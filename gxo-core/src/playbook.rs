//! Playbook data model (spec §3): the validated, typed input to the DAG
//! Builder. YAML parsing is a thin `serde_yaml` layer — the semantic
//! validation (identifier shapes, register/name coupling, schema version
//! compatibility) lives in [`crate::dag`], which is where those checks
//! naturally compose with cycle detection.

use crate::error::{GxoError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::OnceLock;
use std::time::Duration;

/// Major schema version this engine supports. A playbook's
/// `schema_version` must share this major component.
pub const SUPPORTED_SCHEMA_MAJOR: u32 = 1;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Playbook {
    pub schema_version: String,
    /// Optional human-readable identifier, used as the `name` label on the
    /// playbook-level metrics series. Purely descriptive — the engine never
    /// uses it for dependency resolution or dedup.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub vars: Map<String, Value>,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub task_policy: Option<TaskPolicyDefaults>,
    #[serde(default)]
    pub channel_policy: Option<ChannelPolicyDefaults>,
    #[serde(default)]
    pub state_policy: Option<StatePolicyDefaults>,
}

impl Playbook {
    /// Parse a playbook from YAML bytes, then check the schema-version
    /// major component. Semantic validation beyond that is the DAG
    /// Builder's job.
    pub fn from_yaml(bytes: &[u8]) -> Result<Self> {
        let playbook: Playbook =
            serde_yaml::from_slice(bytes).map_err(|e| GxoError::Config(format!("invalid playbook: {e}")))?;
        playbook.check_schema_version()?;
        Ok(playbook)
    }

    fn check_schema_version(&self) -> Result<()> {
        let major: u32 = self
            .schema_version
            .split('.')
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                GxoError::Config(format!("malformed schema_version: {:?}", self.schema_version))
            })?;
        if major != SUPPORTED_SCHEMA_MAJOR {
            return Err(GxoError::Config(format!(
                "unsupported schema_version {:?}: engine supports major version {}",
                self.schema_version, SUPPORTED_SCHEMA_MAJOR
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Task {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    pub register: Option<String>,
    #[serde(default)]
    pub stream_inputs: Vec<String>,
    #[serde(default)]
    pub ignore_errors: bool,
    pub when: Option<String>,
    #[serde(rename = "loop")]
    pub loop_spec: Option<LoopSpec>,
    #[serde(default)]
    pub loop_control: LoopControl,
    #[serde(default)]
    pub retry: RetryConfig,
    pub timeout: Option<String>,
    #[serde(default)]
    pub state_policy: StatePolicyOverride,
}

impl Task {
    /// The stable identifier used throughout the DAG: the task's `name` if
    /// set, else `__task_idx_<N>` where `N` is its 0-based playbook
    /// position.
    pub fn internal_id(&self, idx: usize) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("__task_idx_{idx}"),
        }
    }

    pub fn effective_timeout(&self) -> Result<Duration> {
        match &self.timeout {
            Some(s) => parse_duration(s),
            None => Ok(Duration::ZERO),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum LoopSpec {
    /// A template string that resolves to a sequence or mapping.
    Template(String),
    /// A literal collection, iterated in order.
    Literal(Value),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoopControl {
    #[serde(default = "default_parallel")]
    pub parallel: usize,
    #[serde(default = "default_loop_var")]
    pub loop_var: String,
}

fn default_parallel() -> usize {
    1
}
fn default_loop_var() -> String {
    "item".to_string()
}

impl Default for LoopControl {
    fn default() -> Self {
        Self {
            parallel: default_parallel(),
            loop_var: default_loop_var(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_attempts")]
    pub attempts: usize,
    #[serde(default = "default_delay")]
    pub delay: String,
    pub max_delay: Option<String>,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default)]
    pub jitter: f64,
    #[serde(default = "default_true")]
    pub on_error: bool,
}

fn default_attempts() -> usize {
    1
}
fn default_delay() -> String {
    "1s".to_string()
}
fn default_backoff_factor() -> f64 {
    1.0
}
fn default_true() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            delay: default_delay(),
            max_delay: None,
            backoff_factor: default_backoff_factor(),
            jitter: 0.0,
            on_error: default_true(),
        }
    }
}

impl RetryConfig {
    /// Normalize into a [`crate::retry::RetryPolicy`], applying the
    /// clamping rules in spec §4.6 (attempts ≤0 → 1, backoff_factor <1 →
    /// 1, jitter clamped to [0,1], negative delay → 0).
    pub fn to_policy(&self) -> Result<crate::retry::RetryPolicy> {
        let delay = parse_duration(&self.delay)?;
        let max_delay = self.max_delay.as_deref().map(parse_duration).transpose()?;
        Ok(crate::retry::RetryPolicy {
            attempts: self.attempts.max(1),
            delay,
            max_delay,
            backoff_factor: self.backoff_factor.max(1.0),
            jitter: self.jitter.clamp(0.0, 1.0),
            on_error: self.on_error,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    DeepCopy,
    UnsafeDirectReference,
}

impl Default for AccessMode {
    fn default() -> Self {
        AccessMode::DeepCopy
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StatePolicyOverride {
    pub access_mode: Option<AccessMode>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StatePolicyDefaults {
    pub access_mode: Option<AccessMode>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TaskPolicyDefaults {
    pub retry: Option<RetryConfig>,
    pub timeout: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    Block,
    DropNew,
    DropOldest,
    Error,
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        OverflowPolicy::Block
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChannelPolicyDefaults {
    pub buffer_size: Option<usize>,
    pub overflow: Option<OverflowPolicy>,
}

/// Parse a Go-style duration string (`"500ms"`, `"1s"`, `"2m"`).
pub fn parse_duration(s: &str) -> Result<Duration> {
    humantime::parse_duration(s).map_err(|e| GxoError::Config(format!("invalid duration {s:?}: {e}")))
}

fn task_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static regex is valid"))
}

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex is valid"))
}

pub fn is_task_name(s: &str) -> bool {
    task_name_re().is_match(s)
}

pub fn is_identifier(s: &str) -> bool {
    identifier_re().is_match(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_playbook() {
        let yaml = r#"
schema_version: "1.0"
tasks:
  - name: task_a
    type: mock
    params:
      p1: hello
    register: task_a_output
"#;
        let pb = Playbook::from_yaml(yaml.as_bytes()).unwrap();
        assert_eq!(pb.tasks.len(), 1);
        assert_eq!(pb.tasks[0].name.as_deref(), Some("task_a"));
    }

    #[test]
    fn rejects_unsupported_major_version() {
        let yaml = r#"
schema_version: "2.0"
tasks: []
"#;
        let err = Playbook::from_yaml(yaml.as_bytes()).unwrap_err();
        assert!(matches!(err, GxoError::Config(_)));
    }

    #[test]
    fn internal_id_falls_back_to_index() {
        let task = Task {
            name: None,
            type_name: "mock".to_string(),
            params: Map::new(),
            register: None,
            stream_inputs: vec![],
            ignore_errors: false,
            when: None,
            loop_spec: None,
            loop_control: LoopControl::default(),
            retry: RetryConfig::default(),
            timeout: None,
            state_policy: StatePolicyOverride::default(),
        };
        assert_eq!(task.internal_id(3), "__task_idx_3");
    }

    #[test]
    fn retry_policy_clamps_bad_inputs() {
        let cfg = RetryConfig {
            attempts: 0,
            delay: "1s".to_string(),
            max_delay: None,
            backoff_factor: 0.1,
            jitter: 2.0,
            on_error: true,
        };
        let policy = cfg.to_policy().unwrap();
        assert_eq!(policy.attempts, 1);
        assert_eq!(policy.backoff_factor, 1.0);
        assert_eq!(policy.jitter, 1.0);
    }

    #[test]
    fn identifier_and_name_shapes() {
        assert!(is_task_name("task-1_A"));
        assert!(!is_task_name("task 1"));
        assert!(is_identifier("_foo_1"));
        assert!(!is_identifier("1foo"));
    }
}
