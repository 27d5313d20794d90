//! Configuration record for the flow engine: clients, rules, tasks, queues, and pools.
//!
//! Deserialized from YAML after the `!VAR`/`!ENV` tag pre-pass ([`crate::yaml_tags`]).
//! `FlowConfig::validate` enforces every cross-reference invariant from the data
//! model before the orchestrator is allowed to build anything from it.

use crate::error::FlowError;
use crate::topic::TopicFormatter;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{HashMap, HashSet};

/// The top-level configuration record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default)]
    pub mqtt_clients: Vec<ClientSpec>,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
    #[serde(default)]
    pub tasks: HashMap<String, TaskSpec>,
    #[serde(default)]
    pub tasks_queues: Vec<TaskQueueSpec>,
    #[serde(default)]
    pub pools: Vec<PoolSpec>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl FlowConfig {
    /// Cross-reference validation per the data model's Invariants. Fatal at
    /// orchestrator construction (see the error handling design).
    pub fn validate(&self) -> Result<(), FlowError> {
        let mut client_names = HashSet::new();
        for client in &self.mqtt_clients {
            if client.client_name.is_empty() {
                return Err(FlowError::Config("mqtt client is missing 'client_name'".into()));
            }
            if !client_names.insert(client.client_name.as_str()) {
                return Err(FlowError::Config(format!(
                    "duplicate MQTT client name found: {}",
                    client.client_name
                )));
            }
        }

        let pool_names: HashSet<&str> = self.pools.iter().map(|p| p.name.as_str()).collect();
        let mut queue_names = HashSet::new();
        for queue in &self.tasks_queues {
            if !queue_names.insert(queue.name.as_str()) {
                return Err(FlowError::Config(format!("duplicate task queue name: {}", queue.name)));
            }
            if !pool_names.contains(queue.pool.as_str()) {
                return Err(FlowError::Config(format!(
                    "task queue '{}' references unknown pool '{}'",
                    queue.name, queue.pool
                )));
            }
        }

        for rule in &self.rules {
            if !client_names.contains(rule.source_client_name.as_str()) {
                return Err(FlowError::Config(format!(
                    "rule '{}' references unknown source_client_name '{}'",
                    rule.rule_name, rule.source_client_name
                )));
            }
            if !self.tasks.contains_key(&rule.task.name) {
                return Err(FlowError::Config(format!(
                    "rule '{}' references unknown task '{}'",
                    rule.rule_name, rule.task.name
                )));
            }
            if !queue_names.contains(rule.task.queue_name.as_str()) {
                return Err(FlowError::Config(format!(
                    "rule '{}' references unknown queue_name '{}'",
                    rule.rule_name, rule.task.queue_name
                )));
            }
        }

        for client in &self.mqtt_clients {
            if let Some(persistence) = &client.persistence_config {
                if persistence.main_path.is_empty() {
                    return Err(FlowError::Config(format!(
                        "client '{}' persistence_config is missing 'main_path'",
                        client.client_name
                    )));
                }
            }
            if let Some(regex) = client_relay_regexes(client) {
                for r in regex {
                    regex::Regex::new(&r).map_err(|e| {
                        FlowError::Config(format!(
                            "client '{}' persistence rule has invalid regex '{r}': {e}",
                            client.client_name
                        ))
                    })?;
                }
            }
        }

        Ok(())
    }
}

fn client_relay_regexes(client: &ClientSpec) -> Option<Vec<String>> {
    let persistence = client.persistence_config.as_ref()?;
    Some(persistence.rules.iter().filter_map(|r| r.regex.clone()).collect())
}

/// One declared MQTT client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSpec {
    pub client_name: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_true")]
    pub client_id_unique: bool,
    #[serde(default = "default_server")]
    pub server: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,
    #[serde(default = "default_max_reconnect_delay")]
    pub max_reconnect_delay: u64,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    #[serde(default)]
    pub will_set_topic: Option<String>,
    #[serde(default)]
    pub will_set_payload: Option<String>,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_publish_interval")]
    pub publish_interval: u64,
    #[serde(default)]
    pub ssl_config: Option<SslConfig>,
    #[serde(default)]
    pub sub_topics: Vec<SubTopic>,
    #[serde(default)]
    pub userdata: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub persistence_config: Option<PersistenceConfig>,
    #[serde(default)]
    pub exit_on_reconnect: bool,
}

impl ClientSpec {
    pub fn wire_client_id(&self) -> String {
        self.client_id.clone().unwrap_or_else(|| self.client_name.clone())
    }
}

fn default_true() -> bool {
    true
}
fn default_server() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    1883
}
fn default_keep_alive() -> u64 {
    60
}
fn default_max_reconnect_delay() -> u64 {
    8
}
fn default_queue_size() -> usize {
    5
}
fn default_batch_size() -> usize {
    5
}
fn default_publish_interval() -> u64 {
    60
}

/// A subscription topic, optionally paired with a QoS level.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubTopic {
    Plain(String),
    WithQos(String, u8),
}

impl SubTopic {
    pub fn filter(&self) -> &str {
        match self {
            SubTopic::Plain(t) => t,
            SubTopic::WithQos(t, _) => t,
        }
    }

    pub fn qos(&self) -> u8 {
        match self {
            SubTopic::Plain(_) => 0,
            SubTopic::WithQos(_, qos) => *qos,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SslConfig {
    #[serde(default)]
    pub alpn_protocol: Option<String>,
    #[serde(default)]
    pub ca: Option<String>,
    #[serde(default)]
    pub cert: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub name: String,
    pub main_path: String,
    #[serde(default)]
    pub backup_path: Option<String>,
    #[serde(default = "default_persistence_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_upload_min_delay")]
    pub batch_upload_min_delay: u64,
    #[serde(default = "default_upload_interval")]
    pub upload_interval: u64,
    #[serde(default)]
    pub rules: Vec<PersistenceRule>,
}

fn default_persistence_batch_size() -> usize {
    10
}
fn default_batch_upload_min_delay() -> u64 {
    60
}
fn default_upload_interval() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceRule {
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub reupload_topic_formatters: Vec<TopicFormatter>,
}

/// A routing rule: source client, topic/condition predicate, and a target task+queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    pub rule_name: String,
    pub source_client_name: String,
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    pub task: RuleTarget,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleTarget {
    pub name: String,
    pub queue_name: String,
}

/// An entry in the `tasks` catalog: a registry identifier plus its configuration.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TaskSpec {
    pub path: String,
    #[serde(default)]
    pub client_for_userdata: Option<String>,
    pub params: TaskParams,
}

/// Per-task-type parameters. `relay` is the one built-in task; any other
/// `path` value is accepted as an opaque bag of parameters for an
/// operator-registered task (the registry itself is a compile-time mapping —
/// see `engine::task` — unresolved paths fail at orchestrator construction).
#[derive(Debug, Clone, Serialize, PartialEq)]
pub enum TaskParams {
    Relay(RelayParams),
    Opaque(serde_json::Map<String, serde_json::Value>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RelayParams {
    pub client_to_publish: String,
    #[serde(default)]
    pub topic_to_publish: Option<String>,
    #[serde(default)]
    pub topic_formatter: Vec<TopicFormatter>,
    #[serde(default)]
    pub persist: bool,
}

// `path` decides which variant of `TaskParams` the remaining fields parse as,
// so the enum can't be `#[serde(tag = "path")]` directly (the field also needs
// to land in `TaskSpec::path`).
impl<'de> Deserialize<'de> for TaskSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let mut value = serde_json::Map::<String, serde_json::Value>::deserialize(deserializer)?;
        let path = value
            .remove("path")
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| Error::missing_field("path"))?;
        let client_for_userdata = value
            .remove("client_for_userdata")
            .and_then(|v| v.as_str().map(str::to_string));

        let params = if path == "relay" {
            let relay = serde_json::from_value(serde_json::Value::Object(value))
                .map_err(|e| Error::custom(format!("invalid relay task params: {e}")))?;
            TaskParams::Relay(relay)
        } else {
            TaskParams::Opaque(value)
        };

        Ok(TaskSpec { path, client_for_userdata, params })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskQueueSpec {
    pub name: String,
    pub size: usize,
    pub pool: String,
    #[serde(default = "default_rate_limit")]
    pub execution_rate_limit_per_second: u64,
}

fn default_rate_limit() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub pool_type: PoolType,
    pub max_workers: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PoolType {
    Sequential,
    SimpleThread,
    Thread,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub default_level: String,
    #[serde(default)]
    pub loggers: HashMap<String, LoggerConfig>,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerConfig {
    pub level: String,
}
