//! Flow Orchestrator: builds every other component from a validated
//! configuration and wires them together — pools, task queues and their
//! executors, MQTT clients and their event loops, the rule index, and, where
//! configured, a persistence engine per client.
//!
//! Grounded on `original_source/mqtt_flow/mqtt_flow.py`'s build order:
//! queues and pools first, then tasks queues bound to pools, then clients,
//! then rules resolved against the already-built queues.

use shared::config::{FlowConfig, TaskSpec};
use shared::error::FlowError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::client::MqttClient;
use crate::context::{ClientHandles, InboundMessage, OutboundMessage, RuntimeContext};
use crate::executor::run_rate_limited_task_queue;
use crate::persistence::{BatchUploader, PersistenceEngine};
use crate::pool::Pool;
use crate::rule::Rule;
use crate::task::build_task;

pub struct Orchestrator {
    ctx: Arc<RuntimeContext>,
    clients: Vec<Arc<MqttClient>>,
    shutdown_tx: watch::Sender<bool>,
    join_handles: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    pub async fn build(config: FlowConfig) -> Result<Self, FlowError> {
        config.validate()?;

        let mut pools = HashMap::new();
        for pool_spec in &config.pools {
            pools.insert(pool_spec.name.clone(), Pool::new(pool_spec.pool_type, pool_spec.max_workers));
        }

        let mut tasks_queues_tx = HashMap::new();
        let mut tasks_queues_rx = HashMap::new();
        for queue_spec in &config.tasks_queues {
            let (tx, rx) = mpsc::channel(queue_spec.size.max(1));
            tasks_queues_tx.insert(queue_spec.name.clone(), tx);
            tasks_queues_rx.insert(queue_spec.name.clone(), rx);
        }

        let mut clients_queues = HashMap::new();
        let mut outgoing_rx = HashMap::new();
        for client_spec in &config.mqtt_clients {
            let (tx, rx) = mpsc::channel(client_spec.queue_size.max(1));
            clients_queues.insert(client_spec.client_name.clone(), ClientHandles { outgoing: tx });
            outgoing_rx.insert(client_spec.client_name.clone(), rx);
        }

        let ctx = Arc::new(RuntimeContext {
            clients_queues,
            tasks_queues: tasks_queues_tx,
            tasks: config.tasks.clone(),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut join_handles = Vec::new();

        for queue_spec in &config.tasks_queues {
            let pool = pools
                .get(&queue_spec.pool)
                .cloned()
                .ok_or_else(|| FlowError::Config(format!("unknown pool '{}'", queue_spec.pool)))?;
            let rx = tasks_queues_rx.remove(&queue_spec.name).expect("queue receiver built above");
            join_handles.push(tokio::spawn(run_rate_limited_task_queue(
                queue_spec.name.clone(),
                rx,
                pool,
                queue_spec.execution_rate_limit_per_second,
            )));
        }

        let mut rules_by_client: HashMap<String, Vec<Rule>> = HashMap::new();
        for rule_spec in &config.rules {
            let rule = Rule::from_spec(rule_spec)?;
            rules_by_client.entry(rule.source_client_name.clone()).or_default().push(rule);
        }

        let mut persistence_engines: HashMap<String, Arc<PersistenceEngine>> = HashMap::new();
        for client_spec in &config.mqtt_clients {
            if let Some(persistence_config) = &client_spec.persistence_config {
                let engine = Arc::new(PersistenceEngine::open(persistence_config).await?);
                persistence_engines.insert(client_spec.client_name.clone(), engine);
            }
        }

        let mut clients = Vec::new();
        for client_spec in &config.mqtt_clients {
            let (mqtt_client, eventloop) = MqttClient::new(client_spec)?;
            let mqtt_client = Arc::new(mqtt_client);
            if let Err(e) = mqtt_client.subscribe_topics(&client_spec.sub_topics).await {
                warn!(client = %client_spec.client_name, error = %e, "failed to queue subscriptions");
            }
            clients.push(mqtt_client.clone());

            let (inbound_tx, inbound_rx) = mpsc::channel(client_spec.queue_size.max(1));
            {
                let mqtt_client = mqtt_client.clone();
                join_handles.push(tokio::spawn(async move {
                    mqtt_client.run_event_loop(eventloop, inbound_tx).await;
                }));
            }

            let rules = rules_by_client.remove(&client_spec.client_name).unwrap_or_default();
            let tasks_catalog = config.tasks.clone();
            let ctx_for_inbound = ctx.clone();
            join_handles.push(tokio::spawn(run_inbound_consumer(
                inbound_rx,
                rules,
                tasks_catalog,
                ctx_for_inbound,
            )));

            let outgoing_rx = outgoing_rx.remove(&client_spec.client_name).expect("outgoing receiver built above");
            let persistence = persistence_engines.get(&client_spec.client_name).cloned();
            join_handles.push(tokio::spawn(run_outbound_consumer(mqtt_client.clone(), outgoing_rx, persistence)));

            {
                let mqtt_client = mqtt_client.clone();
                let interval = std::time::Duration::from_secs(client_spec.publish_interval.max(1));
                join_handles.push(tokio::spawn(async move {
                    mqtt_client.run_interval_publisher(interval).await;
                }));
            }

            if let Some(engine) = persistence_engines.get(&client_spec.client_name).cloned() {
                let uploader: Arc<dyn BatchUploader> = mqtt_client.clone();
                let drain_engine = engine.clone();
                let drain_shutdown_rx = shutdown_rx.clone();
                join_handles.push(tokio::spawn(async move {
                    drain_engine.run_drain_loop(uploader, drain_shutdown_rx).await;
                }));

                let flush_shutdown_rx = shutdown_rx.clone();
                join_handles.push(tokio::spawn(async move {
                    engine.run_flush_loop(flush_shutdown_rx).await;
                }));
            }
        }

        Ok(Orchestrator { ctx, clients, shutdown_tx, join_handles })
    }

    pub fn clients(&self) -> &[Arc<MqttClient>] {
        &self.clients
    }

    /// Operator API: look up a running client by name.
    pub fn get_client(&self, client_name: &str) -> Option<Arc<MqttClient>> {
        self.clients.iter().find(|c| c.client_name == client_name).cloned()
    }

    /// Operator API: enqueue a task manually, bypassing rule match entirely.
    /// `task_name` resolves against the `tasks` catalog, `queue_name` against
    /// the declared task queues; `topic`/`payload` stand in for the message
    /// that would otherwise have come from a rule match.
    pub async fn submit_task(
        &self,
        task_name: &str,
        queue_name: &str,
        topic: String,
        payload: serde_json::Value,
    ) -> Result<(), FlowError> {
        let task_spec = self
            .ctx
            .tasks
            .get(task_name)
            .ok_or_else(|| FlowError::UnknownTask(task_name.to_string()))?;
        let task = build_task(task_spec, topic, payload, self.ctx.clone())?;
        self.ctx.submit_task(queue_name, task).await;
        Ok(())
    }

    pub fn context(&self) -> &Arc<RuntimeContext> {
        &self.ctx
    }

    /// Flush every client's pending batches and outgoing queue, broadcast
    /// shutdown to every drain loop, then abort the remaining
    /// consumer/event-loop tasks. There is no graceful MQTT disconnect here
    /// — the process is expected to exit shortly after.
    pub async fn stop(self) {
        for client in &self.clients {
            client.flush_pending().await;
        }
        let _ = self.shutdown_tx.send(true);
        for handle in self.join_handles {
            handle.abort();
        }
    }
}

/// Per-client inbound loop: every message is tested
/// against every rule bound to this client; each match constructs and
/// enqueues a task instance independently, so one message can fan out to
/// several queues.
async fn run_inbound_consumer(
    mut inbound: mpsc::Receiver<InboundMessage>,
    rules: Vec<Rule>,
    tasks_catalog: HashMap<String, TaskSpec>,
    ctx: Arc<RuntimeContext>,
) {
    while let Some(message) = inbound.recv().await {
        for rule in &rules {
            if !rule.is_matched(&message.topic, &message.payload) {
                continue;
            }

            let Some(task_spec) = tasks_catalog.get(&rule.task_name) else {
                warn!(task = %rule.task_name, "rule references task missing from catalog at runtime");
                continue;
            };

            match build_task(task_spec, message.topic.clone(), message.payload.clone(), ctx.clone()) {
                Ok(task) => ctx.submit_task(&rule.queue_name, task).await,
                Err(e) => warn!(rule = %rule.rule_name, error = %e, "failed to build task for matched rule"),
            }
        }
    }
}

/// Per-client outbound loop: when connected, publish unconditionally;
/// when disconnected, stage into persistence if `persist` is set and a
/// persistence engine is configured, otherwise drop. A publish attempt that
/// fails while connected falls back to persistence under the same `persist`
/// condition.
async fn run_outbound_consumer(
    client: Arc<MqttClient>,
    mut outgoing: mpsc::Receiver<OutboundMessage>,
    persistence: Option<Arc<PersistenceEngine>>,
) {
    while let Some(message) = outgoing.recv().await {
        if !client.is_connected() {
            if message.persist {
                if let Some(engine) = &persistence {
                    engine.record(&message).await;
                }
            }
            continue;
        }

        let bytes = match serde_json::to_vec(&message.payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(topic = %message.topic, error = %e, "failed to encode outgoing payload");
                continue;
            }
        };

        if let Err(e) = client.publish(&message.topic, &bytes, message.qos).await {
            warn!(topic = %message.topic, error = %e, "publish failed");
            if message.persist {
                if let Some(engine) = &persistence {
                    engine.record(&message).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> FlowConfig {
        let yaml = r#"
mqtt_clients:
  - client_name: a
    server: 127.0.0.1
    port: 18830
  - client_name: b
    server: 127.0.0.1
    port: 18830
tasks:
  relay:
    path: relay
    client_to_publish: b
rules:
  - rule_name: r1
    source_client_name: a
    regex: "^sens/.*$"
    task: { name: relay, queue_name: q1 }
tasks_queues:
  - name: q1
    size: 100
    pool: p1
pools:
  - name: p1
    type: simple_thread
    max_workers: 4
"#;
        serde_yaml::from_str(yaml).unwrap()
    }

    #[tokio::test]
    async fn builds_and_stops_without_a_live_broker() {
        let orchestrator = Orchestrator::build(minimal_config()).await.unwrap();
        assert_eq!(orchestrator.clients().len(), 2);
        assert!(orchestrator.context().tasks_queues.contains_key("q1"));
        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn get_client_resolves_by_name() {
        let orchestrator = Orchestrator::build(minimal_config()).await.unwrap();
        assert!(orchestrator.get_client("a").is_some());
        assert!(orchestrator.get_client("missing").is_none());
        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn submit_task_bypasses_rule_match() {
        let orchestrator = Orchestrator::build(minimal_config()).await.unwrap();
        orchestrator
            .submit_task("relay", "q1", "manual/topic".into(), serde_json::json!("manual"))
            .await
            .unwrap();
        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn submit_task_rejects_unknown_task_name() {
        let orchestrator = Orchestrator::build(minimal_config()).await.unwrap();
        let err = orchestrator
            .submit_task("missing", "q1", "t".into(), serde_json::json!(null))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::UnknownTask(_)));
        orchestrator.stop().await;
    }
}
