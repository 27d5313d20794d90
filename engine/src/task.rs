//! Task instances and the task registry.
//!
//! Grounded on `original_source/mqtt_flow/core/task/{task.py,simple_task.py,
//! relay_message_task.py,task_loader.py}`: a rule match constructs a task
//! instance bound to the triggering message and enqueues the instance itself
//! (not the raw message) onto its target task queue.

use serde_json::Value as Json;
use shared::config::{TaskParams, TaskSpec};
use shared::error::FlowError;
use shared::topic::format_topic;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::{OutboundMessage, RuntimeContext};

/// A unit of work produced by a matched rule. `process` consumes `self`
/// because a task instance is used exactly once.
pub trait Task: Send {
    fn process(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send>>;
}

/// The only built-in task: re-publish the triggering message, with an
/// optional topic rewrite, onto another client's outgoing queue.
pub struct RelayTask {
    ctx: Arc<RuntimeContext>,
    client_to_publish: String,
    topic_to_publish: Option<String>,
    topic_formatter: Vec<shared::topic::TopicFormatter>,
    persist: bool,
    source_topic: String,
    payload: Json,
}

impl Task for RelayTask {
    fn process(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send>> {
        Box::pin(async move {
            let topic = match &self.topic_to_publish {
                Some(fixed) => fixed.clone(),
                None => format_topic(&self.source_topic, &self.topic_formatter),
            };
            self.ctx
                .publish_message(
                    &self.client_to_publish,
                    OutboundMessage { topic, payload: self.payload, persist: self.persist, qos: 0 },
                )
                .await;
            Ok(())
        })
    }
}

/// Resolves a configured `tasks` entry's `path` into a constructor, and
/// builds a task instance bound to one triggering message.
///
/// Any `path` other than `relay` is an operator-extension point: resolving it
/// here fails fast at config-load time rather than silently dropping matches
/// at runtime.
pub fn build_task(
    task_spec: &TaskSpec,
    topic: String,
    payload: Json,
    ctx: Arc<RuntimeContext>,
) -> Result<Box<dyn Task>, FlowError> {
    match (&task_spec.path[..], &task_spec.params) {
        ("relay", TaskParams::Relay(relay)) => Ok(Box::new(RelayTask {
            ctx,
            client_to_publish: relay.client_to_publish.clone(),
            topic_to_publish: relay.topic_to_publish.clone(),
            topic_formatter: relay.topic_formatter.clone(),
            persist: relay.persist,
            source_topic: topic,
            payload,
        })),
        (other, _) => Err(FlowError::UnknownTask(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared::config::RelayParams;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    fn ctx_with_client(name: &str) -> (Arc<RuntimeContext>, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(8);
        let mut clients_queues = HashMap::new();
        clients_queues.insert(name.to_string(), crate::context::ClientHandles { outgoing: tx });
        (
            Arc::new(RuntimeContext { clients_queues, tasks_queues: HashMap::new(), tasks: HashMap::new() }),
            rx,
        )
    }

    #[tokio::test]
    async fn relay_task_publishes_with_topic_formatter() {
        let (ctx, mut rx) = ctx_with_client("b");
        let spec = TaskSpec {
            path: "relay".into(),
            client_for_userdata: None,
            params: TaskParams::Relay(RelayParams {
                client_to_publish: "b".into(),
                topic_to_publish: None,
                topic_formatter: vec![shared::topic::TopicFormatter {
                    remove_prefix: Some("sens".into()),
                    ..Default::default()
                }],
                persist: true,
            }),
        };

        let task = build_task(&spec, "sens/temp".into(), json!("21"), ctx).unwrap();
        task.process().await.unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "temp");
        assert_eq!(msg.payload, json!("21"));
        assert!(msg.persist);
    }

    #[tokio::test]
    async fn relay_task_prefers_fixed_topic_over_formatter() {
        let (ctx, mut rx) = ctx_with_client("b");
        let spec = TaskSpec {
            path: "relay".into(),
            client_for_userdata: None,
            params: TaskParams::Relay(RelayParams {
                client_to_publish: "b".into(),
                topic_to_publish: Some("fixed/topic".into()),
                topic_formatter: vec![],
                persist: false,
            }),
        };

        let task = build_task(&spec, "sens/temp".into(), json!(1), ctx).unwrap();
        task.process().await.unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "fixed/topic");
        assert!(!msg.persist);
    }

    #[tokio::test]
    async fn unresolved_path_fails_fast() {
        let (ctx, _rx) = ctx_with_client("b");
        let spec = TaskSpec {
            path: "custom_probe".into(),
            client_for_userdata: None,
            params: TaskParams::Opaque(serde_json::Map::new()),
        };
        let err = build_task(&spec, "t".into(), json!(null), ctx).unwrap_err();
        assert!(matches!(err, FlowError::UnknownTask(_)));
    }
}
