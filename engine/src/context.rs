//! The runtime context record threaded through callbacks and task instances.
//!
//! Replacing the original's cyclic back-references via `userdata`: the original
//! embeds the tasks-queues, clients-queues, and task registry into each
//! client's `userdata` mapping. Here that becomes an explicit, `Arc`-shared
//! record built once by the orchestrator and handed to every consumer,
//! callback, and task instance — handles only, no ownership cycles.

use serde_json::Value as Json;
use shared::config::TaskSpec;
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::task::Task;

/// One data point bound for a client's outgoing queue.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Json,
    pub persist: bool,
    pub qos: u8,
}

/// An inbound message as handed from the client wrapper's on-message callback
/// to the orchestrator's per-client inbound consumer.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Json,
}

/// Per-client handles reachable from task instances and callbacks.
#[derive(Clone)]
pub struct ClientHandles {
    pub outgoing: mpsc::Sender<OutboundMessage>,
}

/// Back-references available to every task instance and callback, built once
/// at orchestrator construction and read-only from then on.
pub struct RuntimeContext {
    pub clients_queues: HashMap<String, ClientHandles>,
    pub tasks_queues: HashMap<String, mpsc::Sender<Box<dyn Task>>>,
    pub tasks: HashMap<String, TaskSpec>,
}

impl RuntimeContext {
    /// `publish_message`: enqueue `{topic, payload}` on another client's
    /// outgoing queue. Silently drops if the client is unknown or its
    /// queue is gone — mirrors the source's bare dict lookup with no
    /// existence check, but logs rather than panicking.
    pub async fn publish_message(&self, client_name: &str, message: OutboundMessage) {
        if let Some(handles) = self.clients_queues.get(client_name) {
            if handles.outgoing.send(message).await.is_err() {
                tracing::warn!(client = %client_name, "outgoing queue closed, message dropped");
            }
        } else {
            tracing::warn!(client = %client_name, "publish_message: unknown client");
        }
    }

    /// `submit_task`: enqueue a manually-constructed task onto its queue,
    /// bypassing rule match, as the operator API allows.
    pub async fn submit_task(&self, queue_name: &str, task: Box<dyn Task>) {
        if let Some(queue) = self.tasks_queues.get(queue_name) {
            if queue.send(task).await.is_err() {
                tracing::warn!(queue = %queue_name, "task queue closed, task dropped");
            }
        } else {
            tracing::warn!(queue = %queue_name, "submit_task: unknown queue");
        }
    }
}
