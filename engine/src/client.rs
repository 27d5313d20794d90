//! MQTT Client Wrapper: one `rumqttc` connection per configured
//! client, translating its event loop into inbound messages, a connectivity
//! flag, and the `exit_on_reconnect` clean-restart policy.
//!
//! Grounded on `original_source/mqtt_flow/mqtt_lib/mqtt_client.py` and the
//! `on_connect`/`on_disconnect`/`on_message` callbacks under
//! `core/mqtt_callbacks/`, adapted from paho-mqtt's threaded callback model
//! to `rumqttc`'s polled event loop.

use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS, Transport, TlsConfiguration};
use serde_json::Value as Json;
use shared::config::{ClientSpec, SslConfig, SubTopic};
use shared::error::FlowError;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::pin::Pin;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::context::{InboundMessage, OutboundMessage};
use crate::persistence::BatchUploader;

/// One entry queued by `qpublish` awaiting the next interval flush.
struct QueuedPublish {
    topic: String,
    payload: Vec<u8>,
    qos: u8,
}

pub struct MqttClient {
    pub client_name: String,
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    exit_on_reconnect: bool,
    first_connected: Arc<AtomicBool>,
    outgoing_queue: Mutex<VecDeque<QueuedPublish>>,
    queue_capacity: usize,
    topic_batches: Mutex<HashMap<String, Vec<Json>>>,
    batch_size: usize,
    broker_host: String,
    broker_port: u16,
}

impl MqttClient {
    pub fn build_options(spec: &ClientSpec) -> Result<MqttOptions, FlowError> {
        let mut opts = MqttOptions::new(spec.wire_client_id(), spec.server.clone(), spec.port);
        opts.set_keep_alive(Duration::from_secs(spec.keep_alive.max(5)));
        opts.set_clean_session(spec.clean_session);

        if let (Some(topic), Some(payload)) = (&spec.will_set_topic, &spec.will_set_payload) {
            opts.set_last_will(LastWill::new(topic, payload.clone().into_bytes(), QoS::AtLeastOnce, false));
        }

        if let Some(ssl) = &spec.ssl_config {
            opts.set_transport(Transport::Tls(build_tls_config(ssl)?));
        }

        Ok(opts)
    }

    pub fn new(spec: &ClientSpec) -> Result<(Self, EventLoop), FlowError> {
        let opts = Self::build_options(spec)?;
        let (client, eventloop) = AsyncClient::new(opts, spec.queue_size.max(10));
        Ok((
            MqttClient {
                client_name: spec.client_name.clone(),
                client,
                connected: Arc::new(AtomicBool::new(false)),
                exit_on_reconnect: spec.exit_on_reconnect,
                first_connected: Arc::new(AtomicBool::new(false)),
                outgoing_queue: Mutex::new(VecDeque::new()),
                queue_capacity: spec.queue_size.max(1),
                topic_batches: Mutex::new(HashMap::new()),
                batch_size: spec.batch_size.max(1),
                broker_host: spec.server.clone(),
                broker_port: spec.port,
            },
            eventloop,
        ))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn subscribe_topics(&self, sub_topics: &[SubTopic]) -> Result<(), FlowError> {
        for sub in sub_topics {
            self.client
                .subscribe(sub.filter(), qos_from_u8(sub.qos()))
                .await
                .map_err(|e| FlowError::Network(format!("subscribe failed for '{}': {e}", sub.filter())))?;
        }
        Ok(())
    }

    pub async fn publish(&self, topic: &str, payload: &[u8], qos: u8) -> Result<(), FlowError> {
        self.client
            .publish(topic, qos_from_u8(qos), false, payload.to_vec())
            .await
            .map_err(|e| FlowError::Network(format!("publish to '{topic}' failed: {e}")))
    }

    /// Append to the bounded outgoing queue; when it reaches
    /// `queue_size` capacity, flush it by publishing each entry in order.
    pub async fn qpublish(&self, topic: &str, payload: &[u8], qos: u8) -> Result<(), FlowError> {
        let drained = {
            let mut queue = self.outgoing_queue.lock().await;
            queue.push_back(QueuedPublish { topic: topic.to_string(), payload: payload.to_vec(), qos });
            if queue.len() >= self.queue_capacity {
                Some(std::mem::take(&mut *queue))
            } else {
                None
            }
        };

        if let Some(drained) = drained {
            for entry in drained {
                self.publish(&entry.topic, &entry.payload, entry.qos).await?;
            }
        }
        Ok(())
    }

    /// Append `payload` to the per-topic batch buffer; at
    /// `batch_size` entries, publish the batch as a JSON array and reset it.
    pub async fn batch_publish(&self, topic: &str, payload: Json) -> Result<(), FlowError> {
        let drained = {
            let mut batches = self.topic_batches.lock().await;
            let entries = batches.entry(topic.to_string()).or_default();
            entries.push(payload);
            if entries.len() >= self.batch_size {
                Some(batches.remove(topic).unwrap_or_default())
            } else {
                None
            }
        };

        if let Some(entries) = drained {
            self.publish_batch_array(topic, &entries).await?;
        }
        Ok(())
    }

    async fn publish_batch_array(&self, topic: &str, entries: &[Json]) -> Result<(), FlowError> {
        let bytes = serde_json::to_vec(entries)
            .map_err(|e| FlowError::Network(format!("failed to encode batch for '{topic}': {e}")))?;
        self.publish(topic, &bytes, 1).await
    }

    /// Every `publish_interval` seconds, drain the outgoing queue (publishing
    /// each pending entry) and flush every non-empty per-topic batch as a
    /// JSON array. Runs for the client's lifetime.
    pub async fn run_interval_publisher(&self, publish_interval: Duration) {
        let mut ticker = tokio::time::interval(publish_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.flush_pending().await;
        }
    }

    /// Drain the outgoing queue and every per-topic batch, regardless of
    /// whether their thresholds have been reached — used by both the
    /// interval publisher and `stop()`.
    pub async fn flush_pending(&self) {
        let queued = std::mem::take(&mut *self.outgoing_queue.lock().await);
        for entry in queued {
            if let Err(e) = self.publish(&entry.topic, &entry.payload, entry.qos).await {
                warn!(client = %self.client_name, topic = %entry.topic, error = %e, "interval publish failed");
            }
        }

        let batches = std::mem::take(&mut *self.topic_batches.lock().await);
        for (topic, entries) in batches {
            if entries.is_empty() {
                continue;
            }
            if let Err(e) = self.publish_batch_array(&topic, &entries).await {
                warn!(client = %self.client_name, topic = %topic, error = %e, "interval batch publish failed");
            }
        }
    }

    /// One-shot publish on a throwaway connection, bypassing the persistent
    /// session entirely. Useful for a single urgent message when the
    /// main session might be mid-reconnect: opens a short-keepalive
    /// connection to `host`/`port` (defaulting to this client's own broker
    /// address), publishes once, and disconnects.
    pub async fn publish_high_priority(
        &self,
        topic: &str,
        payload: &[u8],
        host: Option<&str>,
        port: Option<u16>,
    ) -> Result<(), FlowError> {
        let host = host.map(str::to_string).unwrap_or_else(|| self.broker_host.clone());
        let port = port.unwrap_or(self.broker_port);

        let client_id = format!("{}-hp-{}", self.client_name, shared::utils::random_token());
        let mut opts = MqttOptions::new(client_id, host, port);
        opts.set_keep_alive(Duration::from_secs(5));

        let (client, mut eventloop) = AsyncClient::new(opts, 1);
        client
            .publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .await
            .map_err(|e| FlowError::Network(format!("high-priority publish to '{topic}' failed: {e}")))?;

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::PubAck(_))) | Ok(Event::Incoming(Packet::PubComp(_))) => {
                    client.disconnect().await.ok();
                    return Ok(());
                }
                Ok(_) => continue,
                Err(e) => {
                    return Err(FlowError::Network(format!(
                        "high-priority publish to '{topic}' failed mid-flight: {e}"
                    )))
                }
            }
        }
    }

    /// Drive the event loop for this client's lifetime, translating
    /// connack/publish/disconnect events into the connectivity flag, inbound
    /// message forwarding, and `exit_on_reconnect`.
    ///
    /// The first successful connect is recorded as such; a later reconnect
    /// with `exit_on_reconnect` set exits the process so an external
    /// supervisor restarts the whole engine with a clean socket and
    /// subscription state instead of patching one up in place.
    pub async fn run_event_loop(&self, mut eventloop: EventLoop, inbound: mpsc::Sender<InboundMessage>) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    let was_first = !self.first_connected.swap(true, Ordering::SeqCst);
                    self.connected.store(true, Ordering::SeqCst);
                    if was_first {
                        info!(client = %self.client_name, "connected");
                    } else {
                        info!(client = %self.client_name, "reconnected");
                        if self.exit_on_reconnect {
                            warn!(client = %self.client_name, "exit_on_reconnect set, restarting process");
                            process::exit(0);
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let payload: serde_json::Value =
                        serde_json::from_slice(&publish.payload).unwrap_or(serde_json::Value::Null);
                    let message = InboundMessage { topic: publish.topic, payload };
                    if inbound.send(message).await.is_err() {
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) | Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                    self.connected.store(false, Ordering::SeqCst);
                    warn!(client = %self.client_name, "disconnected");
                }
                Ok(_) => {}
                Err(e) => {
                    self.connected.store(false, Ordering::SeqCst);
                    error!(client = %self.client_name, error = %e, "mqtt connection error, backing off");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

impl BatchUploader for MqttClient {
    fn is_connected(&self) -> bool {
        MqttClient::is_connected(self)
    }

    fn upload<'a>(
        &'a self,
        batch: &'a [u8],
    ) -> Pin<Box<dyn std::future::Future<Output = Result<(), FlowError>> + Send + 'a>> {
        Box::pin(async move {
            let records = decode_persisted_records(batch)?;
            for (topic, payload) in records {
                self.publish(&topic, &payload, 1).await?;
            }
            Ok(())
        })
    }
}

#[derive(serde::Deserialize)]
struct PersistedRecord {
    topic: String,
    payload: serde_json::Value,
}

/// Decode a persisted batch (a JSON array of `{topic, payload}`, already
/// rule-rewritten by the persistence engine) into wire-ready publish pairs.
fn decode_persisted_records(batch: &[u8]) -> Result<Vec<(String, Vec<u8>)>, FlowError> {
    let records: Vec<PersistedRecord> = serde_json::from_slice(batch)
        .map_err(|e| FlowError::Persistence(format!("corrupt persisted batch: {e}")))?;

    records
        .into_iter()
        .map(|r| {
            serde_json::to_vec(&r.payload)
                .map(|bytes| (r.topic, bytes))
                .map_err(|e| FlowError::Persistence(format!("failed to encode persisted payload: {e}")))
        })
        .collect()
}

fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

fn build_tls_config(ssl: &SslConfig) -> Result<TlsConfiguration, FlowError> {
    let ca = ssl
        .ca
        .as_deref()
        .map(read_pem)
        .transpose()?
        .ok_or_else(|| FlowError::Config("ssl_config requires 'ca'".into()))?;

    let client_auth = match (&ssl.cert, &ssl.key) {
        (Some(cert), Some(key)) => Some((read_pem(cert)?, read_pem(key)?)),
        _ => None,
    };

    Ok(TlsConfiguration::Simple {
        ca,
        alpn: ssl.alpn_protocol.as_ref().map(|p| vec![p.clone().into_bytes()]),
        client_auth,
    })
}

fn read_pem(path: &str) -> Result<Vec<u8>, FlowError> {
    std::fs::read(Path::new(path)).map_err(|e| FlowError::Config(format!("failed to read TLS file '{path}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(server: &str, port: u16) -> ClientSpec {
        ClientSpec {
            client_name: "a".into(),
            client_id: None,
            client_id_unique: true,
            server: server.into(),
            port,
            keep_alive: 30,
            max_reconnect_delay: 8,
            clean_session: true,
            will_set_topic: None,
            will_set_payload: None,
            queue_size: 5,
            batch_size: 5,
            publish_interval: 60,
            ssl_config: None,
            sub_topics: vec![],
            userdata: serde_json::Map::new(),
            persistence_config: None,
            exit_on_reconnect: false,
        }
    }

    #[test]
    fn build_options_carries_server_port_and_keep_alive() {
        let opts = MqttClient::build_options(&spec("broker.local", 8883)).unwrap();
        assert_eq!(opts.broker_address(), ("broker.local".to_string(), 8883));
        assert_eq!(opts.keep_alive(), Duration::from_secs(30));
        assert!(opts.clean_session());
    }

    #[test]
    fn qos_mapping_matches_configured_level() {
        assert_eq!(qos_from_u8(0), QoS::AtMostOnce);
        assert_eq!(qos_from_u8(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_u8(2), QoS::ExactlyOnce);
    }

    #[test]
    fn decodes_persisted_batch_into_publish_pairs() {
        let batch = serde_json::to_vec(&serde_json::json!([
            {"topic": "reup/a", "payload": 1},
            {"topic": "reup/b", "payload": "x"}
        ]))
        .unwrap();

        let records = decode_persisted_records(&batch).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0, "reup/a");
        assert_eq!(records[1].0, "reup/b");
    }

    #[test]
    fn corrupt_persisted_batch_is_an_error() {
        assert!(decode_persisted_records(b"not json").is_err());
    }

    #[tokio::test]
    async fn qpublish_buffers_below_capacity_and_flushes_at_capacity() {
        let mut client_spec = spec("127.0.0.1", 18831);
        client_spec.queue_size = 3;
        let (client, _eventloop) = MqttClient::new(&client_spec).unwrap();

        client.qpublish("t", b"1", 0).await.unwrap();
        client.qpublish("t", b"2", 0).await.unwrap();
        assert_eq!(client.outgoing_queue.lock().await.len(), 2);

        // third entry reaches capacity and drains the buffer
        client.qpublish("t", b"3", 0).await.unwrap();
        assert_eq!(client.outgoing_queue.lock().await.len(), 0);
    }

    #[tokio::test]
    async fn batch_publish_accumulates_per_topic_until_threshold() {
        let mut client_spec = spec("127.0.0.1", 18832);
        client_spec.batch_size = 2;
        let (client, _eventloop) = MqttClient::new(&client_spec).unwrap();

        client.batch_publish("sens/temp", serde_json::json!(1)).await.unwrap();
        assert_eq!(client.topic_batches.lock().await.get("sens/temp").unwrap().len(), 1);

        client.batch_publish("sens/temp", serde_json::json!(2)).await.unwrap();
        assert!(client.topic_batches.lock().await.get("sens/temp").is_none());
    }

    #[tokio::test]
    async fn flush_pending_drains_queue_and_batches_regardless_of_threshold() {
        let mut client_spec = spec("127.0.0.1", 18833);
        client_spec.queue_size = 10;
        client_spec.batch_size = 10;
        let (client, _eventloop) = MqttClient::new(&client_spec).unwrap();

        client.qpublish("t", b"1", 0).await.unwrap();
        client.batch_publish("sens/temp", serde_json::json!(1)).await.unwrap();
        assert_eq!(client.outgoing_queue.lock().await.len(), 1);
        assert_eq!(client.topic_batches.lock().await.get("sens/temp").unwrap().len(), 1);

        client.flush_pending().await;

        assert_eq!(client.outgoing_queue.lock().await.len(), 0);
        assert!(client.topic_batches.lock().await.get("sens/temp").is_none());
    }
}
