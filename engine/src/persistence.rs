//! Persistence Engine: store-and-forward for a client's outgoing
//! messages while it is disconnected, or always when `persist` is set.
//!
//! Grounded on `original_source/mqtt_flow/peristence/{persistence.py,
//! mqtt_persistence.py}`. The rule-aware rewrite described there (filter
//! which points get persisted, rewrite their topic before storing) happens at
//! persist time here, so a drained batch can be re-published byte-for-byte
//! with no further lookup at upload time.

use crate::context::OutboundMessage;
use crate::queue::{DurableQueue, Empty};
use serde::{Deserialize, Serialize};
use shared::config::{PersistenceConfig, PersistenceRule};
use shared::error::FlowError;
use shared::topic::{format_topic, match_topic};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::sleep;
use tracing::{error, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedRecord {
    topic: String,
    payload: serde_json::Value,
}

/// Implemented by the MQTT client wrapper so the persistence engine can drain
/// without depending on `client.rs` directly.
pub trait BatchUploader: Send + Sync {
    fn is_connected(&self) -> bool;
    fn upload<'a>(
        &'a self,
        batch: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), FlowError>> + Send + 'a>>;
}

struct Rule {
    regex: Option<regex::Regex>,
    topic: Option<String>,
    reupload_topic_formatters: Vec<shared::topic::TopicFormatter>,
}

pub struct PersistenceEngine {
    queue: DurableQueue,
    rules: Vec<Rule>,
    batch_size: usize,
    batch_upload_min_delay: Duration,
    upload_interval: Duration,
    buffer: Mutex<Vec<PersistedRecord>>,
}

impl PersistenceEngine {
    pub async fn open(config: &PersistenceConfig) -> Result<Self, FlowError> {
        let queue = DurableQueue::open_with_backup(&config.main_path, config.backup_path.as_deref()).await?;
        let rules = config
            .rules
            .iter()
            .map(compile_rule)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(PersistenceEngine {
            queue,
            rules,
            batch_size: config.batch_size,
            batch_upload_min_delay: Duration::from_secs(config.batch_upload_min_delay),
            upload_interval: Duration::from_secs(config.upload_interval),
            buffer: Mutex::new(Vec::new()),
        })
    }

    /// Offer a message to the persistence layer. When rules are configured,
    /// only a message matching one is kept, topic-rewritten by that rule's
    /// formatter pipeline; with no rules every message is persisted as-is.
    pub async fn record(&self, message: &OutboundMessage) {
        let record = match self.rule_rewrite(message) {
            Some(record) => record,
            None => return,
        };

        let should_flush = {
            let mut buffer = self.buffer.lock().await;
            buffer.push(record);
            buffer.len() >= self.batch_size
        };

        if should_flush {
            self.flush().await;
        }
    }

    fn rule_rewrite(&self, message: &OutboundMessage) -> Option<PersistedRecord> {
        if self.rules.is_empty() {
            return Some(PersistedRecord { topic: message.topic.clone(), payload: message.payload.clone() });
        }

        for rule in &self.rules {
            if match_topic(&message.topic, rule.regex.as_ref(), rule.topic.as_deref()) {
                let topic = format_topic(&message.topic, &rule.reupload_topic_formatters);
                return Some(PersistedRecord { topic, payload: message.payload.clone() });
            }
        }

        None
    }

    /// Force the in-memory buffer out to the durable queue.
    pub async fn flush(&self) {
        let mut buffer = self.buffer.lock().await;
        if buffer.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut *buffer);
        drop(buffer);

        match serde_json::to_vec(&batch) {
            Ok(bytes) => {
                if let Err(e) = self.queue.put_nowait(bytes).await {
                    error!(error = %e, "failed to persist batch to durable queue");
                }
            }
            Err(e) => error!(error = %e, "failed to serialize persisted batch"),
        }
    }

    /// Force a flush every `batch_upload_min_delay`, regardless of size,
    /// whenever the buffer is non-empty — the time trigger half of §4.2,
    /// alongside `record`'s size trigger. Without this, a batch smaller than
    /// `batch_size` sits in the buffer until another message happens to push
    /// it over the threshold.
    pub async fn run_flush_loop(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = sleep(self.batch_upload_min_delay) => {}
            }

            if !self.buffer.lock().await.is_empty() {
                self.flush().await;
            }
        }
    }

    /// Periodically, while the wrapped client is connected, drain persisted
    /// batches in order. A batch that fails to upload is retried with
    /// exponential backoff without being acknowledged, so ordering is
    /// preserved and nothing is lost on a crash mid-retry.
    pub async fn run_drain_loop(&self, uploader: Arc<dyn BatchUploader>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = sleep(self.upload_interval) => {}
            }

            if !uploader.is_connected() {
                continue;
            }

            loop {
                let (id, payload) = match self.queue.get_nowait().await {
                    Ok(entry) => entry,
                    Err(Empty) => break,
                };

                let mut attempt = 0u32;
                loop {
                    match uploader.upload(&payload).await {
                        Ok(()) => {
                            if let Err(e) = self.queue.task_done(id).await {
                                error!(error = %e, "failed to acknowledge uploaded batch");
                            }
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, attempt, "persisted batch upload failed, retrying");
                            let delay = shared::utils::calculate_backoff_delay(attempt, 1000, 8000);
                            sleep(Duration::from_millis(delay)).await;
                            attempt = attempt.saturating_add(1);
                            if !uploader.is_connected() {
                                break;
                            }
                        }
                    }
                }

                if !uploader.is_connected() {
                    break;
                }
            }
        }
    }
}

fn compile_rule(spec: &PersistenceRule) -> Result<Rule, FlowError> {
    let regex = spec
        .regex
        .as_ref()
        .map(|r| regex::Regex::new(r))
        .transpose()
        .map_err(|e| FlowError::Config(format!("invalid persistence rule regex: {e}")))?;

    Ok(Rule { regex, topic: spec.topic.clone(), reupload_topic_formatters: spec.reupload_topic_formatters.clone() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared::config::PersistenceConfig;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn config(dir: &TempDir, rules: Vec<PersistenceRule>) -> PersistenceConfig {
        PersistenceConfig {
            name: "p".into(),
            main_path: dir.path().join("p.sqlite3").to_string_lossy().into_owned(),
            backup_path: None,
            batch_size: 2,
            batch_upload_min_delay: 3600,
            upload_interval: 3600,
            rules,
        }
    }

    #[tokio::test]
    async fn flushes_when_batch_size_reached() {
        let dir = TempDir::new().unwrap();
        let engine = PersistenceEngine::open(&config(&dir, vec![])).await.unwrap();

        engine
            .record(&OutboundMessage { topic: "a".into(), payload: json!(1), persist: true, qos: 0 })
            .await;
        assert_eq!(engine.queue.len().await.unwrap(), 0);

        engine
            .record(&OutboundMessage { topic: "b".into(), payload: json!(2), persist: true, qos: 0 })
            .await;
        assert_eq!(engine.queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn flush_loop_forces_a_flush_below_batch_size() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir, vec![]);
        cfg.batch_upload_min_delay = 1;
        let engine = Arc::new(PersistenceEngine::open(&cfg).await.unwrap());

        engine
            .record(&OutboundMessage { topic: "a".into(), payload: json!(1), persist: true, qos: 0 })
            .await;
        assert_eq!(engine.queue.len().await.unwrap(), 0);

        let (tx, rx) = watch::channel(false);
        let engine_clone = engine.clone();
        let handle = tokio::spawn(async move { engine_clone.run_flush_loop(rx).await });

        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert_eq!(engine.queue.len().await.unwrap(), 1);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn rules_filter_and_rewrite_topic() {
        let dir = TempDir::new().unwrap();
        let rule = PersistenceRule {
            regex: Some("^keep/.*$".into()),
            topic: None,
            reupload_topic_formatters: vec![shared::topic::TopicFormatter {
                prefix: Some("reup".into()),
                ..Default::default()
            }],
        };
        let engine = PersistenceEngine::open(&config(&dir, vec![rule])).await.unwrap();

        engine
            .record(&OutboundMessage { topic: "drop/me".into(), payload: json!(1), persist: true, qos: 0 })
            .await;
        engine
            .record(&OutboundMessage { topic: "keep/me".into(), payload: json!(2), persist: true, qos: 0 })
            .await;
        engine.flush().await;

        let (_id, bytes) = engine.queue.get_nowait().await.unwrap();
        let records: Vec<PersistedRecord> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].topic, "reup/keep/me");
    }

    struct FlakyUploader {
        connected: AtomicBool,
        attempts: AtomicUsize,
        fail_first_n: usize,
    }

    impl BatchUploader for FlakyUploader {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn upload<'a>(
            &'a self,
            _batch: &'a [u8],
        ) -> Pin<Box<dyn Future<Output = Result<(), FlowError>> + Send + 'a>> {
            Box::pin(async move {
                let n = self.attempts.fetch_add(1, Ordering::SeqCst);
                if n < self.fail_first_n {
                    Err(FlowError::Network("simulated upload failure".into()))
                } else {
                    Ok(())
                }
            })
        }
    }

    #[tokio::test]
    async fn drain_loop_retries_until_upload_succeeds() {
        let dir = TempDir::new().unwrap();
        let engine =
            Arc::new(PersistenceEngine::open(&config(&dir, vec![])).await.unwrap());
        engine
            .record(&OutboundMessage { topic: "a".into(), payload: json!(1), persist: true, qos: 0 })
            .await;
        engine.flush().await;
        assert_eq!(engine.queue.len().await.unwrap(), 1);

        let uploader = Arc::new(FlakyUploader {
            connected: AtomicBool::new(true),
            attempts: AtomicUsize::new(0),
            fail_first_n: 2,
        });
        let (_tx, rx) = watch::channel(false);

        let engine_clone = engine.clone();
        let uploader_clone: Arc<dyn BatchUploader> = uploader.clone();
        let handle = tokio::spawn(async move {
            // drive one drain pass manually instead of waiting on the interval
            let (id, payload) = engine_clone.queue.get_nowait().await.unwrap();
            let mut attempt = 0u32;
            loop {
                match uploader_clone.upload(&payload).await {
                    Ok(()) => {
                        engine_clone.queue.task_done(id).await.unwrap();
                        break;
                    }
                    Err(_) => {
                        attempt += 1;
                        if attempt > 5 {
                            panic!("did not converge");
                        }
                    }
                }
            }
        });
        handle.await.unwrap();
        drop(rx);

        assert_eq!(engine.queue.len().await.unwrap(), 0);
        assert_eq!(uploader.attempts.load(Ordering::SeqCst), 3);
    }
}
