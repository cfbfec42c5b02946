use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;
use tracing::info;
use tracing::warn;

use shipsec_protocol::LogRecord;
use shipsec_protocol::NodeIoCompletion;
use shipsec_protocol::NodeIoRecord;
use shipsec_protocol::ProgressEvent;
use shipsec_protocol::TerminalChunk;

use crate::consumer::ConsumerConfig;

/// Redelivery is at-least-once; a record is retried this many times
/// before it is parked with an error log.
const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Error, Debug)]
#[error("store error: {0}")]
pub struct StoreError(pub String);

/// The logs topic interleaves structured log lines and terminal chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum LogTopicRecord {
    Log(LogRecord),
    Terminal(TerminalChunk),
}

/// The node-io topic carries the start record and the completion patch as
/// separate messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum NodeIoMessage {
    Start(NodeIoRecord),
    Completion {
        run_id: String,
        node_ref: String,
        completion: NodeIoCompletion,
    },
}

/// Persistence seam to the search/OLAP backend. Implementations must be
/// idempotent: terminal chunks by (run, node, stream, chunkIndex),
/// node-IO starts by (run, node, startedAt).
pub trait TelemetryStore: Send + Sync {
    fn persist_log(&self, record: &LogRecord) -> Result<(), StoreError>;
    fn persist_terminal(&self, chunk: &TerminalChunk) -> Result<(), StoreError>;
    fn persist_event(&self, event: &ProgressEvent) -> Result<(), StoreError>;
    fn persist_node_start(&self, record: &NodeIoRecord) -> Result<(), StoreError>;
    fn persist_node_completion(
        &self,
        run_id: &str,
        node_ref: &str,
        completion: &NodeIoCompletion,
    ) -> Result<(), StoreError>;
}

async fn persist_with_retry<F>(config: &ConsumerConfig, mut persist: F)
where
    F: FnMut() -> Result<(), StoreError>,
{
    for attempt in 1..=PERSIST_ATTEMPTS {
        match persist() {
            Ok(()) => return,
            Err(err) if attempt < PERSIST_ATTEMPTS => {
                warn!(
                    consumer = %config.client_id,
                    attempt,
                    "persist failed, retrying: {err}"
                );
                tokio::time::sleep(PERSIST_RETRY_DELAY).await;
            }
            Err(err) => {
                error!(consumer = %config.client_id, "persist failed permanently: {err}");
            }
        }
    }
}

pub fn spawn_log_ingestor(
    config: ConsumerConfig,
    mut records: mpsc::Receiver<LogTopicRecord>,
    store: Arc<dyn TelemetryStore>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(consumer = %config.client_id, group = %config.group_id, "log ingestor started");
        while let Some(record) = records.recv().await {
            persist_with_retry(&config, || match &record {
                LogTopicRecord::Log(log) => store.persist_log(log),
                LogTopicRecord::Terminal(chunk) => store.persist_terminal(chunk),
            })
            .await;
        }
        info!(consumer = %config.client_id, "log ingestor stopped (topic closed)");
    })
}

pub fn spawn_event_ingestor(
    config: ConsumerConfig,
    mut events: mpsc::Receiver<ProgressEvent>,
    store: Arc<dyn TelemetryStore>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(consumer = %config.client_id, group = %config.group_id, "event ingestor started");
        while let Some(event) = events.recv().await {
            persist_with_retry(&config, || store.persist_event(&event)).await;
        }
        info!(consumer = %config.client_id, "event ingestor stopped (topic closed)");
    })
}

pub fn spawn_node_io_ingestor(
    config: ConsumerConfig,
    mut messages: mpsc::Receiver<NodeIoMessage>,
    store: Arc<dyn TelemetryStore>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(consumer = %config.client_id, group = %config.group_id, "node-io ingestor started");
        while let Some(message) = messages.recv().await {
            persist_with_retry(&config, || match &message {
                NodeIoMessage::Start(record) => store.persist_node_start(record),
                NodeIoMessage::Completion {
                    run_id,
                    node_ref,
                    completion,
                } => store.persist_node_completion(run_id, node_ref, completion),
            })
            .await;
        }
        info!(consumer = %config.client_id, "node-io ingestor stopped (topic closed)");
    })
}

/// In-process store backing the dev harness and tests.
#[derive(Default)]
pub struct InMemoryTelemetryStore {
    inner: Mutex<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    logs: Vec<LogRecord>,
    terminal: Vec<TerminalChunk>,
    terminal_seen: HashSet<(String, String, String, u64)>,
    events: Vec<ProgressEvent>,
    node_io: Vec<NodeIoRecord>,
    node_io_seen: HashSet<(String, String, DateTime<Utc>)>,
}

impl InMemoryTelemetryStore {
    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn terminal_chunks(&self, run_id: &str, node_ref: &str) -> Vec<TerminalChunk> {
        self.lock()
            .terminal
            .iter()
            .filter(|c| c.run_id == run_id && c.node_ref == node_ref)
            .cloned()
            .collect()
    }

    pub fn node_io_records(&self, run_id: &str) -> Vec<NodeIoRecord> {
        self.lock()
            .node_io
            .iter()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect()
    }

    pub fn logs(&self, run_id: &str) -> Vec<LogRecord> {
        self.lock()
            .logs
            .iter()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect()
    }

    pub fn events(&self, run_id: &str) -> Vec<ProgressEvent> {
        self.lock()
            .events
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect()
    }
}

impl TelemetryStore for InMemoryTelemetryStore {
    fn persist_log(&self, record: &LogRecord) -> Result<(), StoreError> {
        self.lock().logs.push(record.clone());
        Ok(())
    }

    fn persist_terminal(&self, chunk: &TerminalChunk) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let key = (
            chunk.run_id.clone(),
            chunk.node_ref.clone(),
            chunk.stream.to_string(),
            chunk.chunk_index,
        );
        if inner.terminal_seen.insert(key) {
            inner.terminal.push(chunk.clone());
        }
        Ok(())
    }

    fn persist_event(&self, event: &ProgressEvent) -> Result<(), StoreError> {
        self.lock().events.push(event.clone());
        Ok(())
    }

    fn persist_node_start(&self, record: &NodeIoRecord) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let key = (
            record.run_id.clone(),
            record.node_ref.clone(),
            record.started_at,
        );
        if inner.node_io_seen.insert(key) {
            inner.node_io.push(record.clone());
        }
        Ok(())
    }

    fn persist_node_completion(
        &self,
        run_id: &str,
        node_ref: &str,
        completion: &NodeIoCompletion,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let row = inner
            .node_io
            .iter_mut()
            .rev()
            .find(|r| r.run_id == run_id && r.node_ref == node_ref);
        match row {
            Some(row) => {
                row.completion = Some(completion.clone());
                Ok(())
            }
            None => Err(StoreError(format!(
                "completion for unknown node execution {run_id}/{node_ref}"
            ))),
        }
    }
}
