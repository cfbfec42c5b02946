use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use shipsec_protocol::LogLevel;
use shipsec_protocol::LogRecord;
use shipsec_protocol::ProgressEvent;
use shipsec_protocol::RunnerKind;
use shipsec_protocol::TerminalChunk;
use shipsec_protocol::TerminalStream;

use crate::terminal::TerminalEmitter;

/// Metadata key carrying the tool-provider node ids an agent node may call
/// through the MCP gateway. Resolved from the graph at schedule time.
pub const CONNECTED_TOOL_NODE_IDS: &str = "connectedToolNodeIds";

pub type ProgressCollector = Arc<dyn Fn(ProgressEvent) + Send + Sync>;
pub type LogCollector = Arc<dyn Fn(LogRecord) + Send + Sync>;
pub type TerminalCollector =
    Arc<dyn Fn(TerminalChunk) -> std::result::Result<(), String> + Send + Sync>;

/// Per-activity execution context. Created at activity entry, dropped at
/// activity exit; never shared across activities. Cloning is cheap: all
/// collector callbacks are behind `Arc`.
#[derive(Clone)]
pub struct ExecutionContext {
    pub run_id: String,
    pub node_ref: String,
    pub organization_id: String,
    pub http: reqwest::Client,
    pub cancellation: CancellationToken,
    progress: Option<ProgressCollector>,
    logs: Option<LogCollector>,
    terminal: Option<TerminalCollector>,
    pub metadata: HashMap<String, Value>,
}

impl ExecutionContext {
    pub fn new(run_id: &str, node_ref: &str, organization_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            node_ref: node_ref.to_string(),
            organization_id: organization_id.to_string(),
            http: reqwest::Client::new(),
            cancellation: CancellationToken::new(),
            progress: None,
            logs: None,
            terminal: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_progress(mut self, collector: ProgressCollector) -> Self {
        self.progress = Some(collector);
        self
    }

    pub fn with_logs(mut self, collector: LogCollector) -> Self {
        self.logs = Some(collector);
        self
    }

    pub fn with_terminal(mut self, collector: TerminalCollector) -> Self {
        self.terminal = Some(collector);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Emit an operator-facing progress note. A missing collector makes
    /// this a no-op; progress must never fail the component.
    pub fn emit_progress(&self, message: impl Into<String>, level: LogLevel) {
        if let Some(progress) = &self.progress {
            progress(ProgressEvent {
                run_id: self.run_id.clone(),
                node_ref: self.node_ref.clone(),
                message: message.into(),
                level,
                recorded_at: Utc::now(),
            });
        }
    }

    pub fn collect_log(&self, level: LogLevel, message: impl Into<String>) {
        if let Some(logs) = &self.logs {
            logs(LogRecord {
                run_id: self.run_id.clone(),
                node_ref: self.node_ref.clone(),
                level,
                message: message.into(),
                fields: None,
                recorded_at: Utc::now(),
            });
        }
    }

    pub(crate) fn terminal_collector(&self) -> Option<TerminalCollector> {
        self.terminal.clone()
    }

    /// Bind a chunk emitter for one terminal stream of this activity.
    pub fn terminal_emitter(
        &self,
        stream: TerminalStream,
        runner_kind: RunnerKind,
        origin: &str,
    ) -> TerminalEmitter {
        TerminalEmitter::new(self, stream, runner_kind, origin)
    }

    /// Tool-provider node ids reachable from this node, when it is an AI
    /// agent. Empty for every other node kind.
    pub fn connected_tool_node_ids(&self) -> Vec<String> {
        match self.metadata.get(CONNECTED_TOOL_NODE_IDS) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn progress_is_noop_without_collector() {
        let ctx = ExecutionContext::new("run-1", "node-1", "org-1");
        ctx.emit_progress("nothing listens", LogLevel::Info);
    }

    #[test]
    fn progress_reaches_the_collector() {
        let seen: Arc<Mutex<Vec<ProgressEvent>>> = Arc::default();
        let sink = seen.clone();
        let ctx = ExecutionContext::new("run-1", "node-1", "org-1").with_progress(Arc::new(
            move |event| {
                sink.lock().unwrap().push(event);
            },
        ));

        ctx.emit_progress("Displayed text note: Reminder", LogLevel::Info);

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "Displayed text note: Reminder");
        assert_eq!(events[0].run_id, "run-1");
    }

    #[test]
    fn connected_tool_node_ids_parses_metadata() {
        let metadata = HashMap::from([(
            CONNECTED_TOOL_NODE_IDS.to_string(),
            json!(["node-a", "node-b"]),
        )]);
        let ctx = ExecutionContext::new("run-1", "agent-1", "org-1").with_metadata(metadata);
        assert_eq!(ctx.connected_tool_node_ids(), vec!["node-a", "node-b"]);

        let bare = ExecutionContext::new("run-1", "node-2", "org-1");
        assert!(bare.connected_tool_node_ids().is_empty());
    }
}
