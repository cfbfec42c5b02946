use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::runner::RunnerKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TerminalStream {
    Stdout,
    Stderr,
    Pty,
}

impl std::fmt::Display for TerminalStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminalStream::Stdout => write!(f, "stdout"),
            TerminalStream::Stderr => write!(f, "stderr"),
            TerminalStream::Pty => write!(f, "pty"),
        }
    }
}

/// One frame of terminal output. `chunk_index` is strictly increasing per
/// (run_id, node_ref, stream) session starting at 1; chunks are append-only
/// and never mutated once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalChunk {
    pub run_id: String,
    pub node_ref: String,
    pub stream: TerminalStream,
    pub chunk_index: u64,
    /// Raw bytes from the stream, base64-encoded.
    pub payload: String,
    pub recorded_at: DateTime<Utc>,
    /// Milliseconds since the previous chunk in the same session; 0 for the
    /// first chunk.
    pub delta_ms: u64,
    pub origin: String,
    pub runner_kind: RunnerKind,
}
