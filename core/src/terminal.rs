//! Terminal chunk emission and fan-out.
//!
//! The emitter turns arbitrary byte slices from a component's
//! stdout/stderr/PTY into ordered, base64-framed [`TerminalChunk`]s. The
//! hub fans finished chunks out to live viewers and keeps a bounded replay
//! ring per session so late joiners see recent history; the full journal
//! backs time-bounded replay with asciinema-like seeking over `recordedAt`.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use chrono::DateTime;
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::warn;

use shipsec_protocol::RunnerKind;
use shipsec_protocol::TerminalChunk;
use shipsec_protocol::TerminalStream;

use crate::context::ExecutionContext;
use crate::context::TerminalCollector;

/// Emits ordered chunks for one (run, node, stream) session.
///
/// The first emission carries `chunk_index = 1` and `delta_ms = 0`; every
/// later one increments the index and measures the gap to the previous
/// emission. Collector failures are logged and swallowed: component
/// execution never stalls on telemetry backpressure.
pub struct TerminalEmitter {
    run_id: String,
    node_ref: String,
    stream: TerminalStream,
    runner_kind: RunnerKind,
    origin: String,
    collector: Option<TerminalCollector>,
    next_index: u64,
    last_emit: Option<Instant>,
}

impl TerminalEmitter {
    pub(crate) fn new(
        ctx: &ExecutionContext,
        stream: TerminalStream,
        runner_kind: RunnerKind,
        origin: &str,
    ) -> Self {
        Self {
            run_id: ctx.run_id.clone(),
            node_ref: ctx.node_ref.clone(),
            stream,
            runner_kind,
            origin: origin.to_string(),
            collector: ctx.terminal_collector(),
            next_index: 1,
            last_emit: None,
        }
    }

    /// Frame `bytes` as the next chunk. Zero-length payloads are dropped;
    /// without a collector this is a no-op that does not advance the index.
    pub fn emit(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let Some(collector) = &self.collector else {
            return;
        };

        let now = Instant::now();
        let delta_ms = match self.last_emit {
            None => 0,
            Some(previous) => now.duration_since(previous).as_millis() as u64,
        };

        let chunk = TerminalChunk {
            run_id: self.run_id.clone(),
            node_ref: self.node_ref.clone(),
            stream: self.stream,
            chunk_index: self.next_index,
            payload: BASE64_STANDARD.encode(bytes),
            recorded_at: Utc::now(),
            delta_ms,
            origin: self.origin.clone(),
            runner_kind: self.runner_kind,
        };

        self.next_index += 1;
        self.last_emit = Some(now);

        if let Err(err) = collector(chunk) {
            warn!(
                run_id = %self.run_id,
                node_ref = %self.node_ref,
                stream = %self.stream,
                "terminal collector failed: {err}"
            );
        }
    }

    pub fn emit_str(&mut self, text: &str) {
        self.emit(text.as_bytes());
    }
}

pub type SessionKey = (String, String, TerminalStream);

fn session_key(chunk: &TerminalChunk) -> SessionKey {
    (chunk.run_id.clone(), chunk.node_ref.clone(), chunk.stream)
}

struct SessionState {
    live: broadcast::Sender<TerminalChunk>,
    /// Recent history for late joiners; oldest entries are dropped on
    /// overflow and counted.
    recent: VecDeque<TerminalChunk>,
    journal: Vec<TerminalChunk>,
    dropped: u64,
}

/// Publish-subscribe hub keyed by (run, node, stream).
pub struct TerminalHub {
    sessions: Mutex<HashMap<SessionKey, SessionState>>,
    replay_ring: usize,
    live_capacity: usize,
}

impl Default for TerminalHub {
    fn default() -> Self {
        Self::new(256, 256)
    }
}

impl TerminalHub {
    pub fn new(replay_ring: usize, live_capacity: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            replay_ring,
            live_capacity,
        }
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<SessionKey, SessionState>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record and fan out one chunk. Producers never block: live sends to
    /// lagging subscribers rely on the broadcast ring, and ring overflow in
    /// the replay buffer drops the oldest entry.
    pub fn publish(&self, chunk: TerminalChunk) {
        let mut sessions = self.lock_sessions();
        let state = sessions
            .entry(session_key(&chunk))
            .or_insert_with(|| SessionState {
                live: broadcast::channel(self.live_capacity).0,
                recent: VecDeque::new(),
                journal: Vec::new(),
                dropped: 0,
            });

        if state.recent.len() == self.replay_ring {
            state.recent.pop_front();
            state.dropped += 1;
            if state.dropped.is_power_of_two() {
                warn!(
                    run_id = %chunk.run_id,
                    node_ref = %chunk.node_ref,
                    dropped = state.dropped,
                    "terminal replay ring overflow"
                );
            }
        }
        state.recent.push_back(chunk.clone());
        state.journal.push(chunk.clone());

        // No receivers is fine; chunks are still journaled for replay.
        let _ = state.live.send(chunk);
    }

    /// Subscribe a live viewer. Returns the buffered recent history plus a
    /// receiver for everything emitted afterwards.
    pub fn subscribe(
        &self,
        run_id: &str,
        node_ref: &str,
        stream: TerminalStream,
    ) -> (Vec<TerminalChunk>, broadcast::Receiver<TerminalChunk>) {
        let mut sessions = self.lock_sessions();
        let state = sessions
            .entry((run_id.to_string(), node_ref.to_string(), stream))
            .or_insert_with(|| SessionState {
                live: broadcast::channel(self.live_capacity).0,
                recent: VecDeque::new(),
                journal: Vec::new(),
                dropped: 0,
            });
        (
            state.recent.iter().cloned().collect(),
            state.live.subscribe(),
        )
    }

    /// Time-bounded replay over the journal, inclusive on both ends.
    pub fn replay(
        &self,
        run_id: &str,
        node_ref: &str,
        stream: TerminalStream,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Vec<TerminalChunk> {
        let sessions = self.lock_sessions();
        let Some(state) = sessions.get(&(run_id.to_string(), node_ref.to_string(), stream)) else {
            return Vec::new();
        };
        state
            .journal
            .iter()
            .filter(|chunk| chunk.recorded_at >= start_time && chunk.recorded_at <= end_time)
            .cloned()
            .collect()
    }

    /// Drop all sessions owned by a finished run.
    pub fn remove_run(&self, run_id: &str) {
        let mut sessions = self.lock_sessions();
        sessions.retain(|(session_run, _, _), _| session_run != run_id);
    }
}
