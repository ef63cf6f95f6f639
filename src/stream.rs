//! Back-pressured event channels carrying invocation progress to subscribers
//! (C8 — StreamBroker).
//!
//! Bounded to ~256 events per invocation. When a slow consumer would
//! overflow the queue, older `heartbeat` events are dropped first, then
//! consecutive `stdout`/`stderr` events are coalesced. `progress` phase
//! transitions and the terminal event (`result`/`error`) are never dropped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};

use crate::cancellation::CancellationToken;

const QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Queued,
    RunStarted,
    ProviderInvocationStarted,
    ProviderInvocationCompleted,
    RunCompleted,
    Stdout,
    Stderr,
    Heartbeat,
}

impl Phase {
    fn is_coalescable_output(&self) -> bool {
        matches!(self, Phase::Stdout | Phase::Stderr)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationResult {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Progress {
        seq: u64,
        phase: Phase,
        timestamp: i64,
        message: String,
    },
    Result {
        seq: u64,
        agent_id: String,
        session_ref: String,
        output: String,
        result: InvocationResult,
        message: Option<String>,
    },
    Error {
        seq: u64,
        timestamp: i64,
        error: String,
    },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Result { .. } | StreamEvent::Error { .. })
    }

    fn phase(&self) -> Option<Phase> {
        match self {
            StreamEvent::Progress { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    fn seq(&self) -> u64 {
        match self {
            StreamEvent::Progress { seq, .. } => *seq,
            StreamEvent::Result { seq, .. } => *seq,
            StreamEvent::Error { seq, .. } => *seq,
        }
    }
}

/// Per-invocation producer handle. The executor calls `emit`/`emit_terminal`
/// as it walks the state machine in §4.7.
pub struct StreamProducer {
    tx: mpsc::UnboundedSender<StreamEvent>,
    seq: AtomicU64,
    cancel: CancellationToken,
}

impl StreamProducer {
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// The cancellation token shared with this invocation's subscription.
    /// Dropping the subscription without draining it (an HTTP client
    /// disconnecting mid-stream) flips this; the executor threads it through
    /// to the provider adapter so the subprocess actually gets killed.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn emit_progress(&self, phase: Phase, message: impl Into<String>) {
        let event = StreamEvent::Progress {
            seq: self.next_seq(),
            phase,
            timestamp: chrono::Utc::now().timestamp_millis(),
            message: message.into(),
        };
        let _ = self.tx.send(event);
    }

    pub fn emit_result(
        &self,
        agent_id: impl Into<String>,
        session_ref: impl Into<String>,
        output: impl Into<String>,
        result: InvocationResult,
        message: Option<String>,
    ) {
        let event = StreamEvent::Result {
            seq: self.next_seq(),
            agent_id: agent_id.into(),
            session_ref: session_ref.into(),
            output: output.into(),
            result,
            message,
        };
        let _ = self.tx.send(event);
    }

    pub fn emit_error(&self, error: impl Into<String>) {
        let event = StreamEvent::Error {
            seq: self.next_seq(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            error: error.into(),
        };
        let _ = self.tx.send(event);
    }
}

/// Consumer side: a bounded, coalescing view over the producer's unbounded
/// channel. The producer never blocks on a slow subscriber; coalescing
/// happens here, on the read side, which is where the backlog actually
/// accumulates.
pub struct StreamSubscription {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    buffer: VecDeque<StreamEvent>,
    closed: bool,
    cancel: CancellationToken,
}

/// A subscription dropped before it observes a terminal event means nobody
/// is listening any more — the HTTP handler's response body was dropped on
/// client disconnect, or a caller gave up early. Either way the invocation
/// backing it should stop: this is the other half of §5's cancellation
/// contract (the executor checks `cancel.is_cancelled()` to kill the
/// provider subprocess). Cancelling after the terminal event already arrived
/// is a harmless no-op — the invocation is already finished.
impl Drop for StreamSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl StreamSubscription {
    /// Pulls the next event, applying back-pressure coalescing if the
    /// producer has gotten far ahead of this consumer.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.buffer.is_empty() {
            if self.closed {
                return None;
            }
            self.drain_available().await;
        }
        self.buffer.pop_front()
    }

    async fn drain_available(&mut self) {
        match self.rx.recv().await {
            Some(event) => self.buffer.push_back(event),
            None => {
                self.closed = true;
                return;
            }
        }
        // Opportunistically pull everything already queued so we can apply
        // back-pressure policy before handing events to the caller.
        while let Ok(event) = self.rx.try_recv() {
            self.buffer.push_back(event);
        }
        self.apply_backpressure();
    }

    fn apply_backpressure(&mut self) {
        while self.buffer.len() > QUEUE_CAPACITY {
            if let Some(idx) = self
                .buffer
                .iter()
                .position(|e| e.phase() == Some(Phase::Heartbeat))
            {
                self.buffer.remove(idx);
                continue;
            }
            break;
        }
        while self.buffer.len() > QUEUE_CAPACITY {
            if !self.coalesce_one_output_run() {
                break;
            }
        }
    }

    /// Merges the first run of ≥2 consecutive same-phase stdout/stderr
    /// events into one. Returns false if no such run exists.
    fn coalesce_one_output_run(&mut self) -> bool {
        let mut i = 0;
        while i + 1 < self.buffer.len() {
            let same_output_run = match (&self.buffer[i], &self.buffer[i + 1]) {
                (
                    StreamEvent::Progress {
                        phase: p1,
                        message: m1,
                        ..
                    },
                    StreamEvent::Progress {
                        phase: p2,
                        message: _,
                        ..
                    },
                ) if p1 == p2 && p1.is_coalescable_output() => Some(m1.clone()),
                _ => None,
            };
            if let Some(_first_message) = same_output_run {
                if let Some(StreamEvent::Progress {
                    message: second_message,
                    seq,
                    phase,
                    timestamp,
                }) = self.buffer.remove(i + 1)
                {
                    if let Some(StreamEvent::Progress { message, .. }) = self.buffer.get_mut(i) {
                        message.push_str(&second_message);
                    }
                    let _ = (seq, phase, timestamp);
                    return true;
                }
            }
            i += 1;
        }
        false
    }

    /// Blocks until the terminal event, discarding everything before it.
    /// Used by the non-streaming `POST /api/sessions/message` endpoint.
    pub async fn await_result(mut self) -> Option<StreamEvent> {
        loop {
            match self.next().await {
                Some(event) if event.is_terminal() => return Some(event),
                Some(_) => continue,
                None => return None,
            }
        }
    }
}

pub struct StreamBroker {
    /// Signalled whenever a new invocation's channel is created, for tests
    /// that want to wait for subscription readiness without polling.
    pub ready: Arc<Notify>,
}

impl StreamBroker {
    pub fn new() -> Self {
        Self {
            ready: Arc::new(Notify::new()),
        }
    }

    /// Creates a fresh producer/subscription pair for one invocation.
    pub fn open(&self) -> (StreamProducer, StreamSubscription) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        self.ready.notify_waiters();
        (
            StreamProducer {
                tx,
                seq: AtomicU64::new(0),
                cancel: cancel.clone(),
            },
            StreamSubscription {
                rx,
                buffer: VecDeque::new(),
                closed: false,
                cancel,
            },
        )
    }
}

impl Default for StreamBroker {
    fn default() -> Self {
        Self::new()
    }
}
