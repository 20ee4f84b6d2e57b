//! Feed session state machine.
//!
//! Pure: inputs in, actions out. The async driver in `connection.rs` performs
//! the I/O and feeds results back as inputs, so every transition is testable
//! without a socket.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::ClobConfig;
use crate::ws::frames::Operation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    /// Handshake sent with `initial_dump`; snapshot burst still arriving.
    AwaitingSnapshot,
    Subscribed,
    /// Full resubscribe sent after a sequence gap; fresh snapshots pending.
    Resyncing,
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            SessionState::AwaitingSnapshot | SessionState::Subscribed | SessionState::Resyncing
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::AwaitingSnapshot => "awaiting_snapshot",
            SessionState::Subscribed => "subscribed",
            SessionState::Resyncing => "resyncing",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionInput {
    Start,
    Connected,
    ConnectFailed(String),
    TransportLost(String),
    HeartbeatTimeout,
    SnapshotComplete,
    DesiredChanged { added: Vec<String>, removed: Vec<String> },
    GapDetected { token_id: String, now_ms: i64 },
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthNotice {
    /// Reconnect attempts in a row reached the escalation threshold.
    Degraded { attempts: u32, reason: String },
    Recovered { attempts: u32 },
    Resync { token_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    Connect { delay: Duration },
    SendFullSubscribe(Vec<String>),
    SendDelta { operation: Operation, tokens: Vec<String> },
    /// Drop per-connection state (books, sequence expectations).
    ResetStreams,
    Close,
    Health(HealthNotice),
}

#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub initial_dump: bool,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub escalate_after: u32,
    pub resync_on_gap: bool,
    pub resync_min_interval_ms: i64,
}

impl From<&ClobConfig> for SessionPolicy {
    fn from(cfg: &ClobConfig) -> Self {
        Self {
            initial_dump: cfg.initial_dump,
            backoff_base: Duration::from_secs(cfg.reconnect_backoff_sec),
            backoff_max: Duration::from_secs(cfg.reconnect_max_sec),
            escalate_after: cfg.reconnect_escalate_after.max(1),
            resync_on_gap: cfg.resync_on_gap,
            resync_min_interval_ms: (cfg.resync_min_interval_sec as i64) * 1000,
        }
    }
}

pub struct SessionMachine {
    policy: SessionPolicy,
    state: SessionState,
    desired: BTreeSet<String>,
    /// Whether the handshake subscribe has gone out on the current connection.
    handshake_sent: bool,
    /// Consecutive failed connects / losses since the last successful connect.
    attempts: u32,
    escalated: bool,
    last_resync_ms: Option<i64>,
    rng: StdRng,
}

impl SessionMachine {
    pub fn new(policy: SessionPolicy) -> Self {
        Self::with_rng(policy, StdRng::from_entropy())
    }

    pub fn with_rng(policy: SessionPolicy, rng: StdRng) -> Self {
        Self {
            policy,
            state: SessionState::Disconnected,
            desired: BTreeSet::new(),
            handshake_sent: false,
            attempts: 0,
            escalated: false,
            last_resync_ms: None,
            rng,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn desired(&self) -> &BTreeSet<String> {
        &self.desired
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn handle(&mut self, input: SessionInput) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        match input {
            SessionInput::Start => {
                if self.state == SessionState::Disconnected {
                    self.state = SessionState::Connecting;
                    actions.push(SessionAction::Connect { delay: Duration::ZERO });
                }
            }

            SessionInput::Connected => {
                if self.state != SessionState::Connecting {
                    return actions;
                }
                if self.escalated {
                    actions.push(SessionAction::Health(HealthNotice::Recovered { attempts: self.attempts }));
                    self.escalated = false;
                }
                self.attempts = 0;
                self.handshake_sent = false;
                actions.push(SessionAction::ResetStreams);
                self.send_handshake(&mut actions, SessionState::AwaitingSnapshot);
            }

            SessionInput::ConnectFailed(reason) => {
                if self.state == SessionState::Connecting {
                    self.schedule_reconnect(reason, &mut actions);
                }
            }

            SessionInput::TransportLost(reason) => {
                if self.state.is_connected() {
                    self.schedule_reconnect(reason, &mut actions);
                }
            }

            SessionInput::HeartbeatTimeout => {
                if self.state.is_connected() {
                    actions.push(SessionAction::Close);
                    self.schedule_reconnect("heartbeat timeout".into(), &mut actions);
                }
            }

            SessionInput::SnapshotComplete => {
                if matches!(self.state, SessionState::AwaitingSnapshot | SessionState::Resyncing) {
                    self.state = SessionState::Subscribed;
                }
            }

            SessionInput::DesiredChanged { added, removed } => {
                let added: Vec<String> = added.into_iter().filter(|t| self.desired.insert(t.clone())).collect();
                let removed: Vec<String> = removed.into_iter().filter(|t| self.desired.remove(t)).collect();
                if !self.state.is_connected() {
                    return actions;
                }
                if !self.handshake_sent {
                    // Nothing subscribed yet on this connection: the handshake carries everything.
                    self.send_handshake(&mut actions, SessionState::AwaitingSnapshot);
                    return actions;
                }
                if !added.is_empty() {
                    actions.push(SessionAction::SendDelta { operation: Operation::Subscribe, tokens: added });
                }
                if !removed.is_empty() {
                    actions.push(SessionAction::SendDelta { operation: Operation::Unsubscribe, tokens: removed });
                }
            }

            SessionInput::GapDetected { token_id, now_ms } => {
                if self.state != SessionState::Subscribed || !self.policy.resync_on_gap {
                    return actions;
                }
                let throttled = self
                    .last_resync_ms
                    .is_some_and(|last| now_ms - last < self.policy.resync_min_interval_ms);
                if throttled {
                    return actions;
                }
                self.last_resync_ms = Some(now_ms);
                actions.push(SessionAction::Health(HealthNotice::Resync { token_id }));
                actions.push(SessionAction::ResetStreams);
                actions.push(SessionAction::SendFullSubscribe(self.desired.iter().cloned().collect()));
                if self.policy.initial_dump {
                    self.state = SessionState::Resyncing;
                }
            }

            SessionInput::Stop => {
                if self.state.is_connected() {
                    actions.push(SessionAction::Close);
                }
                self.state = SessionState::Disconnected;
            }
        }
        actions
    }

    fn send_handshake(&mut self, actions: &mut Vec<SessionAction>, awaiting: SessionState) {
        if self.desired.is_empty() {
            self.state = SessionState::Subscribed;
            return;
        }
        self.handshake_sent = true;
        actions.push(SessionAction::SendFullSubscribe(self.desired.iter().cloned().collect()));
        self.state = if self.policy.initial_dump { awaiting } else { SessionState::Subscribed };
    }

    fn schedule_reconnect(&mut self, reason: String, actions: &mut Vec<SessionAction>) {
        let delay = self.backoff_delay(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        self.handshake_sent = false;
        self.state = SessionState::Connecting;
        if self.attempts == self.policy.escalate_after {
            self.escalated = true;
            actions.push(SessionAction::Health(HealthNotice::Degraded { attempts: self.attempts, reason }));
        }
        actions.push(SessionAction::Connect { delay });
    }

    /// `base * 2^attempt` capped at `max`, then equal jitter: half fixed, half random.
    fn backoff_delay(&mut self, attempt: u32) -> Duration {
        let capped = self
            .policy
            .backoff_base
            .checked_mul(2u32.saturating_pow(attempt.min(31)))
            .unwrap_or(self.policy.backoff_max)
            .min(self.policy.backoff_max);
        let half = capped / 2;
        half + half.mul_f64(self.rng.gen::<f64>())
    }
}

// ---------------------------------------------------------------------------
// Sequence tracking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqCheck {
    /// No sequence carried, first sighting, or the expected successor.
    InOrder,
    /// Replay or reordering at or below the last seen value.
    Stale,
    Gap { expected: u64, observed: u64 },
}

/// Per-token sequence expectations. A gap is `observed > expected + tolerance`.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    tolerance: u64,
    last: HashMap<String, u64>,
}

impl SequenceTracker {
    pub fn new(tolerance: u64) -> Self {
        Self { tolerance, last: HashMap::new() }
    }

    pub fn observe(&mut self, token_id: &str, seq: Option<u64>) -> SeqCheck {
        let Some(observed) = seq else { return SeqCheck::InOrder };
        let check = match self.last.get(token_id) {
            None => SeqCheck::InOrder,
            Some(&last) if observed <= last => return SeqCheck::Stale,
            Some(&last) => {
                let expected = last + 1;
                if observed > expected + self.tolerance {
                    SeqCheck::Gap { expected, observed }
                } else {
                    SeqCheck::InOrder
                }
            }
        };
        self.last.insert(token_id.to_string(), observed);
        check
    }

    /// Snapshots re-baseline the expectation.
    pub fn rebase(&mut self, token_id: &str, seq: Option<u64>) {
        match seq {
            Some(s) => {
                self.last.insert(token_id.to_string(), s);
            }
            None => {
                self.last.remove(token_id);
            }
        }
    }

    pub fn reset(&mut self) {
        self.last.clear();
    }
}
