use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::ClobConfig;
use crate::error::{AppError, Result};
use crate::state::OrderBooks;
use crate::subscription::FeedCommand;
use crate::types::{
    BookUpdate, DomainEvent, EventType, FeedEvent, LifecycleNotice, QuoteUpdate, Tick, TradeTick,
};
use crate::ws::frames::{initial_subscribe_frames, operation_frames};
use crate::ws::messages::{parse_frame, FeedMessage};
use crate::ws::session::{
    HealthNotice, SeqCheck, SequenceTracker, SessionAction, SessionInput, SessionMachine, SessionPolicy,
    SessionState,
};
use crate::ws::transport::FeedTransport;

/// Malformed-frame warnings: the first few verbatim, then one per this many.
const MALFORMED_WARN_FIRST: u64 = 10;
const MALFORMED_WARN_EVERY: u64 = 1000;
const FLOW_LOG_EVERY: u64 = 500;

/// Flow counters since process start, shared for shutdown reporting.
#[derive(Debug, Default)]
pub struct FeedStats {
    pub frames: AtomicU64,
    pub ticks: AtomicU64,
    pub baselines: AtomicU64,
    pub malformed: AtomicU64,
    pub ignored: AtomicU64,
    pub gaps: AtomicU64,
    pub reconnects: AtomicU64,
}

impl FeedStats {
    pub fn log_summary(&self) {
        info!(
            frames = self.frames.load(Ordering::Relaxed),
            ticks = self.ticks.load(Ordering::Relaxed),
            baselines = self.baselines.load(Ordering::Relaxed),
            malformed = self.malformed.load(Ordering::Relaxed),
            ignored = self.ignored.load(Ordering::Relaxed),
            gaps = self.gaps.load(Ordering::Relaxed),
            reconnects = self.reconnects.load(Ordering::Relaxed),
            "[WS] feed totals"
        );
    }
}

enum Step {
    Frame(Result<Option<String>>),
    Command(Option<FeedCommand>),
    HeartbeatExpired,
    Ping,
    SnapshotDeadline,
    Reconnect,
    Shutdown,
}

/// Single persistent market-channel session.
///
/// Owns the transport, the local order books and the sequence tracker; all
/// protocol decisions are delegated to [`SessionMachine`].
pub struct FeedSession<T: FeedTransport> {
    cfg: ClobConfig,
    transport: T,
    machine: SessionMachine,
    books: OrderBooks,
    seqs: SequenceTracker,
    clock: Arc<dyn Clock>,
    command_rx: mpsc::Receiver<FeedCommand>,
    feed_tx: mpsc::Sender<FeedEvent>,
    events_tx: mpsc::Sender<DomainEvent>,
    shutdown: CancellationToken,
    stats: Arc<FeedStats>,

    last_inbound: Instant,
    reconnect_at: Option<Instant>,
    snapshot_deadline: Option<Instant>,
    ping: Option<Interval>,
    /// Tokens whose snapshot has not arrived since the last full subscribe.
    awaiting_books: HashSet<String>,
}

impl<T: FeedTransport> FeedSession<T> {
    pub fn new(
        cfg: ClobConfig,
        transport: T,
        clock: Arc<dyn Clock>,
        command_rx: mpsc::Receiver<FeedCommand>,
        feed_tx: mpsc::Sender<FeedEvent>,
        events_tx: mpsc::Sender<DomainEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        let machine = SessionMachine::new(SessionPolicy::from(&cfg));
        Self::with_machine(cfg, transport, machine, clock, command_rx, feed_tx, events_tx, shutdown)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_machine(
        cfg: ClobConfig,
        transport: T,
        machine: SessionMachine,
        clock: Arc<dyn Clock>,
        command_rx: mpsc::Receiver<FeedCommand>,
        feed_tx: mpsc::Sender<FeedEvent>,
        events_tx: mpsc::Sender<DomainEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        let seqs = SequenceTracker::new(cfg.seq_gap_tolerance);
        Self {
            cfg,
            transport,
            machine,
            books: OrderBooks::new(),
            seqs,
            clock,
            command_rx,
            feed_tx,
            events_tx,
            shutdown,
            stats: Arc::new(FeedStats::default()),
            last_inbound: Instant::now(),
            reconnect_at: None,
            snapshot_deadline: None,
            ping: None,
            awaiting_books: HashSet::new(),
        }
    }

    pub fn stats(&self) -> Arc<FeedStats> {
        self.stats.clone()
    }

    pub async fn run(mut self) -> Result<()> {
        info!(url = %self.cfg.ws_url, "WS session starting");
        let mut inputs = VecDeque::from([SessionInput::Start]);

        loop {
            while let Some(input) = inputs.pop_front() {
                let actions = self.machine.handle(input);
                for action in actions {
                    if let Some(follow_up) = self.execute(action).await {
                        inputs.push_back(follow_up);
                    }
                }
            }

            let connected = self.machine.state().is_connected();
            let heartbeat_at = self.last_inbound + Duration::from_secs(self.cfg.heartbeat_timeout_sec);
            let far = Instant::now() + Duration::from_secs(86_400);

            let step = tokio::select! {
                frame = self.transport.recv(), if connected => Step::Frame(frame),
                cmd = self.command_rx.recv() => Step::Command(cmd),
                _ = sleep_until(heartbeat_at), if connected => Step::HeartbeatExpired,
                _ = tick_opt(&mut self.ping), if connected => Step::Ping,
                _ = sleep_until(self.snapshot_deadline.unwrap_or(far)), if self.snapshot_deadline.is_some() => {
                    Step::SnapshotDeadline
                }
                _ = sleep_until(self.reconnect_at.unwrap_or(far)), if self.reconnect_at.is_some() => Step::Reconnect,
                _ = self.shutdown.cancelled() => Step::Shutdown,
            };

            match step {
                Step::Frame(Ok(Some(text))) => {
                    self.last_inbound = Instant::now();
                    match self.handle_text(&text).await {
                        Ok(gaps) => inputs.extend(gaps),
                        Err(e) => {
                            // Detector side is gone; nothing left to feed.
                            error!("WS feed output closed: {e}");
                            inputs.push_back(SessionInput::Stop);
                            self.drain(inputs).await;
                            return Err(e);
                        }
                    }
                }
                Step::Frame(Ok(None)) => {
                    warn!("WS connection closed by peer");
                    inputs.push_back(SessionInput::TransportLost("closed by peer".into()));
                }
                Step::Frame(Err(e)) => {
                    error!("WS connection error: {e}");
                    inputs.push_back(SessionInput::TransportLost(e.to_string()));
                }
                Step::Command(Some(FeedCommand::Subscribe(tokens))) => {
                    inputs.push_back(SessionInput::DesiredChanged { added: tokens, removed: Vec::new() });
                }
                Step::Command(Some(FeedCommand::Unsubscribe(tokens))) => {
                    for token in &tokens {
                        self.books.invalidate(token);
                        self.awaiting_books.remove(token);
                    }
                    inputs.push_back(SessionInput::DesiredChanged { added: Vec::new(), removed: tokens });
                }
                Step::Command(None) => {
                    info!("WS command channel closed, stopping session");
                    inputs.push_back(SessionInput::Stop);
                    self.drain(inputs).await;
                    return Ok(());
                }
                Step::HeartbeatExpired => {
                    warn!(timeout_sec = self.cfg.heartbeat_timeout_sec, "WS heartbeat timeout");
                    inputs.push_back(SessionInput::HeartbeatTimeout);
                }
                Step::Ping => {
                    debug!("WS ping");
                    if let Err(e) = self.transport.send(self.cfg.ping_message.clone()).await {
                        inputs.push_back(SessionInput::TransportLost(e.to_string()));
                    }
                }
                Step::SnapshotDeadline => {
                    self.snapshot_deadline = None;
                    if !self.awaiting_books.is_empty() {
                        debug!(missing = self.awaiting_books.len(), "WS snapshot burst ended by timeout");
                    }
                    self.awaiting_books.clear();
                    inputs.push_back(SessionInput::SnapshotComplete);
                }
                Step::Reconnect => {
                    self.reconnect_at = None;
                    inputs.push_back(self.connect().await);
                }
                Step::Shutdown => {
                    info!("WS session shutting down");
                    inputs.push_back(SessionInput::Stop);
                    self.drain(inputs).await;
                    return Ok(());
                }
            }
        }
    }

    /// Runs the remaining inputs to completion without waiting on I/O.
    async fn drain(&mut self, mut inputs: VecDeque<SessionInput>) {
        while let Some(input) = inputs.pop_front() {
            for action in self.machine.handle(input) {
                if matches!(action, SessionAction::Connect { .. }) {
                    continue;
                }
                if let Some(next) = self.execute(action).await {
                    inputs.push_back(next);
                }
            }
        }
        self.stats.log_summary();
    }

    async fn connect(&mut self) -> SessionInput {
        info!("WS connecting to {}", self.cfg.ws_url);
        let limit = Duration::from_secs(self.cfg.heartbeat_timeout_sec.max(1));
        let attempt = tokio::time::timeout(limit, self.transport.connect(&self.cfg.ws_url)).await;
        match attempt {
            Ok(Ok(())) => {
                self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                self.last_inbound = Instant::now();
                self.ping = self.cfg.ping_interval_sec.filter(|s| *s > 0).map(|s| {
                    let period = Duration::from_secs(s);
                    let mut iv = interval_at(Instant::now() + period, period);
                    iv.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    iv
                });
                info!("WS connected");
                SessionInput::Connected
            }
            Ok(Err(e)) => {
                error!("WS connect failed: {e}");
                SessionInput::ConnectFailed(e.to_string())
            }
            Err(_) => {
                error!("WS connect timed out after {limit:?}");
                SessionInput::ConnectFailed("connect timeout".into())
            }
        }
    }

    /// Performs one action. A failed send comes back as a transport-loss input.
    async fn execute(&mut self, action: SessionAction) -> Option<SessionInput> {
        match action {
            SessionAction::Connect { delay } => {
                if !delay.is_zero() {
                    warn!("WS reconnecting in {}ms", delay.as_millis());
                }
                self.ping = None;
                self.snapshot_deadline = None;
                self.reconnect_at = Some(Instant::now() + delay);
                None
            }
            SessionAction::SendFullSubscribe(tokens) => {
                let frames = initial_subscribe_frames(
                    &self.cfg.channel,
                    &tokens,
                    self.cfg.custom_feature_enabled,
                    self.cfg.initial_dump,
                    self.cfg.max_frame_bytes,
                );
                let total = frames.len();
                if let Err(e) = self.send_all(frames).await {
                    return Some(SessionInput::TransportLost(e.to_string()));
                }
                info!("WS subscribed to {} asset_ids in {} frame(s)", tokens.len(), total);
                if self.cfg.initial_dump {
                    self.awaiting_books = tokens.into_iter().collect();
                    self.snapshot_deadline =
                        Some(Instant::now() + Duration::from_secs(self.cfg.snapshot_timeout_sec));
                }
                None
            }
            SessionAction::SendDelta { operation, tokens } => {
                let frames = operation_frames(operation, &tokens, self.cfg.max_frame_bytes);
                if let Err(e) = self.send_all(frames).await {
                    return Some(SessionInput::TransportLost(e.to_string()));
                }
                info!("WS {operation} {} asset_ids", tokens.len());
                None
            }
            SessionAction::ResetStreams => {
                self.books.clear();
                self.seqs.reset();
                self.awaiting_books.clear();
                self.snapshot_deadline = None;
                None
            }
            SessionAction::Close => {
                self.ping = None;
                self.snapshot_deadline = None;
                if let Err(e) = self.transport.close().await {
                    debug!("WS close: {e}");
                }
                None
            }
            SessionAction::Health(notice) => {
                self.emit_health(notice);
                None
            }
        }
    }

    async fn send_all(&mut self, frames: Vec<String>) -> Result<()> {
        for frame in frames {
            self.transport.send(frame).await?;
        }
        Ok(())
    }

    fn emit_health(&self, notice: HealthNotice) {
        let now = self.clock.now_ms();
        let event = DomainEvent::new(EventType::HealthEvent, now).metric("component", "feed");
        let event = match notice {
            HealthNotice::Degraded { attempts, reason } => {
                warn!(attempts, reason = %reason, "WS reconnect attempts escalated");
                event
                    .metric("status", "feed_degraded")
                    .metric("attempts", attempts as i64)
                    .metric("reason", reason)
            }
            HealthNotice::Recovered { attempts } => {
                info!(attempts, "WS feed recovered");
                event.metric("status", "feed_recovered").metric("attempts", attempts as i64)
            }
            HealthNotice::Resync { token_id } => {
                info!(token_id = %token_id, "WS resync after sequence gap");
                event.metric("status", "feed_resync").metric("token_id", token_id)
            }
        };
        if let Err(e) = self.events_tx.try_send(event) {
            warn!("health event dropped: {e}");
        }
    }

    /// Parses one inbound text frame and forwards the normalized events in
    /// arrival order. Returns the gap inputs the frame produced.
    async fn handle_text(&mut self, text: &str) -> Result<Vec<SessionInput>> {
        let trimmed = text.trim();
        if trimmed.eq_ignore_ascii_case(&self.cfg.pong_message) {
            debug!("WS pong");
            return Ok(Vec::new());
        }
        if trimmed.eq_ignore_ascii_case(&self.cfg.ping_message) {
            let pong = self.cfg.pong_message.clone();
            if let Err(e) = self.transport.send(pong).await {
                return Ok(vec![SessionInput::TransportLost(e.to_string())]);
            }
            return Ok(Vec::new());
        }

        let total_frames = self.stats.frames.fetch_add(1, Ordering::Relaxed) + 1;
        if total_frames % FLOW_LOG_EVERY == 0 {
            let ticks = self.stats.ticks.load(Ordering::Relaxed);
            let malformed = self.stats.malformed.load(Ordering::Relaxed);
            info!(
                frames = total_frames,
                ticks,
                malformed,
                books = self.books.len(),
                state = %self.machine.state(),
                "[WS] {total_frames} frames | ticks={ticks} malformed={malformed}"
            );
        }

        let outcome = parse_frame(text);
        self.stats.ignored.fetch_add(outcome.ignored as u64, Ordering::Relaxed);
        if outcome.malformed > 0 {
            let before = self.stats.malformed.fetch_add(outcome.malformed as u64, Ordering::Relaxed);
            if before < MALFORMED_WARN_FIRST || (before + 1) % MALFORMED_WARN_EVERY == 0 {
                let sample: String = text.chars().take(200).collect();
                warn!(total = before + outcome.malformed as u64, "malformed WS frame dropped: {sample}");
            }
        }

        let now = self.clock.now_ms();
        let mut gaps = Vec::new();
        let mut out = Vec::new();
        for msg in outcome.messages {
            self.normalize(msg, now, &mut out, &mut gaps);
        }

        let baseline = matches!(
            self.machine.state(),
            SessionState::AwaitingSnapshot | SessionState::Resyncing
        );
        for tick in out {
            let event = match tick {
                Normalized::Tick(t) if baseline => {
                    self.stats.baselines.fetch_add(1, Ordering::Relaxed);
                    FeedEvent::Baseline(t)
                }
                Normalized::Tick(t) => {
                    self.stats.ticks.fetch_add(1, Ordering::Relaxed);
                    FeedEvent::Tick(t)
                }
                Normalized::Lifecycle(n) => FeedEvent::Lifecycle(n),
            };
            self.feed_tx
                .send(event)
                .await
                .map_err(|e| AppError::ChannelSend(format!("feed events: {e}")))?;
        }

        if baseline && self.snapshot_deadline.is_some() && self.awaiting_books.is_empty() {
            self.snapshot_deadline = None;
            gaps.push(SessionInput::SnapshotComplete);
        }
        Ok(gaps)
    }

    fn normalize(&mut self, msg: FeedMessage, now: i64, out: &mut Vec<Normalized>, gaps: &mut Vec<SessionInput>) {
        match msg {
            FeedMessage::Book { token_id, bids, asks, ts_ms, seq } => {
                self.seqs.rebase(&token_id, seq);
                let update = self.books.apply_snapshot(&token_id, &bids, &asks, ts_ms.unwrap_or(now), seq);
                self.awaiting_books.remove(&token_id);
                out.push(Normalized::Tick(Tick::Book(update)));
            }

            FeedMessage::PriceChange { changes, ts_ms, seq } => {
                let ts = ts_ms.unwrap_or(now);
                // One sequence check per token per message, then one update per token.
                let mut verdicts: HashMap<String, bool> = HashMap::new();
                let mut updates: Vec<BookUpdate> = Vec::new();
                for change in &changes {
                    let keep = *verdicts
                        .entry(change.token_id.clone())
                        .or_insert_with(|| self.check_seq(&change.token_id, seq, now, gaps));
                    if !keep {
                        continue;
                    }
                    match self.books.apply_change(change, ts, seq) {
                        Some(update) => match updates.iter().position(|u| u.token_id == update.token_id) {
                            Some(i) => updates[i] = update,
                            None => updates.push(update),
                        },
                        None if change.best_bid.is_some() || change.best_ask.is_some() => {
                            out.push(Normalized::Tick(Tick::Quote(QuoteUpdate {
                                token_id: change.token_id.clone(),
                                best_bid: change.best_bid,
                                best_ask: change.best_ask,
                                ts_ms: ts,
                            })));
                        }
                        None => {}
                    }
                }
                out.extend(updates.into_iter().map(|u| Normalized::Tick(Tick::Book(u))));
            }

            FeedMessage::Trade { token_id, price, size, ts_ms, seq } => {
                match self.seqs.observe(&token_id, seq) {
                    SeqCheck::Stale => return,
                    SeqCheck::Gap { expected, observed } => {
                        self.on_gap(&token_id, expected, observed, now, gaps);
                    }
                    SeqCheck::InOrder => {}
                }
                out.push(Normalized::Tick(Tick::Trade(TradeTick {
                    token_id,
                    price,
                    size,
                    notional: price * size,
                    ts_ms: ts_ms.unwrap_or(now),
                    seq,
                })));
            }

            FeedMessage::BestBidAsk { token_id, best_bid, best_ask, ts_ms } => {
                out.push(Normalized::Tick(Tick::Quote(QuoteUpdate {
                    token_id,
                    best_bid,
                    best_ask,
                    ts_ms: ts_ms.unwrap_or(now),
                })));
            }

            FeedMessage::Lifecycle { action, market_id, token_ids, title, ts_ms, raw } => {
                out.push(Normalized::Lifecycle(LifecycleNotice {
                    action,
                    market_id,
                    token_ids,
                    title,
                    ts_ms: ts_ms.unwrap_or(now),
                    raw,
                }));
            }
        }
    }

    /// `false` when the delta must be dropped.
    fn check_seq(&mut self, token_id: &str, seq: Option<u64>, now: i64, gaps: &mut Vec<SessionInput>) -> bool {
        match self.seqs.observe(token_id, seq) {
            SeqCheck::InOrder => true,
            SeqCheck::Stale => false,
            SeqCheck::Gap { expected, observed } => {
                // The book is unknown past a gap until a fresh snapshot arrives.
                self.books.invalidate(token_id);
                self.on_gap(token_id, expected, observed, now, gaps);
                false
            }
        }
    }

    fn on_gap(&self, token_id: &str, expected: u64, observed: u64, now: i64, gaps: &mut Vec<SessionInput>) {
        self.stats.gaps.fetch_add(1, Ordering::Relaxed);
        warn!(token_id = %token_id, expected, observed, "WS sequence gap");
        gaps.push(SessionInput::GapDetected { token_id: token_id.to_string(), now_ms: now });
    }
}

enum Normalized {
    Tick(Tick),
    Lifecycle(LifecycleNotice),
}

async fn tick_opt(iv: &mut Option<Interval>) {
    match iv {
        Some(iv) => {
            iv.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::clock::ManualClock;
    use crate::ws::transport::{ScriptedHandle, ScriptedTransport};

    struct Harness {
        handle: ScriptedHandle,
        cmd_tx: mpsc::Sender<FeedCommand>,
        feed_rx: mpsc::Receiver<FeedEvent>,
        events_rx: mpsc::Receiver<DomainEvent>,
        shutdown: CancellationToken,
        task: tokio::task::JoinHandle<Result<()>>,
    }

    fn cfg() -> ClobConfig {
        ClobConfig {
            ping_interval_sec: Some(10),
            heartbeat_timeout_sec: 30,
            snapshot_timeout_sec: 5,
            reconnect_escalate_after: 2,
            ..ClobConfig::default()
        }
    }

    fn start(cfg: ClobConfig) -> Harness {
        let (transport, handle) = ScriptedTransport::new();
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (feed_tx, feed_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let machine = SessionMachine::with_rng(SessionPolicy::from(&cfg), StdRng::seed_from_u64(11));
        let session = FeedSession::with_machine(
            cfg,
            transport,
            machine,
            Arc::new(ManualClock::new(1_000)),
            cmd_rx,
            feed_tx,
            events_tx,
            shutdown.clone(),
        );
        let task = tokio::spawn(session.run());
        Harness { handle, cmd_tx, feed_rx, events_rx, shutdown, task }
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn subscribes_then_streams_ticks_after_snapshot() {
        let mut h = start(cfg());
        h.cmd_tx.send(FeedCommand::Subscribe(vec!["a".into()])).await.unwrap();
        settle().await;

        let sent = h.handle.sent();
        assert_eq!(
            sent,
            vec![r#"{"type":"market","assets_ids":["a"],"custom_feature_enabled":false,"initial_dump":true}"#]
        );

        h.handle.push(r#"{"event_type":"book","asset_id":"a","bids":[{"price":"0.4","size":"10"}],"asks":[{"price":"0.6","size":"5"}]}"#);
        settle().await;
        assert!(matches!(h.feed_rx.try_recv(), Ok(FeedEvent::Baseline(Tick::Book(_)))));

        h.handle.push(r#"{"event_type":"last_trade_price","asset_id":"a","price":"0.5","size":"100"}"#);
        settle().await;
        match h.feed_rx.try_recv() {
            Ok(FeedEvent::Tick(Tick::Trade(t))) => assert_eq!(t.notional, 50.0),
            other => panic!("expected trade tick, got {other:?}"),
        }

        h.shutdown.cancel();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn delta_operations_while_subscribed() {
        let h = start(ClobConfig { initial_dump: false, ..cfg() });
        h.cmd_tx.send(FeedCommand::Subscribe(vec!["a".into()])).await.unwrap();
        settle().await;
        h.cmd_tx.send(FeedCommand::Subscribe(vec!["b".into()])).await.unwrap();
        h.cmd_tx.send(FeedCommand::Unsubscribe(vec!["a".into()])).await.unwrap();
        settle().await;

        let sent = h.handle.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[1], r#"{"assets_ids":["b"],"operation":"subscribe"}"#);
        assert_eq!(sent[2], r#"{"assets_ids":["a"],"operation":"unsubscribe"}"#);
        assert_eq!(h.handle.connects(), 1, "deltas never reconnect");

        h.shutdown.cancel();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_and_resubscribes_after_drop() {
        let h = start(ClobConfig { initial_dump: false, ..cfg() });
        h.cmd_tx.send(FeedCommand::Subscribe(vec!["a".into(), "b".into()])).await.unwrap();
        settle().await;

        h.handle.drop_connection();
        settle().await;
        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;

        assert_eq!(h.handle.connects(), 2);
        let sent = h.handle.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], sent[1], "full set replayed on reconnect");

        h.shutdown.cancel();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_pings_and_timeout() {
        let h = start(ClobConfig { initial_dump: false, ..cfg() });
        settle().await;
        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(h.handle.sent(), vec!["PING"]);

        h.handle.push("PONG");
        settle().await;
        // Silence past the timeout forces a reconnect.
        tokio::time::advance(Duration::from_secs(31)).await;
        settle().await;
        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert!(h.handle.connects() >= 2);

        h.shutdown.cancel();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn escalates_health_after_failed_connects() {
        let mut h = start(cfg());
        h.handle.fail_next_connects(3);
        settle().await;
        for _ in 0..6 {
            tokio::time::advance(Duration::from_secs(5)).await;
            settle().await;
        }

        let degraded = h.events_rx.try_recv().expect("degraded event");
        assert_eq!(degraded.event_type, EventType::HealthEvent);
        assert_eq!(degraded.metrics["status"].as_str(), Some("feed_degraded"));
        let recovered = h.events_rx.try_recv().expect("recovered event");
        assert_eq!(recovered.metrics["status"].as_str(), Some("feed_recovered"));

        h.shutdown.cancel();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn gap_drops_delta_and_resyncs_once() {
        let mut h = start(ClobConfig { snapshot_timeout_sec: 1, ..cfg() });
        h.cmd_tx.send(FeedCommand::Subscribe(vec!["a".into()])).await.unwrap();
        settle().await;
        h.handle.push(r#"{"event_type":"book","asset_id":"a","seq":1,"bids":[{"price":"0.4","size":"10"}],"asks":[]}"#);
        settle().await;
        let _ = h.feed_rx.try_recv();

        h.handle.push(r#"{"event_type":"price_change","seq":5,"price_changes":[{"asset_id":"a","price":"0.41","size":"3","side":"BUY"}]}"#);
        h.handle.push(r#"{"event_type":"price_change","seq":9,"price_changes":[{"asset_id":"a","price":"0.42","size":"3","side":"BUY"}]}"#);
        settle().await;

        assert!(h.feed_rx.try_recv().is_err(), "deltas past a gap are dropped");
        let subscribes = h.handle.sent().iter().filter(|f| f.contains("initial_dump")).count();
        assert_eq!(subscribes, 2, "one handshake plus one throttled resync");

        h.shutdown.cancel();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frames_are_counted_not_forwarded() {
        let (transport, handle) = ScriptedTransport::new();
        let (_cmd_tx, cmd_rx) = mpsc::channel(4);
        let (feed_tx, mut feed_rx) = mpsc::channel(4);
        let (events_tx, _events_rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();
        let session = FeedSession::new(
            ClobConfig { initial_dump: false, ..cfg() },
            transport,
            Arc::new(ManualClock::new(0)),
            cmd_rx,
            feed_tx,
            events_tx,
            shutdown.clone(),
        );
        let stats = session.stats();
        let task = tokio::spawn(session.run());
        settle().await;

        handle.push("{not json");
        handle.push(r#"{"event_type":"tick_size_change","asset_id":"a"}"#);
        settle().await;

        assert!(feed_rx.try_recv().is_err());
        assert_eq!(stats.malformed.load(Ordering::Relaxed), 1);
        assert_eq!(stats.ignored.load(Ordering::Relaxed), 1);

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }
}
