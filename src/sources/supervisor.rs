//! Stream supervisor.
//!
//! Runs one background task per (symbol, interval). Each task owns its feed
//! session, feeds frames through a [`CandleAggregator`] and hands closed
//! candles to the persistence queue. When the session drops, the task waits
//! out the reconnect delay and opens a new one, until its handle is closed.
//!
//! At most one task exists per stream key: subscribing again replaces the
//! running task, and the old one has fully stopped before the new one starts.

use crate::error::StreamError;
use crate::sources::feed::{kline_stream_url, FeedConnector, FrameStream};
use crate::sources::kline::CandleAggregator;
use crate::types::{Candle, StreamKey};
use futures_util::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Delay between reconnects and an optional cap on consecutive failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    pub fn new(delay: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            delay,
            max_attempts,
        }
    }

    fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), None)
    }
}

/// Lifecycle of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SubscriptionState {
    Connecting,
    Open,
    /// Waiting before reconnect attempt `attempt`.
    Backoff { attempt: u32 },
    Closed,
}

impl SubscriptionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, SubscriptionState::Closed)
    }
}

/// Caller-side handle of a subscription.
///
/// Dropping the handle does not stop the subscription; call [`close`](Self::close).
pub struct SubscriptionHandle {
    key: StreamKey,
    shutdown: Arc<watch::Sender<bool>>,
    state: watch::Receiver<SubscriptionState>,
}

impl SubscriptionHandle {
    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Stop the subscription. A pending reconnect never fires after this.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    /// Wait until the state satisfies `target`. Returns the last state seen
    /// if the task ended first.
    pub async fn wait_for(&mut self, target: impl Fn(&SubscriptionState) -> bool) -> SubscriptionState {
        let reached = self.state.wait_for(|s| target(s)).await.map(|s| *s).ok();
        reached.unwrap_or_else(|| *self.state.borrow())
    }

    /// Close and wait for the task to finish.
    pub async fn close_and_wait(mut self) {
        self.close();
        self.wait_for(SubscriptionState::is_closed).await;
    }
}

struct ActiveSubscription {
    shutdown: Arc<watch::Sender<bool>>,
    state: watch::Receiver<SubscriptionState>,
    task: JoinHandle<()>,
}

impl ActiveSubscription {
    async fn stop(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.task.await {
            error!("Subscription task failed: {}", e);
        }
    }
}

/// Everything a subscription task needs, cloned per task.
#[derive(Clone)]
struct SessionContext {
    key: StreamKey,
    url: String,
    connector: Arc<dyn FeedConnector>,
    policy: ReconnectPolicy,
    candle_tx: mpsc::Sender<Candle>,
    enqueue_timeout: Duration,
}

enum SessionEnd {
    Shutdown,
    Dropped { frames: u64 },
}

/// Owns every market-data subscription.
pub struct StreamSupervisor {
    connector: Arc<dyn FeedConnector>,
    base_url: String,
    policy: ReconnectPolicy,
    candle_tx: mpsc::Sender<Candle>,
    enqueue_timeout: Duration,
    active: Mutex<HashMap<StreamKey, ActiveSubscription>>,
}

impl StreamSupervisor {
    /// `candle_tx` is the bounded queue towards the candle writer; a full queue
    /// is waited on for at most `enqueue_timeout` before the candle is dropped.
    pub fn new(
        connector: Arc<dyn FeedConnector>,
        base_url: impl Into<String>,
        policy: ReconnectPolicy,
        candle_tx: mpsc::Sender<Candle>,
        enqueue_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            base_url: base_url.into(),
            policy,
            candle_tx,
            enqueue_timeout,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Start streaming closed candles for a symbol and interval, replacing any
    /// running subscription for the same pair.
    pub async fn subscribe(&self, symbol: &str, interval: &str) -> SubscriptionHandle {
        let key = StreamKey::new(symbol, interval);
        let mut active = self.active.lock().await;

        if let Some(previous) = active.remove(&key) {
            info!(key = %key, "replacing existing subscription");
            previous.stop().await;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Connecting);
        let shutdown = Arc::new(shutdown_tx);

        let ctx = SessionContext {
            key: key.clone(),
            url: kline_stream_url(&self.base_url, &key.symbol, &key.interval),
            connector: Arc::clone(&self.connector),
            policy: self.policy.clone(),
            candle_tx: self.candle_tx.clone(),
            enqueue_timeout: self.enqueue_timeout,
        };
        let task = tokio::spawn(run_subscription(ctx, shutdown_rx, state_tx));

        active.insert(
            key.clone(),
            ActiveSubscription {
                shutdown: Arc::clone(&shutdown),
                state: state_rx.clone(),
                task,
            },
        );
        info!(key = %key, "subscribed");

        SubscriptionHandle {
            key,
            shutdown,
            state: state_rx,
        }
    }

    /// Stop and forget a subscription. Returns false if none was registered.
    pub async fn unsubscribe(&self, symbol: &str, interval: &str) -> bool {
        let key = StreamKey::new(symbol, interval);
        let removed = self.active.lock().await.remove(&key);
        match removed {
            Some(subscription) => {
                subscription.stop().await;
                info!(key = %key, "unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Registered subscriptions that have not closed, sorted by key.
    pub async fn active(&self) -> Vec<(StreamKey, SubscriptionState)> {
        let active = self.active.lock().await;
        let mut list: Vec<_> = active
            .iter()
            .map(|(key, sub)| (key.clone(), *sub.state.borrow()))
            .filter(|(_, state)| !state.is_closed())
            .collect();
        list.sort_by(|a, b| a.0.to_string().cmp(&b.0.to_string()));
        list
    }

    /// Stop every subscription.
    pub async fn shutdown(&self) {
        let drained: Vec<_> = self.active.lock().await.drain().collect();
        for (key, subscription) in drained {
            subscription.stop().await;
            debug!(key = %key, "subscription stopped");
        }
    }
}

async fn run_subscription(
    ctx: SessionContext,
    mut shutdown: watch::Receiver<bool>,
    state: watch::Sender<SubscriptionState>,
) {
    let mut aggregator = CandleAggregator::new();
    let mut attempt: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        state.send_replace(SubscriptionState::Connecting);
        let connected = tokio::select! {
            _ = shutdown.changed() => break,
            result = ctx.connector.connect(ctx.url.clone()) => result,
        };

        match connected {
            Ok(frames) => {
                state.send_replace(SubscriptionState::Open);
                info!(key = %ctx.key, "stream open");
                match read_session(&ctx, frames, &mut aggregator, &mut shutdown).await {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Dropped { frames } if frames > 0 => attempt = 0,
                    SessionEnd::Dropped { .. } => {}
                }
            }
            Err(e) => {
                warn!(key = %ctx.key, error = %e, "stream connect failed");
            }
        }

        attempt += 1;
        if !ctx.policy.allows(attempt) {
            error!(key = %ctx.key, attempt, "giving up on stream after repeated failures");
            break;
        }

        state.send_replace(SubscriptionState::Backoff { attempt });
        debug!(key = %ctx.key, attempt, delay = ?ctx.policy.delay, "reconnecting after delay");
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(ctx.policy.delay) => {}
        }
    }

    state.send_replace(SubscriptionState::Closed);
    info!(key = %ctx.key, "stream closed");
}

async fn read_session(
    ctx: &SessionContext,
    mut frames: FrameStream,
    aggregator: &mut CandleAggregator,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let mut received: u64 = 0;

    loop {
        let next = tokio::select! {
            _ = shutdown.changed() => return SessionEnd::Shutdown,
            next = frames.next() => next,
        };

        match next {
            Some(Ok(text)) => {
                received += 1;
                match aggregator.process_frame(&text) {
                    Ok(Some(candle)) => {
                        if forward(ctx, candle.clone()).await {
                            aggregator.mark_emitted(&candle);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(key = %ctx.key, error = %e, "skipping undecodable frame"),
                }
            }
            Some(Err(e)) => {
                warn!(key = %ctx.key, error = %e, "stream connection lost");
                return SessionEnd::Dropped { frames: received };
            }
            None => {
                let e = StreamError::ConnectionLost("closed by remote".to_string());
                warn!(key = %ctx.key, error = %e, "stream ended");
                return SessionEnd::Dropped { frames: received };
            }
        }
    }
}

/// Queue a closed candle for the writer. Returns false when it was dropped.
async fn forward(ctx: &SessionContext, candle: Candle) -> bool {
    debug!(key = %ctx.key, close_time = %candle.close_time, close = %candle.close, "closed candle");
    match ctx.candle_tx.send_timeout(candle, ctx.enqueue_timeout).await {
        Ok(()) => true,
        Err(SendTimeoutError::Timeout(candle)) => {
            warn!(key = %ctx.key, close_time = %candle.close_time, "candle queue full, dropping candle");
            false
        }
        Err(SendTimeoutError::Closed(_)) => {
            warn!(key = %ctx.key, "candle queue closed, dropping candle");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::BoxFuture;
    use futures_util::{stream, FutureExt};
    use parking_lot::Mutex as SyncMutex;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::timeout;

    enum Script {
        Refuse,
        Frames(Vec<String>),
    }

    /// Plays scripted sessions in order, then hangs on an idle session.
    #[derive(Default)]
    struct ScriptedConnector {
        scripts: SyncMutex<VecDeque<Script>>,
        connects: AtomicUsize,
    }

    impl ScriptedConnector {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: SyncMutex::new(scripts.into()),
                connects: AtomicUsize::new(0),
            })
        }

        fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    impl FeedConnector for ScriptedConnector {
        fn connect(&self, _url: String) -> BoxFuture<'static, Result<FrameStream, StreamError>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let script = self.scripts.lock().pop_front();
            async move {
                match script {
                    Some(Script::Refuse) => Err(StreamError::ConnectionLost("refused".to_string())),
                    Some(Script::Frames(frames)) => {
                        let frames: FrameStream = stream::iter(frames.into_iter().map(Ok)).boxed();
                        Ok(frames)
                    }
                    None => {
                        let idle: FrameStream = stream::pending().boxed();
                        Ok(idle)
                    }
                }
            }
            .boxed()
        }
    }

    fn kline(close_ms: i64, close: &str, is_closed: bool) -> String {
        serde_json::json!({
            "e": "kline",
            "s": "BTCUSDT",
            "k": {
                "t": close_ms - 59_999, "T": close_ms, "s": "BTCUSDT", "i": "1m",
                "o": "100", "h": "110", "l": "90", "c": close, "v": "5", "x": is_closed
            }
        })
        .to_string()
    }

    fn supervisor(
        connector: Arc<ScriptedConnector>,
        policy: ReconnectPolicy,
    ) -> (StreamSupervisor, mpsc::Receiver<Candle>) {
        let (tx, rx) = mpsc::channel(16);
        let supervisor = StreamSupervisor::new(
            connector,
            "ws://feed.test/ws",
            policy,
            tx,
            Duration::from_millis(100),
        );
        (supervisor, rx)
    }

    fn fast() -> ReconnectPolicy {
        ReconnectPolicy::new(Duration::from_millis(20), None)
    }

    #[tokio::test]
    async fn test_only_closed_update_is_forwarded() {
        let mut frames: Vec<String> = (0..10)
            .map(|i| kline(1_700_000_059_999, &format!("10{}", i), false))
            .collect();
        frames.push(kline(1_700_000_059_999, "105.5", true));
        let connector = ScriptedConnector::new(vec![Script::Frames(frames)]);
        let (supervisor, mut rx) = supervisor(connector, fast());

        let handle = supervisor.subscribe("btcusdt", "1m").await;

        let candle = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(candle.close, dec!(105.5));
        assert!(timeout(Duration::from_millis(150), rx.recv()).await.is_err());

        handle.close_and_wait().await;
    }

    #[tokio::test]
    async fn test_replay_after_reconnect_is_not_forwarded_twice() {
        let a = kline(1_700_000_059_999, "101", true);
        let b = kline(1_700_000_119_999, "102", true);
        let connector = ScriptedConnector::new(vec![
            Script::Frames(vec![a.clone()]),
            Script::Frames(vec![a, b]),
        ]);
        let (supervisor, mut rx) = supervisor(Arc::clone(&connector), fast());

        let handle = supervisor.subscribe("BTCUSDT", "1m").await;

        let first = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        let second = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.close, dec!(101));
        assert_eq!(second.close, dec!(102));
        assert!(timeout(Duration::from_millis(150), rx.recv()).await.is_err());

        // Third session is the idle one and stays up.
        timeout(Duration::from_secs(2), async {
            while connector.connects() < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(connector.connects(), 3);
        handle.close_and_wait().await;
    }

    #[tokio::test]
    async fn test_candle_dropped_on_full_queue_is_forwarded_on_replay() {
        let a = kline(1_700_000_059_999, "101", true);
        let connector = ScriptedConnector::new(vec![
            Script::Frames(vec![a.clone()]),
            Script::Frames(vec![a]),
        ]);
        let (tx, mut rx) = mpsc::channel(1);
        let supervisor = StreamSupervisor::new(
            Arc::clone(&connector) as Arc<dyn FeedConnector>,
            "ws://feed.test/ws",
            fast(),
            tx.clone(),
            Duration::from_millis(300),
        );

        // Fill the queue so the first delivery times out.
        let mut filler: Candle = crate::sources::kline::decode_frame(&kline(1_600_000_059_999, "1", true))
            .unwrap()
            .unwrap()
            .into_candle()
            .unwrap();
        filler.symbol = "FILLER".to_string();
        tx.send(filler).await.unwrap();

        let handle = supervisor.subscribe("btcusdt", "1m").await;
        timeout(Duration::from_secs(2), async {
            while connector.connects() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let drained = rx.recv().await.unwrap();
        assert_eq!(drained.symbol, "FILLER");

        let replayed = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(replayed.close, dec!(101));
        handle.close_and_wait().await;
    }

    #[tokio::test]
    async fn test_close_during_backoff_prevents_reconnect() {
        let connector = ScriptedConnector::new(vec![Script::Refuse]);
        let policy = ReconnectPolicy::new(Duration::from_millis(300), None);
        let (supervisor, _rx) = supervisor(Arc::clone(&connector), policy);

        let mut handle = supervisor.subscribe("btcusdt", "1m").await;
        let state = handle
            .wait_for(|s| matches!(s, SubscriptionState::Backoff { .. }))
            .await;
        assert_eq!(state, SubscriptionState::Backoff { attempt: 1 });

        handle.close();
        let state = timeout(Duration::from_secs(1), handle.wait_for(SubscriptionState::is_closed))
            .await
            .unwrap();
        assert!(state.is_closed());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(connector.connects(), 1);
        assert!(supervisor.active().await.is_empty());
    }

    #[tokio::test]
    async fn test_second_subscribe_replaces_first() {
        let connector = ScriptedConnector::new(vec![]);
        let (supervisor, _rx) = supervisor(Arc::clone(&connector), fast());

        let mut first = supervisor.subscribe("btcusdt", "1m").await;
        first.wait_for(|s| *s == SubscriptionState::Open).await;

        let mut second = supervisor.subscribe("BTCUSDT", "1m").await;
        // The old task is gone before subscribe returns.
        assert_eq!(first.state(), SubscriptionState::Closed);
        second.wait_for(|s| *s == SubscriptionState::Open).await;

        let active = supervisor.active().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].0.to_string(), "BTCUSDT@1m");
        assert_eq!(connector.connects(), 2);

        assert!(supervisor.unsubscribe("btcusdt", "1m").await);
        assert!(second.state().is_closed());
        assert!(!supervisor.unsubscribe("btcusdt", "1m").await);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let connector = ScriptedConnector::new((0..5).map(|_| Script::Refuse).collect());
        let policy = ReconnectPolicy::new(Duration::from_millis(10), Some(2));
        let (supervisor, _rx) = supervisor(Arc::clone(&connector), policy);

        let mut handle = supervisor.subscribe("ethusdt", "5m").await;
        let state = timeout(Duration::from_secs(2), handle.wait_for(SubscriptionState::is_closed))
            .await
            .unwrap();

        assert!(state.is_closed());
        assert_eq!(connector.connects(), 3);
    }

    #[tokio::test]
    async fn test_undecodable_frames_are_skipped() {
        let frames = vec![
            "garbage".to_string(),
            r#"{"result":null,"id":1}"#.to_string(),
            kline(1_700_000_059_999, "100", true),
        ];
        let connector = ScriptedConnector::new(vec![Script::Frames(frames)]);
        let (supervisor, mut rx) = supervisor(connector, fast());

        let handle = supervisor.subscribe("btcusdt", "1m").await;
        let candle = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(candle.close, dec!(100));

        handle.close_and_wait().await;
        supervisor.shutdown().await;
    }

    #[test]
    fn test_policy_limits() {
        let unlimited = ReconnectPolicy::default();
        assert_eq!(unlimited.delay, Duration::from_secs(5));
        assert!(unlimited.allows(u32::MAX));

        let capped = ReconnectPolicy::new(Duration::from_secs(1), Some(3));
        assert!(capped.allows(3));
        assert!(!capped.allows(4));
    }
}
