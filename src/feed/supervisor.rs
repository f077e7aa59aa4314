use super::record::{parse_message, InstrumentMap};
use super::transport::FeedTransport;
use crate::backoff::{sleep_or_shutdown, ExponentialBackoff};
use crate::error::{BotError, Result};
use crate::market::{CandleStore, MarketHours, SessionSnapshot};
use crate::models::Tick;
use crate::persistence::SnapshotStore;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Stale,
    Reconnecting,
}

/// Everything the supervisor publishes downstream
#[derive(Debug)]
pub enum FeedEvent {
    Connected,
    Tick(Tick),
    /// No tick within the staleness window; the connection is being rebuilt
    Stale { silent_for: Duration },
    /// Histories to reinstate. Always delivered before the first tick of the new connection.
    Restored(SessionSnapshot),
    /// Finite transport reached its end
    Finished,
    /// Reconnect budget exhausted or credentials refused
    Fatal(BotError),
}

/// When silence counts as staleness
#[derive(Debug, Clone, Copy)]
pub enum StalenessPolicy {
    Always,
    /// Only while the market is open; an idle feed overnight is expected
    MarketHours(MarketHours),
}

impl StalenessPolicy {
    fn applies_now(&self) -> bool {
        match self {
            Self::Always => true,
            Self::MarketHours(hours) => hours.is_open(Utc::now()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub stale_after: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub connect_timeout: Duration,
    pub teardown_grace: Duration,
    pub staleness: StalenessPolicy,
}

impl SupervisorConfig {
    pub fn from_settings(feed: &crate::config::FeedSettings, staleness: StalenessPolicy) -> Self {
        Self {
            stale_after: Duration::from_secs(feed.stale_after_secs),
            max_reconnect_attempts: feed.max_reconnect_attempts.max(1),
            reconnect_base: Duration::from_millis(feed.reconnect_base_ms),
            reconnect_max: Duration::from_millis(feed.reconnect_max_ms),
            connect_timeout: Duration::from_secs(feed.connect_timeout_secs),
            teardown_grace: Duration::from_millis(feed.teardown_grace_ms),
            staleness,
        }
    }
}

enum Flow {
    Continue,
    TickSeen,
    Reconnected,
    Stop,
}

enum Wake {
    Shutdown,
    Spurious,
    Silent,
    Message(Result<Option<String>>),
}

/// Owns the feed connection: connects, watches for silence, rebuilds the
/// connection with a history snapshot, and gives up after a bounded number
/// of attempts.
pub struct ConnectionSupervisor<T: FeedTransport> {
    transport: T,
    instruments: InstrumentMap,
    store: CandleStore,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    config: SupervisorConfig,
    backoff: ExponentialBackoff,
    state_tx: watch::Sender<ConnectionState>,
}

impl<T: FeedTransport> ConnectionSupervisor<T> {
    pub fn new(
        transport: T,
        instruments: InstrumentMap,
        store: CandleStore,
        config: SupervisorConfig,
    ) -> Self {
        let backoff = ExponentialBackoff::new(config.reconnect_base, config.reconnect_max, 0.1);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            instruments,
            store,
            snapshots: None,
            config,
            backoff,
            state_tx,
        }
    }

    pub fn with_snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(store);
        self
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(?previous, ?state, "feed state change");
        }
    }

    /// Run until shutdown, end of a finite feed, or a fatal error.
    ///
    /// Fatal errors are published as [`FeedEvent::Fatal`] and also returned.
    pub async fn run(
        mut self,
        events: mpsc::Sender<FeedEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        match self.connect_with_retry(&mut shutdown).await {
            Ok(()) => {}
            Err(BotError::Shutdown) => return self.stop().await,
            Err(e) => return self.fail(&events, e).await,
        }
        if events.send(FeedEvent::Connected).await.is_err() {
            return self.stop().await;
        }

        let mut last_tick = Instant::now();
        loop {
            let deadline = last_tick + self.config.stale_after;

            let wake = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        Wake::Shutdown
                    } else {
                        Wake::Spurious
                    }
                }
                _ = tokio::time::sleep_until(deadline) => Wake::Silent,
                message = self.transport.next_message() => Wake::Message(message),
            };

            let flow = match wake {
                Wake::Shutdown => return self.stop().await,
                Wake::Spurious => continue,
                Wake::Silent if !self.config.staleness.applies_now() => {
                    last_tick = Instant::now();
                    continue;
                }
                Wake::Silent => {
                    let silent_for = last_tick.elapsed();
                    warn!(silent_secs = silent_for.as_secs(), "feed stale");
                    self.set_state(ConnectionState::Stale);
                    if events.send(FeedEvent::Stale { silent_for }).await.is_err() {
                        return self.stop().await;
                    }
                    self.recover(&events, &mut shutdown).await
                }
                Wake::Message(Ok(Some(text))) => {
                    match publish(&self.instruments, &text, &events).await {
                        Ok(0) => Ok(Flow::Continue),
                        Ok(_) => Ok(Flow::TickSeen),
                        Err(_) => Ok(Flow::Stop),
                    }
                }
                Wake::Message(Ok(None)) if self.transport.is_finite() => {
                    info!("feed finished");
                    let _ = events.send(FeedEvent::Finished).await;
                    return self.stop().await;
                }
                Wake::Message(Ok(None)) => {
                    warn!("feed stream closed");
                    self.recover(&events, &mut shutdown).await
                }
                Wake::Message(Err(e)) => {
                    warn!(error = %e, "feed read failed");
                    self.recover(&events, &mut shutdown).await
                }
            };

            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::TickSeen) | Ok(Flow::Reconnected) => last_tick = Instant::now(),
                Ok(Flow::Stop) | Err(BotError::Shutdown) => return self.stop().await,
                Err(e) => return self.fail(&events, e).await,
            }
        }
    }

    /// Snapshot, tear down, reconnect, then hand the snapshot back downstream.
    async fn recover(
        &mut self,
        events: &mpsc::Sender<FeedEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Flow> {
        let snapshot = self.store.snapshot(Utc::now())?;
        info!(
            candles = snapshot.candle_count(),
            symbols = snapshot.histories.len(),
            "history snapshot taken before reconnect"
        );
        if let Some(store) = &self.snapshots {
            if let Err(e) = store.save(&snapshot).await {
                warn!(store = store.name(), error = %e, "failed to persist snapshot");
            }
        }

        if let Err(e) = self.transport.disconnect().await {
            debug!(error = %e, "disconnect during recovery failed");
        }
        self.set_state(ConnectionState::Reconnecting);
        sleep_or_shutdown(self.config.teardown_grace, shutdown).await?;

        self.connect_with_retry(shutdown).await?;

        if events.send(FeedEvent::Restored(snapshot)).await.is_err() {
            return Ok(Flow::Stop);
        }
        if events.send(FeedEvent::Connected).await.is_err() {
            return Ok(Flow::Stop);
        }
        Ok(Flow::Reconnected)
    }

    async fn connect_with_retry(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        if self.state() != ConnectionState::Reconnecting {
            self.set_state(ConnectionState::Connecting);
        }
        let keys = self.instruments.keys();
        let max = self.config.max_reconnect_attempts;
        let mut last_error = String::new();

        for attempt in 1..=max {
            let result = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Err(BotError::Shutdown);
                    }
                    Err(BotError::TransientNetwork("connection attempt interrupted".into()))
                }
                r = tokio::time::timeout(self.config.connect_timeout, self.transport.connect(&keys)) => {
                    r.unwrap_or_else(|_| Err(BotError::TransientNetwork("connect timeout".into())))
                }
            };

            match result {
                Ok(()) => {
                    info!(attempt, "feed connected");
                    self.backoff.reset();
                    self.set_state(ConnectionState::Connected);
                    return Ok(());
                }
                Err(e @ BotError::Auth(_)) => {
                    self.set_state(ConnectionState::Disconnected);
                    return Err(e);
                }
                Err(e) => {
                    warn!(attempt, max, error = %e, "feed connect failed");
                    last_error = e.to_string();
                    if attempt < max {
                        let delay = self.backoff.next_delay();
                        sleep_or_shutdown(delay, shutdown).await?;
                    }
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        Err(BotError::ConnectivityDegraded {
            attempts: max,
            reason: last_error,
        })
    }

    async fn stop(mut self) -> Result<()> {
        if let Err(e) = self.transport.disconnect().await {
            debug!(error = %e, "disconnect on shutdown failed");
        }
        self.set_state(ConnectionState::Disconnected);
        info!("feed supervisor stopped");
        Ok(())
    }

    async fn fail(mut self, events: &mpsc::Sender<FeedEvent>, err: BotError) -> Result<()> {
        error!(error = %err, "feed supervisor giving up");
        if let Err(e) = self.transport.disconnect().await {
            debug!(error = %e, "disconnect after failure failed");
        }
        self.set_state(ConnectionState::Disconnected);
        let _ = events.send(FeedEvent::Fatal(err.clone())).await;
        Err(err)
    }
}

/// Parse one message and forward its ticks. Malformed records are dropped.
async fn publish(
    instruments: &InstrumentMap,
    text: &str,
    events: &mpsc::Sender<FeedEvent>,
) -> std::result::Result<usize, mpsc::error::SendError<FeedEvent>> {
    let received_at = Utc::now();
    let mut delivered = 0;
    for record in parse_message(text) {
        match record.and_then(|r| instruments.to_tick(&r, received_at)) {
            Ok(tick) => {
                events.send(FeedEvent::Tick(tick)).await?;
                delivered += 1;
            }
            Err(e) => warn!(error = %e, "dropping feed record"),
        }
    }
    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstrumentConfig;
    use crate::feed::transport::ChannelTransport;
    use crate::models::TrendCandle;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            stale_after: Duration::from_secs(120),
            max_reconnect_attempts: 3,
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(8),
            connect_timeout: Duration::from_secs(10),
            teardown_grace: Duration::from_secs(2),
            staleness: StalenessPolicy::Always,
        }
    }

    fn instruments() -> InstrumentMap {
        InstrumentMap::from_config(&[InstrumentConfig {
            id: "NSE_INDEX|Nifty 50".to_string(),
            ..InstrumentConfig::default()
        }])
    }

    fn seeded_store(n: i64) -> CandleStore {
        let store = CandleStore::new(100);
        let start = Utc.with_ymd_and_hms(2026, 10, 19, 4, 0, 0).unwrap();
        for i in 0..n {
            store
                .push(TrendCandle {
                    symbol: "NIFTY_50".to_string(),
                    open: 100.0,
                    high: 101.0,
                    low: 99.0,
                    close: 100.5,
                    timestamp: start + ChronoDuration::minutes(i),
                })
                .unwrap();
        }
        store
    }

    fn record(price: f64) -> String {
        format!(r#"{{"instrumentId":"NSE_INDEX|Nifty 50","lastPrice":{},"volume":1}}"#, price)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_are_forwarded_and_bad_records_dropped() {
        let (feed_tx, feed_rx) = mpsc::channel(16);
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let supervisor = ConnectionSupervisor::new(
            ChannelTransport::new(feed_rx),
            instruments(),
            CandleStore::new(100),
            config(),
        );
        let handle = tokio::spawn(supervisor.run(event_tx, shutdown_rx));

        feed_tx.send("garbage".to_string()).await.unwrap();
        feed_tx.send(record(25000.0)).await.unwrap();

        assert!(matches!(event_rx.recv().await, Some(FeedEvent::Connected)));
        match event_rx.recv().await {
            Some(FeedEvent::Tick(tick)) => {
                assert_eq!(tick.symbol, "NIFTY_50");
                assert_eq!(tick.last_price, 25000.0);
            }
            other => panic!("expected tick, got {:?}", other),
        }

        drop(event_rx);
        drop(feed_tx);
        let _ = handle.await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_feed_reconnects_and_restores_before_ticks() {
        let (feed_tx, feed_rx) = mpsc::channel(16);
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let supervisor = ConnectionSupervisor::new(
            ChannelTransport::new(feed_rx),
            instruments(),
            seeded_store(40),
            config(),
        );
        let mut states = supervisor.subscribe_state();
        let handle = tokio::spawn(supervisor.run(event_tx, shutdown_rx));

        assert!(matches!(event_rx.recv().await, Some(FeedEvent::Connected)));
        // Silence: paused clock auto-advances past the staleness window
        match event_rx.recv().await {
            Some(FeedEvent::Stale { silent_for }) => assert!(silent_for >= Duration::from_secs(120)),
            other => panic!("expected stale, got {:?}", other),
        }
        match event_rx.recv().await {
            Some(FeedEvent::Restored(snapshot)) => {
                assert_eq!(snapshot.candle_count(), 40);
            }
            other => panic!("expected restore, got {:?}", other),
        }
        assert!(matches!(event_rx.recv().await, Some(FeedEvent::Connected)));
        assert_eq!(*states.borrow_and_update(), ConnectionState::Connected);

        feed_tx.send(record(25001.0)).await.unwrap();
        assert!(matches!(event_rx.recv().await, Some(FeedEvent::Tick(_))));

        shutdown_tx.send(true).unwrap();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_reconnects_are_fatal() {
        let (_feed_tx, feed_rx) = mpsc::channel::<String>(16);
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let refusals = (0..3).map(|_| BotError::TransientNetwork("refused".into()));
        let supervisor = ConnectionSupervisor::new(
            ChannelTransport::new(feed_rx).refuse_next(refusals),
            instruments(),
            CandleStore::new(100),
            config(),
        );

        let result = supervisor.run(event_tx, shutdown_rx).await;
        assert!(matches!(
            result,
            Err(BotError::ConnectivityDegraded { attempts: 3, .. })
        ));
        match event_rx.recv().await {
            Some(FeedEvent::Fatal(err)) => assert!(err.is_fatal()),
            other => panic!("expected fatal, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_is_not_retried() {
        let (_feed_tx, feed_rx) = mpsc::channel::<String>(16);
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let supervisor = ConnectionSupervisor::new(
            ChannelTransport::new(feed_rx).refuse_next([BotError::Auth("expired".into())]),
            instruments(),
            CandleStore::new(100),
            config(),
        );

        assert!(matches!(
            supervisor.run(event_tx, shutdown_rx).await,
            Err(BotError::Auth(_))
        ));
        assert!(matches!(
            event_rx.recv().await,
            Some(FeedEvent::Fatal(BotError::Auth(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_connect_failures() {
        let (_feed_tx, feed_rx) = mpsc::channel::<String>(16);
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let refusals = (0..2).map(|_| BotError::TransientNetwork("refused".into()));
        let supervisor = ConnectionSupervisor::new(
            ChannelTransport::new(feed_rx).refuse_next(refusals),
            instruments(),
            CandleStore::new(100),
            config(),
        );
        let handle = tokio::spawn(supervisor.run(event_tx, shutdown_rx));

        assert!(matches!(event_rx.recv().await, Some(FeedEvent::Connected)));
        shutdown_tx.send(true).unwrap();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_backoff() {
        let (_feed_tx, feed_rx) = mpsc::channel::<String>(16);
        let (event_tx, _event_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut cfg = config();
        cfg.reconnect_base = Duration::from_secs(3600);
        let supervisor = ConnectionSupervisor::new(
            ChannelTransport::new(feed_rx)
                .refuse_next([BotError::TransientNetwork("refused".into())]),
            instruments(),
            CandleStore::new(100),
            cfg,
        );
        let handle = tokio::spawn(supervisor.run(event_tx, shutdown_rx));

        tokio::task::yield_now().await;
        shutdown_tx.send(true).unwrap();
        assert!(handle.await.unwrap().is_ok());
    }
}
