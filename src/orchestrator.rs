use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Duration;

use crate::api::{OrderGateway, RateLimiter};
use crate::config::Settings;
use crate::error::{BotError, Result};
use crate::execution::{
    ClosedTrade, ExitContext, ExitDecision, PositionBook, PositionEntry, PositionSide,
};
use crate::feed::FeedEvent;
use crate::market::{CandleStore, ClosedCandle, MarketHours, MarketSession};
use crate::models::{
    BrokerPosition, Direction, EntrySignal, OptionKind, OrderAck, OrderRequest, OrderStatus,
    OrderType, StrikeMeta, Tick, TrendCandle,
};
use crate::notify::{BotEvent, NotificationSink};
use crate::persistence::SnapshotStore;
use crate::risk::{PositionSizer, RiskLimits, SessionState};
use crate::strategy::{Strategy, StrikeSelector};

/// What an in-flight order is meant to do once confirmed
#[derive(Debug, Clone)]
pub enum OrderIntent {
    Entry { entry: PositionEntry },
    Exit { decision: ExitDecision },
}

/// Result of an order task, delivered back to the event loop
#[derive(Debug)]
pub struct OrderOutcome {
    pub symbol: String,
    pub intent: OrderIntent,
    pub request: OrderRequest,
    pub result: Result<OrderAck>,
}

/// Whether the event loop keeps going
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Stop,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub entries: u32,
    pub closed_trades: usize,
    pub wins: u32,
    pub losses: u32,
    pub realized_pnl: f64,
    pub open_positions: usize,
}

/// Single event loop that owns the market session, the position book and
/// the session counters.
///
/// Feed events are handled one at a time. A candle close runs exits and then
/// entries before the next event is looked at. Orders run as separate tasks
/// and report back through a channel; the book changes only when an order
/// comes back confirmed.
pub struct Orchestrator {
    settings: Arc<Settings>,
    strategy: Arc<dyn Strategy>,
    session: MarketSession,
    book: PositionBook,
    state: SessionState,
    limits: RiskLimits,
    sizer: PositionSizer,
    hours: MarketHours,
    strikes: Option<StrikeSelector>,
    evaluated: HashSet<String>,
    gateway: Arc<dyn OrderGateway>,
    limiter: Arc<RateLimiter>,
    notifier: Arc<dyn NotificationSink>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    pending: HashSet<String>,
    quotes: HashMap<String, f64>,
    clock: Option<DateTime<Utc>>,
    order_timeout: Duration,
    outcomes_tx: mpsc::Sender<OrderOutcome>,
    outcomes_rx: mpsc::Receiver<OrderOutcome>,
}

impl Orchestrator {
    pub fn new(
        settings: Arc<Settings>,
        strategy: Arc<dyn Strategy>,
        store: CandleStore,
        gateway: Arc<dyn OrderGateway>,
        limiter: Arc<RateLimiter>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Result<Self> {
        let hours = MarketHours::from_settings(&settings.market)?;
        let strikes = settings
            .options
            .enabled
            .then(|| StrikeSelector::from_settings(&settings.options));
        let evaluated = settings
            .feed
            .instruments
            .iter()
            .filter(|i| i.evaluate)
            .map(|i| i.resolved_symbol())
            .collect();
        let (outcomes_tx, outcomes_rx) = mpsc::channel(64);

        Ok(Self {
            session: MarketSession::new(settings.feed.candle_interval_secs, store),
            book: PositionBook::new(),
            state: SessionState::new(hours.trading_day(Utc::now())),
            limits: RiskLimits::from_settings(&settings.risk),
            sizer: PositionSizer::from_settings(&settings.risk),
            order_timeout: Duration::from_secs(settings.api.order_timeout_secs),
            hours,
            strikes,
            evaluated,
            strategy,
            gateway,
            limiter,
            notifier,
            snapshots: None,
            pending: HashSet::new(),
            quotes: HashMap::new(),
            clock: None,
            outcomes_tx,
            outcomes_rx,
            settings,
        })
    }

    pub fn with_snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(store);
        self
    }

    pub fn book(&self) -> &PositionBook {
        &self.book
    }

    pub fn session_state(&self) -> &SessionState {
        &self.state
    }

    pub fn store(&self) -> &CandleStore {
        self.session.store()
    }

    pub fn has_pending_order(&self, symbol: &str) -> bool {
        self.pending.contains(symbol)
    }

    /// Event time: the latest tick seen, or the wall clock before any tick
    fn now(&self) -> DateTime<Utc> {
        self.clock.unwrap_or_else(Utc::now)
    }

    /// Warm histories from the stored snapshot, keeping only candles from
    /// the trading day of `now`.
    pub async fn preload(&mut self, now: DateTime<Utc>) -> Result<usize> {
        let Some(store) = self.snapshots.clone() else {
            return Ok(0);
        };
        if !self.settings.persistence.preload {
            return Ok(0);
        }

        let Some(mut snapshot) = store.load().await? else {
            tracing::info!(store = store.name(), "no stored snapshot to preload");
            return Ok(0);
        };

        let today = self.hours.trading_day(now);
        let hours = self.hours;
        snapshot.retain_day(today, |ts| hours.trading_day(ts));
        if snapshot.is_empty() {
            tracing::info!(day = %today, "stored snapshot has nothing from today");
            return Ok(0);
        }

        let restored = self.session.restore(&snapshot)?;
        tracing::info!(restored, store = store.name(), "📦 Preloaded candle history");
        Ok(restored)
    }

    /// Consume feed events until shutdown, the end of the feed, or a fatal error.
    ///
    /// However the loop ends, in-flight orders are settled and the candle
    /// histories are saved before returning.
    pub async fn run(
        &mut self,
        mut events: mpsc::Receiver<FeedEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<RunSummary> {
        tracing::info!(strategy = self.strategy.name(), "💹 Orchestrator running");

        let result = self.event_loop(&mut events, &mut shutdown).await;

        // Let in-flight orders settle so the book matches what the broker did
        let drained = self.drain_outcomes().await;
        self.persist_snapshot().await;

        match (result, drained) {
            (Ok(()), Ok(_)) => Ok(self.summary()),
            (Ok(()), Err(e)) => Err(e),
            (Err(e), drained) => {
                if let Err(drain_err) = drained {
                    tracing::error!(error = %drain_err, "settling orders after failure");
                }
                self.summary();
                Err(e)
            }
        }
    }

    async fn event_loop(
        &mut self,
        events: &mut mpsc::Receiver<FeedEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            let control = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("shutdown requested");
                        Control::Stop
                    } else {
                        Control::Continue
                    }
                }
                Some(outcome) = self.outcomes_rx.recv() => {
                    self.handle_outcome(outcome).await?;
                    Control::Continue
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await?,
                    None => Control::Stop,
                },
            };

            if control == Control::Stop {
                return Ok(());
            }
        }
    }

    /// Save the candle histories for the next start
    async fn persist_snapshot(&self) {
        let Some(store) = &self.snapshots else {
            return;
        };
        let snapshot = match self.session.store().snapshot(self.now()) {
            Ok(snapshot) if snapshot.is_empty() => return,
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(error = %e, "no snapshot on shutdown");
                return;
            }
        };
        match store.save(&snapshot).await {
            Ok(()) => tracing::info!(
                candles = snapshot.candle_count(),
                store = store.name(),
                "💾 Snapshot saved on shutdown"
            ),
            Err(e) => tracing::warn!(store = store.name(), error = %e, "snapshot save on shutdown failed"),
        }
    }

    /// Rebuild the book from positions the broker still holds.
    ///
    /// Recovered positions hold capital but do not count as today's entries.
    /// Returns the number of positions recovered.
    pub async fn recover_positions(&mut self) -> Result<usize> {
        let held = self.gateway.get_positions().await?;
        let now = self.now();
        let mut recovered = 0;

        for position in held {
            let Some(entry) = self.entry_for_broker_position(&position) else {
                tracing::warn!(instrument = %position.instrument, "broker position not tracked, left alone");
                continue;
            };
            if self.book.has_open_position(&entry.symbol) {
                continue;
            }

            let cost = entry.price * entry.lots as f64 * entry.multiplier;
            let symbol = entry.symbol.clone();
            match self.book.open_position_at(entry, now) {
                Ok(_) => {
                    self.state.hold_capital(cost);
                    recovered += 1;
                    tracing::info!(
                        symbol = %symbol,
                        instrument = %position.instrument,
                        quantity = position.quantity,
                        average_price = position.average_price,
                        "♻️ Position recovered"
                    );
                }
                Err(e) => tracing::warn!(symbol = %symbol, "broker position not booked: {}", e),
            }
        }
        Ok(recovered)
    }

    /// Match a broker position to a tracked symbol, directly or as an option on one
    fn entry_for_broker_position(&self, position: &BrokerPosition) -> Option<PositionEntry> {
        if position.quantity == 0 || !(position.average_price > 0.0) {
            return None;
        }

        let (symbol, direction, side, strike) = if self.evaluated.contains(&position.instrument) {
            let (direction, side) = if position.quantity > 0 {
                (Direction::Bullish, PositionSide::Long)
            } else {
                (Direction::Bearish, PositionSide::Short)
            };
            (position.instrument.clone(), direction, side, None)
        } else {
            if self.strikes.is_none() || position.quantity < 0 {
                return None;
            }
            let (underlying, strike, kind) = self.parse_option(&position.instrument)?;
            let direction = match kind {
                OptionKind::Call => Direction::Bullish,
                OptionKind::Put => Direction::Bearish,
            };
            let meta = StrikeMeta {
                underlying: underlying.clone(),
                strike,
                kind,
                instrument: position.instrument.clone(),
                spot_at_entry: self.quotes.get(&underlying).copied().unwrap_or(strike),
            };
            (underlying, direction, PositionSide::Long, Some(meta))
        };

        let multiplier = self.settings.multiplier_for(&symbol);
        let lots = (position.quantity.unsigned_abs() as f64 / multiplier).round() as u32;
        Some(PositionEntry {
            symbol,
            instrument: position.instrument.clone(),
            direction,
            side,
            lots,
            multiplier,
            price: position.average_price,
            strike,
            order_id: String::new(),
        })
    }

    /// Split `<underlying><strike><CE|PE>` for an evaluated underlying
    fn parse_option(&self, instrument: &str) -> Option<(String, f64, OptionKind)> {
        let code_at = instrument.len().checked_sub(2)?;
        let kind = OptionKind::from_code(instrument.get(code_at..)?)?;
        self.evaluated.iter().find_map(|underlying| {
            let strike = instrument.get(..code_at)?.strip_prefix(underlying.as_str())?;
            let strike: f64 = strike.parse().ok()?;
            Some((underlying.clone(), strike, kind))
        })
    }

    pub async fn handle_event(&mut self, event: FeedEvent) -> Result<Control> {
        match event {
            FeedEvent::Connected => {
                tracing::info!("🔌 Feed connected");
            }
            FeedEvent::Tick(tick) => self.on_tick(tick).await?,
            FeedEvent::Stale { silent_for } => {
                tracing::warn!(silent_secs = silent_for.as_secs(), "feed stale, awaiting recovery");
            }
            FeedEvent::Restored(snapshot) => {
                self.session.restore(&snapshot)?;
            }
            FeedEvent::Finished => {
                tracing::info!("feed finished");
                return Ok(Control::Stop);
            }
            FeedEvent::Fatal(err) => {
                let event = match &err {
                    BotError::Auth(reason) => BotEvent::AuthError {
                        reason: reason.clone(),
                    },
                    other => BotEvent::ConnectivityDegraded {
                        reason: other.to_string(),
                    },
                };
                self.notifier.notify(event).await;
                return Err(err);
            }
        }
        Ok(Control::Continue)
    }

    async fn on_tick(&mut self, tick: Tick) -> Result<()> {
        self.clock = Some(self.clock.map_or(tick.timestamp, |c| c.max(tick.timestamp)));
        self.state.roll_day(self.hours.trading_day(tick.timestamp));

        if self.settings.market.enforce_hours && !self.hours.is_open(tick.timestamp) {
            tracing::trace!(symbol = %tick.symbol, "tick outside market hours ignored");
            return Ok(());
        }

        self.quotes.insert(tick.symbol.clone(), tick.last_price);
        self.book.mark(&tick.symbol, tick.last_price);

        match self.session.on_tick(&tick) {
            Ok(Some(closed)) => self.on_candle_close(closed).await,
            Ok(None) => Ok(()),
            Err(BotError::DataIntegrity(reason)) => {
                tracing::warn!(symbol = %tick.symbol, "dropping tick: {}", reason);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn on_candle_close(&mut self, closed: ClosedCandle) -> Result<()> {
        let symbol = closed.trend.symbol.clone();
        if !self.evaluated.contains(&symbol) {
            return Ok(());
        }
        let history = self.session.store().candles(&symbol)?;

        if self.book.has_open_position(&symbol) {
            if !self.pending.contains(&symbol) {
                self.evaluate_exit(&symbol, &history).await?;
            }
            return Ok(());
        }

        if self.pending.contains(&symbol) {
            return Ok(());
        }

        match self.strategy.evaluate_entry(&history) {
            Ok(Some(signal)) => self.try_enter(signal).await,
            Ok(None) => Ok(()),
            Err(BotError::InsufficientHistory { have, need }) => {
                tracing::debug!(symbol = %symbol, have, need, "warming up");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(symbol = %symbol, error = %e, "entry evaluation failed");
                Ok(())
            }
        }
    }

    async fn evaluate_exit(&mut self, symbol: &str, history: &[TrendCandle]) -> Result<()> {
        let now = self.now();
        let Some(position) = self.book.get_open_position(symbol) else {
            return Ok(());
        };

        let evaluation = self.strategy.evaluate_exit(&ExitContext {
            position,
            price: position.current_price,
            now,
            history,
        });
        let instrument = position.instrument.clone();
        let units = position.units();
        let exit_side = position.side.exit_order();

        self.book
            .set_trail(symbol, evaluation.trail)
            .map_err(|e| BotError::DataIntegrity(e.to_string()))?;

        let Some(decision) = evaluation.decision else {
            return Ok(());
        };

        tracing::info!(
            symbol = %symbol,
            reason = %decision.reason,
            price = decision.price,
            pnl = decision.pnl,
            pnl_pct = decision.pnl_pct,
            "🚪 Exit signal"
        );
        self.notifier
            .notify(BotEvent::ExitSignal {
                symbol: symbol.to_string(),
                instrument: instrument.clone(),
                reason: decision.reason,
                price: decision.price,
                pnl: decision.pnl,
                pnl_pct: decision.pnl_pct,
            })
            .await;

        let request = OrderRequest {
            symbol: instrument,
            quantity: units.round() as u32,
            price: decision.price,
            side: exit_side,
            order_type: OrderType::Market,
        };
        self.submit(symbol.to_string(), OrderIntent::Exit { decision }, request);
        Ok(())
    }

    async fn try_enter(&mut self, signal: EntrySignal) -> Result<()> {
        let now = self.now();
        let symbol = signal.symbol.clone();

        if let Err(block) = self.limits.check(&self.state, &symbol, now) {
            tracing::info!(symbol = %symbol, direction = %signal.direction, "entry skipped: {}", block);
            return Ok(());
        }

        let spot = self.quotes.get(&symbol).copied().unwrap_or(signal.price);
        let (instrument, strike): (String, Option<StrikeMeta>) = match &self.strikes {
            Some(selector) => {
                let meta = selector.select(&symbol, spot, signal.direction);
                (meta.instrument.clone(), Some(meta))
            }
            None => (symbol.clone(), None),
        };

        let Some(price) = self.quotes.get(&instrument).copied() else {
            tracing::warn!(symbol = %symbol, instrument = %instrument, "entry skipped: no quote for instrument");
            return Ok(());
        };

        let multiplier = self.settings.multiplier_for(&symbol);
        let free = self.state.free_capital(self.sizer.capital());
        let lots = match self.sizer.lots_for(price, multiplier, free) {
            Ok(lots) => lots,
            Err(block) => {
                tracing::info!(symbol = %symbol, price, "entry skipped: {}", block);
                return Ok(());
            }
        };

        let side = PositionSide::for_entry(signal.direction, self.strikes.is_some());
        tracing::info!(
            symbol = %symbol,
            instrument = %instrument,
            direction = %signal.direction,
            price,
            lots,
            adx = signal.adx,
            trend_line = signal.trend_line,
            "🎯 Entry signal"
        );
        self.notifier.notify(BotEvent::EntrySignal(signal.clone())).await;

        let request = OrderRequest {
            symbol: instrument.clone(),
            quantity: (lots as f64 * multiplier).round() as u32,
            price,
            side: side.entry_order(),
            order_type: OrderType::Market,
        };
        let entry = PositionEntry {
            symbol: symbol.clone(),
            instrument,
            direction: signal.direction,
            side,
            lots,
            multiplier,
            price,
            strike,
            order_id: String::new(),
        };
        self.state.reserve_entry(price * lots as f64 * multiplier);
        self.submit(symbol, OrderIntent::Entry { entry }, request);
        Ok(())
    }

    /// Place an order on its own task; the outcome comes back on the outcome channel
    fn submit(&mut self, symbol: String, intent: OrderIntent, request: OrderRequest) {
        self.pending.insert(symbol.clone());

        let gateway = self.gateway.clone();
        let limiter = self.limiter.clone();
        let outcomes = self.outcomes_tx.clone();
        let timeout = self.order_timeout;

        tokio::spawn(async move {
            // The timeout covers each broker call, not the limiter's waits
            let result = {
                let gateway = &gateway;
                let request = &request;
                limiter
                    .execute(move || async move {
                        tokio::time::timeout(timeout, gateway.place_order(request))
                            .await
                            .unwrap_or_else(|_| {
                                Err(BotError::TransientNetwork(format!(
                                    "order for {} timed out after {}s",
                                    request.symbol,
                                    timeout.as_secs()
                                )))
                            })
                    })
                    .await
            };

            let outcome = OrderOutcome {
                symbol,
                intent,
                request,
                result,
            };
            if outcomes.send(outcome).await.is_err() {
                tracing::error!("order outcome dropped: event loop gone");
            }
        });
    }

    pub async fn handle_outcome(&mut self, outcome: OrderOutcome) -> Result<()> {
        let OrderOutcome {
            symbol,
            intent,
            request,
            result,
        } = outcome;
        self.pending.remove(&symbol);
        if let OrderIntent::Entry { entry } = &intent {
            self.state
                .release_entry(entry.price * entry.lots as f64 * entry.multiplier);
        }

        let ack = match result {
            Ok(ack) => ack,
            Err(BotError::Auth(reason)) => {
                tracing::error!(symbol = %symbol, "order refused, credentials invalid: {}", reason);
                self.notifier
                    .notify(BotEvent::AuthError {
                        reason: reason.clone(),
                    })
                    .await;
                return Err(BotError::Auth(reason));
            }
            Err(BotError::Shutdown) => return Ok(()),
            Err(e) => {
                tracing::warn!(symbol = %symbol, instrument = %request.symbol, error = %e, "order failed, book unchanged");
                return Ok(());
            }
        };

        if ack.status != OrderStatus::Confirmed {
            tracing::warn!(
                symbol = %symbol,
                order_id = %ack.order_id,
                status = ?ack.status,
                "order not confirmed, book unchanged"
            );
            return Ok(());
        }

        let fill = ack.fill_price.unwrap_or(request.price);
        let now = self.now();
        match intent {
            OrderIntent::Entry { mut entry } => {
                entry.price = fill;
                entry.order_id = ack.order_id;
                let cost = fill * entry.lots as f64 * entry.multiplier;
                match self.book.open_position_at(entry, now) {
                    Ok(_) => self.state.record_entry(cost),
                    Err(e) => tracing::error!(symbol = %symbol, "confirmed entry not booked: {}", e),
                }
            }
            OrderIntent::Exit { decision } => {
                let cost = self
                    .book
                    .get_open_position(&symbol)
                    .map(|p| p.cost_basis())
                    .unwrap_or(0.0);
                match self.book.close_position_at(&symbol, fill, decision.reason, now) {
                    Ok(trade) => self.settle(&trade, cost),
                    Err(e) => tracing::error!(symbol = %symbol, "confirmed exit not booked: {}", e),
                }
            }
        }
        Ok(())
    }

    fn settle(&mut self, trade: &ClosedTrade, cost: f64) {
        self.state
            .record_exit(&trade.symbol, cost, trade.pnl, trade.closed_at);
        tracing::info!(
            symbol = %trade.symbol,
            pnl = trade.pnl,
            realized = self.state.realized_pnl,
            free_capital = self.state.free_capital(self.sizer.capital()),
            "💰 Capital released"
        );
    }

    /// Wait for every in-flight order to report back and apply the outcomes
    pub async fn drain_outcomes(&mut self) -> Result<usize> {
        let mut handled = 0;
        while !self.pending.is_empty() {
            match self.outcomes_rx.recv().await {
                Some(outcome) => {
                    self.handle_outcome(outcome).await?;
                    handled += 1;
                }
                None => break,
            }
        }
        Ok(handled)
    }

    pub fn summary(&self) -> RunSummary {
        let summary = RunSummary {
            entries: self.state.trades_today,
            closed_trades: self.book.closed_trades().len(),
            wins: self.state.wins,
            losses: self.state.losses,
            realized_pnl: self.state.realized_pnl,
            open_positions: self.book.open_count(),
        };
        tracing::info!(
            entries_today = summary.entries,
            closed = summary.closed_trades,
            wins = summary.wins,
            losses = summary.losses,
            win_rate = self.state.win_rate(),
            realized_pnl = summary.realized_pnl,
            open = summary.open_positions,
            "📊 Session summary"
        );
        summary
    }
}
