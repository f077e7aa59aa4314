use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use trendbot::api::{
    AuthProvider, HttpOrderGateway, OrderGateway, PaperOrderGateway, RateLimiter,
    RateLimiterConfig, StaticTokenAuth,
};
use trendbot::config::{LayeredSettings, SettingsProvider, SnapshotBackend};
use trendbot::feed::{
    ConnectionSupervisor, FeedEvent, FeedTransport, InstrumentMap, ReplayTransport,
    StalenessPolicy, SupervisorConfig, WsFeedTransport,
};
use trendbot::market::{CandleStore, MarketHours};
use trendbot::notify::LogSink;
use trendbot::persistence::{JsonFileSnapshotStore, RedisSnapshotStore, SnapshotStore};
use trendbot::strategy::{Strategy, TrendFollowStrategy};
use trendbot::{BotError, Orchestrator, Settings};

#[derive(Parser, Debug)]
#[command(name = "trendbot", about = "Trend-candle signal bot over a live tick feed")]
struct Args {
    /// TOML settings file layered over the defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Replay a JSON-lines feed capture instead of connecting live
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Tracing filter, e.g. "trendbot=debug"
    #[arg(long)]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    setup_logging(args.log.as_deref());

    tracing::info!("🚀 TrendBot starting");

    let settings = Arc::new(
        LayeredSettings {
            path: args.config.clone(),
        }
        .load()
        .context("loading settings")?,
    );
    let hours = MarketHours::from_settings(&settings.market)?;
    log_configuration(&settings, args.replay.is_some());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let store = CandleStore::new(settings.feed.history_capacity);
    let snapshots = connect_snapshot_store(&settings).await?;

    let limiter = Arc::new(
        RateLimiter::new(RateLimiterConfig::from_settings(&settings.api))?
            .with_shutdown(shutdown_rx.clone()),
    );
    let gateway = create_order_gateway(&settings)?;
    let strategy: Arc<dyn Strategy> = Arc::new(TrendFollowStrategy::from_settings(&settings)?);
    tracing::info!("  Strategy: {} (warm-up {} candles)", strategy.name(), strategy.min_candles_required());

    let mut orchestrator = Orchestrator::new(
        settings.clone(),
        strategy,
        store.clone(),
        gateway,
        limiter,
        Arc::new(LogSink),
    )?;
    if let Some(snapshots) = &snapshots {
        orchestrator = orchestrator.with_snapshot_store(snapshots.clone());
    }
    match orchestrator.preload(Utc::now()).await {
        Ok(n) if n > 0 => tracing::info!("✅ Warm start with {} candles", n),
        Ok(_) => tracing::info!("  Cold start, histories empty"),
        Err(e) => tracing::warn!("Snapshot preload failed, starting cold: {}", e),
    }
    match orchestrator.recover_positions().await {
        Ok(n) if n > 0 => tracing::info!("✅ Recovered {} open positions from the broker", n),
        Ok(_) => {}
        Err(e @ BotError::Auth(_)) => {
            return Err(anyhow::Error::new(e).context("recovering broker positions"));
        }
        Err(e) => tracing::warn!("Position recovery failed, starting with an empty book: {}", e),
    }

    // ========================================================================
    // Feed and trading loop
    // ========================================================================

    let (event_tx, event_rx) = mpsc::channel(1024);
    let instruments = InstrumentMap::from_config(&settings.feed.instruments);

    let feed_task = match &args.replay {
        Some(path) => {
            tracing::info!("🎞️  Replaying {}", path.display());
            let config = SupervisorConfig::from_settings(&settings.feed, StalenessPolicy::Always);
            spawn_feed(
                ReplayTransport::new(path.clone(), None),
                instruments,
                store,
                config,
                snapshots,
                event_tx,
                shutdown_rx.clone(),
            )
        }
        None => {
            let url = settings.feed.url.clone();
            tracing::info!("🔌 Connecting to {}", url);
            let staleness = if settings.market.enforce_hours {
                StalenessPolicy::MarketHours(hours)
            } else {
                StalenessPolicy::Always
            };
            let config = SupervisorConfig::from_settings(&settings.feed, staleness);
            let transport =
                WsFeedTransport::new(url, Duration::from_secs(settings.feed.connect_timeout_secs));
            spawn_feed(
                transport,
                instruments,
                store,
                config,
                snapshots,
                event_tx,
                shutdown_rx.clone(),
            )
        }
    };

    let mut trading_task =
        tokio::spawn(async move { orchestrator.run(event_rx, shutdown_rx).await });
    tracing::info!("\nPress Ctrl+C to stop...\n");

    let outcome = tokio::select! {
        result = &mut trading_task => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("\n⚠️  Received Ctrl+C, shutting down...");
            let _ = shutdown_tx.send(true);
            trading_task.await
        }
    };

    // Stop the feed whichever way the trading loop ended
    let _ = shutdown_tx.send(true);
    match feed_task.await {
        Ok(Err(e)) => tracing::error!("Feed supervisor exited with error: {}", e),
        Err(e) => tracing::error!("Feed task panicked: {}", e),
        Ok(Ok(())) => {}
    }

    let summary = outcome.context("trading loop panicked")??;
    tracing::info!(
        "👋 TrendBot stopped: {} closed trades, realized P&L {:.2}",
        summary.closed_trades,
        summary.realized_pnl
    );
    Ok(())
}

// ============================================================================
// Initialization Functions
// ============================================================================

fn setup_logging(filter: Option<&str>) {
    let filter = filter
        .map(tracing_subscriber::EnvFilter::new)
        .or_else(|| tracing_subscriber::EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new("trendbot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn log_configuration(settings: &Settings, replay: bool) {
    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Mode: {}", if replay { "replay" } else { "live feed" });
    tracing::info!(
        "  Orders: {}",
        if settings.api.paper_trading || settings.api.order_url.is_none() {
            "paper"
        } else {
            "live"
        }
    );
    tracing::info!("  Capital: {:.2}", settings.risk.capital);
    tracing::info!("  Max Daily Trades: {}", settings.risk.max_daily_trades);
    tracing::info!(
        "  Stop Loss: {}% | Target: {}% | Trail: {}%/{}%",
        settings.exits.stop_loss_pct,
        settings.exits.profit_target_pct,
        settings.exits.trail_activation_pct,
        settings.exits.trail_step_pct
    );
    tracing::info!("  Candle Interval: {}s", settings.feed.candle_interval_secs);
    tracing::info!("  Options Mode: {}", settings.options.enabled);
    tracing::info!("  Instruments:");
    for instrument in &settings.feed.instruments {
        tracing::info!(
            "    - {} ({}, x{})",
            instrument.resolved_symbol(),
            instrument.id,
            instrument.multiplier
        );
    }
}

async fn connect_snapshot_store(settings: &Settings) -> anyhow::Result<Option<Arc<dyn SnapshotStore>>> {
    let persistence = &settings.persistence;
    let store: Option<Arc<dyn SnapshotStore>> = match persistence.backend {
        SnapshotBackend::None => None,
        SnapshotBackend::File => Some(Arc::new(JsonFileSnapshotStore::new(&persistence.path))),
        SnapshotBackend::Redis => match RedisSnapshotStore::new(&persistence.redis_url, &persistence.redis_key).await {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                tracing::warn!("Redis unavailable, snapshots disabled: {}", e);
                None
            }
        },
    };
    if let Some(store) = &store {
        tracing::info!("  Snapshot store: {}", store.name());
    }
    Ok(store)
}

fn create_order_gateway(settings: &Settings) -> anyhow::Result<Arc<dyn OrderGateway>> {
    let api = &settings.api;
    match (&api.order_url, api.paper_trading) {
        (Some(url), false) => {
            let auth = StaticTokenAuth::from_env(&api.token_env);
            if !auth.is_valid() {
                anyhow::bail!("{} must hold a valid token for live trading", api.token_env);
            }
            let mut gateway = HttpOrderGateway::new(
                url.clone(),
                Arc::new(auth),
                Duration::from_secs(api.order_timeout_secs),
            )?;
            if let Some(positions_url) = &api.positions_url {
                gateway = gateway.with_positions_url(positions_url.clone());
            }
            Ok(Arc::new(gateway))
        }
        _ => Ok(Arc::new(PaperOrderGateway::new())),
    }
}

fn spawn_feed<T: FeedTransport + 'static>(
    transport: T,
    instruments: InstrumentMap,
    store: CandleStore,
    config: SupervisorConfig,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    events: mpsc::Sender<FeedEvent>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<trendbot::Result<()>> {
    let mut supervisor = ConnectionSupervisor::new(transport, instruments, store, config);
    if let Some(snapshots) = snapshots {
        supervisor = supervisor.with_snapshot_store(snapshots);
    }
    tokio::spawn(supervisor.run(events, shutdown))
}
