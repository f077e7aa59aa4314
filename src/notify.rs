use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::execution::ExitReason;
use crate::models::EntrySignal;

/// Structured events for whoever delivers notifications
#[derive(Debug, Clone, PartialEq)]
pub enum BotEvent {
    EntrySignal(EntrySignal),
    ExitSignal {
        symbol: String,
        instrument: String,
        reason: ExitReason,
        price: f64,
        pnl: f64,
        pnl_pct: f64,
    },
    ConnectivityDegraded {
        reason: String,
    },
    AuthError {
        reason: String,
    },
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, event: BotEvent);
}

/// Writes events to the log
#[derive(Debug, Default, Clone)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(&self, event: BotEvent) {
        match event {
            BotEvent::EntrySignal(signal) => tracing::info!(
                symbol = %signal.symbol,
                direction = %signal.direction,
                price = signal.price,
                adx = signal.adx,
                "🔔 Entry signal"
            ),
            BotEvent::ExitSignal {
                symbol,
                reason,
                price,
                pnl,
                ..
            } => tracing::info!(symbol = %symbol, reason = %reason, price, pnl, "🔔 Exit signal"),
            BotEvent::ConnectivityDegraded { reason } => {
                tracing::error!("🚨 Connectivity degraded: {}", reason)
            }
            BotEvent::AuthError { reason } => tracing::error!("🚨 Authentication failed: {}", reason),
        }
    }
}

/// Forwards events over a channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<BotEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BotEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationSink for ChannelSink {
    async fn notify(&self, event: BotEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("notification receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_forwards() {
        let (sink, mut rx) = ChannelSink::new();
        sink.notify(BotEvent::ConnectivityDegraded {
            reason: "feed down".into(),
        })
        .await;

        assert_eq!(
            rx.recv().await,
            Some(BotEvent::ConnectivityDegraded {
                reason: "feed down".into()
            })
        );
    }

    #[tokio::test]
    async fn test_channel_sink_survives_closed_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.notify(BotEvent::AuthError {
            reason: "expired".into(),
        })
        .await;
    }
}
