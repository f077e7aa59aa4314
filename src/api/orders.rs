use super::auth::AuthProvider;
use crate::error::{BotError, Result};
use crate::models::{BrokerPosition, OrderAck, OrderRequest, OrderStatus};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Order placement. Only a `Confirmed` ack may change the position book.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck>;

    /// Positions currently held at the broker, used to rebuild the book at startup
    async fn get_positions(&self) -> Result<Vec<BrokerPosition>>;

    fn name(&self) -> &str;
}

/// Simulated fills at the requested price
#[derive(Debug, Default)]
pub struct PaperOrderGateway {
    seq: AtomicU64,
}

impl PaperOrderGateway {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderGateway for PaperOrderGateway {
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck> {
        if order.quantity == 0 || !(order.price > 0.0) {
            return Ok(OrderAck {
                order_id: String::new(),
                status: OrderStatus::Rejected,
                fill_price: None,
            });
        }

        let n = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let order_id = format!("PAPER_{}_{:04}", Utc::now().format("%Y%m%d_%H%M%S"), n);
        tracing::info!(
            order_id = %order_id,
            symbol = %order.symbol,
            side = ?order.side,
            quantity = order.quantity,
            price = order.price,
            "📝 paper order filled"
        );

        Ok(OrderAck {
            order_id,
            status: OrderStatus::Confirmed,
            fill_price: Some(order.price),
        })
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>> {
        Ok(Vec::new())
    }

    fn name(&self) -> &str {
        "paper"
    }
}

#[derive(Debug, Deserialize)]
struct PositionsResponse {
    data: Vec<BrokerPosition>,
}

/// Broker REST order endpoint
pub struct HttpOrderGateway {
    client: Client,
    url: String,
    positions_url: Option<String>,
    auth: Arc<dyn AuthProvider>,
}

impl HttpOrderGateway {
    pub fn new(url: impl Into<String>, auth: Arc<dyn AuthProvider>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BotError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
            positions_url: None,
            auth,
        })
    }

    pub fn with_positions_url(mut self, url: impl Into<String>) -> Self {
        self.positions_url = Some(url.into());
        self
    }
}

/// Status and body of a broker response
async fn read_response(response: Response, what: &str) -> Result<(StatusCode, String)> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| BotError::TransientNetwork(format!("{} response unreadable: {}", what, e)))?;
    Ok((status, body))
}

/// Errors shared by every broker endpoint; client errors are left to the caller
fn status_error(status: StatusCode, body: &str, what: &str) -> Option<BotError> {
    match status {
        StatusCode::TOO_MANY_REQUESTS => Some(BotError::RateLimited(body.to_string())),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Some(BotError::Auth(format!(
            "{} API refused credentials: {}",
            what, status
        ))),
        s if s.is_server_error() => Some(BotError::TransientNetwork(format!(
            "{} API {}: {}",
            what, s, body
        ))),
        _ => None,
    }
}

#[async_trait]
impl OrderGateway for HttpOrderGateway {
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck> {
        let token = self.auth.get_token()?;

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(token)
            .json(order)
            .send()
            .await
            .map_err(|e| BotError::TransientNetwork(format!("order request failed: {}", e)))?;

        let (status, body) = read_response(response, "order").await?;
        if let Some(err) = status_error(status, &body, "order") {
            return Err(err);
        }

        match status {
            s if s.is_client_error() => Err(BotError::OrderRejected(format!("{}: {}", s, body))),
            _ => {
                let ack: OrderAck = serde_json::from_str(&body).map_err(|e| {
                    BotError::DataIntegrity(format!("unreadable order ack: {} ({})", e, body))
                })?;
                tracing::info!(
                    order_id = %ack.order_id,
                    status = ?ack.status,
                    symbol = %order.symbol,
                    "order acknowledged"
                );
                Ok(ack)
            }
        }
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>> {
        let Some(url) = &self.positions_url else {
            return Ok(Vec::new());
        };
        let token = self.auth.get_token()?;

        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| BotError::TransientNetwork(format!("positions request failed: {}", e)))?;

        let (status, body) = read_response(response, "positions").await?;
        if let Some(err) = status_error(status, &body, "positions") {
            return Err(err);
        }
        if status.is_client_error() {
            return Err(BotError::DataIntegrity(format!("positions API {}: {}", status, body)));
        }

        let parsed: PositionsResponse = serde_json::from_str(&body).map_err(|e| {
            BotError::DataIntegrity(format!("unreadable positions: {} ({})", e, body))
        })?;
        let held: Vec<BrokerPosition> = parsed
            .data
            .into_iter()
            .filter(|p| p.quantity != 0 && p.average_price > 0.0)
            .collect();
        tracing::info!(count = held.len(), "broker positions fetched");
        Ok(held)
    }

    fn name(&self) -> &str {
        "http"
    }
}
