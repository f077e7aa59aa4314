use crate::error::{BotError, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Raw market-data connection. Publishes message text only; parsing and
/// candle building happen downstream.
#[async_trait]
pub trait FeedTransport: Send {
    /// Open the connection and subscribe to the given instrument keys
    async fn connect(&mut self, instruments: &[String]) -> Result<()>;

    /// Next raw message. `Ok(None)` means the stream ended.
    async fn next_message(&mut self) -> Result<Option<String>>;

    async fn disconnect(&mut self) -> Result<()>;

    /// Transports that end for good (replays) rather than dropping
    fn is_finite(&self) -> bool {
        false
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket feed: JSON subscribe frame, then one JSON message per frame
pub struct WsFeedTransport {
    url: String,
    connect_timeout: Duration,
    stream: Option<WsStream>,
}

impl WsFeedTransport {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
            stream: None,
        }
    }
}

#[async_trait]
impl FeedTransport for WsFeedTransport {
    async fn connect(&mut self, instruments: &[String]) -> Result<()> {
        let (mut stream, _) = timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| BotError::TransientNetwork("feed connection timeout".into()))?
            .map_err(|e| match e {
                tokio_tungstenite::tungstenite::Error::Http(ref resp)
                    if resp.status().as_u16() == 401 || resp.status().as_u16() == 403 =>
                {
                    BotError::Auth(format!("feed refused credentials: {}", resp.status()))
                }
                other => BotError::TransientNetwork(other.to_string()),
            })?;

        let subscribe = serde_json::json!({
            "method": "sub",
            "data": { "mode": "ltpc", "instrumentKeys": instruments },
        });
        stream
            .send(Message::Text(subscribe.to_string()))
            .await
            .map_err(|e| BotError::TransientNetwork(e.to_string()))?;

        tracing::info!(url = %self.url, instruments = instruments.len(), "feed subscribed");
        self.stream = Some(stream);
        Ok(())
    }

    async fn next_message(&mut self) -> Result<Option<String>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| BotError::TransientNetwork("feed not connected".into()))?;

        while let Some(frame) = stream.next().await {
            match frame.map_err(|e| BotError::TransientNetwork(e.to_string()))? {
                Message::Text(text) => return Ok(Some(text)),
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => return Ok(Some(text)),
                    Err(_) => tracing::warn!("dropping non-UTF-8 binary frame"),
                },
                Message::Close(frame) => {
                    tracing::warn!(?frame, "feed closed by server");
                    return Ok(None);
                }
                // Pings are answered by tungstenite on the next read/write
                _ => {}
            }
        }
        Ok(None)
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.close(None).await {
                tracing::debug!(error = %e, "feed close handshake failed");
            }
        }
        Ok(())
    }
}

/// Replays a JSON-lines capture of feed messages
pub struct ReplayTransport {
    path: PathBuf,
    pace: Option<Duration>,
    lines: Option<Lines<BufReader<tokio::fs::File>>>,
}

impl ReplayTransport {
    /// # Arguments
    /// * `pace` - Optional delay between messages
    pub fn new(path: impl Into<PathBuf>, pace: Option<Duration>) -> Self {
        Self {
            path: path.into(),
            pace,
            lines: None,
        }
    }
}

#[async_trait]
impl FeedTransport for ReplayTransport {
    async fn connect(&mut self, _instruments: &[String]) -> Result<()> {
        if self.lines.is_some() {
            // Reconnecting a replay continues where it stopped
            return Ok(());
        }
        let file = tokio::fs::File::open(&self.path).await.map_err(|e| {
            BotError::Config(format!("cannot open replay {}: {}", self.path.display(), e))
        })?;
        self.lines = Some(BufReader::new(file).lines());
        tracing::info!(path = %self.path.display(), "replaying feed capture");
        Ok(())
    }

    async fn next_message(&mut self) -> Result<Option<String>> {
        let lines = self
            .lines
            .as_mut()
            .ok_or_else(|| BotError::TransientNetwork("replay not opened".into()))?;

        if let Some(pace) = self.pace {
            tokio::time::sleep(pace).await;
        }
        loop {
            let line = lines
                .next_line()
                .await
                .map_err(|e| BotError::TransientNetwork(format!("replay read: {}", e)))?;
            match line {
                Some(line) if line.trim().is_empty() => continue,
                other => return Ok(other),
            }
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_finite(&self) -> bool {
        true
    }
}

/// In-process feed fed through a channel.
///
/// The first `refuse` connection attempts fail with a transient error.
pub struct ChannelTransport {
    rx: mpsc::Receiver<String>,
    refuse: VecDeque<BotError>,
    connected: bool,
    connects: u32,
}

impl ChannelTransport {
    pub fn new(rx: mpsc::Receiver<String>) -> Self {
        Self {
            rx,
            refuse: VecDeque::new(),
            connected: false,
            connects: 0,
        }
    }

    /// Queue errors returned by upcoming connection attempts
    pub fn refuse_next(mut self, errors: impl IntoIterator<Item = BotError>) -> Self {
        self.refuse.extend(errors);
        self
    }

    pub fn successful_connects(&self) -> u32 {
        self.connects
    }
}

#[async_trait]
impl FeedTransport for ChannelTransport {
    async fn connect(&mut self, _instruments: &[String]) -> Result<()> {
        if let Some(err) = self.refuse.pop_front() {
            return Err(err);
        }
        self.connected = true;
        self.connects += 1;
        Ok(())
    }

    async fn next_message(&mut self) -> Result<Option<String>> {
        if !self.connected {
            return Err(BotError::TransientNetwork("channel feed not connected".into()));
        }
        Ok(self.rx.recv().await)
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }
}
