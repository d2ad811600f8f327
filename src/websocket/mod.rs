//! Exchange WebSocket client
//!
//! One client per (exchange, market) connection. Frames are forwarded to
//! the manager's router; outbound frames (OKX subscribe/unsubscribe) come
//! in over a command channel. Reconnects use exponential backoff and are
//! followed by resubscription plus a `Resubscribed` event so the manager
//! can force a resync of every symbol on the connection.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use crate::metrics::CollectorMetrics;

/// Backoff reset threshold: a connection that lived this long counts as
/// healthy and resets the retry counter.
const HEALTHY_CONNECTION: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum WsError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("stream error: {0}")]
    Stream(String),
    #[error("no frames within idle timeout")]
    IdleTimeout,
    #[error("connection closed by server")]
    Closed,
}

/// Events emitted to the manager
#[derive(Debug)]
pub enum WsEvent {
    /// A text frame from the exchange
    Frame(String),
    /// Connection re-established and subscriptions replayed; every symbol
    /// on this connection must resync
    Resubscribed,
    /// Reconnect budget exhausted; the connection is gone for good
    Failed,
}

#[derive(Debug, Clone)]
pub struct WsConfig {
    pub url: String,
    /// Frames sent after every (re)connect
    pub subscribe_frames: Vec<String>,
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// 0 means retry forever
    pub max_reconnect_attempts: u32,
    /// OKX expects a literal `"ping"` text heartbeat instead of a ping frame
    pub text_ping: bool,
}

/// Handle to a spawned connection task
pub struct WsHandle {
    pub events: mpsc::Receiver<WsEvent>,
    pub commands: mpsc::Sender<String>,
    pub task: JoinHandle<()>,
}

/// Spawn the connection task for one exchange stream
pub fn spawn(
    config: WsConfig,
    metrics: Arc<CollectorMetrics>,
    shutdown: watch::Receiver<bool>,
) -> WsHandle {
    let (event_tx, event_rx) = mpsc::channel(16_384);
    let (command_tx, command_rx) = mpsc::channel(256);

    let task = tokio::spawn(run_connection(
        config,
        event_tx,
        command_rx,
        metrics,
        shutdown,
    ));

    WsHandle {
        events: event_rx,
        commands: command_tx,
        task,
    }
}

async fn run_connection(
    config: WsConfig,
    event_tx: mpsc::Sender<WsEvent>,
    mut command_rx: mpsc::Receiver<String>,
    metrics: Arc<CollectorMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempts: u32 = 0;
    let mut had_connection = false;

    loop {
        if *shutdown.borrow() {
            return;
        }

        let connected_at = Instant::now();
        match connect_and_process(
            &config,
            &event_tx,
            &mut command_rx,
            &mut shutdown,
            had_connection,
        )
        .await
        {
            Ok(()) => {
                // Clean exit only happens on shutdown
                return;
            }
            Err(err) => {
                if *shutdown.borrow() {
                    return;
                }
                if connected_at.elapsed() >= HEALTHY_CONNECTION {
                    attempts = 0;
                }
                attempts += 1;
                metrics.record_ws_reconnect();

                if config.max_reconnect_attempts != 0 && attempts > config.max_reconnect_attempts {
                    error!(
                        url = %config.url,
                        attempts,
                        "reconnect budget exhausted, giving up"
                    );
                    let _ = event_tx.send(WsEvent::Failed).await;
                    return;
                }

                let delay = backoff_delay(
                    config.initial_backoff,
                    config.max_backoff,
                    attempts.saturating_sub(1),
                );
                warn!(
                    url = %config.url,
                    error = %err,
                    attempts,
                    delay_secs = delay.as_secs(),
                    "connection lost, reconnecting"
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => return,
                }
                had_connection = true;
            }
        }
    }
}

/// Exponential backoff: `initial * 2^retries`, capped
pub fn backoff_delay(initial: Duration, max: Duration, retries: u32) -> Duration {
    let factor = 1u64 << retries.min(16);
    initial.checked_mul(factor as u32).unwrap_or(max).min(max)
}

async fn connect_and_process(
    config: &WsConfig,
    event_tx: &mpsc::Sender<WsEvent>,
    command_rx: &mut mpsc::Receiver<String>,
    shutdown: &mut watch::Receiver<bool>,
    is_reconnect: bool,
) -> Result<(), WsError> {
    info!(url = %config.url, "connecting");
    let (ws_stream, _) = connect_async(&config.url)
        .await
        .map_err(|e| WsError::Connect(e.to_string()))?;
    info!(url = %config.url, "connected");

    let (mut sink, mut stream) = ws_stream.split();

    for frame in &config.subscribe_frames {
        sink.send(Message::Text(frame.clone()))
            .await
            .map_err(|e| WsError::Stream(e.to_string()))?;
    }
    if !config.subscribe_frames.is_empty() {
        debug!(count = config.subscribe_frames.len(), "subscription frames sent");
    }

    if is_reconnect {
        // Manager resyncs every symbol once subscriptions are replayed
        if event_tx.send(WsEvent::Resubscribed).await.is_err() {
            return Ok(());
        }
    }

    let mut ping = tokio::time::interval(config.ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await; // first tick fires immediately, skip it

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                return Ok(());
            }

            Some(frame) = command_rx.recv() => {
                sink.send(Message::Text(frame))
                    .await
                    .map_err(|e| WsError::Stream(e.to_string()))?;
            }

            _ = ping.tick() => {
                let heartbeat = if config.text_ping {
                    Message::Text("ping".to_string())
                } else {
                    Message::Ping(vec![])
                };
                sink.send(heartbeat)
                    .await
                    .map_err(|e| WsError::Stream(e.to_string()))?;
            }

            next = timeout(config.idle_timeout, stream.next()) => {
                let message = match next {
                    Err(_) => return Err(WsError::IdleTimeout),
                    Ok(None) => return Err(WsError::Closed),
                    Ok(Some(Err(e))) => return Err(WsError::Stream(e.to_string())),
                    Ok(Some(Ok(message))) => message,
                };

                match message {
                    Message::Text(text) => {
                        if text == "pong" {
                            continue;
                        }
                        if event_tx.send(WsEvent::Frame(text)).await.is_err() {
                            // Receiver gone, we are shutting down
                            return Ok(());
                        }
                    }
                    Message::Ping(payload) => {
                        sink.send(Message::Pong(payload))
                            .await
                            .map_err(|e| WsError::Stream(e.to_string()))?;
                    }
                    Message::Pong(_) => {}
                    Message::Close(frame) => {
                        info!(frame = ?frame, "close frame received");
                        return Err(WsError::Closed);
                    }
                    Message::Binary(_) => {
                        warn!("unexpected binary frame dropped");
                    }
                    Message::Frame(_) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_cap() {
        let initial = Duration::from_secs(1);
        let max = Duration::from_secs(300);
        assert_eq!(backoff_delay(initial, max, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(initial, max, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(initial, max, 5), Duration::from_secs(32));
        assert_eq!(backoff_delay(initial, max, 12), max);
        assert_eq!(backoff_delay(initial, max, 60), max);
    }
}
