//! Secure WebSocket subscription to the firehose.
//!
//! One connection at a time: resolve and handshake with a 30 s budget,
//! read with a 30 s idle timeout, and on any failure sleep 10 s and
//! reconnect with the latest cursor so the stream resumes where it left
//! off. The cursor never regresses across reconnects.

use crate::controller::Controller;
use crate::cursor::Cursor;
use crate::metrics::Metrics;
use crate::payload::PayloadDispatcher;
use fh_activity::RateObserver;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{error, info, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Inbound-rate observation window and ceiling; excess is logged, not
/// enforced.
const RATE_WINDOW: Duration = Duration::from_secs(1);
const RATE_LIMIT: i64 = 5_000;

pub struct Datasource {
    host: String,
    port: u16,
    subscription: String,
    dispatcher: PayloadDispatcher,
    cursor: Arc<Cursor>,
    metrics: Arc<Metrics>,
    controller: Controller,
}

impl Datasource {
    pub fn new(
        host: String,
        port: u16,
        subscription: String,
        dispatcher: PayloadDispatcher,
        cursor: Arc<Cursor>,
        metrics: Arc<Metrics>,
        controller: Controller,
    ) -> Self {
        Datasource {
            host,
            port,
            subscription,
            dispatcher,
            cursor,
            metrics,
            controller,
        }
    }

    fn subscription_url(&self) -> String {
        let cursor = self.cursor.sequence();
        if cursor > 0 {
            format!(
                "wss://{}:{}{}?cursor={cursor}",
                self.host, self.port, self.subscription
            )
        } else {
            format!("wss://{}:{}{}", self.host, self.port, self.subscription)
        }
    }

    /// Run until shutdown, reconnecting with backoff on every failure.
    pub async fn run(self) {
        info!(host = %self.host, port = self.port, subscription = %self.subscription,
            "datasource starting");
        let mut rate = RateObserver::new(RATE_WINDOW, RATE_LIMIT);
        while self.controller.is_active() {
            if let Err(reason) = self.connect_and_read(&mut rate).await {
                error!(%reason, "firehose connection failed");
            }
            if !self.controller.is_active() {
                break;
            }
            let mut shutdown = self.controller.subscribe();
            let _ = tokio::time::timeout(RECONNECT_DELAY, shutdown.changed()).await;
        }
        info!("datasource stopping");
    }

    async fn connect_and_read(&self, rate: &mut RateObserver) -> Result<(), String> {
        let url = self.subscription_url();
        info!(%url, "connecting to firehose");
        let (mut ws, _response) = tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| "handshake timed out".to_owned())?
            .map_err(|e| format!("connect: {e}"))?;
        info!("firehose connected");

        while self.controller.is_active() {
            let frame = match tokio::time::timeout(IDLE_TIMEOUT, ws.next()).await {
                Ok(frame) => frame,
                Err(_) => return Err("idle timeout".to_owned()),
            };
            match frame {
                Some(Ok(Message::Binary(data))) => {
                    self.metrics.websocket_messages.inc();
                    self.metrics.websocket_bytes.inc_by(data.len() as u64);
                    let excess = rate.observe_and_get_excess();
                    if excess > 0 {
                        warn!(excess, "inbound message rate above watermark");
                    }
                    if let Err(error) = self.dispatcher.handle_message(&data).await {
                        // Skip the unit; the stream and cursor continue.
                        error!(%error, bytes = data.len(), "message dropped");
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = ws.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    return Err(format!("closed by server: {frame:?}"));
                }
                Some(Ok(_)) => {} // text/pong frames carry nothing for us
                Some(Err(e)) => return Err(format!("read: {e}")),
                None => return Err("stream ended".to_owned()),
            }
        }
        Ok(())
    }
}
