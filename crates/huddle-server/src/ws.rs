//! Axum websocket adapter for the [`FrameSink`]/[`FrameSource`] seam.
//!
//! Each socket is split into a writer task that drains a bounded queue and
//! sends heartbeat pings, and a reader the session polls directly. Both halves
//! share one cancellation token: whichever side stops first stops the other.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message as WsMessage, Utf8Bytes, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use huddle_core::DeliveryError;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::ServerConfig;
use crate::transport::{CloseNotice, FrameSink, FrameSource, Inbound};

/// Close sent when a session ends on its own.
pub const SESSION_ENDED: CloseNotice = CloseNotice {
    code: 1000,
    reason: "session ended",
};

/// Outbound half: enqueue frames for the writer task.
pub struct WsSink {
    tx: mpsc::Sender<Utf8Bytes>,
    notice: Arc<Mutex<Option<CloseNotice>>>,
    closing: CancellationToken,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_frame(&self, frame: Utf8Bytes) -> Result<(), DeliveryError> {
        if self.closing.is_cancelled() {
            return Err(DeliveryError::Closed);
        }
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// First notice wins; later calls only re-cancel.
    async fn close(&self, notice: CloseNotice) {
        {
            let mut slot = self.notice.lock();
            if slot.is_none() {
                *slot = Some(notice);
            }
        }
        self.closing.cancel();
    }
}

/// Inbound half: polled by the session.
pub struct WsSource {
    stream: SplitStream<WebSocket>,
    idle_timeout: Option<Duration>,
    closing: CancellationToken,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn recv_frame(&mut self) -> Inbound {
        let Self {
            stream,
            idle_timeout,
            closing,
        } = self;

        loop {
            let next = tokio::select! {
                _ = closing.cancelled() => return Inbound::Disconnected,
                next = read_next(stream, *idle_timeout) => next,
            };
            let Some(msg) = next else {
                closing.cancel();
                return Inbound::Disconnected;
            };
            match msg {
                WsMessage::Text(text) => return Inbound::Frame(Bytes::from(text)),
                WsMessage::Binary(data) => return Inbound::Frame(data),
                WsMessage::Close(_) => {
                    closing.cancel();
                    return Inbound::Disconnected;
                }
                // Pongs only refresh the idle timer; axum answers pings itself.
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            }
        }
    }
}

/// Next message, or `None` on stream end, read error or idle timeout.
async fn read_next(
    stream: &mut SplitStream<WebSocket>,
    idle_timeout: Option<Duration>,
) -> Option<WsMessage> {
    let next = match idle_timeout {
        Some(limit) => match tokio::time::timeout(limit, stream.next()).await {
            Ok(next) => next,
            Err(_) => {
                debug!(timeout_secs = limit.as_secs(), "idle timeout");
                return None;
            }
        },
        None => stream.next().await,
    };
    match next {
        Some(Ok(msg)) => Some(msg),
        Some(Err(e)) => {
            debug!(error = %e, "websocket read error");
            None
        }
        None => None,
    }
}

/// Split an upgraded socket and spawn its writer task.
pub fn accept(socket: WebSocket, config: &ServerConfig) -> (Arc<WsSink>, WsSource) {
    let (ws_tx, ws_rx) = socket.split();
    let (tx, rx) = mpsc::channel(config.send_queue_capacity);
    let closing = CancellationToken::new();
    let notice = Arc::new(Mutex::new(None));

    tokio::spawn(write_loop(
        ws_tx,
        rx,
        Arc::clone(&notice),
        closing.clone(),
        config.heartbeat_interval(),
    ));

    let sink = Arc::new(WsSink {
        tx,
        notice,
        closing: closing.clone(),
    });
    let source = WsSource {
        stream: ws_rx,
        idle_timeout: config.idle_timeout(),
        closing,
    };
    (sink, source)
}

async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<Utf8Bytes>,
    notice: Arc<Mutex<Option<CloseNotice>>>,
    closing: CancellationToken,
    heartbeat: Option<Duration>,
) {
    let mut ping = heartbeat.map(|every| interval_at(Instant::now() + every, every));

    loop {
        tokio::select! {
            biased;
            _ = closing.cancelled() => {
                let notice = notice.lock().take().unwrap_or(SESSION_ENDED);
                let frame = CloseFrame {
                    code: notice.code,
                    reason: notice.reason.into(),
                };
                let _ = ws_tx.send(WsMessage::Close(Some(frame))).await;
                break;
            }
            msg = rx.recv() => {
                let Some(text) = msg else { break };
                if ws_tx.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
            _ = next_tick(&mut ping) => {
                if ws_tx.send(WsMessage::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                trace!("sent ping");
            }
        }
    }

    closing.cancel();
    let _ = ws_tx.close().await;
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
