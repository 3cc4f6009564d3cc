//! Per-connection read and write tasks.
//!
//! Every WebSocket connection is served by exactly two tasks that share
//! nothing but the client's outbound queue:
//!
//! * [`read_pump`] – reads frames, enforces the read deadline and hands
//!   each message to the [`Handler`].  Always unregisters the client on
//!   exit.
//! * [`write_pump`] – the only task that writes to the socket.  Forwards
//!   queued frames, sends transport pings, and closes the socket once the
//!   queue is closed.
//!
//! Liveness is decided by transport-level ping/pong alone: the read deadline
//! moves forward on every Pong and on nothing else.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at, timeout, timeout_at};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage, error::CapacityError};
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::config::ServerConfig;
use crate::handler::Handler;

/// Timing and sizing shared by every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpSettings {
    pub max_message_bytes: usize,
    pub send_buffer: usize,
    pub write_wait: Duration,
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub max_messages_per_second: Option<NonZeroU32>,
}

impl Default for PumpSettings {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for PumpSettings {
    fn from(cfg: &ServerConfig) -> Self {
        Self {
            max_message_bytes: cfg.max_message_bytes,
            send_buffer: cfg.send_buffer,
            write_wait: cfg.write_wait(),
            pong_wait: cfg.pong_wait(),
            ping_period: cfg.ping_period(),
            max_messages_per_second: cfg.rate_limit(),
        }
    }
}

/// Read frames from `stream` until the peer goes away, the deadline passes
/// or the protocol layer fails.
pub async fn read_pump<S>(mut stream: S, client: Arc<Client>, handler: Arc<Handler>, settings: PumpSettings)
where
    S: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    let client_id = client.id();
    let mut deadline = Instant::now() + settings.pong_wait;

    loop {
        let next = match timeout_at(deadline, stream.next()).await {
            Ok(next) => next,
            Err(_) => {
                info!(client_id = %client_id, "read deadline passed, closing connection");
                break;
            }
        };
        match next {
            Some(Ok(WsMessage::Binary(data))) => handler.handle_frame(&client, &data).await,
            Some(Ok(WsMessage::Text(text))) => {
                handler.handle_frame(&client, text.as_str().as_bytes()).await
            }
            Some(Ok(WsMessage::Pong(_))) => {
                deadline = Instant::now() + settings.pong_wait;
            }
            // Pings are answered by the protocol layer.
            Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Frame(_))) => {}
            Some(Ok(WsMessage::Close(frame))) => {
                debug!(client_id = %client_id, ?frame, "client closed connection");
                break;
            }
            Some(Err(WsError::Capacity(CapacityError::MessageTooLong { size, max_size }))) => {
                warn!(client_id = %client_id, size, max_size, "oversized frame, closing connection");
                handler.reject_oversized(&client, size, max_size);
                break;
            }
            Some(Err(WsError::ConnectionClosed)) | None => break,
            Some(Err(e)) => {
                warn!(client_id = %client_id, error = %e, "read error");
                break;
            }
        }
    }

    handler.disconnect(&client).await;
}

/// Drain `queue` into `sink`, pinging every `ping_period`.
///
/// Returns once the queue is closed (after sending a Close frame), or on
/// the first failed or timed-out write.
pub async fn write_pump<K>(mut sink: K, mut queue: mpsc::Receiver<Bytes>, settings: PumpSettings)
where
    K: Sink<WsMessage, Error = WsError> + Unpin,
{
    let mut ticker = interval_at(Instant::now() + settings.ping_period, settings.ping_period);

    loop {
        tokio::select! {
            frame = queue.recv() => {
                let Some(frame) = frame else {
                    let _ = timeout(settings.write_wait, sink.send(WsMessage::Close(None))).await;
                    return;
                };
                if !write(&mut sink, WsMessage::Binary(frame), settings.write_wait).await {
                    return;
                }
            }
            _ = ticker.tick() => {
                if !write(&mut sink, WsMessage::Ping(Bytes::new()), settings.write_wait).await {
                    return;
                }
            }
        }
    }
}

async fn write<K>(sink: &mut K, msg: WsMessage, write_wait: Duration) -> bool
where
    K: Sink<WsMessage, Error = WsError> + Unpin,
{
    match timeout(write_wait, sink.send(msg)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(error = %e, "write failed");
            false
        }
        Err(_) => {
            warn!("write deadline passed, dropping connection");
            false
        }
    }
}
