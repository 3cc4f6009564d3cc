//! [`GatewayServer`] – TCP accept loop, HTTP routing and WebSocket upgrade.
//!
//! | Request | Response |
//! |---|---|
//! | `GET /health` | `200 {"status":"ok","service":"gateway"}` |
//! | `GET /ws` + `Upgrade: websocket` | WebSocket session |
//! | `GET /ws` without upgrade | `426 Upgrade Required` |
//! | anything else | `404 Not Found` |
//!
//! A token on the upgrade request (`?token=` or `Authorization: Bearer`) is
//! verified during the handshake.  An invalid token is answered with `401`
//! before any client state is created.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fleet_types::GatewayError;
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, header};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, error, info, warn};

use crate::auth::Claims;
use crate::client::Client;
use crate::handler::Handler;
use crate::pumps::{PumpSettings, read_pump, write_pump};

/// Longest request head the router inspects.
const MAX_REQUEST_HEAD: usize = 8 * 1024;

/// How long a new connection may take to send its request head.
const REQUEST_HEAD_TIMEOUT: Duration = Duration::from_secs(10);

const HEALTH_BODY: &str = r#"{"status":"ok","service":"gateway"}"#;

pub struct GatewayServer {
    listener: TcpListener,
    handler: Arc<Handler>,
    settings: PumpSettings,
}

impl GatewayServer {
    /// Bind the listening socket.  Port `0` picks an ephemeral port; see
    /// [`GatewayServer::local_addr`].
    ///
    /// # Errors
    ///
    /// [`GatewayError::Io`] when the address cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        handler: Arc<Handler>,
        settings: PumpSettings,
    ) -> Result<Self, GatewayError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            handler,
            settings,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, GatewayError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the task is cancelled.
    pub async fn run(self) -> Result<(), GatewayError> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves.  Connections already accepted keep
    /// running on their own tasks.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), GatewayError>
    where
        F: Future<Output = ()>,
    {
        let addr = self.local_addr()?;
        info!(%addr, "gateway listening");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("gateway listener stopped");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let handler = Arc::clone(&self.handler);
                        let settings = self.settings;
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, peer, handler, settings).await {
                                debug!(%peer, error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "accept failed"),
                },
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Per-connection routing
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
struct RequestHead {
    path: String,
    upgrade: bool,
}

/// Request line and `Upgrade` header of a raw HTTP request head.
fn parse_head(raw: &[u8]) -> Option<RequestHead> {
    let text = String::from_utf8_lossy(raw);
    let mut lines = text.lines();
    let target = lines.next()?.split_whitespace().nth(1)?;
    let path = target.split('?').next().unwrap_or(target).to_string();
    let upgrade = lines.any(|line| {
        let line = line.to_ascii_lowercase();
        line.starts_with("upgrade:") && line.contains("websocket")
    });
    Some(RequestHead { path, upgrade })
}

/// Peek until the whole request head is buffered, without consuming it, so
/// the WebSocket handshake still sees the full request.
async fn peek_head(stream: &TcpStream, buf: &mut [u8]) -> Result<usize, GatewayError> {
    let peeked = tokio::time::timeout(REQUEST_HEAD_TIMEOUT, async {
        loop {
            let n = stream.peek(buf).await?;
            if n == 0 || n == buf.len() || buf[..n].windows(4).any(|w| w == b"\r\n\r\n") {
                return Ok::<_, std::io::Error>(n);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .map_err(|_| GatewayError::Io(std::io::ErrorKind::TimedOut.into()))?;
    Ok(peeked?)
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<Handler>,
    settings: PumpSettings,
) -> Result<(), GatewayError> {
    let mut buf = vec![0u8; MAX_REQUEST_HEAD];
    let n = peek_head(&stream, &mut buf).await?;
    if n == 0 {
        return Ok(());
    }
    let Some(head) = parse_head(&buf[..n]) else {
        return respond(&mut stream, &mut buf[..n], "400 Bad Request", "text/plain", "bad request").await;
    };

    match (head.path.as_str(), head.upgrade) {
        ("/health", _) => respond(&mut stream, &mut buf[..n], "200 OK", "application/json", HEALTH_BODY).await,
        ("/ws", true) => serve_ws(stream, peer, handler, settings).await,
        ("/ws", false) => {
            respond(&mut stream, &mut buf[..n], "426 Upgrade Required", "text/plain", "websocket upgrade required").await
        }
        _ => respond(&mut stream, &mut buf[..n], "404 Not Found", "text/plain", "not found").await,
    }
}

/// Consume the peeked request and write a plain HTTP response.
async fn respond(
    stream: &mut TcpStream,
    head: &mut [u8],
    status: &str,
    content_type: &str,
    body: &str,
) -> Result<(), GatewayError> {
    let _ = stream.read(head).await?;
    let response = format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

// ────────────────────────────────────────────────────────────────────────────
// WebSocket sessions
// ────────────────────────────────────────────────────────────────────────────

/// The token offered on the upgrade request: `?token=` first, then an
/// `Authorization: Bearer` header.
fn request_token(req: &Request) -> Option<String> {
    let from_query = req.uri().query().and_then(|query| {
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix("token="))
            .filter(|token| !token.is_empty())
            .map(str::to_string)
    });
    from_query.or_else(|| {
        req.headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|token| token.trim().to_string())
    })
}

fn unauthorized(reason: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

async fn serve_ws(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<Handler>,
    settings: PumpSettings,
) -> Result<(), GatewayError> {
    let mut claims: Option<Claims> = None;
    let validator = Arc::clone(handler.validator());
    let check_token = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let Some(token) = request_token(req) else {
            return Ok(response);
        };
        match validator.validate(&token) {
            Ok(valid) => {
                claims = Some(valid);
                Ok(response)
            }
            Err(e) => {
                warn!(%peer, error = %e, "rejecting upgrade with invalid token");
                Err(unauthorized(e.to_string()))
            }
        }
    };
    let config = WebSocketConfig::default()
        .max_message_size(Some(settings.max_message_bytes))
        .max_frame_size(Some(settings.max_message_bytes));

    let ws = accept_hdr_async_with_config(stream, check_token, Some(config))
        .await
        .map_err(|e| GatewayError::Channel(format!("websocket handshake with {peer}: {e}")))?;

    let (client, queue) = Client::new(settings.send_buffer, settings.max_messages_per_second);
    if let Some(claims) = claims {
        client.authenticate(claims.sub, claims.role);
    }
    handler.hub().register(Arc::clone(&client)).await?;
    info!(
        client_id = %client.id(),
        %peer,
        user_id = client.user_id().as_deref().unwrap_or(""),
        "client connected"
    );

    let (sink, stream) = ws.split();
    let writer = tokio::spawn(write_pump(sink, queue, settings));
    read_pump(stream, client, handler, settings).await;
    if let Err(e) = writer.await {
        error!(%peer, error = %e, "write pump panicked");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_path_and_upgrade() {
        let raw = b"GET /ws?token=abc HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        assert_eq!(
            parse_head(raw),
            Some(RequestHead {
                path: "/ws".into(),
                upgrade: true
            })
        );
    }

    #[test]
    fn plain_request_is_not_an_upgrade() {
        let head = parse_head(b"GET /health HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert_eq!(head.path, "/health");
        assert!(!head.upgrade);
    }

    #[test]
    fn empty_head_does_not_parse() {
        assert!(parse_head(b"").is_none());
        assert!(parse_head(b"GARBAGE\r\n\r\n").is_none());
    }

    #[test]
    fn token_from_query_wins() {
        let req = Request::builder()
            .uri("/ws?foo=1&token=from-query")
            .header(header::AUTHORIZATION, "Bearer from-header")
            .body(())
            .unwrap();
        assert_eq!(request_token(&req).as_deref(), Some("from-query"));
    }

    #[test]
    fn token_from_bearer_header() {
        let req = Request::builder()
            .uri("/ws")
            .header(header::AUTHORIZATION, "Bearer abc.def.ghi")
            .body(())
            .unwrap();
        assert_eq!(request_token(&req).as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn no_token_is_none() {
        let req = Request::builder().uri("/ws?token=").body(()).unwrap();
        assert!(request_token(&req).is_none());
    }

    #[test]
    fn unauthorized_response_has_401() {
        let response = unauthorized("expired".into());
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.body().as_deref(), Some("expired"));
    }
}
