//! WebSocket transport.
//!
//! Connects to the realtime WebSocket endpoint with a bearer token on the
//! upgrade request, completes the `auth` / `auth_ok` handshake, then spawns
//! a pump task that shuttles frames between the socket and a [`Link`].
//! Reconnection is NOT handled here -- the engine's connection manager
//! owns retry policy and simply asks for a fresh link.

use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder, Message};
use url::Url;

use crate::error::Error;
use crate::protocol::{self, ServerFrame};
use crate::transport::{Link, LinkPeer, TransportKind};

/// How long the server has to answer the `auth` frame.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connect, authenticate, and return a live [`Link`].
pub async fn connect(url: &Url, token: &SecretString) -> Result<Link, Error> {
    tracing::info!(url = %url, "Connecting to WebSocket");

    let uri: tungstenite::http::Uri = url
        .as_str()
        .parse()
        .map_err(|e: tungstenite::http::uri::InvalidUri| Error::WebSocketConnect(e.to_string()))?;

    let request = ClientRequestBuilder::new(uri).with_header(
        "Authorization",
        format!("Bearer {}", token.expose_secret()),
    );

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(map_connect_error)?;

    let (mut write, mut read) = ws_stream.split();

    write
        .send(Message::text(protocol::auth_frame(token)))
        .await
        .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

    tokio::time::timeout(HANDSHAKE_TIMEOUT, await_auth(&mut read))
        .await
        .map_err(|_| Error::Timeout {
            timeout_secs: HANDSHAKE_TIMEOUT.as_secs(),
        })??;

    tracing::info!("WebSocket connected and authenticated");

    let (link, peer) = Link::channel(TransportKind::WebSocket);
    tokio::spawn(pump(write, read, peer));
    Ok(link)
}

/// Translate an upgrade failure, singling out 401/403 as auth failures.
fn map_connect_error(err: tungstenite::Error) -> Error {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            if matches!(status, 401 | 403) {
                Error::Authentication {
                    message: format!("upgrade rejected with HTTP {status}"),
                }
            } else {
                Error::Http {
                    status,
                    message: "WebSocket upgrade rejected".into(),
                }
            }
        }
        other => Error::WebSocketConnect(other.to_string()),
    }
}

/// Read frames until the server accepts or rejects the token.
async fn await_auth<R>(read: &mut R) -> Result<(), Error>
where
    R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(frame) = read.next().await {
        match frame.map_err(|e| Error::WebSocketConnect(e.to_string()))? {
            Message::Text(text) => match protocol::parse_frame(&text)? {
                ServerFrame::AuthOk => return Ok(()),
                ServerFrame::AuthError { message } => {
                    return Err(Error::Authentication {
                        message: message.unwrap_or_else(|| "token rejected".into()),
                    });
                }
                // Events before auth_ok are not expected; skip them.
                _ => tracing::debug!("Ignoring pre-auth frame"),
            },
            Message::Close(frame) => {
                let (code, reason) = close_details(frame.as_ref());
                return Err(Error::WebSocketClosed { code, reason });
            }
            _ => {}
        }
    }
    Err(Error::WebSocketClosed {
        code: 1006,
        reason: "stream ended during handshake".into(),
    })
}

fn close_details(frame: Option<&tungstenite::protocol::CloseFrame>) -> (u16, String) {
    frame.map_or_else(
        || (1005, String::new()),
        |cf| (u16::from(cf.code), cf.reason.as_str().to_owned()),
    )
}

// ── Pump ─────────────────────────────────────────────────────────────

/// Shuttle frames between the socket and the link until either side ends.
async fn pump<W, R>(mut write: W, mut read: R, mut peer: LinkPeer)
where
    W: Sink<Message, Error = tungstenite::Error> + Unpin,
    R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        tokio::select! {
            outbound = peer.outbound.recv() => {
                let Some(message) = outbound else {
                    // Link dropped by the engine.
                    let _ = write.send(Message::Close(None)).await;
                    break;
                };
                tracing::debug!(frame = %message.to_frame(), "WebSocket send");
                if let Err(e) = write.send(Message::text(message.to_frame())).await {
                    let _ = peer.inbound.send(Err(Error::WebSocketConnect(e.to_string()))).await;
                    break;
                }
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => match protocol::parse_frame(&text) {
                        Ok(ServerFrame::Event(event)) => {
                            if peer.inbound.send(Ok(event)).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => tracing::trace!("Ignoring non-event frame"),
                        Err(e) => tracing::debug!(error = %e, "Failed to parse WebSocket frame"),
                    },
                    Some(Ok(Message::Ping(_))) => {
                        // tungstenite handles pong replies automatically
                        tracing::trace!("WebSocket ping");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = close_details(frame.as_ref());
                        tracing::info!(code, reason = %reason, "WebSocket close frame received");
                        let _ = peer.inbound.send(Err(Error::WebSocketClosed { code, reason })).await;
                        break;
                    }
                    Some(Err(e)) => {
                        let _ = peer.inbound.send(Err(Error::WebSocketConnect(e.to_string()))).await;
                        break;
                    }
                    None => {
                        tracing::info!("WebSocket stream ended");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Binary, Pong, Frame -- ignore
                    }
                }
            }
        }
    }

    tracing::debug!("WebSocket pump exiting");
}
