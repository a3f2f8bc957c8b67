#![allow(clippy::unwrap_used)]
// Integration tests for the WebSocket transport against an in-process server.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::SecretString;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use url::Url;

use trackly_api::{Channel, ChannelKind, ClientMessage, Error, EventKind, websocket};

// ── Helpers ─────────────────────────────────────────────────────────

fn token() -> SecretString {
    SecretString::from("tok-123".to_owned())
}

/// How the fake server answers the `auth` frame.
#[derive(Clone, Copy)]
enum AuthReply {
    Accept,
    Reject,
}

/// Accept one connection, check the bearer header, answer the handshake,
/// push one location event, then report the next client frame.
async fn spawn_server(reply: AuthReply) -> (Url, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (frame_tx, frame_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let check_bearer = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let authorized = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                == Some("Bearer tok-123");
            if authorized {
                Ok(resp)
            } else {
                let mut rejection = ErrorResponse::new(None);
                *rejection.status_mut() = StatusCode::UNAUTHORIZED;
                Err(rejection)
            }
        };
        let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, check_bearer).await else {
            return;
        };

        let auth = ws.next().await.unwrap().unwrap();
        let auth: serde_json::Value = serde_json::from_str(auth.to_text().unwrap()).unwrap();
        assert_eq!(auth["type"], "auth");
        assert_eq!(auth["token"], "tok-123");

        match reply {
            AuthReply::Reject => {
                let _ = ws
                    .send(Message::text(r#"{"type":"auth_error","message":"expired"}"#))
                    .await;
                return;
            }
            AuthReply::Accept => {
                ws.send(Message::text(r#"{"type":"auth_ok"}"#)).await.unwrap();
            }
        }

        let event = serde_json::json!({
            "type": "event",
            "channel": "order:42",
            "event": "location-updated",
            "data": { "lat": 40.0, "lng": -74.0, "speed": 10.0, "timestamp": 100_000 }
        });
        ws.send(Message::text(event.to_string())).await.unwrap();

        if let Some(Ok(frame)) = ws.next().await {
            let _ = frame_tx.send(frame.to_text().unwrap_or_default().to_owned());
        }
    });

    let url = Url::parse(&format!("ws://{addr}/stream")).unwrap();
    (url, frame_rx)
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_handshake_then_events_and_subscribe() {
    let (url, frame_rx) = spawn_server(AuthReply::Accept).await;

    let mut link = websocket::connect(&url, &token()).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), link.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(event.channel, "order:42");
    assert_eq!(event.event, EventKind::LocationUpdated);

    link.send(ClientMessage::Subscribe(Channel::new(ChannelKind::Order, "42")))
        .await
        .unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(5), frame_rx)
        .await
        .unwrap()
        .unwrap();
    let frame: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(frame["type"], "subscribe:order");
    assert_eq!(frame["id"], "42");
}

#[tokio::test]
async fn test_auth_error_frame_is_auth_failure() {
    let (url, _frame_rx) = spawn_server(AuthReply::Reject).await;

    let err = websocket::connect(&url, &token()).await.unwrap_err();

    assert!(
        matches!(err, Error::Authentication { ref message } if message == "expired"),
        "expected Authentication error, got: {err:?}"
    );
    assert!(err.is_auth_failure());
}

#[tokio::test]
async fn test_wrong_bearer_is_rejected_at_upgrade() {
    let (url, _frame_rx) = spawn_server(AuthReply::Accept).await;

    let wrong = SecretString::from("nope".to_owned());
    let err = websocket::connect(&url, &wrong).await.unwrap_err();

    assert!(err.is_auth_failure(), "expected auth failure, got: {err:?}");
}

#[tokio::test]
async fn test_unreachable_server_is_transient() {
    // Bind then drop to get a port nothing listens on.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let url = Url::parse(&format!("ws://{addr}/stream")).unwrap();
    let err = websocket::connect(&url, &token()).await.unwrap_err();

    assert!(err.is_transient(), "expected transient error, got: {err:?}");
}
