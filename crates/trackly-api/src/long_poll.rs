// HTTP long-poll fallback transport.
//
// Used when the WebSocket cannot be established (proxies that strip
// upgrades, captive networks). Session protocol:
//
//   POST {base}/sessions                    bearer → {"sid": "…"}
//   GET  {base}/sessions/{sid}/events       held open → [frame, …] (204 = none)
//   POST {base}/sessions/{sid}/messages     body = one client frame

use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::Error;
use crate::protocol::{ClientMessage, ServerEvent, ServerFrame};
use crate::transport::{Link, LinkPeer, TransportKind};

#[derive(Debug, Deserialize)]
struct SessionResponse {
    sid: String,
}

/// Open a long-poll session and return a live [`Link`].
pub async fn connect(
    http: &reqwest::Client,
    base: &Url,
    token: &SecretString,
) -> Result<Link, Error> {
    let base = with_trailing_slash(base);
    let sessions_url = base.join("sessions")?;
    tracing::info!(url = %sessions_url, "Opening long-poll session");

    let resp = http
        .post(sessions_url)
        .bearer_auth(token.expose_secret())
        .send()
        .await?;
    let resp = check_status(resp).await?;

    let body = resp.text().await?;
    let session: SessionResponse =
        serde_json::from_str(&body).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body,
        })?;

    let session_url = base.join(&format!("sessions/{}/", session.sid))?;
    tracing::info!(sid = %session.sid, "Long-poll session established");

    let (link, peer) = Link::channel(TransportKind::LongPoll);
    let LinkPeer { outbound, inbound } = peer;
    let cancel = CancellationToken::new();

    tokio::spawn(poll_loop(
        http.clone(),
        session_url.join("events")?,
        token.clone(),
        inbound.clone(),
        cancel.clone(),
    ));
    tokio::spawn(send_loop(
        http.clone(),
        session_url.join("messages")?,
        token.clone(),
        outbound,
        inbound,
        cancel,
    ));

    Ok(link)
}

/// `Url::join` replaces the last segment unless the base ends in `/`.
fn with_trailing_slash(base: &Url) -> Url {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base
}

/// Map auth rejections and other non-success statuses to errors.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, Error> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        return Err(Error::Authentication {
            message: if message.is_empty() {
                format!("HTTP {}", status.as_u16())
            } else {
                message
            },
        });
    }
    Err(Error::Http {
        status: status.as_u16(),
        message,
    })
}

/// Repeatedly hold a GET open and forward decoded events.
async fn poll_loop(
    http: reqwest::Client,
    events_url: Url,
    token: SecretString,
    inbound: mpsc::Sender<Result<ServerEvent, Error>>,
    cancel: CancellationToken,
) {
    loop {
        let request = http
            .get(events_url.clone())
            .bearer_auth(token.expose_secret())
            .send();

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = inbound.closed() => break,
            result = request => result,
        };

        let batch = match result {
            Ok(resp) => match poll_batch(resp).await {
                Ok(batch) => batch,
                Err(e) => {
                    let _ = inbound.send(Err(e)).await;
                    break;
                }
            },
            Err(e) if e.is_timeout() => {
                // Server held the poll past our client timeout; just re-poll.
                tracing::trace!("Long-poll timed out, re-polling");
                continue;
            }
            Err(e) => {
                let _ = inbound.send(Err(Error::Transport(e))).await;
                break;
            }
        };

        for frame in batch {
            match serde_json::from_value::<ServerFrame>(frame) {
                Ok(ServerFrame::Event(event)) => {
                    if inbound.send(Ok(event)).await.is_err() {
                        cancel.cancel();
                        return;
                    }
                }
                Ok(_) => tracing::trace!("Ignoring non-event frame"),
                Err(e) => tracing::debug!(error = %e, "Failed to parse long-poll frame"),
            }
        }
    }

    cancel.cancel();
    tracing::debug!("Long-poll loop exiting");
}

async fn poll_batch(resp: reqwest::Response) -> Result<Vec<serde_json::Value>, Error> {
    if resp.status() == StatusCode::NO_CONTENT {
        return Ok(Vec::new());
    }
    if resp.status() == StatusCode::GONE {
        return Err(Error::Http {
            status: StatusCode::GONE.as_u16(),
            message: "long-poll session expired".into(),
        });
    }
    let resp = check_status(resp).await?;
    let body = resp.text().await?;
    serde_json::from_str(&body).map_err(|e| Error::Deserialization {
        message: e.to_string(),
        body,
    })
}

/// Deliver queued client messages as individual POSTs.
async fn send_loop(
    http: reqwest::Client,
    messages_url: Url,
    token: SecretString,
    mut outbound: mpsc::Receiver<ClientMessage>,
    inbound: mpsc::Sender<Result<ServerEvent, Error>>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            message = outbound.recv() => message,
        };
        // Link dropped by the engine.
        let Some(message) = message else { break };

        tracing::debug!(frame = %message.to_frame(), "Long-poll send");
        let result = http
            .post(messages_url.clone())
            .bearer_auth(token.expose_secret())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(message.to_frame())
            .send()
            .await;

        let outcome = match result {
            Ok(resp) => check_status(resp).await.map(|_| ()),
            Err(e) => Err(Error::Transport(e)),
        };
        if let Err(e) = outcome {
            let _ = inbound.send(Err(e)).await;
            break;
        }
    }

    cancel.cancel();
    tracing::debug!("Long-poll sender exiting");
}
