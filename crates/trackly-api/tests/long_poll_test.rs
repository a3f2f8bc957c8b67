#![allow(clippy::unwrap_used)]
// Integration tests for the HTTP long-poll transport using wiremock.

use std::time::Duration;

use secrecy::SecretString;
use serde_json::json;
use url::Url;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use trackly_api::{Channel, ChannelKind, ClientMessage, Error, EventKind, long_poll};

// ── Helpers ─────────────────────────────────────────────────────────

fn token() -> SecretString {
    SecretString::from("tok-123".to_owned())
}

async fn setup() -> (MockServer, Url) {
    let server = MockServer::start().await;
    let base = Url::parse(&format!("{}/rt", server.uri())).unwrap();
    (server, base)
}

async fn mount_session(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/rt/sessions"))
        .and(header("authorization", "Bearer tok-123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "sid": "abc" })))
        .mount(server)
        .await;
}

async fn mount_idle_poll(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/rt/sessions/abc/events"))
        .respond_with(ResponseTemplate::new(204).set_delay(Duration::from_millis(50)))
        .mount(server)
        .await;
}

// ── Session tests ───────────────────────────────────────────────────

#[tokio::test]
async fn test_session_rejected_with_401_is_auth_failure() {
    let (server, base) = setup().await;

    Mock::given(method("POST"))
        .and(path("/rt/sessions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("token expired"))
        .mount(&server)
        .await;

    let result = long_poll::connect(&reqwest::Client::new(), &base, &token()).await;

    match result {
        Err(ref err @ Error::Authentication { ref message }) => {
            assert_eq!(message, "token expired");
            assert!(err.is_auth_failure());
        }
        other => panic!("expected Authentication error, got: {other:?}"),
    }
}

#[tokio::test]
async fn test_session_server_error_is_transient() {
    let (server, base) = setup().await;

    Mock::given(method("POST"))
        .and(path("/rt/sessions"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = long_poll::connect(&reqwest::Client::new(), &base, &token())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Http { status: 503, .. }));
    assert!(err.is_transient());
}

// ── Event delivery ──────────────────────────────────────────────────

#[tokio::test]
async fn test_polled_events_are_delivered() {
    let (server, base) = setup().await;
    mount_session(&server).await;

    Mock::given(method("GET"))
        .and(path("/rt/sessions/abc/events"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "type": "heartbeat" },
            {
                "type": "event",
                "channel": "driver:d-7",
                "event": "location-updated",
                "data": { "lat": 40.0, "lng": -74.0, "timestamp": 1000 }
            }
        ])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_idle_poll(&server).await;

    let mut link = long_poll::connect(&reqwest::Client::new(), &base, &token())
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), link.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(event.channel, "driver:d-7");
    assert_eq!(event.event, EventKind::LocationUpdated);
}

#[tokio::test]
async fn test_expired_session_ends_link_with_error() {
    let (server, base) = setup().await;
    mount_session(&server).await;

    Mock::given(method("GET"))
        .and(path("/rt/sessions/abc/events"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&server)
        .await;

    let mut link = long_poll::connect(&reqwest::Client::new(), &base, &token())
        .await
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), link.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(Error::Http { status: 410, .. })));
}

// ── Outbound messages ───────────────────────────────────────────────

#[tokio::test]
async fn test_subscribe_is_posted_as_frame() {
    let (server, base) = setup().await;
    mount_session(&server).await;
    mount_idle_poll(&server).await;

    Mock::given(method("POST"))
        .and(path("/rt/sessions/abc/messages"))
        .and(body_json(json!({ "type": "subscribe:order", "id": "42" })))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let link = long_poll::connect(&reqwest::Client::new(), &base, &token())
        .await
        .unwrap();
    link.send(ClientMessage::Subscribe(Channel::new(ChannelKind::Order, "42")))
        .await
        .unwrap();

    // Delivery is asynchronous; wait for the POST to land.
    for _ in 0..50 {
        let received = server.received_requests().await.unwrap_or_default();
        if received.iter().any(|r| r.url.path() == "/rt/sessions/abc/messages") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    server.verify().await;
}
