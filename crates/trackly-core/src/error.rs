// ── Core error types ──
//
// Engine-facing errors. Consumers never see raw HTTP statuses or frame
// decoding failures; the `From<trackly_api::Error>` impl folds transport
// errors into connection-level variants.

use thiserror::Error;

use crate::geo::GeoError;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    /// One rejected handshake; the connection retries until
    /// `max_auth_retries` is used up.
    #[error("Authentication rejected: {message}")]
    AuthenticationRejected { message: String },

    /// Terminal: the retry budget for rejected handshakes is spent.
    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Realtime transport error: {reason}")]
    Transport { reason: String },

    #[error("Connection attempt timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    // ── Lifecycle errors ─────────────────────────────────────────────
    #[error("Engine is stopped")]
    EngineStopped,

    #[error("Engine is already started")]
    AlreadyStarted,

    #[error("Not tracking {key}")]
    NotTracked { key: String },

    // ── Data errors ──────────────────────────────────────────────────
    #[error(transparent)]
    Geo(#[from] GeoError),

    #[error("Malformed event payload: {message}")]
    MalformedEvent { message: String },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Returns `true` for errors after which the connection will not retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed { .. } | Self::ReconnectExhausted { .. }
        )
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<trackly_api::Error> for CoreError {
    fn from(err: trackly_api::Error) -> Self {
        use trackly_api::Error as Api;

        match err {
            Api::Authentication { message } | Api::TokenUnavailable { message } => {
                CoreError::AuthenticationRejected { message }
            }
            Api::Http { status, message } if matches!(status, 401 | 403) => {
                CoreError::AuthenticationRejected {
                    message: format!("HTTP {status}: {message}"),
                }
            }
            Api::Timeout { timeout_secs } => CoreError::Timeout { timeout_secs },
            Api::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            Api::Tls(msg) => CoreError::Config {
                message: format!("TLS error: {msg}"),
            },
            Api::Deserialization { message, .. } => CoreError::MalformedEvent { message },
            Api::Transport(ref e) if e.is_timeout() => CoreError::Timeout { timeout_secs: 0 },
            other @ (Api::Transport(_)
            | Api::Http { .. }
            | Api::WebSocketConnect(_)
            | Api::WebSocketClosed { .. }
            | Api::LinkClosed) => CoreError::Transport {
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_auth_rejections_are_retryable() {
        let err: CoreError = trackly_api::Error::Authentication {
            message: "expired".into(),
        }
        .into();
        assert!(matches!(err, CoreError::AuthenticationRejected { ref message } if message == "expired"));
        assert!(!err.is_fatal());

        let err: CoreError = trackly_api::Error::TokenUnavailable {
            message: "vault sealed".into(),
        }
        .into();
        assert!(matches!(err, CoreError::AuthenticationRejected { .. }));
        assert!(!err.is_fatal());

        let err: CoreError = trackly_api::Error::Http {
            status: 403,
            message: "nope".into(),
        }
        .into();
        assert!(matches!(err, CoreError::AuthenticationRejected { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn exhausted_auth_retries_are_fatal() {
        let err = CoreError::AuthenticationFailed {
            message: "rejected 6 times".into(),
        };
        assert!(err.is_fatal());
    }

    #[test]
    fn network_errors_translate_to_transport() {
        let err: CoreError = trackly_api::Error::WebSocketClosed {
            code: 1006,
            reason: "abnormal".into(),
        }
        .into();
        assert!(matches!(err, CoreError::Transport { .. }));
        assert!(!err.is_fatal());

        let err: CoreError = trackly_api::Error::Http {
            status: 502,
            message: "bad gateway".into(),
        }
        .into();
        assert!(matches!(err, CoreError::Transport { ref reason } if reason.contains("502")));
    }

    #[test]
    fn geo_errors_are_transparent() {
        let err = CoreError::from(GeoError::InvalidSpeed(0.0));
        assert_eq!(err.to_string(), GeoError::InvalidSpeed(0.0).to_string());
    }
}
