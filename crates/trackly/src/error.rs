//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text and stable exit codes.

use miette::Diagnostic;
use thiserror::Error;

use trackly_config::ConfigError;
use trackly_core::{CoreError, GeoError};

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────
    #[error("Could not reach the tracking service: {reason}")]
    #[diagnostic(
        code(trackly::connection_failed),
        help(
            "Check the endpoint URLs in your profile and that the service is up.\n\
             Try: trackly config show"
        )
    )]
    ConnectionFailed { reason: String },

    // ── Authentication ───────────────────────────────────────────────
    #[error("Authentication failed for profile '{profile}'")]
    #[diagnostic(
        code(trackly::auth_failed),
        help(
            "Verify your token.\n\
             Run: trackly config set-token --profile {profile}"
        )
    )]
    AuthFailed { profile: String },

    #[error("No token configured for profile '{profile}'")]
    #[diagnostic(
        code(trackly::no_token),
        help(
            "Store one with: trackly config set-token --profile {profile}\n\
             Or set the TRACKLY_TOKEN environment variable."
        )
    )]
    NoToken { profile: String },

    // ── Validation ───────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(trackly::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("Profile '{name}' not found in configuration")]
    #[diagnostic(
        code(trackly::profile_not_found),
        help(
            "Available profiles: {available}\n\
             Create one with: trackly config add {name} --ws <url>"
        )
    )]
    ProfileNotFound { name: String, available: String },

    #[error("No tracking service configured")]
    #[diagnostic(
        code(trackly::no_config),
        help(
            "Create a profile with: trackly config add default --ws <url>\n\
             Or pass --ws-url. Expected config at: {path}"
        )
    )]
    NoConfig { path: String },

    #[error(transparent)]
    #[diagnostic(code(trackly::config))]
    Config(Box<figment::Error>),

    #[error("Keyring error: {0}")]
    #[diagnostic(
        code(trackly::keyring),
        help("No usable system keyring. Use token_env in the profile instead.")
    )]
    Keyring(#[from] keyring::Error),

    // ── Timeout ──────────────────────────────────────────────────────
    #[error("Connection timed out after {seconds}s")]
    #[diagnostic(
        code(trackly::timeout),
        help("Raise tuning.connect_timeout in the profile or check the network.")
    )]
    Timeout { seconds: u64 },

    // ── Engine ───────────────────────────────────────────────────────
    #[error("{0}")]
    #[diagnostic(code(trackly::engine))]
    Engine(String),

    // ── IO / Serialization ───────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Failed to encode output: {0}")]
    #[diagnostic(code(trackly::json))]
    Json(#[from] serde_json::Error),

    #[error("Failed to write config: {0}")]
    #[diagnostic(code(trackly::toml))]
    Toml(#[from] toml::ser::Error),
}

impl From<figment::Error> for CliError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } => exit_code::CONNECTION,
            Self::AuthFailed { .. } | Self::NoToken { .. } => exit_code::AUTH,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Validation { .. } => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }

    /// Translate an engine error for `profile`.
    pub fn from_core(err: &CoreError, profile: &str) -> Self {
        match err {
            CoreError::AuthenticationFailed { .. } | CoreError::AuthenticationRejected { .. } => {
                Self::AuthFailed {
                    profile: profile.into(),
                }
            }
            CoreError::Transport { .. } | CoreError::ReconnectExhausted { .. } => {
                Self::ConnectionFailed {
                    reason: err.to_string(),
                }
            }
            CoreError::Timeout { timeout_secs } => Self::Timeout {
                seconds: *timeout_secs,
            },
            CoreError::Geo(geo) => Self::from(*geo),
            CoreError::Config { message } => Self::Validation {
                field: "config".into(),
                reason: message.clone(),
            },
            other => Self::Engine(other.to_string()),
        }
    }
}

// ── Conversions ──────────────────────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        Self::from_core(&err, "current")
    }
}

impl From<GeoError> for CliError {
    fn from(err: GeoError) -> Self {
        let field = match err {
            GeoError::InvalidCoordinate { .. } => "coordinate",
            GeoError::InvalidSpeed(_) => "speed",
            GeoError::InvalidDistance(_) => "distance",
        };
        Self::Validation {
            field: field.into(),
            reason: err.to_string(),
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            ConfigError::UnknownProfile { name } => Self::ProfileNotFound {
                name,
                available: "(none)".into(),
            },
            ConfigError::NoToken { profile } => Self::NoToken { profile },
            ConfigError::Figment(err) => Self::Config(err),
            ConfigError::Serialization(err) => Self::Toml(err),
            ConfigError::Io(err) => Self::Io(err),
        }
    }
}
