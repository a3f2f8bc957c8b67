//! Shared configuration for trackly tools.
//!
//! TOML profiles, bearer-token resolution (env + keyring + plaintext),
//! and translation to `trackly_core::EngineConfig` plus the transport
//! endpoints a `RealtimeConnector` needs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use trackly_api::{RealtimeEndpoints, TlsMode, TransportConfig};
use trackly_core::token::{TokenError, TokenProvider};
use trackly_core::EngineConfig;

/// Keyring service name; entries are `<profile>/token`.
pub const KEYRING_SERVICE: &str = "trackly";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("profile '{name}' not found")]
    UnknownProfile { name: String },

    #[error("no token configured for profile '{profile}'")]
    NoToken { profile: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Default profile name.
    pub default_profile: Option<String>,

    /// Global defaults.
    #[serde(default)]
    pub defaults: Defaults,

    /// Named realtime-service profiles.
    #[serde(default)]
    pub profiles: BTreeMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            profiles: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Look up `name`, or the default profile when `name` is `None`.
    pub fn profile(&self, name: Option<&str>) -> Result<(&str, &Profile), ConfigError> {
        let name = name
            .or(self.default_profile.as_deref())
            .unwrap_or("default");
        self.profiles
            .get_key_value(name)
            .map(|(k, v)| (k.as_str(), v))
            .ok_or_else(|| ConfigError::UnknownProfile { name: name.into() })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Defaults {
    #[serde(default = "default_output")]
    pub output: String,

    #[serde(default)]
    pub insecure: bool,

    /// HTTP request timeout in seconds; must exceed the long-poll hold time.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            output: default_output(),
            insecure: false,
            timeout: default_timeout(),
        }
    }
}

fn default_output() -> String {
    "plain".into()
}
fn default_timeout() -> u64 {
    40
}

/// A named realtime-service profile.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Profile {
    /// WebSocket endpoint (e.g., "wss://rt.example.com/v1/stream").
    pub ws_url: String,

    /// Long-poll base URL; enables the fallback transport when set.
    pub poll_url: Option<String>,

    /// Bearer token (plaintext; prefer keyring or env var).
    pub token: Option<String>,

    /// Environment variable name containing the bearer token.
    pub token_env: Option<String>,

    /// Path to custom CA certificate.
    pub ca_cert: Option<PathBuf>,

    /// Override insecure TLS setting.
    pub insecure: Option<bool>,

    /// Override request timeout (seconds).
    pub timeout: Option<u64>,

    /// Engine tuning overrides.
    #[serde(default)]
    pub tuning: Tuning,
}

/// Per-profile overrides of `EngineConfig`. Durations are in seconds.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Tuning {
    pub base_reconnect_delay: Option<u64>,
    pub max_reconnect_delay: Option<u64>,
    pub max_auth_retries: Option<u32>,
    pub max_reconnect_attempts: Option<u32>,
    pub staleness_window: Option<u64>,
    pub tick_interval: Option<u64>,
    pub connect_timeout: Option<u64>,
    pub min_speed_mps: Option<f64>,
    pub default_speed_mps: Option<f64>,
    pub traffic_adjustment: Option<bool>,
    pub traffic_utc_offset_minutes: Option<i32>,
}

impl Tuning {
    /// Overlay these overrides on the engine defaults.
    pub fn apply(&self, mut config: EngineConfig) -> EngineConfig {
        let secs = Duration::from_secs;
        if let Some(v) = self.base_reconnect_delay {
            config.base_reconnect_delay = secs(v);
        }
        if let Some(v) = self.max_reconnect_delay {
            config.max_reconnect_delay = secs(v);
        }
        if let Some(v) = self.max_auth_retries {
            config.max_auth_retries = v;
        }
        if let Some(v) = self.max_reconnect_attempts {
            config.max_reconnect_attempts = Some(v);
        }
        if let Some(v) = self.staleness_window {
            config.staleness_window = secs(v);
        }
        if let Some(v) = self.tick_interval {
            config.tick_interval = secs(v);
        }
        if let Some(v) = self.connect_timeout {
            config.connect_timeout = secs(v);
        }
        if let Some(v) = self.min_speed_mps {
            config.min_speed_mps = v;
        }
        if let Some(v) = self.default_speed_mps {
            config.default_speed_mps = v;
        }
        if let Some(v) = self.traffic_adjustment {
            config.traffic_adjustment = v;
        }
        if let Some(v) = self.traffic_utc_offset_minutes {
            config.traffic_utc_offset_minutes = v;
        }
        config
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("com", "trackly", "trackly").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("trackly");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from an explicit file, then `TRACKLY_` environment overrides.
///
/// Nested keys use `__`: `TRACKLY_PROFILES__PROD__WS_URL`.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("TRACKLY_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(&config_path(), cfg)
}

pub fn save_config_to(path: &Path, cfg: &Config) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Token resolution ────────────────────────────────────────────────

/// Resolve a bearer token from the credential chain.
pub fn resolve_token(profile: &Profile, profile_name: &str) -> Result<SecretString, ConfigError> {
    // 1. Profile's token_env → env var lookup
    if let Some(ref env_name) = profile.token_env {
        if let Ok(val) = std::env::var(env_name) {
            return Ok(SecretString::from(val));
        }
    }

    // 2. System keyring
    if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, &format!("{profile_name}/token")) {
        if let Ok(secret) = entry.get_password() {
            return Ok(SecretString::from(secret));
        }
    }

    // 3. Plaintext in config
    if let Some(ref token) = profile.token {
        return Ok(SecretString::from(token.clone()));
    }

    Err(ConfigError::NoToken {
        profile: profile_name.into(),
    })
}

/// Re-runs the credential chain on every connection attempt, so a token
/// rotated in the environment or keyring is picked up on reconnect.
#[derive(Debug, Clone)]
pub struct ProfileTokenProvider {
    profile: Profile,
    name: String,
}

impl ProfileTokenProvider {
    pub fn new(profile: Profile, name: impl Into<String>) -> Self {
        Self {
            profile,
            name: name.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for ProfileTokenProvider {
    async fn token(&self) -> Result<SecretString, TokenError> {
        resolve_token(&self.profile, &self.name).map_err(Into::into)
    }
}

// ── Engine settings ─────────────────────────────────────────────────

/// Everything needed to build an engine for one profile.
#[derive(Debug, Clone)]
pub struct ResolvedProfile {
    pub engine: EngineConfig,
    pub endpoints: RealtimeEndpoints,
    pub transport: TransportConfig,
}

fn parse_url(field: &str, raw: &str, schemes: &[&str]) -> Result<Url, ConfigError> {
    let url: Url = raw.parse().map_err(|e| ConfigError::Validation {
        field: field.into(),
        reason: format!("invalid URL '{raw}': {e}"),
    })?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::Validation {
            field: field.into(),
            reason: format!("expected {} URL, got '{raw}'", schemes.join("/")),
        });
    }
    Ok(url)
}

/// Build engine and transport settings from a profile.
pub fn profile_to_engine_config(
    profile: &Profile,
    defaults: &Defaults,
) -> Result<ResolvedProfile, ConfigError> {
    let websocket = parse_url("ws_url", &profile.ws_url, &["ws", "wss"])?;
    let long_poll = profile
        .poll_url
        .as_deref()
        .map(|raw| parse_url("poll_url", raw, &["http", "https"]))
        .transpose()?;

    let tls = if profile.insecure.unwrap_or(defaults.insecure) {
        TlsMode::DangerAcceptInvalid
    } else if let Some(ref ca_path) = profile.ca_cert {
        TlsMode::CustomCa(ca_path.clone())
    } else {
        TlsMode::System
    };
    let timeout = Duration::from_secs(profile.timeout.unwrap_or(defaults.timeout));

    let engine = profile.tuning.apply(EngineConfig::default());
    engine.validate().map_err(|e| ConfigError::Validation {
        field: "tuning".into(),
        reason: e.to_string(),
    })?;

    Ok(ResolvedProfile {
        engine,
        endpoints: RealtimeEndpoints {
            websocket,
            long_poll,
        },
        transport: TransportConfig { tls, timeout },
    })
}

// ── Tests ───────────────────────────────────────────────────────────
