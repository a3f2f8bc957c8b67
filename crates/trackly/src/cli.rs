//! Clap derive structures for the `trackly` CLI.

use std::path::PathBuf;

use chrono::{DateTime, FixedOffset};
use clap::{Args, Parser, Subcommand, ValueEnum};

use trackly_core::{Coordinate, EntityKind};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// trackly -- live order and driver tracking from the terminal
#[derive(Debug, Parser)]
#[command(
    name = "trackly",
    version,
    about = "Track orders and drivers in real time",
    long_about = "Follow an order or driver over the realtime tracking service and\n\
        print distance, ETA and progress as positions arrive.\n\n\
        Connects over WebSocket and falls back to HTTP long-polling when\n\
        the profile configures a poll URL.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Service profile to use
    #[arg(long, short = 'p', env = "TRACKLY_PROFILE", global = true)]
    pub profile: Option<String>,

    /// Config file (overrides the platform default location)
    #[arg(long, env = "TRACKLY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// WebSocket endpoint (overrides profile)
    #[arg(long, env = "TRACKLY_WS_URL", global = true)]
    pub ws_url: Option<String>,

    /// Long-poll endpoint (overrides profile)
    #[arg(long, env = "TRACKLY_POLL_URL", global = true)]
    pub poll_url: Option<String>,

    /// Bearer token
    #[arg(long, env = "TRACKLY_TOKEN", global = true, hide_env = true)]
    pub token: Option<String>,

    /// Output format
    #[arg(
        long,
        short = 'o',
        env = "TRACKLY_OUTPUT",
        default_value = "plain",
        global = true
    )]
    pub output: OutputFormat,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Accept self-signed TLS certificates
    #[arg(long, short = 'k', env = "TRACKLY_INSECURE", global = true)]
    pub insecure: bool,

    /// HTTP request timeout in seconds
    #[arg(long, env = "TRACKLY_TIMEOUT", global = true)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable lines (default)
    Plain,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON, one document per line
    JsonCompact,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Follow an order or driver live
    #[command(alias = "w")]
    Watch(WatchArgs),

    /// Estimate distance and arrival time between two points (offline)
    Eta(EtaArgs),

    /// Manage CLI configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum KindArg {
    Order,
    Driver,
}

impl From<KindArg> for EntityKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Order => Self::Order,
            KindArg::Driver => Self::Driver,
        }
    }
}

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// What to track
    pub kind: KindArg,

    /// Order or driver identifier
    pub id: String,

    /// Destination as "lat,lon"
    #[arg(long, value_parser = parse_coordinate, allow_hyphen_values = true)]
    pub to: Coordinate,

    /// Trip origin as "lat,lon" (enables progress)
    #[arg(long, value_parser = parse_coordinate, allow_hyphen_values = true)]
    pub from: Option<Coordinate>,

    /// Exit after the first position fix
    #[arg(long)]
    pub once: bool,

    /// Stop watching after this many seconds
    #[arg(long)]
    pub duration: Option<u64>,
}

#[derive(Debug, Args)]
pub struct EtaArgs {
    /// Start point as "lat,lon"
    #[arg(long, value_parser = parse_coordinate, allow_hyphen_values = true)]
    pub from: Coordinate,

    /// Destination as "lat,lon"
    #[arg(long, value_parser = parse_coordinate, allow_hyphen_values = true)]
    pub to: Coordinate,

    /// Travel speed in meters per second
    #[arg(long, default_value = "8.0")]
    pub speed: f64,

    /// Departure time (RFC 3339); defaults to now
    #[arg(long, value_parser = parse_datetime)]
    pub at: Option<DateTime<FixedOffset>>,

    /// Local UTC offset in minutes, used when --at is omitted
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    pub utc_offset: i32,

    /// Skip the rush-hour speed adjustment
    #[arg(long)]
    pub no_traffic: bool,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the config file location
    Path,

    /// Display the resolved profile (tokens redacted)
    Show,

    /// List configured profiles
    Profiles,

    /// Add or replace a profile
    Add {
        /// Profile name
        name: String,

        /// WebSocket endpoint
        #[arg(long = "ws")]
        ws: String,

        /// Long-poll endpoint
        #[arg(long = "poll")]
        poll: Option<String>,

        /// Environment variable holding the token
        #[arg(long)]
        token_env: Option<String>,

        /// Make this the default profile
        #[arg(long)]
        default: bool,
    },

    /// Set the default profile
    Use {
        /// Profile name to set as default
        name: String,
    },

    /// Store a profile's token in the system keyring
    SetToken {
        /// Token value; read from stdin when omitted
        token: Option<String>,
    },
}

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}

// ── Value parsers ────────────────────────────────────────────────────

/// Parse `"lat,lon"` into a validated coordinate.
pub fn parse_coordinate(raw: &str) -> Result<Coordinate, String> {
    let (lat, lon) = raw
        .split_once(',')
        .ok_or_else(|| format!("expected \"lat,lon\", got '{raw}'"))?;
    let latitude: f64 = lat
        .trim()
        .parse()
        .map_err(|e| format!("bad latitude '{lat}': {e}"))?;
    let longitude: f64 = lon
        .trim()
        .parse()
        .map_err(|e| format!("bad longitude '{lon}': {e}"))?;
    Coordinate::new(latitude, longitude).map_err(|e| e.to_string())
}

fn parse_datetime(raw: &str) -> Result<DateTime<FixedOffset>, String> {
    DateTime::parse_from_rfc3339(raw).map_err(|e| format!("expected RFC 3339 time: {e}"))
}
