//! Output formatting: plain text or JSON.
//!
//! Structured formats serialize via serde; plain uses a per-command
//! `detail_fn` that renders human-readable lines.

use std::fmt::Write as _;
use std::io::{self, Write};
use std::time::Duration;

use trackly_core::TrackingSnapshot;

use crate::cli::OutputFormat;
use crate::error::CliError;

// ── Render dispatchers ───────────────────────────────────────────────

/// Render one serde-serializable item in the chosen format.
pub fn render_single<T>(
    format: OutputFormat,
    data: &T,
    detail_fn: impl Fn(&T) -> String,
) -> Result<String, CliError>
where
    T: serde::Serialize,
{
    match format {
        OutputFormat::Plain => Ok(detail_fn(data)),
        OutputFormat::Json => render_json(data, false),
        OutputFormat::JsonCompact => render_json(data, true),
    }
}

pub fn render_json<T: serde::Serialize + ?Sized>(data: &T, compact: bool) -> Result<String, CliError> {
    let out = if compact {
        serde_json::to_string(data)?
    } else {
        serde_json::to_string_pretty(data)?
    };
    Ok(out)
}

/// Print the rendered output to stdout, respecting quiet mode.
pub fn print_output(output: &str, quiet: bool) {
    if quiet || output.is_empty() {
        return;
    }
    let mut stdout = io::stdout().lock();
    // Broken pipes (e.g. `| head`) end output quietly.
    let _ = writeln!(stdout, "{output}");
    let _ = stdout.flush();
}

// ── Plain formatters ─────────────────────────────────────────────────

/// `1h 02m 05s`, `3m 20s`, `45s`.
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}h {m:02}m {s:02}s")
    } else if m > 0 {
        format!("{m}m {s:02}s")
    } else {
        format!("{s}s")
    }
}

/// One status line per snapshot change.
pub fn snapshot_line(snap: &TrackingSnapshot) -> String {
    let mut line = format!("{} ", snap.key);

    if snap.arrived {
        line.push_str("arrived");
    } else if let Some(ref distance) = snap.distance_remaining {
        let _ = write!(line, "{:.2} km", distance.kilometers);
        if let Some(remaining) = snap.time_remaining {
            let _ = write!(line, "  eta {}", format_duration(remaining));
        }
        if let Some(eta) = snap.eta {
            let _ = write!(line, " ({})", eta.format("%H:%M:%S UTC"));
        }
        if let Some(bearing) = snap.bearing {
            let _ = write!(line, "  heading {bearing:.0}°");
        }
    } else {
        line.push_str("waiting for position");
    }

    if snap.progress > 0.0 {
        let _ = write!(line, "  {:.0}%", snap.progress * 100.0);
    }
    if let Some(ref status) = snap.status {
        let _ = write!(line, "  [{status}]");
    }
    if snap.is_stale {
        line.push_str("  (stale)");
    }
    line
}
