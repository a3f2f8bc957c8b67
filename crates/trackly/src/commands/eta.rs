//! Offline distance / ETA estimate between two points.

use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use serde::Serialize;

use trackly_core::geo::{self, Coordinate, GeoError};

use crate::cli::{EtaArgs, GlobalOpts};
use crate::error::CliError;
use crate::output;

#[derive(Debug, Serialize)]
struct EtaReport {
    from: Coordinate,
    to: Coordinate,
    distance_m: f64,
    distance_km: f64,
    distance_mi: f64,
    bearing_deg: f64,
    base_speed_mps: f64,
    speed_mps: f64,
    traffic_adjusted: bool,
    duration_secs: f64,
    departure: String,
    arrival: String,
}

fn departure_time(args: &EtaArgs) -> Result<DateTime<FixedOffset>, CliError> {
    if let Some(at) = args.at {
        return Ok(at);
    }
    let offset = args
        .utc_offset
        .checked_mul(60)
        .and_then(FixedOffset::east_opt)
        .ok_or_else(|| CliError::Validation {
            field: "utc-offset".into(),
            reason: format!("{} minutes is out of range", args.utc_offset),
        })?;
    Ok(Utc::now().with_timezone(&offset))
}

fn estimate(args: &EtaArgs) -> Result<EtaReport, CliError> {
    if !args.speed.is_finite() || args.speed <= 0.0 {
        return Err(GeoError::InvalidSpeed(args.speed).into());
    }
    let departure = departure_time(args)?;

    let distance = geo::distance(args.from, args.to)?;
    let speed = if args.no_traffic {
        args.speed
    } else {
        geo::adjusted_speed_at(args.speed, &departure)
    };
    let duration = geo::estimate_duration(distance.meters, speed)?;
    let arrival = chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| departure.checked_add_signed(d))
        .ok_or_else(|| CliError::Validation {
            field: "speed".into(),
            reason: "arrival time out of range".into(),
        })?;

    Ok(EtaReport {
        from: args.from,
        to: args.to,
        distance_m: distance.meters,
        distance_km: distance.kilometers,
        distance_mi: geo::distance_miles(args.from, args.to)?,
        bearing_deg: geo::bearing(args.from, args.to)?,
        base_speed_mps: args.speed,
        speed_mps: speed,
        traffic_adjusted: (speed - args.speed).abs() > f64::EPSILON,
        duration_secs: duration.as_secs_f64(),
        departure: departure.to_rfc3339_opts(SecondsFormat::Secs, true),
        arrival: arrival.to_rfc3339_opts(SecondsFormat::Secs, true),
    })
}

fn detail(report: &EtaReport) -> String {
    let traffic = if report.traffic_adjusted {
        format!(" (traffic-adjusted from {:.1})", report.base_speed_mps)
    } else {
        String::new()
    };
    [
        format!(
            "distance  {:.2} km ({:.2} mi)",
            report.distance_km, report.distance_mi
        ),
        format!("bearing   {:.0}°", report.bearing_deg),
        format!("speed     {:.1} m/s{traffic}", report.speed_mps),
        format!(
            "duration  {}",
            output::format_duration(std::time::Duration::from_secs_f64(report.duration_secs))
        ),
        format!("departure {}", report.departure),
        format!("arrival   {}", report.arrival),
    ]
    .join("\n")
}

pub fn handle(args: &EtaArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let report = estimate(args)?;
    tracing::debug!(
        distance_m = report.distance_m,
        speed_mps = report.speed_mps,
        "estimated trip"
    );
    let out = output::render_single(global.output, &report, detail)?;
    output::print_output(&out, global.quiet);
    Ok(())
}
