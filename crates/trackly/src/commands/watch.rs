//! Live tracking of one order or driver.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;

use trackly_core::{CoreError, Engine, EntityKey, RealtimeConnector, TrackTarget, TrackingSnapshot};

use crate::cli::{GlobalOpts, WatchArgs};
use crate::config;
use crate::error::CliError;
use crate::output;

fn print_snapshot(snap: &TrackingSnapshot, global: &GlobalOpts) -> Result<(), CliError> {
    let out = output::render_single(global.output, snap, output::snapshot_line)?;
    output::print_output(&out, global.quiet);
    Ok(())
}

pub async fn handle(args: WatchArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let cfg = config::load(global)?;
    let (profile_name, profile) = config::resolve_profile(global, &cfg)?;
    let resolved = trackly_config::profile_to_engine_config(&profile, &cfg.defaults)?;
    let tokens = config::token_provider(global, &profile_name, &profile)?;

    let connector = RealtimeConnector::new(resolved.endpoints, &resolved.transport)
        .map_err(CoreError::from)?;
    let engine = Engine::new(resolved.engine, Arc::new(connector))?;

    let key = EntityKey::new(args.kind.into(), args.id);
    let mut target = TrackTarget::to(args.to);
    if let Some(origin) = args.from {
        target = target.with_origin(origin);
    }

    // Subscribe before connecting so the first frame is not missed.
    let mut handle = engine.track(key, target).await?;
    let mut errors = engine.errors();
    let mut status = engine.connection_status();
    engine.start(tokens).await?;

    tracing::info!(profile = %profile_name, key = %handle.key(), "watching");
    print_snapshot(&handle.snapshot(), global)?;

    let duration = args.duration;
    let deadline = async move {
        match duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let outcome = loop {
        tokio::select! {
            biased;

            _ = &mut ctrl_c => {
                tracing::debug!("interrupted");
                break Ok(());
            }

            () = &mut deadline => break Ok(()),

            err = errors.recv() => match err {
                Ok(err) if err.is_fatal() => break Err(CliError::from_core(&err, &profile_name)),
                Ok(err) => tracing::warn!(error = %err, "tracking error"),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "error stream lagged");
                }
                Err(RecvError::Closed) => break Err(CoreError::EngineStopped.into()),
            },

            changed = status.changed() => {
                if changed.is_err() {
                    break Err(CoreError::EngineStopped.into());
                }
                let current = status.borrow_and_update().clone();
                tracing::info!(
                    state = %current.state,
                    transport = ?current.transport,
                    attempt = current.attempt,
                    "connection"
                );
            }

            snap = handle.changed() => {
                let snap = match snap {
                    Ok(snap) => snap,
                    Err(err) => break Err(err.into()),
                };
                if let Err(err) = print_snapshot(&snap, global) {
                    break Err(err);
                }
                if snap.arrived || (args.once && snap.has_fix()) {
                    break Ok(());
                }
            }
        }
    };

    let stats = engine.dispatch_stats();
    tracing::debug!(
        routed = stats.routed,
        unroutable = stats.unroutable,
        malformed = stats.malformed,
        "dispatch totals"
    );
    handle.release();
    engine.shutdown().await;
    outcome
}
