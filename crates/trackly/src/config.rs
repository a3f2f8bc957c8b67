//! Profile resolution: config file plus global flag overrides.

use std::path::PathBuf;
use std::sync::Arc;

use secrecy::SecretString;

use trackly_config::{Config, Profile, ProfileTokenProvider};
use trackly_core::{StaticTokenProvider, TokenProvider};

use crate::cli::GlobalOpts;
use crate::error::CliError;

/// Config file honoring `--config`.
pub fn config_path(global: &GlobalOpts) -> PathBuf {
    global
        .config
        .clone()
        .unwrap_or_else(trackly_config::config_path)
}

pub fn load(global: &GlobalOpts) -> Result<Config, CliError> {
    Ok(trackly_config::load_config_from(&config_path(global))?)
}

pub fn active_profile_name(global: &GlobalOpts, cfg: &Config) -> String {
    global
        .profile
        .clone()
        .or_else(|| cfg.default_profile.clone())
        .unwrap_or_else(|| "default".into())
}

/// The profile to run with, after `--ws-url` / `--poll-url` / `-k` /
/// `--timeout` overrides.
///
/// With no matching profile, `--ws-url` alone is enough to build one.
pub fn resolve_profile(global: &GlobalOpts, cfg: &Config) -> Result<(String, Profile), CliError> {
    let name = active_profile_name(global, cfg);

    let mut profile = match cfg.profiles.get(&name) {
        Some(p) => p.clone(),
        None if global.ws_url.is_some() => Profile::default(),
        None if global.profile.is_some() => {
            return Err(CliError::ProfileNotFound {
                available: available_profiles(cfg),
                name,
            });
        }
        None => {
            return Err(CliError::NoConfig {
                path: config_path(global).display().to_string(),
            });
        }
    };

    if let Some(ref url) = global.ws_url {
        profile.ws_url.clone_from(url);
    }
    if let Some(ref url) = global.poll_url {
        profile.poll_url = Some(url.clone());
    }
    if global.insecure {
        profile.insecure = Some(true);
    }
    if let Some(timeout) = global.timeout {
        profile.timeout = Some(timeout);
    }

    Ok((name, profile))
}

/// `--token` wins; otherwise the profile's credential chain runs on every
/// connection attempt. Fails early when the chain yields nothing.
pub fn token_provider(
    global: &GlobalOpts,
    name: &str,
    profile: &Profile,
) -> Result<Arc<dyn TokenProvider>, CliError> {
    if let Some(ref token) = global.token {
        return Ok(Arc::new(StaticTokenProvider::from(SecretString::from(
            token.clone(),
        ))));
    }
    trackly_config::resolve_token(profile, name)?;
    Ok(Arc::new(ProfileTokenProvider::new(profile.clone(), name)))
}

pub fn available_profiles(cfg: &Config) -> String {
    if cfg.profiles.is_empty() {
        "(none)".into()
    } else {
        cfg.profiles.keys().cloned().collect::<Vec<_>>().join(", ")
    }
}
