//! Config subcommand handlers.

use std::io::BufRead;

use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use trackly_config::{KEYRING_SERVICE, Profile};

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts, OutputFormat};
use crate::config;
use crate::error::CliError;
use crate::output;

const REDACTED: &str = "********";

#[derive(Debug, Serialize)]
struct ProfileView {
    name: String,
    #[serde(flatten)]
    profile: Profile,
}

fn redacted(mut profile: Profile) -> Profile {
    if profile.token.is_some() {
        profile.token = Some(REDACTED.into());
    }
    profile
}

fn status(global: &GlobalOpts, message: &str) {
    if !global.quiet {
        eprintln!("{message}");
    }
}

fn read_token_from_stdin() -> Result<SecretString, CliError> {
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(SecretString::from(line.trim().to_owned()))
}

// ── Handler ─────────────────────────────────────────────────────────

pub fn handle(args: ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Path => {
            output::print_output(&config::config_path(global).display().to_string(), global.quiet);
            Ok(())
        }

        ConfigCommand::Show => {
            let cfg = config::load(global)?;
            let (name, profile) = config::resolve_profile(global, &cfg)?;
            let view = ProfileView {
                name,
                profile: redacted(profile),
            };
            let out = match global.output {
                OutputFormat::Plain => toml::to_string_pretty(&view)?,
                OutputFormat::Json => output::render_json(&view, false)?,
                OutputFormat::JsonCompact => output::render_json(&view, true)?,
            };
            output::print_output(out.trim_end(), global.quiet);
            Ok(())
        }

        ConfigCommand::Profiles => {
            let cfg = config::load(global)?;
            let default = cfg.default_profile.as_deref().unwrap_or("default");
            let names: Vec<&String> = cfg.profiles.keys().collect();
            let out = output::render_single(global.output, &names, |names| {
                names
                    .iter()
                    .map(|n| {
                        if n.as_str() == default {
                            format!("{n} (default)")
                        } else {
                            (*n).clone()
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
            output::print_output(&out, global.quiet);
            Ok(())
        }

        ConfigCommand::Add {
            name,
            ws,
            poll,
            token_env,
            default,
        } => {
            let path = config::config_path(global);
            let mut cfg = config::load(global)?;
            let profile = Profile {
                ws_url: ws,
                poll_url: poll,
                token_env,
                ..Profile::default()
            };
            // Reject unusable endpoints before they reach the file.
            trackly_config::profile_to_engine_config(&profile, &cfg.defaults)?;

            cfg.profiles.insert(name.clone(), profile);
            if default || cfg.profiles.len() == 1 {
                cfg.default_profile = Some(name.clone());
            }
            trackly_config::save_config_to(&path, &cfg)?;
            status(
                global,
                &format!("Saved profile '{name}' to {}", path.display()),
            );
            Ok(())
        }

        ConfigCommand::Use { name } => {
            let path = config::config_path(global);
            let mut cfg = config::load(global)?;
            if !cfg.profiles.contains_key(&name) {
                return Err(CliError::ProfileNotFound {
                    available: config::available_profiles(&cfg),
                    name,
                });
            }
            cfg.default_profile = Some(name.clone());
            trackly_config::save_config_to(&path, &cfg)?;
            status(global, &format!("Default profile is now '{name}'"));
            Ok(())
        }

        ConfigCommand::SetToken { token } => {
            let cfg = config::load(global)?;
            let name = config::active_profile_name(global, &cfg);
            let token = match token {
                Some(token) => SecretString::from(token),
                None => read_token_from_stdin()?,
            };
            if token.expose_secret().is_empty() {
                return Err(CliError::Validation {
                    field: "token".into(),
                    reason: "token cannot be empty".into(),
                });
            }

            let entry = keyring::Entry::new(KEYRING_SERVICE, &format!("{name}/token"))?;
            entry.set_password(token.expose_secret())?;
            tracing::debug!(profile = %name, "token stored in keyring");
            status(global, &format!("Token stored for profile '{name}'"));
            Ok(())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn redaction_hides_plaintext_tokens_only() {
        let profile = Profile {
            ws_url: "wss://rt.example/ws".into(),
            token: Some("secret".into()),
            ..Profile::default()
        };
        assert_eq!(redacted(profile).token.as_deref(), Some(REDACTED));
        assert_eq!(redacted(Profile::default()).token, None);
    }

    #[test]
    fn view_serializes_flat() {
        let view = ProfileView {
            name: "prod".into(),
            profile: Profile {
                ws_url: "wss://rt.example/ws".into(),
                ..Profile::default()
            },
        };
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["name"], "prod");
        assert_eq!(json["ws_url"], "wss://rt.example/ws");
    }
}
