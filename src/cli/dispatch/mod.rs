use crate::cli::actions::Action;
use anyhow::{Result, anyhow};
use secrecy::SecretString;
use std::path::PathBuf;
use tracing::info;

/// Turn parsed arguments into the action to run
///
/// # Errors
///
/// Returns an error if a required argument is missing
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches
        .get_one::<u16>("port")
        .copied()
        .ok_or_else(|| anyhow!("Port is required. Please provide it using the --port flag."))?;

    // None means auto-detect
    let listen = matches.get_one::<String>("listen").cloned();

    let config = matches
        .get_one::<String>("config")
        .map(PathBuf::from)
        .ok_or_else(|| {
            anyhow!("Configuration file is required. Please provide it using the --config.file flag.")
        })?;

    let dsn = matches
        .get_one::<String>("dsn")
        .filter(|s| !s.trim().is_empty())
        .map(|s| SecretString::from(s.clone()));

    info!(
        config = %config.display(),
        dsn_override = dsn.is_some(),
        "Resolved command line"
    );

    Ok(Action::Run {
        port,
        listen,
        config,
        dsn,
    })
}
