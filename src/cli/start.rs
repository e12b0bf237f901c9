use crate::cli::{actions::Action, commands, dispatch::handler, telemetry};
use anyhow::Result;
use tracing::info;

/// `-v` count to tracing level; errors only by default
const fn get_verbosity_level(verbose_count: u8) -> Option<tracing::Level> {
    match verbose_count {
        0 => None,
        1 => Some(tracing::Level::INFO),
        2 => Some(tracing::Level::DEBUG),
        _ => Some(tracing::Level::TRACE),
    }
}

/// Parse the command line, install telemetry and resolve the action to run
///
/// # Errors
///
/// Returns an error if telemetry initialization or command handling fails
pub fn start() -> Result<Action> {
    let matches = commands::new().get_matches();

    telemetry::init(get_verbosity_level(matches.get_count("verbose")))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        commit = crate::exporter::GIT_COMMIT_HASH,
        "Starting {}",
        env!("CARGO_PKG_NAME")
    );

    handler(&matches)
}
