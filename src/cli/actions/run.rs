use crate::cli::actions::Action;
use crate::exporter::new;
use anyhow::Result;

/// Handle the run action
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or the server fails to start
pub async fn handle(action: Action) -> Result<()> {
    match action {
        Action::Run {
            port,
            listen,
            config,
            dsn,
        } => {
            new(port, listen, &config, dsn).await?;
        }
    }

    Ok(())
}
