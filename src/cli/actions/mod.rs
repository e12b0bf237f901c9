pub mod run;

use secrecy::SecretString;
use std::path::PathBuf;

#[derive(Debug)]
pub enum Action {
    Run {
        port: u16,
        listen: Option<String>,
        config: PathBuf,
        dsn: Option<SecretString>,
    },
}
