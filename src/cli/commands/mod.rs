use crate::{config::DEFAULT_CONFIG_FILE, exporter::GIT_COMMIT_HASH};
use clap::{
    Arg, ArgAction, ColorChoice, Command,
    builder::styling::{AnsiColor, Effects, Styles},
};

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    Command::new("sql_exporter")
        .about("SQL query metric exporter for Prometheus")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(GIT_COMMIT_HASH)
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config.file")
                .help("Path to the TOML configuration file")
                .default_value(DEFAULT_CONFIG_FILE)
                .env("SQL_EXPORTER_CONFIG")
                .value_name("FILE"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .help("Port to listen on")
                .default_value("9399")
                .env("SQL_EXPORTER_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("listen")
                .short('l')
                .long("listen")
                .help("IP address to bind to, default tries [::] and falls back to 0.0.0.0")
                .env("SQL_EXPORTER_LISTEN")
                .value_name("IP"),
        )
        .arg(
            Arg::new("dsn")
                .long("dsn")
                .help("Data source name, overrides target.data_source_name")
                .env("SQL_EXPORTER_DSN")
                .hide_env_values(true)
                .value_name("DSN"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Increase verbosity, -vv for debug")
                .action(ArgAction::Count),
        )
}
