pub mod cli;
pub mod collectors;
pub mod config;
pub mod errors;
pub mod exporter;
