//! Error types shared by the collection core.
//!
//! Every failure that reaches a scrape is wrapped in a [`ContextError`], which
//! carries the logical context (`target=..,collector=..,query=..`) the failure
//! happened in. Connection descriptors never appear in any message.

use crate::collectors::{columns::ColumnRole, connection::Driver};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid connection descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("unsupported database driver {0:?}")]
    UnsupportedDriver(String),

    #[error("column {column:?} used both as {previous} and {requested}")]
    ColumnRoleConflict {
        column: String,
        previous: ColumnRole,
        requested: ColumnRole,
    },

    #[error("missing values for the requested columns: {0:?}")]
    MissingColumns(Vec<String>),

    #[error("scanning of query result failed: column {column:?}: {reason}")]
    Scan { column: String, reason: String },

    #[error("{0} statement executed on a {1} handle")]
    ForeignStatement(Driver, Driver),

    #[error("prepare query failed: {0}")]
    Prepare(#[source] sqlx::Error),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Metric(String),

    #[error(transparent)]
    Prometheus(#[from] prometheus::Error),
}

/// An [`Error`] tagged with the logical context it was raised in.
#[derive(Debug, Error)]
#[error("[{context}] {source}")]
pub struct ContextError {
    context: String,
    #[source]
    source: Error,
}

impl ContextError {
    #[must_use]
    pub fn new(context: impl Into<String>, source: impl Into<Error>) -> Self {
        Self {
            context: context.into(),
            source: source.into(),
        }
    }

    #[must_use]
    pub fn context(&self) -> &str {
        &self.context
    }

    #[must_use]
    pub const fn error(&self) -> &Error {
        &self.source
    }
}

impl fmt::Display for ColumnRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Key => "key",
            Self::Value => "value",
            Self::Time => "time",
        })
    }
}

/// Joins context fragments, dropping the ones whose value is empty
/// (e.g. `target=` when the target has no name).
#[must_use]
pub fn trim_missing_context(context: &str) -> String {
    context
        .split(',')
        .filter(|part| !part.is_empty() && !part.ends_with('='))
        .collect::<Vec<_>>()
        .join(",")
}
