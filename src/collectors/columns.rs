//! Column classification: which role each column of a query's result set
//! plays for the metric families it feeds.

use crate::{config::MetricConfig, errors::ContextError, errors::Error};
use std::collections::{HashMap, HashSet};

/// Role of a result column, deciding which scan slot it is read into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ColumnRole {
    /// Label or raw string input (nullable string).
    Key,
    /// Numeric sample value (nullable float).
    Value,
    /// Timestamp override (nullable timestamp).
    Time,
}

/// Column name to role, built once per query and read-only afterwards.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ColumnRoles(HashMap<String, ColumnRole>);

impl ColumnRoles {
    /// Derive the role of every column the given metric families need.
    ///
    /// Lag-calculation sources, row-filter columns and key labels are `Key`
    /// (lag sources are parsed from strings later), value columns `Value`
    /// unless a lag calculation produces them, and the timestamp override
    /// `Time`.
    ///
    /// # Errors
    ///
    /// Returns a role conflict if a column is requested with two different roles
    pub fn build<'a, I>(log_context: &str, metrics: I) -> Result<Self, ContextError>
    where
        I: IntoIterator<Item = &'a MetricConfig>,
    {
        let mut roles = Self::default();

        for metric in metrics {
            let mut derived: HashSet<&str> = HashSet::new();
            for lag in &metric.lag_calculations {
                derived.insert(lag.output_column.as_str());
                roles.set(log_context, &lag.source_column, ColumnRole::Key)?;
            }

            for filter in &metric.row_filters {
                roles.set(log_context, &filter.column, ColumnRole::Key)?;
            }

            for key in &metric.key_labels {
                roles.set(log_context, key, ColumnRole::Key)?;
            }

            for value in &metric.values {
                if !derived.contains(value.as_str()) {
                    roles.set(log_context, value, ColumnRole::Value)?;
                }
            }

            if let Some(column) = &metric.timestamp_value {
                roles.set(log_context, column, ColumnRole::Time)?;
            }
        }

        Ok(roles)
    }

    fn set(&mut self, log_context: &str, column: &str, role: ColumnRole) -> Result<(), ContextError> {
        match self.0.get(column) {
            Some(&previous) if previous != role => Err(ContextError::new(
                log_context,
                Error::ColumnRoleConflict {
                    column: column.to_string(),
                    previous,
                    requested: role,
                },
            )),
            Some(_) => Ok(()),
            None => {
                self.0.insert(column.to_string(), role);
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn get(&self, column: &str) -> Option<ColumnRole> {
        self.0.get(column).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Column names, sorted for stable log output and error messages.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.0.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
