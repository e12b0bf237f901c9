//! Per-row filtering and transformation applied between scanning and metric
//! emission.
//!
//! Filters fail closed on a missing or NULL column but fail open on an
//! operator they do not know.

use super::row::{ColumnValue, Row};
use crate::config::{FilterOperator, MetricConfig, RowFilter};
use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::warn;

/// Whether `row` satisfies every row filter of `metric`.
#[must_use]
pub fn should_include_row(row: &Row, metric: &MetricConfig) -> bool {
    metric
        .row_filters
        .iter()
        .all(|filter| apply_row_filter(row, filter))
}

/// Evaluate a single filter against a row.
#[must_use]
pub fn apply_row_filter(row: &Row, filter: &RowFilter) -> bool {
    let Some(value) = row.get(&filter.column) else {
        return false;
    };
    let Some(value) = value.to_filter_string() else {
        return false;
    };

    match &filter.operator {
        FilterOperator::Equals => value == filter.value,
        FilterOperator::NotEquals => value != filter.value,
        FilterOperator::In => filter.values.iter().any(|v| *v == value),
        FilterOperator::NotIn => !filter.values.iter().any(|v| *v == value),
        FilterOperator::Contains => value.contains(filter.value.as_str()),
        FilterOperator::Unknown(operator) => {
            warn!(operator = %operator, column = %filter.column, "Unknown filter operator");
            true
        }
    }
}

/// Apply the lag calculations of `metric` and then its column allow-list.
#[must_use]
pub fn apply_transformations(row: &Row, metric: &MetricConfig) -> Row {
    apply_transformations_at(row, metric, Utc::now())
}

/// [`apply_transformations`] with an explicit notion of "now".
#[must_use]
pub fn apply_transformations_at(row: &Row, metric: &MetricConfig, now: DateTime<Utc>) -> Row {
    let mut result = row.clone();

    for lag in &metric.lag_calculations {
        if let Some(source) = row.get(&lag.source_column) {
            let seconds = calculate_lag(source, lag.format(), now);
            // Zero means the lag could not be computed.
            #[allow(clippy::float_cmp)]
            let valid = seconds != 0.0;
            result.insert(
                lag.output_column.clone(),
                ColumnValue::Value(valid.then_some(seconds)),
            );
        }
    }

    if metric.column_filters.is_empty() {
        return result;
    }

    metric
        .column_filters
        .iter()
        .filter_map(|column| result.remove_entry(column))
        .collect()
}

/// Seconds elapsed between `value` and `now`. Native timestamps are used
/// directly, strings are parsed with `format`; anything unusable yields `0`.
#[must_use]
pub fn calculate_lag(value: &ColumnValue, format: &str, now: DateTime<Utc>) -> f64 {
    let text = match value {
        ColumnValue::Time(Some(t)) => return elapsed_seconds(*t, now),
        ColumnValue::Time(None) | ColumnValue::Key(None) | ColumnValue::Value(None) => return 0.0,
        ColumnValue::Key(Some(s)) => s.clone(),
        ColumnValue::Value(Some(f)) => f.to_string(),
    };

    if text.is_empty() {
        return 0.0;
    }

    match parse_with_format(&text, format) {
        Some(t) => elapsed_seconds(t, now),
        None => {
            warn!(
                timestamp = %text,
                format = %format,
                "Failed to parse timestamp for lag calculation"
            );
            0.0
        }
    }
}

fn parse_with_format(s: &str, format: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(s, format)
        .map(|t| t.to_utc())
        .or_else(|_| NaiveDateTime::parse_from_str(s, format).map(|t| t.and_utc()))
        .ok()
}

#[allow(clippy::cast_precision_loss)]
fn elapsed_seconds(t: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - t).num_microseconds().map_or_else(
        || (now - t).num_seconds() as f64,
        |us| us as f64 / 1_000_000.0,
    )
}
