use serde::Deserialize;
use std::collections::BTreeMap;

/// Default layout used both to render timestamps for filter comparison and
/// to parse lag-calculation source columns.
pub const DEFAULT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f UTC";

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    #[default]
    Gauge,
    Counter,
}

/// A single metric family definition: which columns become labels, which
/// become values, and how rows are filtered and transformed on the way.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricConfig {
    pub metric_name: String,
    #[serde(rename = "type", default)]
    pub metric_type: MetricType,
    #[serde(default)]
    pub help: String,
    #[serde(default)]
    pub key_labels: Vec<String>,
    #[serde(default)]
    pub static_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default)]
    pub value_label: Option<String>,
    #[serde(default)]
    pub timestamp_value: Option<String>,

    /// Inline SQL; mutually exclusive with `query_ref`.
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub query_ref: Option<String>,
    /// Only meaningful together with an inline `query`.
    #[serde(default)]
    pub no_prepared_statement: bool,

    #[serde(default)]
    pub row_filters: Vec<RowFilter>,
    #[serde(default)]
    pub lag_calculations: Vec<LagCalculation>,
    /// When non-empty, only these columns survive into the emitted row.
    #[serde(default)]
    pub column_filters: Vec<String>,
}

impl MetricConfig {
    /// Label name used to tell value columns apart when there is more than one.
    #[must_use]
    pub fn value_label(&self) -> Option<&str> {
        if self.values.len() > 1 {
            Some(self.value_label.as_deref().unwrap_or("value"))
        } else {
            None
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum FilterOperator {
    Equals,
    NotEquals,
    In,
    NotIn,
    Contains,
    /// Kept verbatim so it can be reported; matches every row.
    Unknown(String),
}

impl From<String> for FilterOperator {
    fn from(op: String) -> Self {
        match op.as_str() {
            "equals" => Self::Equals,
            "not_equals" => Self::NotEquals,
            "in" => Self::In,
            "not_in" => Self::NotIn,
            "contains" => Self::Contains,
            _ => Self::Unknown(op),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RowFilter {
    pub column: String,
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub values: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LagCalculation {
    pub source_column: String,
    pub output_column: String,
    /// `chrono` strftime layout; defaults to [`DEFAULT_TIMESTAMP_FORMAT`].
    #[serde(default)]
    pub timestamp_format: Option<String>,
}

impl LagCalculation {
    #[must_use]
    pub fn format(&self) -> &str {
        match self.timestamp_format.as_deref() {
            Some(format) if !format.is_empty() => format,
            _ => DEFAULT_TIMESTAMP_FORMAT,
        }
    }
}
