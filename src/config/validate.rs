use super::{CollectorConfig, Config, MetricConfig, collector_matches};
use anyhow::{Result, anyhow, bail};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

#[allow(clippy::expect_used)]
static METRIC_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z_:][a-zA-Z0-9_:]*$").expect("metric name regex"));

#[allow(clippy::expect_used)]
static LABEL_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("label name regex"));

impl Config {
    pub(super) fn validate(&self) -> Result<()> {
        let mut collector_names = HashSet::new();
        for collector in &self.collectors {
            if !collector_names.insert(collector.name.as_str()) {
                bail!("duplicate collector name {:?}", collector.name);
            }
            validate_collector(collector)?;
        }

        for pattern in &self.target.collectors {
            if !self
                .collectors
                .iter()
                .any(|c| collector_matches(pattern, &c.name))
            {
                bail!("target references unknown collector {pattern:?}");
            }
        }

        if self.global.max_connections == 0 {
            bail!("global.max_connections must be greater than zero");
        }

        if self.global.scrape_timeout <= self.global.scrape_timeout_offset {
            bail!("global.scrape_timeout must be larger than global.scrape_timeout_offset");
        }

        Ok(())
    }
}

fn validate_collector(collector: &CollectorConfig) -> Result<()> {
    if collector.name.is_empty() {
        bail!("collector name must not be empty");
    }

    let mut query_names = HashSet::new();
    for query in &collector.queries {
        if query.name.is_empty() || query.query.trim().is_empty() {
            bail!(
                "collector {:?}: queries need both a name and SQL text",
                collector.name
            );
        }
        if !query_names.insert(query.name.as_str()) {
            bail!(
                "collector {:?}: duplicate query name {:?}",
                collector.name,
                query.name
            );
        }
    }

    let mut metric_names = HashSet::new();
    for metric in &collector.metrics {
        if !metric_names.insert(metric.metric_name.as_str()) {
            bail!(
                "collector {:?}: duplicate metric {:?}",
                collector.name,
                metric.metric_name
            );
        }
        validate_metric(metric, &query_names)
            .map_err(|e| anyhow!("collector {:?}: {e}", collector.name))?;
    }

    Ok(())
}

fn validate_metric(metric: &MetricConfig, query_names: &HashSet<&str>) -> Result<()> {
    let name = &metric.metric_name;

    if !METRIC_NAME.is_match(name) {
        bail!("invalid metric name {name:?}");
    }

    match (&metric.query, &metric.query_ref) {
        (Some(_), Some(_)) => bail!("metric {name:?}: query and query_ref are mutually exclusive"),
        (None, None) => bail!("metric {name:?}: one of query or query_ref is required"),
        (Some(sql), None) if sql.trim().is_empty() => bail!("metric {name:?}: empty query"),
        (None, Some(query_ref)) if !query_names.contains(query_ref.as_str()) => {
            bail!("metric {name:?}: query_ref {query_ref:?} does not name a query")
        }
        _ => {}
    }

    if metric.values.is_empty() {
        bail!("metric {name:?}: no value columns configured");
    }

    let mut labels = HashSet::new();
    let value_label = metric.value_label();
    for label in metric
        .key_labels
        .iter()
        .map(String::as_str)
        .chain(metric.static_labels.keys().map(String::as_str))
        .chain(value_label)
    {
        if !LABEL_NAME.is_match(label) {
            bail!("metric {name:?}: invalid label name {label:?}");
        }
        if !labels.insert(label) {
            bail!("metric {name:?}: duplicate label {label:?}");
        }
    }

    for lag in &metric.lag_calculations {
        if lag.source_column.is_empty() || lag.output_column.is_empty() {
            bail!("metric {name:?}: lag calculations need a source and an output column");
        }
    }

    for filter in &metric.row_filters {
        if filter.column.is_empty() {
            bail!("metric {name:?}: row filter without a column");
        }
    }

    Ok(())
}
