use super::{Metric, MetricSender, row::{ColumnValue, Row}};
use crate::{
    config::{MetricConfig, MetricType},
    errors::{ContextError, Error},
};
use chrono::{DateTime, Utc};
use std::{collections::BTreeMap, sync::Arc};
use tracing::debug;

/// Static description of a metric family: everything but the label values.
#[derive(Debug, PartialEq, Eq)]
pub struct MetricDesc {
    pub name: String,
    pub help: String,
    pub metric_type: MetricType,
    pub const_labels: BTreeMap<String, String>,
    pub label_names: Vec<String>,
}

impl MetricDesc {
    #[must_use]
    pub fn gauge(name: &str, help: &str, label_names: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            metric_type: MetricType::Gauge,
            const_labels: BTreeMap::new(),
            label_names: label_names.iter().map(ToString::to_string).collect(),
        }
    }
}

/// One point-in-time sample produced during a scrape.
#[derive(Clone, Debug)]
pub struct Sample {
    pub desc: Arc<MetricDesc>,
    pub label_values: Vec<String>,
    pub value: f64,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Turns pipeline rows into samples for one configured metric.
#[derive(Debug)]
pub struct MetricFamily {
    config: MetricConfig,
    desc: Arc<MetricDesc>,
    log_context: String,
}

impl MetricFamily {
    #[must_use]
    pub fn new(log_context: &str, config: MetricConfig) -> Self {
        let mut label_names = config.key_labels.clone();
        if let Some(value_label) = config.value_label() {
            label_names.push(value_label.to_string());
        }

        let help = if config.help.is_empty() {
            config.metric_name.clone()
        } else {
            config.help.clone()
        };

        let desc = Arc::new(MetricDesc {
            name: config.metric_name.clone(),
            help,
            metric_type: config.metric_type,
            const_labels: config.static_labels.clone(),
            label_names,
        });

        Self {
            log_context: format!("{log_context},metric={}", config.metric_name),
            config,
            desc,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &MetricConfig {
        &self.config
    }

    #[must_use]
    pub fn desc(&self) -> &Arc<MetricDesc> {
        &self.desc
    }

    /// Emit one sample per value column of `row`. NULL values are skipped;
    /// missing or mistyped columns are reported as invalid metrics.
    pub fn collect(&self, row: &Row, tx: &MetricSender) {
        let mut label_values = Vec::with_capacity(self.desc.label_names.len());
        for key in &self.config.key_labels {
            match row.get(key) {
                Some(value) => label_values.push(value.to_filter_string().unwrap_or_default()),
                None => {
                    self.invalid(tx, format!("missing key column {key:?}"));
                    return;
                }
            }
        }

        let timestamp = match self.config.timestamp_value.as_ref().map(|c| row.get(c)) {
            Some(Some(ColumnValue::Time(t))) => *t,
            _ => None,
        };

        let with_value_label = self.config.value_label().is_some();
        for column in &self.config.values {
            let value = match row.get(column) {
                Some(ColumnValue::Value(Some(v))) => *v,
                Some(ColumnValue::Value(None)) => {
                    debug!(log_context = %self.log_context, column = %column, "Skipping NULL value");
                    continue;
                }
                Some(_) => {
                    self.invalid(tx, format!("value column {column:?} is not numeric"));
                    continue;
                }
                None => {
                    self.invalid(tx, format!("missing value column {column:?}"));
                    continue;
                }
            };

            if self.desc.metric_type == MetricType::Counter && (value.is_nan() || value < 0.0) {
                self.invalid(
                    tx,
                    format!("counter value {value} in column {column:?} is negative or not a number"),
                );
                continue;
            }

            let mut labels = label_values.clone();
            if with_value_label {
                labels.push(column.clone());
            }

            let _ = tx.send(Metric::Sample(Sample {
                desc: Arc::clone(&self.desc),
                label_values: labels,
                value,
                timestamp,
            }));
        }
    }

    fn invalid(&self, tx: &MetricSender, message: String) {
        let _ = tx.send(Metric::Invalid(ContextError::new(
            self.log_context.clone(),
            Error::Metric(message),
        )));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tokio::sync::mpsc;

    fn family(keys: &[&str], values: &[&str]) -> MetricFamily {
        MetricFamily::new(
            "query=q",
            MetricConfig {
                metric_name: "db_rows".into(),
                key_labels: keys.iter().map(ToString::to_string).collect(),
                values: values.iter().map(ToString::to_string).collect(),
                ..MetricConfig::default()
            },
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Metric>) -> Vec<Metric> {
        let mut out = Vec::new();
        while let Ok(m) = rx.try_recv() {
            out.push(m);
        }
        out
    }

    fn row(entries: Vec<(&str, ColumnValue)>) -> Row {
        entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn test_desc_labels() {
        let f = family(&["env"], &["a", "b"]);
        assert_eq!(f.desc().label_names, vec!["env", "value"]);
        assert_eq!(f.desc().help, "db_rows");

        let f = family(&["env"], &["a"]);
        assert_eq!(f.desc().label_names, vec!["env"]);
    }

    #[test]
    fn test_collect_one_sample_per_value() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let f = family(&["env"], &["a", "b"]);

        f.collect(
            &row(vec![
                ("env", ColumnValue::Key(Some("prod".into()))),
                ("a", ColumnValue::Value(Some(1.0))),
                ("b", ColumnValue::Value(Some(2.0))),
            ]),
            &tx,
        );

        let samples: Vec<(Vec<String>, f64)> = drain(&mut rx)
            .into_iter()
            .map(|m| match m {
                Metric::Sample(s) => (s.label_values, s.value),
                Metric::Invalid(e) => panic!("unexpected {e}"),
            })
            .collect();

        assert_eq!(
            samples,
            vec![
                (vec!["prod".to_string(), "a".to_string()], 1.0),
                (vec!["prod".to_string(), "b".to_string()], 2.0),
            ]
        );
    }

    #[test]
    fn test_null_value_skipped_null_key_empty() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let f = family(&["env"], &["a", "b"]);

        f.collect(
            &row(vec![
                ("env", ColumnValue::Key(None)),
                ("a", ColumnValue::Value(None)),
                ("b", ColumnValue::Value(Some(3.0))),
            ]),
            &tx,
        );

        let out = drain(&mut rx);
        assert_eq!(out.len(), 1);
        match &out[0] {
            Metric::Sample(s) => {
                assert_eq!(s.label_values, vec![String::new(), "b".to_string()]);
            }
            Metric::Invalid(e) => panic!("unexpected {e}"),
        }
    }

    #[test]
    fn test_missing_columns_are_invalid() {
        let (tx, mut rx) = mpsc::unbounded_channel();

        family(&["env"], &["a"]).collect(&row(vec![("a", ColumnValue::Value(Some(1.0)))]), &tx);
        family(&[], &["a"]).collect(&row(vec![]), &tx);

        let out = drain(&mut rx);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|m| matches!(m, Metric::Invalid(_))));
    }

    #[test]
    fn test_negative_counter_rejected() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let f = MetricFamily::new(
            "query=q",
            MetricConfig {
                metric_name: "events_total".into(),
                metric_type: MetricType::Counter,
                values: vec!["n".into()],
                ..MetricConfig::default()
            },
        );

        f.collect(&row(vec![("n", ColumnValue::Value(Some(-1.0)))]), &tx);

        let out = drain(&mut rx);
        assert!(matches!(&out[..], [Metric::Invalid(e)] if e.to_string().contains("negative")));
    }

    #[test]
    fn test_nan_counter_rejected() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let f = MetricFamily::new(
            "query=q",
            MetricConfig {
                metric_name: "events_total".into(),
                metric_type: MetricType::Counter,
                values: vec!["n".into()],
                ..MetricConfig::default()
            },
        );

        f.collect(&row(vec![("n", ColumnValue::Value(Some(f64::NAN)))]), &tx);

        let out = drain(&mut rx);
        assert!(matches!(&out[..], [Metric::Invalid(e)] if e.to_string().contains("not a number")));
    }

    #[test]
    fn test_nan_gauge_passes_through() {
        let (tx, mut rx) = mpsc::unbounded_channel();

        family(&[], &["n"]).collect(&row(vec![("n", ColumnValue::Value(Some(f64::NAN)))]), &tx);

        let out = drain(&mut rx);
        assert!(matches!(&out[..], [Metric::Sample(s)] if s.value.is_nan()));
    }

    #[test]
    fn test_timestamp_value_attached() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let t = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let f = MetricFamily::new(
            "query=q",
            MetricConfig {
                metric_name: "m".into(),
                values: vec!["v".into()],
                timestamp_value: Some("ts".into()),
                ..MetricConfig::default()
            },
        );

        f.collect(
            &row(vec![
                ("v", ColumnValue::Value(Some(1.0))),
                ("ts", ColumnValue::Time(Some(t))),
            ]),
            &tx,
        );

        match drain(&mut rx).pop() {
            Some(Metric::Sample(s)) => assert_eq!(s.timestamp, Some(t)),
            other => panic!("unexpected {other:?}"),
        }
    }
}
