//! Per-scrape rendering of samples into Prometheus metric families.
//!
//! Every scrape builds fresh vectors, so values never leak from one scrape
//! into the next. Families are created on their first sample: the text
//! encoder rejects a family without metrics.

use super::{Metric, metric_family::{MetricDesc, Sample}};
use crate::{config::MetricType, errors::Error};
use prometheus::{CounterVec, GaugeVec, Opts, TextEncoder, core::Collector as _, proto};
use std::{
    collections::{BTreeMap, HashMap, HashSet, btree_map::Entry},
    sync::Arc,
};
use tracing::warn;

type LabelSet = Vec<(String, String)>;

enum Values {
    Gauge(GaugeVec),
    Counter(CounterVec),
}

struct FamilyBuffer {
    desc: Arc<MetricDesc>,
    values: Values,
    seen: HashSet<Vec<String>>,
    timestamps: HashMap<LabelSet, i64>,
}

impl FamilyBuffer {
    fn new(desc: Arc<MetricDesc>) -> Result<Self, Error> {
        let opts = Opts::new(desc.name.as_str(), desc.help.as_str()).const_labels(
            desc.const_labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        let label_names: Vec<&str> = desc.label_names.iter().map(String::as_str).collect();

        let values = match desc.metric_type {
            MetricType::Gauge => Values::Gauge(GaugeVec::new(opts, &label_names)?),
            MetricType::Counter => Values::Counter(CounterVec::new(opts, &label_names)?),
        };

        Ok(Self {
            desc,
            values,
            seen: HashSet::new(),
            timestamps: HashMap::new(),
        })
    }

    fn add(&mut self, sample: Sample) -> Result<(), Error> {
        if self.seen.contains(&sample.label_values) {
            return Err(Error::Metric(format!(
                "collected metric {} {:?} was collected before with the same label values",
                self.desc.name, sample.label_values
            )));
        }

        let values: Vec<&str> = sample.label_values.iter().map(String::as_str).collect();
        match &self.values {
            Values::Gauge(vec) => vec.get_metric_with_label_values(&values)?.set(sample.value),
            Values::Counter(vec) => vec.get_metric_with_label_values(&values)?.inc_by(sample.value),
        }

        if let Some(timestamp) = sample.timestamp {
            self.timestamps
                .insert(self.label_set(&sample.label_values), timestamp.timestamp_millis());
        }
        self.seen.insert(sample.label_values);
        Ok(())
    }

    /// All labels of a sample, const ones included, sorted by name.
    fn label_set(&self, label_values: &[String]) -> LabelSet {
        let mut set: LabelSet = self
            .desc
            .const_labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .chain(
                self.desc
                    .label_names
                    .iter()
                    .cloned()
                    .zip(label_values.iter().cloned()),
            )
            .collect();
        set.sort_unstable();
        set
    }

    fn gather(self) -> Vec<proto::MetricFamily> {
        let mut families = match &self.values {
            Values::Gauge(vec) => vec.collect(),
            Values::Counter(vec) => vec.collect(),
        };

        if self.timestamps.is_empty() {
            return families;
        }

        for family in &mut families {
            for metric in &mut family.metric {
                let mut labels: LabelSet = metric
                    .label
                    .iter()
                    .map(|l| (l.name().to_string(), l.value().to_string()))
                    .collect();
                labels.sort_unstable();

                if let Some(ms) = self.timestamps.get(&labels) {
                    metric.set_timestamp_ms(*ms);
                }
            }
        }

        families
    }
}

/// Samples of one scrape, grouped by metric name.
#[derive(Default)]
pub struct ScrapeBuffer {
    families: BTreeMap<String, FamilyBuffer>,
    samples: usize,
    invalid: usize,
}

impl ScrapeBuffer {
    /// Add one collection result. Invalid metrics and rejected samples are
    /// logged and counted, never fatal.
    pub fn push(&mut self, metric: Metric) {
        let result = match metric {
            Metric::Sample(sample) => self.add(sample),
            Metric::Invalid(e) => {
                warn!(log_context = %e.context(), error = %e.error(), "Error gathering metrics");
                self.invalid += 1;
                return;
            }
        };

        if let Err(e) = result {
            warn!(error = %e, "Error gathering metrics");
            self.invalid += 1;
        }
    }

    fn add(&mut self, sample: Sample) -> Result<(), Error> {
        let family = match self.families.entry(sample.desc.name.clone()) {
            Entry::Occupied(entry) => {
                let family = entry.into_mut();
                if family.desc != sample.desc {
                    return Err(Error::Metric(format!(
                        "collected metric {} has a description inconsistent with a previous one",
                        sample.desc.name
                    )));
                }
                family
            }
            Entry::Vacant(entry) => entry.insert(FamilyBuffer::new(Arc::clone(&sample.desc))?),
        };

        family.add(sample)?;
        self.samples += 1;
        Ok(())
    }

    /// Number of samples accepted so far.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.samples
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.samples == 0
    }

    /// Number of invalid metrics and rejected samples.
    #[must_use]
    pub const fn invalid(&self) -> usize {
        self.invalid
    }

    /// Metric families in name order.
    #[must_use]
    pub fn gather(self) -> Vec<proto::MetricFamily> {
        self.families
            .into_values()
            .flat_map(FamilyBuffer::gather)
            .filter(|family| !family.metric.is_empty())
            .collect()
    }
}

/// Render `families` in the Prometheus text exposition format.
///
/// # Errors
///
/// Returns an error if a family cannot be encoded
pub fn encode_text(families: &[proto::MetricFamily]) -> Result<String, Error> {
    let mut out = String::new();
    TextEncoder::new().encode_utf8(families, &mut out)?;
    Ok(out)
}
