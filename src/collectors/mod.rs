use crate::errors::ContextError;
use tokio::sync::mpsc::UnboundedSender;

pub mod collector;
pub mod columns;
pub mod connection;
pub mod encode;
pub mod metric_family;
pub mod pipeline;
pub mod query;
pub mod registry;
pub mod row;
pub mod scraper;
pub mod target;

pub use collector::QueryCollector;
pub use metric_family::{MetricDesc, MetricFamily, Sample};
pub use query::Query;
pub use target::Target;

/// What a collection pass produces: a sample, or an error that did not abort
/// the scrape.
#[derive(Debug)]
pub enum Metric {
    Sample(Sample),
    Invalid(ContextError),
}

/// Every collection pass writes into one of these; the receiving side
/// renders the scrape.
pub type MetricSender = UnboundedSender<Metric>;
