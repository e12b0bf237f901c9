use super::{MetricSender, connection::DbHandle, metric_family::MetricFamily, query::Query};
use crate::{
    config::{CollectorConfig, QueryConfig},
    errors::{ContextError, Error, trim_missing_context},
};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info_span, instrument};
use tracing_futures::Instrument as _;

/// A named group of queries, scraped together and timed as one unit.
#[derive(Debug)]
pub struct QueryCollector {
    name: String,
    queries: Vec<Query>,
}

impl QueryCollector {
    /// Build the queries of `config`. Metrics sharing a `query_ref` share one
    /// [`Query`]; an inline query becomes a query of its own, named after the
    /// metric.
    ///
    /// # Errors
    ///
    /// Returns an error on an unresolved `query_ref` or a column role conflict
    pub fn new(
        log_context: &str,
        config: &CollectorConfig,
        ignore_missing_values: bool,
    ) -> Result<Self, ContextError> {
        let log_context = trim_missing_context(&format!("{log_context},collector={}", config.name));

        let mut grouped: Vec<(Option<&str>, QueryConfig, Vec<MetricFamily>)> = Vec::new();

        for metric in &config.metrics {
            let family = MetricFamily::new(&log_context, metric.clone());

            if let Some(reference) = metric.query_ref.as_deref() {
                if let Some((_, _, families)) = grouped
                    .iter_mut()
                    .find(|(r, _, _)| *r == Some(reference))
                {
                    families.push(family);
                    continue;
                }

                let query = config
                    .queries
                    .iter()
                    .find(|q| q.name == reference)
                    .cloned()
                    .ok_or_else(|| {
                        ContextError::new(
                            log_context.as_str(),
                            Error::Config(format!(
                                "metric {:?} references undefined query {reference:?}",
                                metric.metric_name
                            )),
                        )
                    })?;
                grouped.push((Some(reference), query, vec![family]));
            } else if let Some(sql) = &metric.query {
                let query = QueryConfig {
                    name: metric.metric_name.clone(),
                    query: sql.clone(),
                    no_prepared_statement: metric.no_prepared_statement,
                };
                grouped.push((None, query, vec![family]));
            } else {
                return Err(ContextError::new(
                    log_context.as_str(),
                    Error::Config(format!("metric {:?} has no query", metric.metric_name)),
                ));
            }
        }

        let queries = grouped
            .into_iter()
            .map(|(_, query, families)| {
                Query::new(&log_context, query, families, ignore_missing_values)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name: config.name.clone(),
            queries,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn queries(&self) -> &[Query] {
        &self.queries
    }

    /// Run every query concurrently against `handle`.
    #[instrument(skip_all, level = "info", fields(collector = %self.name, otel.kind = "internal"))]
    pub async fn collect(&self, token: &CancellationToken, handle: &DbHandle, tx: &MetricSender) {
        let mut tasks = FuturesUnordered::new();

        for query in &self.queries {
            let span = info_span!("query.collect", query = %query.name(), otel.kind = "internal");
            tasks.push(query.collect(token, handle, tx).instrument(span));
        }

        while tasks.next().await.is_some() {}
    }
}
