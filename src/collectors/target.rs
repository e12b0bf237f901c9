use super::{
    Metric, MetricSender,
    collector::QueryCollector,
    connection::{DbHandle, PoolLimits, open_connection, ping_db},
    metric_family::{MetricDesc, Sample},
    scraper::ScraperCollector,
};
use crate::{
    config::Config,
    errors::{ContextError, trim_missing_context},
};
use futures::stream::{FuturesUnordered, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use tokio::sync::{OnceCell, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, instrument};
use tracing_futures::Instrument as _;

/// The monitored database: its descriptor, a lazily opened handle and the
/// collectors scraped from it.
#[derive(Debug)]
pub struct Target {
    name: String,
    log_context: String,
    dsn: SecretString,
    limits: PoolLimits,
    handle: OnceCell<DbHandle>,
    up: Arc<MetricDesc>,
    collectors: Vec<QueryCollector>,
}

impl Target {
    /// Build the target described by `config`; `dsn` replaces the configured
    /// data source name when given.
    ///
    /// # Errors
    ///
    /// Returns an error if a collector cannot be built
    pub fn new(config: &Config, dsn: Option<SecretString>) -> Result<Self, ContextError> {
        let name = config.target.name.clone();
        let log_context = trim_missing_context(&format!("target={name}"));

        let collectors = config
            .target_collectors()
            .into_iter()
            .map(|c| QueryCollector::new(&log_context, c, config.global.ignore_missing_values))
            .collect::<Result<Vec<_>, _>>()?;

        let mut up = MetricDesc::gauge(
            "up",
            "1 if the target is reachable, or 0 if the scrape failed",
            &[],
        );
        if !name.is_empty() {
            up.const_labels.insert("target".to_string(), name.clone());
        }

        Ok(Self {
            name,
            log_context,
            dsn: dsn.unwrap_or_else(|| {
                SecretString::from(config.target.data_source_name.expose_secret().to_string())
            }),
            limits: PoolLimits {
                max_connections: config.global.max_connections,
                max_idle_connections: config.global.max_idle_connections,
                max_lifetime: config.global.max_connection_lifetime,
            },
            handle: OnceCell::new(),
            up: Arc::new(up),
            collectors,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn collectors(&self) -> &[QueryCollector] {
        &self.collectors
    }

    /// The database handle, opened on first use. A failed open leaves the
    /// slot empty so the next scrape retries.
    async fn handle(&self, token: &CancellationToken) -> Result<&DbHandle, ContextError> {
        self.handle
            .get_or_try_init(|| open_connection(token, &self.log_context, &self.dsn, self.limits))
            .await
            .map_err(|e| ContextError::new(self.log_context.as_str(), e))
    }

    /// Open the handle if needed and check that the database answers.
    ///
    /// # Errors
    ///
    /// Returns the open or ping failure, or a cancellation
    pub async fn ping(&self, token: &CancellationToken) -> Result<&DbHandle, ContextError> {
        let handle = self.handle(token).await?;
        ping_db(token, handle)
            .await
            .map_err(|e| ContextError::new(self.log_context.as_str(), e))?;
        Ok(handle)
    }

    /// Scrape the target: emit `up`, then run every collector concurrently.
    /// Each collector is timed on its own and fails when it reports any
    /// invalid metric.
    #[instrument(skip_all, level = "info", fields(target = %self.name, otel.kind = "internal"))]
    pub async fn collect(
        &self,
        token: &CancellationToken,
        tx: &MetricSender,
        scraper: &ScraperCollector,
    ) {
        let handle = match self.ping(token).await {
            Ok(handle) => handle,
            Err(e) => {
                let _ = tx.send(Metric::Invalid(e));
                self.send_up(tx, 0.0);
                return;
            }
        };
        self.send_up(tx, 1.0);

        let mut tasks: FuturesUnordered<_> = self
            .collectors
            .iter()
            .map(|collector| {
                let span = info_span!("collector.collect", collector = %collector.name());
                async move {
                    let timer = scraper.start_scrape(collector.name());
                    let (collector_tx, mut collector_rx) = mpsc::unbounded_channel();

                    collector.collect(token, handle, &collector_tx).await;
                    drop(collector_tx);

                    let mut failed = false;
                    while let Some(metric) = collector_rx.recv().await {
                        failed |= matches!(metric, Metric::Invalid(_));
                        let _ = tx.send(metric);
                    }

                    if failed {
                        timer.error();
                    } else {
                        timer.success();
                    }
                }
                .instrument(span)
            })
            .collect();

        while tasks.next().await.is_some() {}

        debug!(log_context = %self.log_context, "Target collection completed");
    }

    fn send_up(&self, tx: &MetricSender, value: f64) {
        let _ = tx.send(Metric::Sample(Sample {
            desc: Arc::clone(&self.up),
            label_values: Vec::new(),
            value,
            timestamp: None,
        }));
    }

    /// Close the handle, if one was ever opened.
    pub async fn close(&self) {
        if let Some(handle) = self.handle.get() {
            handle.close().await;
        }
    }
}
