use prometheus::{CounterVec, GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntGauge, Opts, Registry};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Tracks scrape performance and the number of samples exported.
///
/// # Metrics Exported
///
/// - `sql_exporter_collector_scrape_duration_seconds{collector}` (Histogram)
/// - `sql_exporter_collector_scrape_errors_total{collector}` (Counter)
/// - `sql_exporter_collector_last_scrape_timestamp_seconds{collector}` (Gauge)
/// - `sql_exporter_collector_last_scrape_success{collector}` (Gauge, 1 or 0)
/// - `sql_exporter_metrics_total` (`IntGauge`): samples in the last scrape
/// - `sql_exporter_scrapes_total` (`IntCounter`)
///
/// A collector counts as failed for a scrape when it reported at least one
/// invalid metric.
///
/// ```no_run
/// # use sql_exporter::collectors::scraper::ScraperCollector;
/// let scraper = ScraperCollector::new();
/// let timer = scraper.start_scrape("replication");
/// // ... run the collector ...
/// timer.success();
/// ```
#[derive(Clone, Debug)]
pub struct ScraperCollector {
    scrape_duration_seconds: HistogramVec,
    scrape_errors_total: CounterVec,
    last_scrape_timestamp: GaugeVec,
    last_scrape_success: GaugeVec,

    metrics_total: IntGauge,
    scrapes_total: IntCounter,
}

impl Default for ScraperCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl ScraperCollector {
    /// Creates a new `ScraperCollector`
    ///
    /// # Panics
    ///
    /// Panics if metric creation fails (should never happen with valid metric names)
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        let scrape_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "sql_exporter_collector_scrape_duration_seconds",
                "Time spent scraping each collector in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["collector"],
        )
        .expect("sql_exporter_collector_scrape_duration_seconds");

        let scrape_errors_total = CounterVec::new(
            Opts::new(
                "sql_exporter_collector_scrape_errors_total",
                "Total number of scrapes per collector that reported errors",
            ),
            &["collector"],
        )
        .expect("sql_exporter_collector_scrape_errors_total");

        let last_scrape_timestamp = GaugeVec::new(
            Opts::new(
                "sql_exporter_collector_last_scrape_timestamp_seconds",
                "Unix timestamp of the last scrape attempt per collector",
            ),
            &["collector"],
        )
        .expect("sql_exporter_collector_last_scrape_timestamp_seconds");

        let last_scrape_success = GaugeVec::new(
            Opts::new(
                "sql_exporter_collector_last_scrape_success",
                "Whether the last scrape was successful (1=success, 0=failure)",
            ),
            &["collector"],
        )
        .expect("sql_exporter_collector_last_scrape_success");

        let metrics_total = IntGauge::with_opts(Opts::new(
            "sql_exporter_metrics_total",
            "Number of samples exported by the last scrape",
        ))
        .expect("sql_exporter_metrics_total");

        let scrapes_total = IntCounter::with_opts(Opts::new(
            "sql_exporter_scrapes_total",
            "Total number of scrapes performed since start",
        ))
        .expect("sql_exporter_scrapes_total");

        Self {
            scrape_duration_seconds,
            scrape_errors_total,
            last_scrape_timestamp,
            last_scrape_success,
            metrics_total,
            scrapes_total,
        }
    }

    /// Record the start of a collector scrape
    #[must_use]
    pub fn start_scrape(&self, collector_name: &str) -> ScrapeTimer {
        ScrapeTimer {
            collector_name: collector_name.to_string(),
            start: Instant::now(),
            scraper: self.clone(),
            recorded: false,
        }
    }

    pub fn update_metrics_count(&self, count: usize) {
        self.metrics_total
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    pub fn increment_scrapes(&self) {
        self.scrapes_total.inc();
    }

    fn record(&self, collector_name: &str, duration: f64, success: bool) {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();

        self.scrape_duration_seconds
            .with_label_values(&[collector_name])
            .observe(duration);

        self.last_scrape_timestamp
            .with_label_values(&[collector_name])
            .set(timestamp);

        self.last_scrape_success
            .with_label_values(&[collector_name])
            .set(if success { 1.0 } else { 0.0 });

        if !success {
            self.scrape_errors_total
                .with_label_values(&[collector_name])
                .inc();
        }
    }

    /// Register all metrics with the registry
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register
    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.scrape_duration_seconds.clone()))?;
        registry.register(Box::new(self.scrape_errors_total.clone()))?;
        registry.register(Box::new(self.last_scrape_timestamp.clone()))?;
        registry.register(Box::new(self.last_scrape_success.clone()))?;
        registry.register(Box::new(self.metrics_total.clone()))?;
        registry.register(Box::new(self.scrapes_total.clone()))?;
        Ok(())
    }
}

/// RAII timer for recording scrape duration
///
/// Records success on drop unless [`ScrapeTimer::error`] was called.
pub struct ScrapeTimer {
    collector_name: String,
    start: Instant,
    scraper: ScraperCollector,
    recorded: bool,
}

impl ScrapeTimer {
    pub fn success(mut self) {
        self.finish(true);
    }

    pub fn error(mut self) {
        self.finish(false);
    }

    fn finish(&mut self, success: bool) {
        if self.recorded {
            return;
        }
        self.recorded = true;
        let duration = self.start.elapsed().as_secs_f64();
        self.scraper.record(&self.collector_name, duration, success);
    }
}

impl Drop for ScrapeTimer {
    fn drop(&mut self) {
        self.finish(true);
    }
}
