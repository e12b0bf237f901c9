use super::{
    encode::{ScrapeBuffer, encode_text},
    scraper::ScraperCollector,
    target::Target,
};
use crate::{
    config::{Config, GlobalConfig},
    errors::{ContextError, Error},
};
use prometheus::Registry;
use secrecy::SecretString;
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Everything a scrape needs: the target, its collectors and the exporter's
/// own metrics. Cheap to clone.
#[derive(Clone)]
pub struct CollectorRegistry {
    target: Arc<Target>,
    scraper: ScraperCollector,
    registry: Registry,
    global: GlobalConfig,
}

impl CollectorRegistry {
    /// # Errors
    ///
    /// Returns an error if a collector cannot be built or the self-metrics
    /// cannot be registered
    pub fn new(config: &Config, dsn: Option<SecretString>) -> Result<Self, ContextError> {
        let target = Target::new(config, dsn)?;

        let scraper = ScraperCollector::new();
        let registry = Registry::new();
        scraper
            .register(&registry)
            .map_err(|e| ContextError::new("exporter", Error::Prometheus(e)))?;

        Ok(Self {
            target: Arc::new(target),
            scraper,
            registry,
            global: config.global.clone(),
        })
    }

    #[must_use]
    pub fn target(&self) -> &Target {
        &self.target
    }

    #[must_use]
    pub fn collector_names(&self) -> Vec<&str> {
        self.target.collectors().iter().map(|c| c.name()).collect()
    }

    /// Time budget of a scrape. A timeout announced by Prometheus (seconds)
    /// is shortened by the configured offset and never exceeds the
    /// configured scrape timeout.
    #[must_use]
    pub fn scrape_timeout(&self, announced: Option<f64>) -> Duration {
        let configured = self.global.scrape_timeout;

        let Some(seconds) = announced.filter(|s| s.is_finite() && *s > 0.0) else {
            return configured;
        };

        let announced = Duration::from_secs_f64(seconds);
        let budget = announced
            .checked_sub(self.global.scrape_timeout_offset)
            .filter(|d| !d.is_zero())
            .unwrap_or(announced);

        budget.min(configured)
    }

    /// Scrape the target within `timeout` and render the text exposition,
    /// self-metrics included.
    ///
    /// # Errors
    ///
    /// Returns an error only if the result cannot be encoded
    #[instrument(skip(self), level = "info", err)]
    pub async fn collect_all(&self, timeout: Duration) -> Result<String, Error> {
        let token = CancellationToken::new();
        let deadline = cancel_after(&token, timeout);

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.target.collect(&token, &tx, &self.scraper).await;
        deadline.abort();
        drop(tx);

        let mut buffer = ScrapeBuffer::default();
        while let Some(metric) = rx.recv().await {
            buffer.push(metric);
        }

        debug!(
            samples = buffer.len(),
            invalid = buffer.invalid(),
            cancelled = token.is_cancelled(),
            "Scrape collected"
        );

        self.scraper.increment_scrapes();
        self.scraper.update_metrics_count(buffer.len());

        let mut families = buffer.gather();
        families.extend(self.registry.gather());

        encode_text(&families)
    }

    /// Check that the target's database answers within the scrape timeout.
    ///
    /// # Errors
    ///
    /// Returns the open or ping failure
    pub async fn ping(&self) -> Result<(), ContextError> {
        let token = CancellationToken::new();
        let deadline = cancel_after(&token, self.global.scrape_timeout);

        let result = self.target.ping(&token).await.map(|_| ());
        deadline.abort();
        result
    }

    pub async fn close(&self) {
        self.target.close().await;
    }
}

fn cancel_after(token: &CancellationToken, timeout: Duration) -> JoinHandle<()> {
    let token = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        token.cancel();
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(global: &str) -> CollectorRegistry {
        let config = Config::from_toml(&format!(
            r#"
            [global]
            {global}

            [target]
            data_source_name = "sqlite::memory:"
            collectors = []
            "#
        ))
        .unwrap();
        CollectorRegistry::new(&config, None).unwrap()
    }

    #[test]
    fn test_scrape_timeout_without_header() {
        let r = registry(r#"scrape_timeout = "10s""#);
        assert_eq!(r.scrape_timeout(None), Duration::from_secs(10));
        assert_eq!(r.scrape_timeout(Some(-1.0)), Duration::from_secs(10));
        assert_eq!(r.scrape_timeout(Some(f64::NAN)), Duration::from_secs(10));
    }

    #[test]
    fn test_scrape_timeout_from_header() {
        let r = registry(r#"scrape_timeout = "10s""#);
        assert_eq!(r.scrape_timeout(Some(5.0)), Duration::from_millis(4500));
        assert_eq!(r.scrape_timeout(Some(30.0)), Duration::from_secs(10));
        assert_eq!(r.scrape_timeout(Some(0.25)), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_collect_all_without_collectors() {
        let r = registry("");
        let text = r.collect_all(Duration::from_secs(5)).await.unwrap();

        assert!(text.contains("up 1\n"), "{text}");
        assert!(text.contains("sql_exporter_scrapes_total 1\n"));
        assert!(text.contains("sql_exporter_metrics_total 1\n"));
        r.close().await;
    }

    #[tokio::test]
    async fn test_unreachable_target_is_down() {
        let config = Config::from_toml(
            r#"
            [target]
            name = "broken"
            data_source_name = "sqlite:///nonexistent/dir/db.sqlite?mode=ro"
            "#,
        )
        .unwrap();
        let r = CollectorRegistry::new(&config, None).unwrap();

        let text = r.collect_all(Duration::from_secs(5)).await.unwrap();
        assert!(text.contains("up{target=\"broken\"} 0\n"), "{text}");
        assert!(r.ping().await.is_err());
    }
}
