use crate::collectors::registry::CollectorRegistry;
use axum::{
    extract::Extension,
    http::{HeaderMap, HeaderValue, StatusCode, header::CONTENT_TYPE},
    response::IntoResponse,
};
use tracing::{debug, error};

/// Header Prometheus uses to announce its scrape timeout, in seconds.
pub const SCRAPE_TIMEOUT_HEADER: &str = "x-prometheus-scrape-timeout-seconds";

fn announced_timeout(headers: &HeaderMap) -> Option<f64> {
    headers
        .get(SCRAPE_TIMEOUT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
}

pub async fn metrics(
    request_headers: HeaderMap,
    Extension(registry): Extension<CollectorRegistry>,
) -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(prometheus::TEXT_FORMAT),
    );

    let timeout = registry.scrape_timeout(announced_timeout(&request_headers));

    match registry.collect_all(timeout).await {
        Ok(metrics) => {
            debug!(timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX), "Successfully collected metrics");
            (StatusCode::OK, headers, metrics)
        }
        Err(e) => {
            error!("Failed to collect metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                headers,
                format!("Error collecting metrics: {e}"),
            )
        }
    }
}
