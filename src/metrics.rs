//! Prometheus metrics

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Setup Prometheus metrics recorder
/// Returns a handle that can be used to render metrics
pub fn setup_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;

    tracing::info!("Prometheus metrics recorder installed");

    Ok(handle)
}

/// Record a load served from the cache
pub fn record_cache_hit(model_id: &str) {
    metrics::counter!("model_delivery_cache_hits_total",
        "model" => model_id.to_string()
    )
    .increment(1);
}

/// Record a successful network load (full or delta)
pub fn record_download(model_id: &str, source: &str, bytes: u64) {
    metrics::counter!("model_delivery_downloads_total",
        "model" => model_id.to_string(),
        "source" => source.to_string()
    )
    .increment(1);
    metrics::counter!("model_delivery_downloaded_bytes_total",
        "source" => source.to_string()
    )
    .increment(bytes);
}

/// Record a failed load
pub fn record_load_failure(model_id: &str, kind: &str) {
    metrics::counter!("model_delivery_load_failures_total",
        "model" => model_id.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record a model evicted from the cache
pub fn record_eviction(model_id: &str) {
    metrics::counter!("model_delivery_evictions_total",
        "model" => model_id.to_string()
    )
    .increment(1);
}

/// Record a delta update that was rolled back
pub fn record_update_rollback(model_id: &str) {
    metrics::counter!("model_delivery_update_rollbacks_total",
        "model" => model_id.to_string()
    )
    .increment(1);
}

/// Update total cached bytes gauge
pub fn update_cache_bytes(bytes: u64) {
    metrics::gauge!("model_delivery_cache_bytes").set(bytes as f64);
}

/// Update network health score gauge
pub fn update_health_score(score: u8) {
    metrics::gauge!("model_delivery_network_health_score").set(f64::from(score));
}
