//! Network health monitoring and download strategy selection

use crate::error::{DeliveryError, DeliveryResult};
use crate::transport::FetchTransport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

/// Number of most recent latency samples averaged into `recent_latency`
const RECENT_WINDOW: usize = 10;

/// How a model should be fetched given current network conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStrategy {
    Offline,
    FullDownload,
    DeltaUpdate,
    ProgressiveDownload,
    CachedOnly,
}

impl DownloadStrategy {
    /// Whether this strategy allows network I/O
    pub fn allows_network(self) -> bool {
        !matches!(self, Self::Offline | Self::CachedOnly)
    }
}

impl fmt::Display for DownloadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offline => write!(f, "offline"),
            Self::FullDownload => write!(f, "full_download"),
            Self::DeltaUpdate => write!(f, "delta_update"),
            Self::ProgressiveDownload => write!(f, "progressive_download"),
            Self::CachedOnly => write!(f, "cached_only"),
        }
    }
}

/// Kind of link the transport is using
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Wifi,
    Ethernet,
    Cellular,
    #[default]
    Unknown,
}

impl TransportKind {
    pub fn is_high_bandwidth(self) -> bool {
        matches!(self, Self::Wifi | Self::Ethernet)
    }
}

/// Derived transport quality metrics; recomputed on every sample
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkHealthMetrics {
    pub average_latency: Duration,
    /// Mean of the most recent samples
    pub recent_latency: Duration,
    pub success_rate: f64,
    pub error_rate: f64,
    pub health_score: u8,
    pub sample_count: usize,
    pub last_updated: Option<DateTime<Utc>>,
}

impl Default for NetworkHealthMetrics {
    fn default() -> Self {
        compute_metrics(&VecDeque::new(), &VecDeque::new(), None)
    }
}

/// Monitor tuning
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub window_capacity: usize,
    pub probe_interval: Duration,
    pub probe_url: Option<String>,
    pub download_latency_threshold: Duration,
    pub download_error_rate_threshold: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_capacity: 100,
            probe_interval: Duration::from_secs(30),
            probe_url: None,
            download_latency_threshold: Duration::from_millis(1000),
            download_error_rate_threshold: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Connectivity {
    connected: bool,
    kind: TransportKind,
}

struct Samples {
    latencies: VecDeque<Duration>,
    /// true = success
    outcomes: VecDeque<bool>,
}

/// Score for an average latency
pub fn latency_score(average: Duration) -> u32 {
    match average.as_millis() {
        0..500 => 100,
        500..1000 => 80,
        1000..2000 => 60,
        2000..5000 => 40,
        _ => 20,
    }
}

/// Composite 0-100 score from average latency and success rate
pub fn health_score(average: Duration, success_rate: f64) -> u8 {
    let success_score = success_rate.clamp(0.0, 1.0) * 100.0;
    let score = 0.6 * f64::from(latency_score(average)) + 0.4 * success_score;
    score.round().clamp(0.0, 100.0) as u8
}

fn mean(samples: impl ExactSizeIterator<Item = Duration>) -> Duration {
    let n = samples.len();
    if n == 0 {
        return Duration::ZERO;
    }
    samples.sum::<Duration>() / n as u32
}

fn compute_metrics(
    latencies: &VecDeque<Duration>,
    outcomes: &VecDeque<bool>,
    last_updated: Option<DateTime<Utc>>,
) -> NetworkHealthMetrics {
    let success_rate = if outcomes.is_empty() {
        1.0
    } else {
        outcomes.iter().filter(|ok| **ok).count() as f64 / outcomes.len() as f64
    };
    let average_latency = mean(latencies.iter().copied());
    let recent = latencies.len().saturating_sub(RECENT_WINDOW);
    let recent_latency = mean(latencies.range(recent..).copied());

    NetworkHealthMetrics {
        average_latency,
        recent_latency,
        success_rate,
        error_rate: 1.0 - success_rate,
        health_score: health_score(average_latency, success_rate),
        sample_count: outcomes.len().max(latencies.len()),
        last_updated,
    }
}

/// Tracks recent transport outcomes and recommends a download strategy
///
/// Metrics are process-scoped: they start empty and are never persisted.
pub struct NetworkHealthMonitor {
    config: MonitorConfig,
    transport: Arc<dyn FetchTransport>,
    samples: Mutex<Samples>,
    metrics_tx: watch::Sender<NetworkHealthMetrics>,
    connectivity_tx: watch::Sender<Connectivity>,
    probe_task: StdMutex<Option<JoinHandle<()>>>,
}

impl NetworkHealthMonitor {
    /// Create a monitor. It starts connected over an unknown link
    pub fn new(config: MonitorConfig, transport: Arc<dyn FetchTransport>) -> Self {
        let capacity = config.window_capacity.max(1);
        let (metrics_tx, _) = watch::channel(NetworkHealthMetrics::default());
        let (connectivity_tx, _) = watch::channel(Connectivity {
            connected: true,
            kind: TransportKind::Unknown,
        });

        Self {
            config: MonitorConfig {
                window_capacity: capacity,
                ..config
            },
            transport,
            samples: Mutex::new(Samples {
                latencies: VecDeque::with_capacity(capacity),
                outcomes: VecDeque::with_capacity(capacity),
            }),
            metrics_tx,
            connectivity_tx,
            probe_task: StdMutex::new(None),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Current metrics snapshot
    pub fn metrics(&self) -> NetworkHealthMetrics {
        self.metrics_tx.borrow().clone()
    }

    /// Subscribe to metrics updates
    pub fn subscribe(&self) -> watch::Receiver<NetworkHealthMetrics> {
        self.metrics_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connectivity_tx.borrow().connected
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.connectivity_tx.borrow().kind
    }

    pub fn set_connected(&self, connected: bool) {
        self.connectivity_tx.send_if_modified(|c| {
            let changed = c.connected != connected;
            c.connected = connected;
            changed
        });
        tracing::debug!(connected = connected, "Connectivity changed");
    }

    pub fn set_transport_kind(&self, kind: TransportKind) {
        self.connectivity_tx.send_if_modified(|c| {
            let changed = c.kind != kind;
            c.kind = kind;
            changed
        });
    }

    /// Record a successful request
    pub async fn record_success(&self, latency: Duration) {
        self.record(latency, true).await;
    }

    /// Record a failed request; its latency is still sampled
    pub async fn record_failure(&self, latency: Duration) {
        self.record(latency, false).await;
    }

    /// Record the outcome of one transport call
    ///
    /// Only network failures count against the link; any other error means
    /// the transfer itself worked.
    pub async fn record_outcome<T>(&self, latency: Duration, outcome: &DeliveryResult<T>) {
        match outcome {
            Err(DeliveryError::NetworkFailure(_)) => self.record_failure(latency).await,
            _ => self.record_success(latency).await,
        }
    }

    async fn record(&self, latency: Duration, success: bool) {
        let mut samples = self.samples.lock().await;
        let capacity = self.config.window_capacity;

        samples.latencies.push_back(latency);
        while samples.latencies.len() > capacity {
            samples.latencies.pop_front();
        }
        samples.outcomes.push_back(success);
        while samples.outcomes.len() > capacity {
            samples.outcomes.pop_front();
        }

        let metrics = compute_metrics(&samples.latencies, &samples.outcomes, Some(Utc::now()));
        drop(samples);

        tracing::debug!(
            latency_ms = latency.as_millis() as u64,
            success = success,
            health_score = metrics.health_score,
            "Network sample recorded"
        );
        crate::metrics::update_health_score(metrics.health_score);
        self.metrics_tx.send_replace(metrics);
    }

    /// Drop all samples
    pub async fn reset(&self) {
        let mut samples = self.samples.lock().await;
        samples.latencies.clear();
        samples.outcomes.clear();
        drop(samples);
        self.metrics_tx.send_replace(NetworkHealthMetrics::default());
    }

    /// Pick a download strategy from connectivity and health score
    pub fn recommend_strategy(&self) -> DownloadStrategy {
        let connectivity = *self.connectivity_tx.borrow();
        if !connectivity.connected {
            return DownloadStrategy::Offline;
        }

        let score = self.metrics().health_score;
        if score > 80 && connectivity.kind.is_high_bandwidth() {
            DownloadStrategy::FullDownload
        } else if score > 60 {
            DownloadStrategy::DeltaUpdate
        } else if score > 40 {
            DownloadStrategy::ProgressiveDownload
        } else {
            DownloadStrategy::CachedOnly
        }
    }

    /// Stricter gate used before background downloads
    pub fn is_suitable_for_download(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        let metrics = self.metrics();
        metrics.health_score > 70
            && metrics.average_latency < self.config.download_latency_threshold
            && metrics.error_rate < self.config.download_error_rate_threshold
    }

    /// Issue one reachability probe and record its outcome
    pub async fn probe_once(&self) -> Option<bool> {
        let url = self.config.probe_url.as_deref()?;
        let started = Instant::now();
        let outcome = self.transport.probe(url).await;
        let latency = started.elapsed();

        let ok = match outcome {
            Ok(status) if (200..400).contains(&status) => true,
            Ok(status) => {
                tracing::warn!(url = %url, status = status, "Reachability probe returned error status");
                false
            }
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Reachability probe failed");
                false
            }
        };

        if ok {
            self.record_success(latency).await;
        } else {
            self.record_failure(latency).await;
        }
        Some(ok)
    }

    /// Start the periodic probe task. Returns false if no probe URL is
    /// configured or probing is already running
    ///
    /// Probes are skipped while disconnected. The task only holds a weak
    /// reference, so dropping the monitor ends it.
    pub fn start_probing(self: &Arc<Self>) -> bool {
        if self.config.probe_url.is_none() {
            return false;
        }

        let Ok(mut task) = self.probe_task.lock() else {
            return false;
        };
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return false;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.probe_interval;

        tracing::info!(interval_secs = period.as_secs(), "Network probing started");

        *task = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(monitor) = weak.upgrade() else {
                    break;
                };
                if monitor.is_connected() {
                    monitor.probe_once().await;
                }
            }
        }));
        true
    }

    /// Stop the periodic probe task if running
    pub fn stop_probing(&self) {
        if let Ok(mut task) = self.probe_task.lock()
            && let Some(handle) = task.take()
        {
            handle.abort();
            tracing::info!("Network probing stopped");
        }
    }

    pub fn is_probing(&self) -> bool {
        self.probe_task
            .lock()
            .map(|t| t.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }
}

impl Drop for NetworkHealthMonitor {
    fn drop(&mut self) {
        if let Ok(mut task) = self.probe_task.lock()
            && let Some(handle) = task.take()
        {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DeliveryError, DeliveryResult};
    use crate::transport::FetchResponse;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ProbeTransport {
        status: DeliveryResult<u16>,
        probes: AtomicUsize,
    }

    #[async_trait]
    impl FetchTransport for ProbeTransport {
        async fn fetch(&self, _locator: &str) -> DeliveryResult<FetchResponse> {
            Err(DeliveryError::NetworkFailure("unused".into()))
        }

        async fn probe(&self, _locator: &str) -> DeliveryResult<u16> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.status.clone()
        }
    }

    fn monitor_with(status: DeliveryResult<u16>, probe_url: Option<&str>) -> Arc<NetworkHealthMonitor> {
        let transport = Arc::new(ProbeTransport {
            status,
            probes: AtomicUsize::new(0),
        });
        let config = MonitorConfig {
            probe_url: probe_url.map(str::to_string),
            probe_interval: Duration::from_millis(10),
            ..Default::default()
        };
        Arc::new(NetworkHealthMonitor::new(config, transport))
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_latency_score_steps() {
        assert_eq!(latency_score(ms(0)), 100);
        assert_eq!(latency_score(ms(499)), 100);
        assert_eq!(latency_score(ms(500)), 80);
        assert_eq!(latency_score(ms(999)), 80);
        assert_eq!(latency_score(ms(1999)), 60);
        assert_eq!(latency_score(ms(4999)), 40);
        assert_eq!(latency_score(ms(5000)), 20);
    }

    #[test]
    fn test_health_score_formula() {
        assert_eq!(health_score(ms(100), 1.0), 100);
        assert_eq!(health_score(ms(100), 0.0), 60);
        assert_eq!(health_score(ms(6000), 0.0), 12);
        assert_eq!(health_score(ms(1500), 0.5), 56);
    }

    #[test]
    fn test_empty_window_defaults() {
        let metrics = NetworkHealthMetrics::default();
        assert_eq!(metrics.health_score, 100);
        assert_eq!(metrics.success_rate, 1.0);
        assert_eq!(metrics.sample_count, 0);
        assert!(metrics.last_updated.is_none());
    }

    #[tokio::test]
    async fn test_degraded_network_recommends_progressive() {
        let monitor = monitor_with(Ok(200), None);
        // latency score 40, success rate 21/40 -> 24 + 21 = 45
        for _ in 0..21 {
            monitor.record_success(ms(3000)).await;
        }
        for _ in 0..19 {
            monitor.record_failure(ms(3000)).await;
        }

        assert_eq!(monitor.metrics().health_score, 45);
        assert_eq!(
            monitor.recommend_strategy(),
            DownloadStrategy::ProgressiveDownload
        );
    }

    #[tokio::test]
    async fn test_strategy_table() {
        let monitor = monitor_with(Ok(200), None);
        assert!(monitor.is_connected());

        // Perfect score but unknown link: not high bandwidth
        assert_eq!(monitor.recommend_strategy(), DownloadStrategy::DeltaUpdate);

        monitor.set_transport_kind(TransportKind::Wifi);
        assert_eq!(monitor.recommend_strategy(), DownloadStrategy::FullDownload);

        monitor.set_connected(false);
        assert_eq!(monitor.recommend_strategy(), DownloadStrategy::Offline);
        monitor.set_connected(true);

        for _ in 0..10 {
            monitor.record_failure(ms(8000)).await;
        }
        assert_eq!(monitor.metrics().health_score, 12);
        assert_eq!(monitor.recommend_strategy(), DownloadStrategy::CachedOnly);
    }

    #[tokio::test]
    async fn test_window_is_bounded() {
        let monitor = monitor_with(Ok(200), None);
        for _ in 0..150 {
            monitor.record_failure(ms(10)).await;
        }
        for _ in 0..100 {
            monitor.record_success(ms(10)).await;
        }

        let metrics = monitor.metrics();
        assert_eq!(metrics.sample_count, 100);
        assert_eq!(metrics.success_rate, 1.0);
        assert_eq!(metrics.health_score, 100);
    }

    #[tokio::test]
    async fn test_recent_latency_uses_latest_samples() {
        let monitor = monitor_with(Ok(200), None);
        for _ in 0..20 {
            monitor.record_success(ms(100)).await;
        }
        for _ in 0..10 {
            monitor.record_success(ms(1000)).await;
        }

        let metrics = monitor.metrics();
        assert_eq!(metrics.recent_latency, ms(1000));
        assert_eq!(metrics.average_latency, ms(400));
    }

    #[tokio::test]
    async fn test_suitable_for_download() {
        let monitor = monitor_with(Ok(200), None);
        assert!(monitor.is_suitable_for_download());

        monitor.set_connected(false);
        assert!(!monitor.is_suitable_for_download());
        monitor.set_connected(true);

        // One failure in five: score stays high but error rate is 0.2
        for _ in 0..4 {
            monitor.record_success(ms(50)).await;
        }
        monitor.record_failure(ms(50)).await;
        assert!(monitor.metrics().health_score > 70);
        assert!(!monitor.is_suitable_for_download());

        monitor.reset().await;
        for _ in 0..10 {
            monitor.record_success(ms(1200)).await;
        }
        // Score 76 but above the latency threshold
        assert!(!monitor.is_suitable_for_download());
    }

    #[tokio::test]
    async fn test_probe_once_records_outcome() {
        let monitor = monitor_with(Ok(503), Some("https://probe.example/health"));
        assert_eq!(monitor.probe_once().await, Some(false));
        assert_eq!(monitor.metrics().error_rate, 1.0);

        let monitor = monitor_with(Err(DeliveryError::NetworkFailure("dns".into())), Some("x"));
        assert_eq!(monitor.probe_once().await, Some(false));

        let monitor = monitor_with(Ok(204), None);
        assert_eq!(monitor.probe_once().await, None);
    }

    #[tokio::test]
    async fn test_background_probing_lifecycle() {
        let monitor = monitor_with(Ok(200), Some("https://probe.example/health"));
        let mut rx = monitor.subscribe();

        assert!(monitor.start_probing());
        assert!(!monitor.start_probing());
        assert!(monitor.is_probing());

        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .expect("probe did not record a sample")
            .unwrap();
        assert!(monitor.metrics().sample_count >= 1);

        monitor.stop_probing();
        assert!(!monitor.is_probing());
    }

    #[tokio::test]
    async fn test_no_probe_url_means_no_probing() {
        let monitor = monitor_with(Ok(200), None);
        assert!(!monitor.start_probing());
        assert!(!monitor.is_probing());
    }

    #[tokio::test]
    async fn test_record_outcome_counts_only_network_failures() {
        let monitor = monitor_with(Ok(200), None);

        monitor
            .record_outcome(ms(100), &DeliveryResult::<()>::Ok(()))
            .await;
        monitor
            .record_outcome::<()>(
                ms(100),
                &Err(DeliveryError::integrity("m1", crate::error::IntegrityStage::Patch, "x")),
            )
            .await;
        monitor
            .record_outcome::<()>(ms(100), &Err(DeliveryError::NetworkFailure("reset".into())))
            .await;

        let metrics = monitor.metrics();
        assert_eq!(metrics.sample_count, 3);
        assert!((metrics.success_rate - 2.0 / 3.0).abs() < 1e-9);
    }
}
