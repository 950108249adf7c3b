//! Common fixtures for orchestrator integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use model_delivery::catalog::StaticCatalog;
use model_delivery::models::sha256_hex;
use model_delivery::{
    CacheLimits, CompressionType, DeliveryResult, DeltaUpdateManager, FetchResponse,
    FetchTransport, HybridOrchestrator, ModelMetadata, ModelUpdate, NetworkHealthMonitor,
    StorageManager, TransportKind,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

/// In-memory transport that counts fetches per locator
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<String, Bytes>>,
    fetches: Mutex<HashMap<String, usize>>,
    delay: Mutex<Duration>,
}

impl MockTransport {
    pub fn serve(&self, locator: &str, body: impl Into<Bytes>) {
        self.routes
            .lock()
            .unwrap()
            .insert(locator.to_string(), body.into());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn fetch_count(&self, locator: &str) -> usize {
        self.fetches
            .lock()
            .unwrap()
            .get(locator)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.fetches.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl FetchTransport for MockTransport {
    async fn fetch(&self, locator: &str) -> DeliveryResult<FetchResponse> {
        *self
            .fetches
            .lock()
            .unwrap()
            .entry(locator.to_string())
            .or_default() += 1;

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let body = self.routes.lock().unwrap().get(locator).cloned();
        Ok(match body {
            Some(body) => FetchResponse::ok(body),
            None => FetchResponse {
                status: 404,
                body: Bytes::new(),
            },
        })
    }

    async fn probe(&self, _locator: &str) -> DeliveryResult<u16> {
        Ok(200)
    }
}

/// Fully wired orchestrator over a scratch cache directory
pub struct Harness {
    pub dir: TempDir,
    pub transport: Arc<MockTransport>,
    pub storage: Arc<StorageManager>,
    pub monitor: Arc<NetworkHealthMonitor>,
    pub delta: Arc<DeltaUpdateManager>,
    pub catalog: Arc<StaticCatalog>,
    pub orchestrator: HybridOrchestrator,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_limits(CacheLimits {
            max_size: 4 * 1024 * 1024,
            max_models: 8,
        })
        .await
    }

    pub async fn with_limits(limits: CacheLimits) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::default());
        let storage = Arc::new(StorageManager::open(dir.path(), limits).await.unwrap());
        let monitor = Arc::new(NetworkHealthMonitor::new(
            Default::default(),
            transport.clone(),
        ));
        monitor.set_transport_kind(TransportKind::Wifi);
        let delta = Arc::new(
            DeltaUpdateManager::new(storage.clone(), transport.clone(), chrono::Duration::days(7))
                .with_monitor(monitor.clone()),
        );
        let catalog = Arc::new(StaticCatalog::new());
        let orchestrator = HybridOrchestrator::new(
            storage.clone(),
            monitor.clone(),
            delta.clone(),
            transport.clone(),
            catalog.clone(),
        );

        Self {
            dir,
            transport,
            storage,
            monitor,
            delta,
            catalog,
            orchestrator,
        }
    }

    /// Put `payload` in the cache as `id@version`
    pub async fn seed(&self, id: &str, version: &str, payload: &[u8]) {
        self.storage
            .save(
                id,
                payload,
                ModelMetadata::for_payload(id, version, CompressionType::None, payload),
            )
            .await
            .unwrap();
    }

    /// Drive the health score down to 45
    pub async fn degrade_network(&self) {
        for _ in 0..21 {
            self.monitor
                .record_success(Duration::from_millis(3000))
                .await;
        }
        for _ in 0..19 {
            self.monitor
                .record_failure(Duration::from_millis(3000))
                .await;
        }
    }

    pub fn artifact_path(&self, id: &str) -> std::path::PathBuf {
        self.dir.path().join("models").join(format!("{}.bin", id))
    }
}

pub fn model_v1() -> Vec<u8> {
    (0..40_000u32).map(|i| (i.wrapping_mul(31) % 251) as u8).collect()
}

pub fn model_v2() -> Vec<u8> {
    let mut data = model_v1();
    data[12_000..12_032].copy_from_slice(&[0xAB; 32]);
    data.extend_from_slice(b"extra output head");
    data
}

/// A later release that no published patch leads to
pub fn model_v3() -> Vec<u8> {
    let mut data = model_v2();
    data[30_000..30_064].copy_from_slice(&[0x5A; 64]);
    data
}

pub fn artifact_url(id: &str, version: &str) -> String {
    format!("https://models.example/{}/{}.bin", id, version)
}

pub fn patch_url(id: &str, version: &str) -> String {
    format!("https://models.example/{}/{}.patch", id, version)
}

/// Update descriptor for `patch` taking `id` from `from` to `to`
pub fn update_for(id: &str, from: &str, to: &str, patch: &[u8], result: &[u8]) -> ModelUpdate {
    ModelUpdate {
        model_id: id.to_string(),
        current_version: from.to_string(),
        target_version: to.to_string(),
        patch_url: patch_url(id, to),
        patch_size: patch.len() as u64,
        original_size: result.len() as u64,
        patch_checksum: sha256_hex(patch),
        result_checksum: sha256_hex(result),
        required: false,
        released_at: chrono::Utc::now(),
    }
}
