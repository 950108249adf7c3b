//! Hybrid orchestrator: the public entry point for loading models
//!
//! Chooses between the cache, a full download and a delta update, and
//! coalesces concurrent loads of the same model into one operation.

use crate::catalog::UpdateCatalog;
use crate::codec::{self, CompressionType};
use crate::delta::DeltaUpdateManager;
use crate::error::{DeliveryError, DeliveryResult, IntegrityStage};
use crate::health::{DownloadStrategy, NetworkHealthMetrics, NetworkHealthMonitor};
use crate::models::{
    LoadResult, LoadSource, ModelMetadata, ModelUpdate, checksums_match, is_valid_checksum,
    sha256_hex,
};
use crate::storage::{StorageManager, StorageStatistics};
use crate::transport::{FetchTransport, fetch_body};
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, broadcast, watch};

/// Parameters of a single load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub model_id: String,
    /// Locator of the full artifact
    pub source: String,
    pub expected_version: String,
    /// Codec the fetched artifact is encoded with
    pub expected_compression: CompressionType,
    /// SHA-256 of the decompressed artifact. Empty accepts whatever is fetched
    pub expected_checksum: String,
    /// Skip the cache and go to the network
    pub force_download: bool,
}

impl LoadRequest {
    pub fn new(
        model_id: impl Into<String>,
        source: impl Into<String>,
        expected_version: impl Into<String>,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            source: source.into(),
            expected_version: expected_version.into(),
            expected_compression: CompressionType::None,
            expected_checksum: String::new(),
            force_download: false,
        }
    }

    pub fn with_compression(mut self, compression: CompressionType) -> Self {
        self.expected_compression = compression;
        self
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.expected_checksum = checksum.into();
        self
    }

    pub fn force_download(mut self, force: bool) -> Self {
        self.force_download = force;
        self
    }
}

/// Lifecycle state of the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", content = "error", rename_all = "snake_case")]
pub enum ManagerState {
    #[default]
    Idle,
    Loading,
    /// The most recent load failed
    Error(DeliveryError),
}

/// Events emitted by the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryEvent {
    LoadStarted { model_id: String },
    LoadCompleted { model_id: String, source: LoadSource },
    LoadFailed { model_id: String, error: DeliveryError },
    UpdateApplied { model_id: String, version: String },
    StateChanged(ManagerState),
}

/// Availability of one model
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ModelStatus {
    NotCached,
    Cached { version: String, pinned: bool },
    Loading,
}

/// Outcome of a background update attempt
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// No applicable update is published
    UpToDate,
    /// The network is not good enough for a background download right now
    Deferred,
    Applied(ModelMetadata),
}

/// Aggregate status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub state: ManagerState,
    pub in_flight: Vec<String>,
    pub strategy: DownloadStrategy,
    pub storage: StorageStatistics,
    pub network: NetworkHealthMetrics,
}

type SharedLoad = Shared<BoxFuture<'static, LoadResult>>;

struct Inner {
    storage: Arc<StorageManager>,
    monitor: Arc<NetworkHealthMonitor>,
    delta: Arc<DeltaUpdateManager>,
    transport: Arc<dyn FetchTransport>,
    catalog: Arc<dyn UpdateCatalog>,
    in_flight: DashMap<String, SharedLoad>,
    /// Serializes loads and background updates of one model
    model_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Running loads; only changed while the state channel is locked
    active_loads: AtomicUsize,
    state_tx: watch::Sender<ManagerState>,
    event_tx: broadcast::Sender<DeliveryEvent>,
}

/// Entry point for loading models
///
/// Cheap to clone; clones share the same in-flight table.
#[derive(Clone)]
pub struct HybridOrchestrator {
    inner: Arc<Inner>,
}

impl HybridOrchestrator {
    pub fn new(
        storage: Arc<StorageManager>,
        monitor: Arc<NetworkHealthMonitor>,
        delta: Arc<DeltaUpdateManager>,
        transport: Arc<dyn FetchTransport>,
        catalog: Arc<dyn UpdateCatalog>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ManagerState::Idle);
        let (event_tx, _) = broadcast::channel(100);

        Self {
            inner: Arc::new(Inner {
                storage,
                monitor,
                delta,
                transport,
                catalog,
                in_flight: DashMap::new(),
                model_locks: DashMap::new(),
                active_loads: AtomicUsize::new(0),
                state_tx,
                event_tx,
            }),
        }
    }

    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.inner.storage
    }

    pub fn monitor(&self) -> &Arc<NetworkHealthMonitor> {
        &self.inner.monitor
    }

    pub fn delta(&self) -> &Arc<DeltaUpdateManager> {
        &self.inner.delta
    }

    /// Current lifecycle state
    pub fn state(&self) -> ManagerState {
        self.inner.state_tx.borrow().clone()
    }

    /// Subscribe to lifecycle state changes
    pub fn watch_state(&self) -> watch::Receiver<ManagerState> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribe to delivery events
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Load a model, coalescing with any load of the same id already running
    ///
    /// The work runs on a spawned task: dropping the returned future (for
    /// example on a caller timeout) does not cancel it, and the cache is
    /// still updated when it finishes.
    pub async fn load_model(&self, request: LoadRequest) -> LoadResult {
        let load = match self.inner.in_flight.entry(request.model_id.clone()) {
            Entry::Occupied(entry) => {
                tracing::debug!(model_id = %request.model_id, "Joining in-flight load");
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                let load = self.spawn_load(request);
                entry.insert(load.clone());
                load
            }
        };

        load.await
    }

    fn spawn_load(&self, request: LoadRequest) -> SharedLoad {
        let inner = self.inner.clone();
        let model_id = request.model_id.clone();

        inner.begin_load();
        inner.emit(DeliveryEvent::LoadStarted {
            model_id: model_id.clone(),
        });

        let handle = tokio::spawn(async move {
            let result = {
                let lock = inner.model_lock(&request.model_id);
                let _held = lock.lock().await;
                inner.run_load(&request).await
            };
            inner.in_flight.remove(&request.model_id);
            inner.finish_load(&result);
            result
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => LoadResult::failed(
                    model_id,
                    DeliveryError::InternalFailure(format!("load task failed: {}", e)),
                    LoadSource::NetworkFull,
                ),
            }
        }
        .boxed()
        .shared()
    }

    /// Bytes of a cached model
    pub async fn get_model_bytes(&self, model_id: &str) -> DeliveryResult<Bytes> {
        let (data, _) = self.inner.storage.load(model_id).await.into_result()?;
        Ok(data)
    }

    pub async fn model_status(&self, model_id: &str) -> ModelStatus {
        if self.inner.in_flight.contains_key(model_id) {
            return ModelStatus::Loading;
        }
        match self.inner.storage.metadata(model_id).await {
            Some(metadata) => ModelStatus::Cached {
                version: metadata.version,
                pinned: self.inner.storage.is_pinned(model_id).await,
            },
            None => ModelStatus::NotCached,
        }
    }

    pub async fn status(&self) -> OrchestratorStatus {
        let mut in_flight: Vec<String> = self
            .inner
            .in_flight
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        in_flight.sort();

        OrchestratorStatus {
            state: self.state(),
            in_flight,
            strategy: self.inner.monitor.recommend_strategy(),
            storage: self.inner.storage.statistics().await,
            network: self.inner.monitor.metrics(),
        }
    }

    /// Valid updates that apply to the cached version, best candidate first
    ///
    /// Required updates come first, then newer releases.
    pub async fn check_for_updates(&self, model_id: &str) -> DeliveryResult<Vec<ModelUpdate>> {
        let cached = self
            .inner
            .storage
            .metadata(model_id)
            .await
            .ok_or_else(|| DeliveryError::not_found(model_id))?;

        let mut updates: Vec<ModelUpdate> = self
            .inner
            .catalog
            .updates_for(model_id)
            .await?
            .into_iter()
            .filter(|update| match update.validate() {
                Ok(()) => update.current_version == cached.version,
                Err(e) => {
                    tracing::warn!(model_id = %model_id, error = %e, "Ignoring invalid update");
                    false
                }
            })
            .collect();

        updates.sort_by(|a, b| {
            b.required
                .cmp(&a.required)
                .then_with(|| b.released_at.cmp(&a.released_at))
        });
        Ok(updates)
    }

    /// Apply the best available update in the background
    ///
    /// Deferred unless the network passes the stricter download gate. Waits
    /// for any running load of the same model, and loads started meanwhile
    /// wait for the update.
    pub async fn apply_available_update(&self, model_id: &str) -> DeliveryResult<UpdateOutcome> {
        if !self.inner.monitor.is_suitable_for_download() {
            tracing::info!(model_id = %model_id, "Network not suitable, deferring update");
            return Ok(UpdateOutcome::Deferred);
        }

        let lock = self.inner.model_lock(model_id);
        let _held = lock.lock().await;

        let Some(update) = self.check_for_updates(model_id).await?.into_iter().next() else {
            return Ok(UpdateOutcome::UpToDate);
        };

        let metadata = self.inner.apply_delta(&update).await?;
        Ok(UpdateOutcome::Applied(metadata))
    }

    /// Stop background probing and wait for in-flight loads to settle
    pub async fn shutdown(&self) {
        self.inner.monitor.stop_probing();

        let pending: Vec<SharedLoad> = self
            .inner
            .in_flight
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "Waiting for in-flight loads");
            futures::future::join_all(pending).await;
        }

        tracing::info!("Orchestrator shut down");
    }
}

impl Inner {
    fn emit(&self, event: DeliveryEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    fn model_lock(&self, model_id: &str) -> Arc<Mutex<()>> {
        self.model_locks
            .entry(model_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn begin_load(&self) {
        let changed = self.state_tx.send_if_modified(|current| {
            self.active_loads.fetch_add(1, Ordering::SeqCst);
            if *current == ManagerState::Loading {
                return false;
            }
            *current = ManagerState::Loading;
            true
        });
        if changed {
            self.emit(DeliveryEvent::StateChanged(ManagerState::Loading));
        }
    }

    /// Leave `Loading` for `state` once the last running load finishes
    fn end_load(&self, state: ManagerState) {
        let changed = self.state_tx.send_if_modified(|current| {
            let running = self
                .active_loads
                .fetch_sub(1, Ordering::SeqCst)
                .saturating_sub(1);
            if running > 0 || *current == state {
                return false;
            }
            *current = state.clone();
            true
        });
        if changed {
            self.emit(DeliveryEvent::StateChanged(state));
        }
    }

    fn finish_load(&self, result: &LoadResult) {
        let model_id = result.model_id().to_string();

        match result.error() {
            None => {
                self.emit(DeliveryEvent::LoadCompleted {
                    model_id,
                    source: result.source(),
                });
                self.end_load(ManagerState::Idle);
            }
            Some(error) => {
                crate::metrics::record_load_failure(&model_id, error.kind());
                self.emit(DeliveryEvent::LoadFailed {
                    model_id,
                    error: error.clone(),
                });
                self.end_load(ManagerState::Error(error.clone()));
            }
        }
    }

    async fn run_load(&self, request: &LoadRequest) -> LoadResult {
        let started = Instant::now();
        let result = match self.resolve(request).await {
            Ok(result) => result,
            Err((error, source)) => {
                tracing::warn!(
                    model_id = %request.model_id,
                    version = %request.expected_version,
                    error = %error,
                    "Model load failed"
                );
                LoadResult::failed(&request.model_id, error, source)
            }
        };

        let result = result.with_elapsed(started.elapsed());
        if result.is_success() {
            tracing::info!(
                model_id = %request.model_id,
                source = %result.source(),
                elapsed_ms = result.elapsed().as_millis() as u64,
                "Model loaded"
            );
        }
        result
    }

    async fn resolve(
        &self,
        request: &LoadRequest,
    ) -> Result<LoadResult, (DeliveryError, LoadSource)> {
        if !request.expected_checksum.is_empty() && !is_valid_checksum(&request.expected_checksum)
        {
            return Err((
                DeliveryError::InternalFailure(format!(
                    "malformed expected checksum '{}'",
                    request.expected_checksum
                )),
                LoadSource::Cache,
            ));
        }

        let cached = self.storage.metadata(&request.model_id).await;
        let has_expected_version = cached
            .as_ref()
            .is_some_and(|m| m.version == request.expected_version);

        if has_expected_version
            && !request.force_download
            && let Some(hit) = self.load_cached(&request.model_id).await
        {
            return Ok(hit);
        }

        let strategy = self.monitor.recommend_strategy();
        tracing::debug!(
            model_id = %request.model_id,
            strategy = %strategy,
            "Selected download strategy"
        );

        match strategy {
            DownloadStrategy::Offline | DownloadStrategy::CachedOnly => {
                // A forced refresh still falls back to the matching cache entry
                if has_expected_version && let Some(hit) = self.load_cached(&request.model_id).await
                {
                    return Ok(hit);
                }
                tracing::warn!(
                    model_id = %request.model_id,
                    strategy = %strategy,
                    "Network unavailable and no usable cache entry"
                );
                Err((
                    DeliveryError::not_found(format!(
                        "{}@{}",
                        request.model_id, request.expected_version
                    )),
                    LoadSource::Cache,
                ))
            }
            DownloadStrategy::DeltaUpdate => {
                match self.try_delta(request, cached.as_ref()).await {
                    Some(Ok(result)) => Ok(result),
                    Some(Err(error)) if !matches!(error, DeliveryError::NetworkFailure(_)) => {
                        Err((error, LoadSource::NetworkDelta))
                    }
                    Some(Err(error)) => {
                        tracing::warn!(
                            model_id = %request.model_id,
                            error = %error,
                            "Delta update failed, falling back to full download"
                        );
                        self.full_download(request, cached.as_ref()).await
                    }
                    None => self.full_download(request, cached.as_ref()).await,
                }
            }
            DownloadStrategy::FullDownload | DownloadStrategy::ProgressiveDownload => {
                self.full_download(request, cached.as_ref()).await
            }
        }
    }

    async fn load_cached(&self, model_id: &str) -> Option<LoadResult> {
        let result = self.storage.load(model_id).await;
        if result.is_success() {
            crate::metrics::record_cache_hit(model_id);
            return Some(result);
        }
        if let Some(error) = result.error() {
            tracing::warn!(model_id = %model_id, error = %error, "Cache entry unusable");
        }
        None
    }

    /// `None` when no published update leads from the cached version to the expected one
    async fn try_delta(
        &self,
        request: &LoadRequest,
        cached: Option<&ModelMetadata>,
    ) -> Option<DeliveryResult<LoadResult>> {
        let cached = cached?;
        let updates = match self.catalog.updates_for(&request.model_id).await {
            Ok(updates) => updates,
            Err(e) => {
                tracing::warn!(model_id = %request.model_id, error = %e, "Update catalog unavailable");
                return None;
            }
        };

        // Only patches that produce the requested build
        let update = updates.into_iter().find(|u| {
            u.applies_to(&cached.version, &request.expected_version)
                && u.validate().is_ok()
                && (request.expected_checksum.is_empty()
                    || checksums_match(&request.expected_checksum, &u.result_checksum))
        })?;

        Some(self.delta_load(request, &update).await)
    }

    async fn delta_load(
        &self,
        request: &LoadRequest,
        update: &ModelUpdate,
    ) -> DeliveryResult<LoadResult> {
        self.apply_delta(update).await?;

        let (data, metadata) = self.storage.load(&request.model_id).await.into_result()?;
        crate::metrics::record_download(&request.model_id, "network_delta", update.patch_size);
        Ok(LoadResult::loaded(
            &request.model_id,
            data,
            metadata,
            LoadSource::NetworkDelta,
        ))
    }

    async fn apply_delta(&self, update: &ModelUpdate) -> DeliveryResult<ModelMetadata> {
        let metadata = self.delta.apply_update(update).await?;
        self.emit(DeliveryEvent::UpdateApplied {
            model_id: update.model_id.clone(),
            version: metadata.version.clone(),
        });
        Ok(metadata)
    }

    async fn full_download(
        &self,
        request: &LoadRequest,
        cached: Option<&ModelMetadata>,
    ) -> Result<LoadResult, (DeliveryError, LoadSource)> {
        self.fetch_and_store(request, cached)
            .await
            .map_err(|e| (e, LoadSource::NetworkFull))
    }

    async fn fetch_and_store(
        &self,
        request: &LoadRequest,
        cached: Option<&ModelMetadata>,
    ) -> DeliveryResult<LoadResult> {
        let model_id = &request.model_id;

        let started = Instant::now();
        let fetched = fetch_body(self.transport.as_ref(), &request.source).await;
        self.monitor.record_outcome(started.elapsed(), &fetched).await;
        let body = fetched?;

        let payload = codec::decompress(&body, request.expected_compression).map_err(|e| {
            DeliveryError::integrity(model_id, IntegrityStage::Download, e.to_string())
        })?;

        let actual = sha256_hex(&payload);
        if request.expected_checksum.is_empty() {
            tracing::warn!(model_id = %model_id, "No expected checksum, accepting fetched artifact");
        } else if !checksums_match(&request.expected_checksum, &actual) {
            tracing::error!(
                model_id = %model_id,
                expected = %request.expected_checksum,
                actual = %actual,
                "Downloaded artifact checksum mismatch"
            );
            return Err(DeliveryError::integrity(
                model_id,
                IntegrityStage::Download,
                format!("expected {}, got {}", request.expected_checksum, actual),
            ));
        }

        let metadata = match cached {
            Some(previous) => ModelMetadata {
                compression: request.expected_compression,
                ..previous.next_version(&request.expected_version, &payload)
            },
            None => ModelMetadata::for_payload(
                model_id,
                &request.expected_version,
                request.expected_compression,
                &payload,
            ),
        };

        self.storage.save(model_id, &body, metadata.clone()).await?;
        crate::metrics::record_download(model_id, "network_full", body.len() as u64);

        Ok(LoadResult::loaded(
            model_id,
            payload,
            metadata,
            LoadSource::NetworkFull,
        ))
    }
}
