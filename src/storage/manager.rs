//! Capacity-bounded artifact cache
//!
//! On-disk layout under the cache root:
//! ```text
//! <root>/
//! ├── models/
//! │   ├── <id>.bin     stored artifact, encoded with metadata.compression
//! │   └── <id>.json    StoredRecord (metadata, pin flag, recency, stored size)
//! ├── backups/         pre-update snapshots (see delta module)
//! └── tmp/             staged patches
//! ```

use super::backend::{FileSystemStorage, StorageBackend, TEMP_SUFFIX};
use super::eviction::{EvictionCandidate, plan_eviction};
use crate::codec::{self, CompressionType};
use crate::error::{DeliveryError, DeliveryResult, IntegrityStage};
use crate::models::{LoadResult, LoadSource, ModelMetadata};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

const ARTIFACT_EXT: &str = "bin";
const RECORD_EXT: &str = "json";

/// Capacity limits for the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLimits {
    /// Maximum total stored bytes
    pub max_size: u64,
    /// Maximum number of cached models
    pub max_models: usize,
}

/// Persisted index record for one cached artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub metadata: ModelMetadata,
    #[serde(default)]
    pub pinned: bool,
    pub last_accessed: DateTime<Utc>,
    /// Size of the stored (possibly compressed) artifact on disk
    pub stored_size: u64,
}

/// An artifact in its stored form together with its index state
#[derive(Debug, Clone)]
pub struct StoredModel {
    pub data: Vec<u8>,
    pub metadata: ModelMetadata,
    pub pinned: bool,
}

/// Snapshot of cache usage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageStatistics {
    pub total_size: u64,
    pub max_size: u64,
    pub usage_percentage: f64,
    pub model_count: usize,
    pub max_models: usize,
    pub pinned_count: usize,
    pub free_bytes: u64,
}

/// Persistent, capacity-bounded cache of model artifacts
pub struct StorageManager {
    root: PathBuf,
    limits: CacheLimits,
    backend: Arc<dyn StorageBackend>,
    /// Held for writing across every mutating disk operation, so mutations
    /// of the same entry are linearized
    index: RwLock<HashMap<String, StoredRecord>>,
}

/// Encode a model id into a filesystem-safe file stem
pub(crate) fn file_stem(model_id: &str) -> String {
    let mut stem = String::with_capacity(model_id.len());
    for byte in model_id.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' => stem.push(byte as char),
            _ => stem.push_str(&format!("%{:02X}", byte)),
        }
    }
    stem
}

pub(crate) fn validate_model_id(model_id: &str) -> DeliveryResult<()> {
    if model_id.trim().is_empty() {
        return Err(DeliveryError::InternalFailure(
            "model id cannot be empty".to_string(),
        ));
    }
    Ok(())
}

impl StorageManager {
    /// Open (or create) a cache rooted at `root` with the default filesystem backend
    pub async fn open(root: impl Into<PathBuf>, limits: CacheLimits) -> DeliveryResult<Self> {
        Self::open_with_backend(root, limits, Arc::new(FileSystemStorage::new())).await
    }

    /// Open a cache with a custom storage backend
    ///
    /// Stray temp files are removed and records without a matching artifact
    /// are dropped, so an interrupted write never surfaces as a cache entry.
    pub async fn open_with_backend(
        root: impl Into<PathBuf>,
        limits: CacheLimits,
        backend: Arc<dyn StorageBackend>,
    ) -> DeliveryResult<Self> {
        let manager = Self {
            root: root.into(),
            limits,
            backend,
            index: RwLock::new(HashMap::new()),
        };

        for dir in [manager.models_dir(), manager.backups_dir(), manager.tmp_dir()] {
            manager.backend.create_dir_all(&dir).await?;
        }

        manager.recover_index().await?;
        manager.enforce_limits().await?;

        let stats = manager.statistics().await;
        tracing::info!(
            root = ?manager.root,
            models = stats.model_count,
            total_size = stats.total_size,
            max_size = stats.max_size,
            "Model cache opened"
        );

        Ok(manager)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn limits(&self) -> CacheLimits {
        self.limits
    }

    pub fn models_dir(&self) -> PathBuf {
        self.root.join("models")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub(crate) fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    fn artifact_path(&self, model_id: &str) -> PathBuf {
        self.models_dir()
            .join(format!("{}.{}", file_stem(model_id), ARTIFACT_EXT))
    }

    fn record_path(&self, model_id: &str) -> PathBuf {
        self.models_dir()
            .join(format!("{}.{}", file_stem(model_id), RECORD_EXT))
    }

    async fn recover_index(&self) -> DeliveryResult<()> {
        let files = self.backend.list(&self.models_dir()).await?;
        let mut index = self.index.write().await;

        for path in &files {
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
            if ext == TEMP_SUFFIX {
                tracing::debug!(path = ?path, "Removing interrupted write");
                self.backend.remove(path).await?;
            }
        }

        for path in files
            .iter()
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(RECORD_EXT))
        {
            let record = match self.backend.read(path).await? {
                Some(raw) => serde_json::from_slice::<StoredRecord>(&raw),
                None => continue,
            };

            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(path = ?path, error = %e, "Dropping unreadable cache record");
                    self.backend.remove(path).await?;
                    continue;
                }
            };

            let artifact = self.artifact_path(&record.metadata.id);
            let on_disk = tokio::fs::metadata(&artifact).await.ok().map(|m| m.len());
            if on_disk != Some(record.stored_size) || path != &self.record_path(&record.metadata.id)
            {
                tracing::warn!(
                    model_id = %record.metadata.id,
                    expected_size = record.stored_size,
                    actual_size = ?on_disk,
                    "Dropping cache record without matching artifact"
                );
                self.backend.remove(path).await?;
                self.backend.remove(&artifact).await?;
                continue;
            }

            index.insert(record.metadata.id.clone(), record);
        }

        // Artifacts whose record never made it to disk
        for path in files
            .iter()
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(ARTIFACT_EXT))
        {
            let known = index
                .keys()
                .any(|id| &self.artifact_path(id) == path);
            if !known {
                tracing::debug!(path = ?path, "Removing orphaned artifact");
                self.backend.remove(path).await?;
            }
        }

        Ok(())
    }

    /// Evict until the index fits the configured limits (used after reopening
    /// a cache with tighter limits)
    async fn enforce_limits(&self) -> DeliveryResult<()> {
        let mut index = self.index.write().await;
        let total: u64 = index.values().map(|r| r.stored_size).sum();
        let bytes_to_free = total.saturating_sub(self.limits.max_size);
        let slots_to_free = index.len().saturating_sub(self.limits.max_models);
        if bytes_to_free == 0 && slots_to_free == 0 {
            return Ok(());
        }

        let victims = {
            let candidates = candidates(&index, None);
            match plan_eviction(&candidates, bytes_to_free, slots_to_free) {
                Ok(plan) => plan.victims,
                Err(_) => {
                    tracing::warn!(
                        total_size = total,
                        max_size = self.limits.max_size,
                        "Pinned models exceed cache limits; evicting all unpinned models"
                    );
                    candidates
                        .iter()
                        .filter(|c| !c.pinned)
                        .map(|c| c.id.to_string())
                        .collect()
                }
            }
        };

        for victim in victims {
            self.remove_entry(&mut index, &victim, "limits").await?;
        }
        Ok(())
    }

    async fn remove_entry(
        &self,
        index: &mut HashMap<String, StoredRecord>,
        model_id: &str,
        reason: &'static str,
    ) -> DeliveryResult<bool> {
        // Record first: a crash after this leaves an orphaned artifact, which
        // recovery deletes, never a record pointing at nothing
        self.backend.remove(&self.record_path(model_id)).await?;
        self.backend.remove(&self.artifact_path(model_id)).await?;

        let removed = index.remove(model_id);
        if let Some(record) = &removed {
            tracing::info!(
                model_id = %model_id,
                version = %record.metadata.version,
                freed_bytes = record.stored_size,
                reason = reason,
                "Model removed from cache"
            );
            if reason != "delete" {
                crate::metrics::record_eviction(model_id);
            }
        }
        crate::metrics::update_cache_bytes(index.values().map(|r| r.stored_size).sum());
        Ok(removed.is_some())
    }

    /// Load a cached model, decompressing it and verifying its checksum
    pub async fn load(&self, model_id: &str) -> LoadResult {
        let started = Instant::now();
        let result = match self.load_verified(model_id).await {
            Ok((payload, metadata)) => {
                LoadResult::loaded(model_id, payload, metadata, LoadSource::Cache)
            }
            Err(e) => LoadResult::failed(model_id, e, LoadSource::Cache),
        };
        result.with_elapsed(started.elapsed())
    }

    async fn load_verified(&self, model_id: &str) -> DeliveryResult<(Vec<u8>, ModelMetadata)> {
        let stored = self.load_stored(model_id).await?;
        let payload = codec::decompress(&stored.data, stored.metadata.compression)?;

        if !stored.metadata.matches_payload(&payload) {
            tracing::error!(
                model_id = %model_id,
                version = %stored.metadata.version,
                "Cached artifact failed checksum verification"
            );
            return Err(DeliveryError::integrity(
                model_id,
                IntegrityStage::AtRest,
                "decompressed artifact does not match recorded checksum",
            ));
        }

        self.touch(model_id, &stored.metadata.checksum).await;
        Ok((payload, stored.metadata))
    }

    /// Read the stored (still compressed) artifact and its metadata
    ///
    /// Does not update recency.
    pub async fn load_stored(&self, model_id: &str) -> DeliveryResult<StoredModel> {
        let index = self.index.read().await;
        let record = index
            .get(model_id)
            .cloned()
            .ok_or_else(|| DeliveryError::not_found(model_id))?;

        let data = self
            .backend
            .read(&self.artifact_path(model_id))
            .await?
            .ok_or_else(|| {
                DeliveryError::InternalFailure(format!(
                    "artifact file for '{}' is missing",
                    model_id
                ))
            })?;
        drop(index);

        Ok(StoredModel {
            data,
            metadata: record.metadata,
            pinned: record.pinned,
        })
    }

    async fn touch(&self, model_id: &str, checksum: &str) {
        let mut index = self.index.write().await;
        let Some(record) = index.get_mut(model_id) else {
            return;
        };
        // Entry was replaced while we were reading
        if record.metadata.checksum != checksum {
            return;
        }

        record.last_accessed = Utc::now();
        let record = record.clone();
        if let Err(e) = self.persist_record(&record).await {
            tracing::warn!(model_id = %model_id, error = %e, "Failed to persist access time");
        }
    }

    async fn persist_record(&self, record: &StoredRecord) -> DeliveryResult<()> {
        let raw = serde_json::to_vec_pretty(record)?;
        self.backend
            .write_atomic(&self.record_path(&record.metadata.id), &raw)
            .await?;
        Ok(())
    }

    /// Store an artifact, evicting least recently used unpinned models if needed
    ///
    /// `stored` must be encoded with `metadata.compression`. If enough space
    /// cannot be freed the save fails with `CapacityExceeded` and the cache is
    /// left exactly as it was. Replacing an existing entry keeps its pin flag.
    pub async fn save(
        &self,
        model_id: &str,
        stored: &[u8],
        metadata: ModelMetadata,
    ) -> DeliveryResult<()> {
        self.store(model_id, stored, metadata, None).await
    }

    /// Like `save`, but only while the active entry still carries `expected`
    ///
    /// Fails with `NotFound` for `id@expected.version` when the entry was
    /// replaced or removed in the meantime; the newer entry is left alone.
    pub async fn replace_if(
        &self,
        model_id: &str,
        expected: &ModelMetadata,
        stored: &[u8],
        metadata: ModelMetadata,
    ) -> DeliveryResult<()> {
        self.store(model_id, stored, metadata, Some(expected)).await
    }

    async fn store(
        &self,
        model_id: &str,
        stored: &[u8],
        metadata: ModelMetadata,
        expected: Option<&ModelMetadata>,
    ) -> DeliveryResult<()> {
        validate_model_id(model_id)?;
        if metadata.id != model_id {
            return Err(DeliveryError::InternalFailure(format!(
                "metadata id '{}' does not match '{}'",
                metadata.id, model_id
            )));
        }

        let size = stored.len() as u64;
        let mut index = self.index.write().await;

        let replaced = index.get(model_id);
        if let Some(expected) = expected
            && replaced.map(|r| &r.metadata) != Some(expected)
        {
            tracing::warn!(
                model_id = %model_id,
                expected = %expected.version,
                active = ?replaced.map(|r| r.metadata.version.as_str()),
                "Cache entry changed, refusing to replace it"
            );
            return Err(DeliveryError::not_found(format!(
                "{}@{}",
                model_id, expected.version
            )));
        }
        let replaced_size = replaced.map(|r| r.stored_size).unwrap_or(0);
        let pinned = replaced.map(|r| r.pinned).unwrap_or(false);

        if size > self.limits.max_size {
            return Err(DeliveryError::CapacityExceeded {
                model_id: model_id.to_string(),
                required: size,
                available: self.limits.max_size,
            });
        }

        let total: u64 = index.values().map(|r| r.stored_size).sum();
        let projected = total - replaced_size + size;
        let bytes_to_free = projected.saturating_sub(self.limits.max_size);
        let count_after = index.len() + usize::from(replaced.is_none());
        let slots_to_free = count_after.saturating_sub(self.limits.max_models);

        let plan = {
            let candidates = candidates(&index, Some(model_id));
            plan_eviction(&candidates, bytes_to_free, slots_to_free).map_err(|available| {
                tracing::warn!(
                    model_id = %model_id,
                    required = bytes_to_free,
                    available = available,
                    "Cannot free enough space for model"
                );
                DeliveryError::CapacityExceeded {
                    model_id: model_id.to_string(),
                    required: bytes_to_free,
                    available,
                }
            })?
        };

        let record = StoredRecord {
            metadata,
            pinned,
            last_accessed: Utc::now(),
            stored_size: size,
        };

        // The old artifact is kept in memory until the new record lands, so a
        // failed record write can put it back under its own record
        let artifact_path = self.artifact_path(model_id);
        let previous = if index.contains_key(model_id) {
            self.backend.read(&artifact_path).await?
        } else {
            None
        };

        self.backend.write_atomic(&artifact_path, stored).await?;
        if let Err(e) = self.persist_record(&record).await {
            let restored = match &previous {
                Some(old) => self.backend.write_atomic(&artifact_path, old).await,
                None => self.backend.remove(&artifact_path).await.map(|_| ()),
            };
            if let Err(restore_err) = restored {
                tracing::error!(
                    model_id = %model_id,
                    error = %restore_err,
                    "Failed to restore artifact after record write failed"
                );
            }
            return Err(e);
        }

        for victim in &plan.victims {
            self.remove_entry(&mut index, victim, "capacity").await?;
        }

        tracing::info!(
            model_id = %model_id,
            version = %record.metadata.version,
            stored_size = size,
            evicted = plan.victims.len(),
            "Model saved to cache"
        );

        index.insert(model_id.to_string(), record);
        crate::metrics::update_cache_bytes(index.values().map(|r| r.stored_size).sum());

        Ok(())
    }

    /// Remove a model. Returns false if it was not cached
    pub async fn delete(&self, model_id: &str) -> DeliveryResult<bool> {
        let mut index = self.index.write().await;
        if !index.contains_key(model_id) {
            return Ok(false);
        }
        self.remove_entry(&mut index, model_id, "delete").await
    }

    /// Remove every unpinned model. Returns the number removed
    pub async fn clear(&self) -> DeliveryResult<usize> {
        let mut index = self.index.write().await;
        let victims: Vec<String> = index
            .iter()
            .filter(|(_, r)| !r.pinned)
            .map(|(id, _)| id.clone())
            .collect();

        for victim in &victims {
            self.remove_entry(&mut index, victim, "delete").await?;
        }
        Ok(victims.len())
    }

    /// Set or clear the pin flag on a cached model
    pub async fn set_pinned(&self, model_id: &str, pinned: bool) -> DeliveryResult<()> {
        let mut index = self.index.write().await;
        let record = index
            .get_mut(model_id)
            .ok_or_else(|| DeliveryError::not_found(model_id))?;

        if record.pinned == pinned {
            return Ok(());
        }

        let mut updated = record.clone();
        updated.pinned = pinned;
        self.persist_record(&updated).await?;
        *record = updated;

        tracing::info!(model_id = %model_id, pinned = pinned, "Model pin flag changed");
        Ok(())
    }

    pub async fn pin(&self, model_id: &str) -> DeliveryResult<()> {
        self.set_pinned(model_id, true).await
    }

    pub async fn unpin(&self, model_id: &str) -> DeliveryResult<()> {
        self.set_pinned(model_id, false).await
    }

    pub async fn is_pinned(&self, model_id: &str) -> bool {
        let index = self.index.read().await;
        index.get(model_id).map(|r| r.pinned).unwrap_or(false)
    }

    pub async fn contains(&self, model_id: &str) -> bool {
        self.index.read().await.contains_key(model_id)
    }

    /// Get cached metadata without reading the artifact
    pub async fn metadata(&self, model_id: &str) -> Option<ModelMetadata> {
        let index = self.index.read().await;
        index.get(model_id).map(|r| r.metadata.clone())
    }

    /// List metadata of all cached models, sorted by id
    pub async fn list(&self) -> Vec<ModelMetadata> {
        let index = self.index.read().await;
        let mut models: Vec<_> = index.values().map(|r| r.metadata.clone()).collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }

    pub async fn statistics(&self) -> StorageStatistics {
        let index = self.index.read().await;
        let total_size: u64 = index.values().map(|r| r.stored_size).sum();
        let usage_percentage = if self.limits.max_size == 0 {
            0.0
        } else {
            total_size as f64 / self.limits.max_size as f64 * 100.0
        };

        StorageStatistics {
            total_size,
            max_size: self.limits.max_size,
            usage_percentage,
            model_count: index.len(),
            max_models: self.limits.max_models,
            pinned_count: index.values().filter(|r| r.pinned).count(),
            free_bytes: self.limits.max_size.saturating_sub(total_size),
        }
    }

    /// Decompress bytes with the codec named by `compression`
    pub fn decompress(&self, data: &[u8], compression: CompressionType) -> DeliveryResult<Vec<u8>> {
        codec::decompress(data, compression)
    }

    /// Compress bytes with the codec named by `compression`
    pub fn compress(&self, data: &[u8], compression: CompressionType) -> DeliveryResult<Vec<u8>> {
        codec::compress(data, compression)
    }
}

fn candidates<'a>(
    index: &'a HashMap<String, StoredRecord>,
    exclude: Option<&str>,
) -> Vec<EvictionCandidate<'a>> {
    index
        .iter()
        .filter(|(id, _)| Some(id.as_str()) != exclude)
        .map(|(id, r)| EvictionCandidate {
            id: id.as_str(),
            size: r.stored_size,
            last_accessed: r.last_accessed,
            pinned: r.pinned,
        })
        .collect()
}
