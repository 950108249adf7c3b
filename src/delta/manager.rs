//! Delta update pipeline with backup, verification and rollback

use super::patch;
use crate::error::{DeliveryError, DeliveryResult, IntegrityStage};
use crate::health::NetworkHealthMonitor;
use crate::models::{ModelMetadata, ModelUpdate, checksums_match, sha256_hex};
use crate::storage::manager::file_stem;
use crate::storage::{StorageBackend, StorageManager};
use crate::transport::{FetchTransport, fetch_body};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, broadcast};

/// Default number of days a pre-update backup is kept
pub const DEFAULT_BACKUP_RETENTION_DAYS: i64 = 7;

/// Stage of an update for one model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    #[default]
    Idle,
    BackingUp,
    Downloading,
    VerifyingPatch,
    Applying,
    VerifyingResult,
    Committed,
    RolledBack,
}

impl UpdateState {
    /// Progress percentage reported when a stage completes
    ///
    /// Result verification belongs to the apply step and shares its percentage.
    pub fn percent(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::BackingUp => 20,
            Self::Downloading => 40,
            Self::VerifyingPatch => 60,
            Self::Applying | Self::VerifyingResult => 80,
            Self::Committed => 100,
            Self::RolledBack => 0,
        }
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::BackingUp => "backing_up",
            Self::Downloading => "downloading",
            Self::VerifyingPatch => "verifying_patch",
            Self::Applying => "applying",
            Self::VerifyingResult => "verifying_result",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
        };
        f.write_str(name)
    }
}

/// Discrete progress notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateProgress {
    pub model_id: String,
    pub target_version: String,
    pub state: UpdateState,
    pub percent: u8,
}

/// Persisted description of a backup snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub metadata: ModelMetadata,
    pub created_at: DateTime<Utc>,
    pub stored_size: u64,
}

/// A backup snapshot on disk
#[derive(Debug, Clone, PartialEq)]
pub struct BackupInfo {
    pub record: BackupRecord,
    pub artifact_path: PathBuf,
    pub record_path: PathBuf,
}

struct Backup {
    data: Vec<u8>,
    metadata: ModelMetadata,
}

/// Applies binary patches to cached models
pub struct DeltaUpdateManager {
    storage: Arc<StorageManager>,
    transport: Arc<dyn FetchTransport>,
    /// Receives a sample for every patch fetch
    monitor: Option<Arc<NetworkHealthMonitor>>,
    retention: chrono::Duration,
    states: DashMap<String, UpdateState>,
    /// Per-model guard so two updates of one model never interleave
    guards: DashMap<String, Arc<Mutex<()>>>,
    progress_tx: broadcast::Sender<UpdateProgress>,
}

impl DeltaUpdateManager {
    pub fn new(
        storage: Arc<StorageManager>,
        transport: Arc<dyn FetchTransport>,
        retention: chrono::Duration,
    ) -> Self {
        let (progress_tx, _) = broadcast::channel(64);
        Self {
            storage,
            transport,
            monitor: None,
            retention,
            states: DashMap::new(),
            guards: DashMap::new(),
            progress_tx,
        }
    }

    /// Feed patch fetch outcomes into `monitor`
    pub fn with_monitor(mut self, monitor: Arc<NetworkHealthMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Compute a patch from `base` to `target` in the format `apply_update` consumes
    pub fn create_patch(base: &[u8], target: &[u8]) -> Vec<u8> {
        patch::diff(base, target)
    }

    /// Subscribe to progress notifications
    pub fn subscribe(&self) -> broadcast::Receiver<UpdateProgress> {
        self.progress_tx.subscribe()
    }

    /// Current update state of a model
    pub fn state(&self, model_id: &str) -> UpdateState {
        self.states
            .get(model_id)
            .map(|s| *s)
            .unwrap_or_default()
    }

    fn set_state(&self, update: &ModelUpdate, state: UpdateState) {
        let previous = self.states.insert(update.model_id.clone(), state);
        if previous.map(UpdateState::percent) == Some(state.percent()) {
            return;
        }
        // No receivers is fine
        let _ = self.progress_tx.send(UpdateProgress {
            model_id: update.model_id.clone(),
            target_version: update.target_version.clone(),
            state,
            percent: state.percent(),
        });
    }

    fn backend(&self) -> &Arc<dyn StorageBackend> {
        self.storage.backend()
    }

    fn staged_patch_path(&self, model_id: &str) -> PathBuf {
        self.storage
            .tmp_dir()
            .join(format!("{}.patch", file_stem(model_id)))
    }

    /// Apply `update` to the cached model
    ///
    /// The active artifact is only replaced after the patched candidate
    /// matches `update.result_checksum`, and only if it is still the entry
    /// that was backed up. Any failure after the backup leaves the
    /// pre-update artifact (or whatever replaced it meanwhile) active.
    pub async fn apply_update(&self, update: &ModelUpdate) -> DeliveryResult<ModelMetadata> {
        update.validate()?;

        let guard = self
            .guards
            .entry(update.model_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _lock = guard.lock().await;

        tracing::info!(
            model_id = %update.model_id,
            from = %update.current_version,
            to = %update.target_version,
            patch_size = update.patch_size,
            savings_pct = format!("{:.1}", update.savings_percentage()),
            "Starting delta update"
        );

        self.set_state(update, UpdateState::BackingUp);
        let backup = match self.backup(update).await {
            Ok(backup) => backup,
            Err(e) => return Err(self.abort(update, e).await),
        };

        self.set_state(update, UpdateState::Downloading);
        let patch_bytes = match self.download_patch(update).await {
            Ok(bytes) => bytes,
            Err(e) => return Err(self.abort(update, e).await),
        };

        self.set_state(update, UpdateState::VerifyingPatch);
        let actual = sha256_hex(&patch_bytes);
        if !checksums_match(&update.patch_checksum, &actual) {
            tracing::error!(
                model_id = %update.model_id,
                expected = %update.patch_checksum,
                actual = %actual,
                "Patch checksum mismatch"
            );
            let err = DeliveryError::integrity(
                &update.model_id,
                IntegrityStage::Patch,
                format!("expected {}, got {}", update.patch_checksum, actual),
            );
            return Err(self.abort(update, err).await);
        }

        self.set_state(update, UpdateState::Applying);
        let candidate = match self.apply_patch(update, &backup, &patch_bytes) {
            Ok(candidate) => candidate,
            Err(e) => return Err(self.rollback(update, &backup, None, e).await),
        };

        self.set_state(update, UpdateState::VerifyingResult);
        let actual = sha256_hex(&candidate);
        if !checksums_match(&update.result_checksum, &actual) {
            tracing::error!(
                model_id = %update.model_id,
                expected = %update.result_checksum,
                actual = %actual,
                "Patched model checksum mismatch"
            );
            let err = DeliveryError::integrity(
                &update.model_id,
                IntegrityStage::Result,
                format!("expected {}, got {}", update.result_checksum, actual),
            );
            return Err(self.rollback(update, &backup, None, err).await);
        }

        let metadata = backup
            .metadata
            .next_version(&update.target_version, &candidate);
        let commit = async {
            let stored = self.storage.compress(&candidate, metadata.compression)?;
            self.storage
                .replace_if(&update.model_id, &backup.metadata, &stored, metadata.clone())
                .await
        };
        if let Err(e) = commit.await {
            return Err(self.rollback(update, &backup, Some(&metadata), e).await);
        }

        self.discard_staged_patch(&update.model_id).await;
        self.set_state(update, UpdateState::Committed);

        tracing::info!(
            model_id = %update.model_id,
            version = %metadata.version,
            size_bytes = metadata.size_bytes,
            "Delta update committed"
        );

        Ok(metadata)
    }

    /// Snapshot the current artifact into the backups directory
    async fn backup(&self, update: &ModelUpdate) -> DeliveryResult<Backup> {
        let stored = self.storage.load_stored(&update.model_id).await?;
        if stored.metadata.version != update.current_version {
            tracing::warn!(
                model_id = %update.model_id,
                cached = %stored.metadata.version,
                expected = %update.current_version,
                "Cached version does not match update base"
            );
            return Err(DeliveryError::not_found(format!(
                "{}@{}",
                update.model_id, update.current_version
            )));
        }

        let created_at = Utc::now();
        let record = BackupRecord {
            metadata: stored.metadata.clone(),
            created_at,
            stored_size: stored.data.len() as u64,
        };
        let base_name = format!(
            "{}@{}@{}",
            file_stem(&update.model_id),
            file_stem(&stored.metadata.version),
            created_at.format("%Y%m%dT%H%M%S%.9fZ")
        );
        let backups_dir = self.storage.backups_dir();
        let artifact_path = backups_dir.join(format!("{}.bin", base_name));
        let record_path = backups_dir.join(format!("{}.json", base_name));

        self.backend().write_new(&artifact_path, &stored.data).await?;
        self.backend()
            .write_new(&record_path, &serde_json::to_vec_pretty(&record)?)
            .await?;

        tracing::debug!(
            model_id = %update.model_id,
            path = ?artifact_path,
            "Backup written"
        );

        Ok(Backup {
            data: stored.data,
            metadata: stored.metadata,
        })
    }

    async fn download_patch(&self, update: &ModelUpdate) -> DeliveryResult<Vec<u8>> {
        let started = Instant::now();
        let fetched = fetch_body(self.transport.as_ref(), &update.patch_url).await;
        if let Some(monitor) = &self.monitor {
            monitor.record_outcome(started.elapsed(), &fetched).await;
        }
        let body = fetched?;
        if body.len() as u64 != update.patch_size {
            tracing::warn!(
                model_id = %update.model_id,
                declared = update.patch_size,
                actual = body.len(),
                "Patch size differs from descriptor"
            );
        }
        self.backend()
            .write_atomic(&self.staged_patch_path(&update.model_id), &body)
            .await?;
        Ok(body.to_vec())
    }

    fn apply_patch(
        &self,
        update: &ModelUpdate,
        backup: &Backup,
        patch_bytes: &[u8],
    ) -> DeliveryResult<Vec<u8>> {
        let base = self
            .storage
            .decompress(&backup.data, backup.metadata.compression)?;
        if !backup.metadata.matches_payload(&base) {
            return Err(DeliveryError::integrity(
                &update.model_id,
                IntegrityStage::AtRest,
                "base artifact does not match its recorded checksum",
            ));
        }

        patch::apply(&base, patch_bytes).map_err(|e| {
            DeliveryError::integrity(&update.model_id, IntegrityStage::Apply, e.to_string())
        })
    }

    /// Fail before anything was mutated
    async fn abort(&self, update: &ModelUpdate, err: DeliveryError) -> DeliveryError {
        tracing::warn!(
            model_id = %update.model_id,
            error = %err,
            "Delta update aborted"
        );
        self.discard_staged_patch(&update.model_id).await;
        self.set_state(update, UpdateState::Idle);
        err
    }

    /// Fail after the patch was accepted
    ///
    /// The backup is only put back over `candidate`; an entry saved by
    /// someone else in the meantime is left active.
    async fn rollback(
        &self,
        update: &ModelUpdate,
        backup: &Backup,
        candidate: Option<&ModelMetadata>,
        err: DeliveryError,
    ) -> DeliveryError {
        tracing::warn!(
            model_id = %update.model_id,
            error = %err,
            "Rolling back delta update"
        );

        let active = self.storage.metadata(&update.model_id).await;
        match candidate {
            Some(candidate) if active.as_ref() == Some(candidate) => {
                if let Err(restore_err) = self
                    .storage
                    .replace_if(
                        &update.model_id,
                        candidate,
                        &backup.data,
                        backup.metadata.clone(),
                    )
                    .await
                {
                    tracing::error!(
                        model_id = %update.model_id,
                        error = %restore_err,
                        "Failed to restore backup during rollback"
                    );
                }
            }
            _ if active.is_some() && active.as_ref() != Some(&backup.metadata) => {
                tracing::info!(
                    model_id = %update.model_id,
                    "Cache entry replaced during update, keeping it"
                );
            }
            _ => {}
        }

        self.discard_staged_patch(&update.model_id).await;
        self.set_state(update, UpdateState::RolledBack);
        crate::metrics::record_update_rollback(&update.model_id);
        err
    }

    async fn discard_staged_patch(&self, model_id: &str) {
        if let Err(e) = self
            .backend()
            .remove(&self.staged_patch_path(model_id))
            .await
        {
            tracing::warn!(model_id = %model_id, error = %e, "Failed to remove staged patch");
        }
    }

    /// List backups of a model, oldest first
    pub async fn list_backups(&self, model_id: &str) -> DeliveryResult<Vec<BackupInfo>> {
        let mut backups: Vec<_> = self
            .all_backups()
            .await?
            .into_iter()
            .filter(|b| b.record.metadata.id == model_id)
            .collect();
        backups.sort_by_key(|b| b.record.created_at);
        Ok(backups)
    }

    async fn all_backups(&self) -> DeliveryResult<Vec<BackupInfo>> {
        let files = self.backend().list(&self.storage.backups_dir()).await?;
        let mut backups = Vec::new();

        for record_path in files
            .into_iter()
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        {
            let Some(raw) = self.backend().read(&record_path).await? else {
                continue;
            };
            match serde_json::from_slice::<BackupRecord>(&raw) {
                Ok(record) => backups.push(BackupInfo {
                    artifact_path: record_path.with_extension("bin"),
                    record_path,
                    record,
                }),
                Err(e) => {
                    tracing::warn!(path = ?record_path, error = %e, "Skipping unreadable backup record");
                }
            }
        }

        Ok(backups)
    }

    /// Make the most recent backup of a model the active artifact again
    pub async fn restore_latest_backup(&self, model_id: &str) -> DeliveryResult<ModelMetadata> {
        let latest = self
            .list_backups(model_id)
            .await?
            .pop()
            .ok_or_else(|| DeliveryError::not_found(format!("{} backup", model_id)))?;

        let data = self
            .backend()
            .read(&latest.artifact_path)
            .await?
            .ok_or_else(|| {
                DeliveryError::InternalFailure(format!(
                    "backup artifact {:?} is missing",
                    latest.artifact_path
                ))
            })?;

        if data.len() as u64 != latest.record.stored_size {
            return Err(DeliveryError::integrity(
                model_id,
                IntegrityStage::AtRest,
                "backup artifact size does not match its record",
            ));
        }

        self.storage
            .save(model_id, &data, latest.record.metadata.clone())
            .await?;

        tracing::info!(
            model_id = %model_id,
            version = %latest.record.metadata.version,
            "Restored model from backup"
        );
        Ok(latest.record.metadata)
    }

    /// Remove backups older than the retention window. Returns the number removed
    pub async fn gc_backups(&self) -> DeliveryResult<usize> {
        self.gc_backups_at(Utc::now()).await
    }

    pub async fn gc_backups_at(&self, now: DateTime<Utc>) -> DeliveryResult<usize> {
        let cutoff = now - self.retention;
        let mut removed = 0;

        for backup in self.all_backups().await? {
            if backup.record.created_at >= cutoff {
                continue;
            }
            self.backend().remove(&backup.artifact_path).await?;
            self.backend().remove(&backup.record_path).await?;
            removed += 1;
        }

        if removed > 0 {
            tracing::info!(removed = removed, "Expired backups removed");
        }
        Ok(removed)
    }
}
