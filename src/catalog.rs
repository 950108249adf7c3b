//! Sources of pending model updates

use crate::error::{DeliveryError, DeliveryResult};
use crate::models::ModelUpdate;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

/// Trait for discovering updates published for a model
#[async_trait]
pub trait UpdateCatalog: Send + Sync {
    /// All updates known for `model_id`, in no particular order
    async fn updates_for(&self, model_id: &str) -> DeliveryResult<Vec<ModelUpdate>>;
}

/// In-memory catalog
#[derive(Default)]
pub struct StaticCatalog {
    updates: RwLock<HashMap<String, Vec<ModelUpdate>>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_updates(updates: impl IntoIterator<Item = ModelUpdate>) -> Self {
        let mut by_model: HashMap<String, Vec<ModelUpdate>> = HashMap::new();
        for update in updates {
            by_model
                .entry(update.model_id.clone())
                .or_default()
                .push(update);
        }
        Self {
            updates: RwLock::new(by_model),
        }
    }

    pub async fn publish(&self, update: ModelUpdate) {
        self.updates
            .write()
            .await
            .entry(update.model_id.clone())
            .or_default()
            .push(update);
    }

    pub async fn clear(&self) {
        self.updates.write().await.clear();
    }
}

#[async_trait]
impl UpdateCatalog for StaticCatalog {
    async fn updates_for(&self, model_id: &str) -> DeliveryResult<Vec<ModelUpdate>> {
        Ok(self
            .updates
            .read()
            .await
            .get(model_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Catalog read from a JSON array of update descriptors
///
/// The file is re-read on every query so a publisher can replace it in place.
pub struct FileCatalog {
    path: PathBuf,
}

impl FileCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read_all(&self) -> DeliveryResult<Vec<ModelUpdate>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = ?self.path, "Update catalog file not present");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&raw).map_err(|e| {
            DeliveryError::InternalFailure(format!(
                "failed to parse update catalog {:?}: {}",
                self.path, e
            ))
        })
    }
}

#[async_trait]
impl UpdateCatalog for FileCatalog {
    async fn updates_for(&self, model_id: &str) -> DeliveryResult<Vec<ModelUpdate>> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .filter(|u| u.model_id == model_id)
            .collect())
    }
}
