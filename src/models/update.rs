//! Pending update descriptors received from an update catalog

use super::metadata::is_valid_checksum;
use crate::error::{DeliveryError, DeliveryResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A pending transition of one model from `current_version` to `target_version`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelUpdate {
    pub model_id: String,
    pub current_version: String,
    pub target_version: String,
    /// Source locator of the patch bytes
    pub patch_url: String,
    pub patch_size: u64,
    /// Size of the full target artifact
    pub original_size: u64,
    pub patch_checksum: String,
    /// Checksum of the decompressed artifact after applying the patch
    pub result_checksum: String,
    #[serde(default)]
    pub required: bool,
    pub released_at: DateTime<Utc>,
}

impl ModelUpdate {
    /// Patch size relative to the full artifact
    pub fn compression_ratio(&self) -> f64 {
        if self.original_size == 0 {
            return 1.0;
        }
        self.patch_size as f64 / self.original_size as f64
    }

    /// Percentage of bytes saved by fetching the patch instead of the full artifact
    pub fn savings_percentage(&self) -> f64 {
        ((1.0 - self.compression_ratio()) * 100.0).clamp(0.0, 100.0)
    }

    /// Whether this update moves `from` to `to`
    pub fn applies_to(&self, from: &str, to: &str) -> bool {
        self.current_version == from && self.target_version == to
    }

    /// Reject descriptors that cannot be applied safely
    pub fn validate(&self) -> DeliveryResult<()> {
        let invalid = |reason: &str| {
            Err(DeliveryError::InternalFailure(format!(
                "invalid update for '{}': {}",
                self.model_id, reason
            )))
        };

        if self.model_id.is_empty() {
            return invalid("empty model id");
        }
        if self.current_version.is_empty() || self.target_version.is_empty() {
            return invalid("empty version");
        }
        if self.current_version == self.target_version {
            return invalid("current and target versions are identical");
        }
        if self.patch_url.is_empty() {
            return invalid("missing patch locator");
        }
        if self.patch_size == 0 || self.original_size == 0 {
            return invalid("zero size");
        }
        if !is_valid_checksum(&self.patch_checksum) {
            return invalid("malformed patch checksum");
        }
        if !is_valid_checksum(&self.result_checksum) {
            return invalid("malformed result checksum");
        }

        Ok(())
    }
}
