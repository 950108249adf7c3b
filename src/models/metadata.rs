//! Model metadata and checksum helpers

use crate::codec::CompressionType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Length of a hex-encoded SHA-256 digest
pub const CHECKSUM_HEX_LEN: usize = 64;

/// Compute the lowercase hex SHA-256 digest of `data`
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Check that a string looks like a hex SHA-256 digest
pub fn is_valid_checksum(checksum: &str) -> bool {
    checksum.len() == CHECKSUM_HEX_LEN && checksum.chars().all(|c| c.is_ascii_hexdigit())
}

/// Compare two hex digests case-insensitively
pub fn checksums_match(expected: &str, actual: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(actual.trim())
}

/// Metadata describing a cached model artifact
///
/// `checksum` and `size_bytes` always describe the decompressed payload,
/// regardless of the codec used to store it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default = "default_artifact_type")]
    pub artifact_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub compression: CompressionType,
    pub checksum: String,
    pub size_bytes: u64,
}

impl ModelMetadata {
    /// Create metadata for a decompressed payload
    pub fn for_payload(
        id: impl Into<String>,
        version: impl Into<String>,
        compression: CompressionType,
        payload: &[u8],
    ) -> Self {
        let id = id.into();
        let now = Utc::now();
        Self {
            name: id.clone(),
            id,
            version: version.into(),
            artifact_type: default_artifact_type(),
            description: String::new(),
            tags: BTreeSet::new(),
            created_at: now,
            updated_at: now,
            compression,
            checksum: sha256_hex(payload),
            size_bytes: payload.len() as u64,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Derive metadata for a new version of the same model
    ///
    /// Descriptive fields and `created_at` carry over; version, checksum,
    /// size and `updated_at` describe the new payload.
    pub fn next_version(&self, version: impl Into<String>, payload: &[u8]) -> Self {
        Self {
            version: version.into(),
            updated_at: Utc::now(),
            checksum: sha256_hex(payload),
            size_bytes: payload.len() as u64,
            ..self.clone()
        }
    }

    /// Verify that `payload` matches the recorded checksum and size
    pub fn matches_payload(&self, payload: &[u8]) -> bool {
        self.size_bytes == payload.len() as u64 && checksums_match(&self.checksum, &sha256_hex(payload))
    }
}

fn default_artifact_type() -> String {
    "model".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_checksum_validation() {
        assert!(is_valid_checksum(&sha256_hex(b"x")));
        assert!(!is_valid_checksum("abc"));
        assert!(!is_valid_checksum(&"z".repeat(64)));
    }

    #[test]
    fn test_checksums_match_case_insensitive() {
        let digest = sha256_hex(b"model");
        assert!(checksums_match(&digest.to_uppercase(), &digest));
        assert!(!checksums_match(&digest, &sha256_hex(b"other")));
    }

    #[test]
    fn test_for_payload() {
        let meta = ModelMetadata::for_payload("m1", "1.0.0", CompressionType::Zstd, b"weights");
        assert_eq!(meta.id, "m1");
        assert_eq!(meta.name, "m1");
        assert_eq!(meta.size_bytes, 7);
        assert_eq!(meta.compression, CompressionType::Zstd);
        assert!(meta.matches_payload(b"weights"));
        assert!(!meta.matches_payload(b"weightz"));
    }

    #[test]
    fn test_next_version_keeps_descriptive_fields() {
        let meta = ModelMetadata::for_payload("m1", "1.0.0", CompressionType::None, b"v1")
            .with_name("Suggestion model")
            .with_tag("keyboard");
        let next = meta.next_version("1.1.0", b"v2-bytes");

        assert_eq!(next.name, "Suggestion model");
        assert!(next.tags.contains("keyboard"));
        assert_eq!(next.created_at, meta.created_at);
        assert_eq!(next.version, "1.1.0");
        assert_eq!(next.size_bytes, 8);
        assert_ne!(next.checksum, meta.checksum);
    }

    #[test]
    fn test_serde_defaults() {
        let json = serde_json::json!({
            "id": "m1",
            "name": "m1",
            "version": "1.0.0",
            "created_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z",
            "checksum": sha256_hex(b""),
            "size_bytes": 0
        });
        let meta: ModelMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(meta.artifact_type, "model");
        assert_eq!(meta.compression, CompressionType::None);
        assert!(meta.tags.is_empty());
    }
}
