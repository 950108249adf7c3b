//! Error types for model delivery operations

use serde::Serialize;
use std::fmt;

/// Result alias used across the library surface
pub type DeliveryResult<T> = Result<T, DeliveryError>;

/// Stage at which an integrity check failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityStage {
    /// Downloaded artifact did not match the expected checksum
    Download,
    /// Artifact read back from the cache did not match its recorded checksum
    AtRest,
    /// Patch bytes did not match the declared patch checksum
    Patch,
    /// Patch could not be applied to the base artifact
    Apply,
    /// Patched candidate did not match the declared result checksum
    Result,
}

impl fmt::Display for IntegrityStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Download => write!(f, "download"),
            Self::AtRest => write!(f, "at-rest"),
            Self::Patch => write!(f, "patch"),
            Self::Apply => write!(f, "apply"),
            Self::Result => write!(f, "result"),
        }
    }
}

/// Typed failures surfaced by the delivery engine
///
/// The type is `Clone` so a single coalesced failure can be handed to every
/// waiter of a deduplicated load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DeliveryError {
    #[error("model '{model_id}' not found")]
    NotFound { model_id: String },

    #[error("integrity check failed for '{model_id}' at {stage} stage: {detail}")]
    IntegrityFailure {
        model_id: String,
        stage: IntegrityStage,
        detail: String,
    },

    #[error("cannot store '{model_id}': need {required} bytes, at most {available} can be freed")]
    CapacityExceeded {
        model_id: String,
        required: u64,
        available: u64,
    },

    #[error("network failure: {0}")]
    NetworkFailure(String),

    #[error("unsupported compression type '{0}'")]
    UnsupportedCompression(String),

    #[error("internal failure: {0}")]
    InternalFailure(String),
}

impl DeliveryError {
    pub fn not_found(model_id: impl Into<String>) -> Self {
        Self::NotFound {
            model_id: model_id.into(),
        }
    }

    pub fn integrity(
        model_id: impl Into<String>,
        stage: IntegrityStage,
        detail: impl Into<String>,
    ) -> Self {
        Self::IntegrityFailure {
            model_id: model_id.into(),
            stage,
            detail: detail.into(),
        }
    }

    /// Short label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::IntegrityFailure { .. } => "integrity_failure",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::NetworkFailure(_) => "network_failure",
            Self::UnsupportedCompression(_) => "unsupported_compression",
            Self::InternalFailure(_) => "internal_failure",
        }
    }

    /// Whether the caller may reasonably try again (possibly with another strategy)
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkFailure(_) | Self::NotFound { .. })
    }

    /// Short message suitable for showing to an end user
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "Model not available offline. Connect and try again.",
            Self::IntegrityFailure { .. } => "Model download was corrupted. Please retry.",
            Self::CapacityExceeded { .. } => "Not enough storage for this model.",
            Self::NetworkFailure(_) => "Network problem while fetching the model. Please retry.",
            Self::UnsupportedCompression(_) | Self::InternalFailure(_) => {
                "Model could not be loaded. Please retry."
            }
        }
    }
}

impl From<std::io::Error> for DeliveryError {
    fn from(err: std::io::Error) -> Self {
        Self::InternalFailure(format!("I/O error: {}", err))
    }
}

impl From<serde_json::Error> for DeliveryError {
    fn from(err: serde_json::Error) -> Self {
        Self::InternalFailure(format!("metadata encoding error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(DeliveryError::not_found("m1").kind(), "not_found");
        assert_eq!(
            DeliveryError::NetworkFailure("timeout".into()).kind(),
            "network_failure"
        );
        assert_eq!(
            DeliveryError::integrity("m1", IntegrityStage::Patch, "mismatch").kind(),
            "integrity_failure"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(DeliveryError::NetworkFailure("reset".into()).is_retryable());
        assert!(!DeliveryError::integrity("m1", IntegrityStage::Result, "x").is_retryable());
        assert!(
            !DeliveryError::CapacityExceeded {
                model_id: "m1".into(),
                required: 10,
                available: 5
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_display_includes_stage() {
        let err = DeliveryError::integrity("m1", IntegrityStage::Patch, "digest mismatch");
        let msg = err.to_string();
        assert!(msg.contains("m1"));
        assert!(msg.contains("patch"));
    }

    #[test]
    fn test_io_error_maps_to_internal() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: DeliveryError = io.into();
        assert_eq!(err.kind(), "internal_failure");
    }

    #[test]
    fn test_serialize_tagged() {
        let err = DeliveryError::UnsupportedCompression("lzma".into());
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "unsupported_compression");
    }
}
