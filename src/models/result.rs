//! Outcome of a model load

use super::metadata::ModelMetadata;
use crate::error::{DeliveryError, DeliveryResult};
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Where a loaded artifact came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadSource {
    Cache,
    NetworkFull,
    NetworkDelta,
}

impl fmt::Display for LoadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cache => write!(f, "cache"),
            Self::NetworkFull => write!(f, "network_full"),
            Self::NetworkDelta => write!(f, "network_delta"),
        }
    }
}

/// Result of loading a model
///
/// Either `success` is true and `data` holds the decompressed artifact, or
/// `success` is false and `error` describes the failure. The constructors
/// are the only way to build one, which keeps the two cases exclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadResult {
    success: bool,
    model_id: String,
    data: Option<Bytes>,
    metadata: Option<ModelMetadata>,
    error: Option<DeliveryError>,
    source: LoadSource,
    elapsed: Duration,
}

impl LoadResult {
    pub fn loaded(
        model_id: impl Into<String>,
        data: impl Into<Bytes>,
        metadata: ModelMetadata,
        source: LoadSource,
    ) -> Self {
        Self {
            success: true,
            model_id: model_id.into(),
            data: Some(data.into()),
            metadata: Some(metadata),
            error: None,
            source,
            elapsed: Duration::ZERO,
        }
    }

    pub fn failed(model_id: impl Into<String>, error: DeliveryError, source: LoadSource) -> Self {
        Self {
            success: false,
            model_id: model_id.into(),
            data: None,
            metadata: None,
            error: Some(error),
            source,
            elapsed: Duration::ZERO,
        }
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Decompressed artifact bytes (cheap to clone)
    pub fn data(&self) -> Option<&Bytes> {
        self.data.as_ref()
    }

    pub fn metadata(&self) -> Option<&ModelMetadata> {
        self.metadata.as_ref()
    }

    pub fn error(&self) -> Option<&DeliveryError> {
        self.error.as_ref()
    }

    pub fn source(&self) -> LoadSource {
        self.source
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Convert into the artifact bytes or the typed error
    pub fn into_result(self) -> DeliveryResult<(Bytes, ModelMetadata)> {
        match (self.data, self.metadata, self.error) {
            (Some(data), Some(metadata), None) => Ok((data, metadata)),
            (_, _, Some(err)) => Err(err),
            _ => Err(DeliveryError::InternalFailure(format!(
                "incomplete load result for '{}'",
                self.model_id
            ))),
        }
    }
}
