//! Model Delivery - hybrid model delivery and caching engine
//!
//! Delivers large binary model artifacts to a client with limited storage
//! and a variable network. Artifacts are cached with LRU eviction and
//! pinning, fetched with a strategy picked from recent network health, and
//! updated in place from verified binary patches that roll back on failure.

pub mod catalog;
pub mod codec;
pub mod config;
pub mod delta;
pub mod error;
pub mod health;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod storage;
pub mod transport;

pub use catalog::{FileCatalog, StaticCatalog, UpdateCatalog};
pub use codec::{Codec, CompressionType};
pub use config::DeliveryConfig;
pub use delta::{DeltaUpdateManager, UpdateProgress, UpdateState};
pub use error::{DeliveryError, DeliveryResult, IntegrityStage};
pub use health::{DownloadStrategy, NetworkHealthMetrics, NetworkHealthMonitor, TransportKind};
pub use models::{LoadResult, LoadSource, ModelMetadata, ModelUpdate};
pub use orchestrator::{
    DeliveryEvent, HybridOrchestrator, LoadRequest, ManagerState, ModelStatus,
    OrchestratorStatus, UpdateOutcome,
};
pub use storage::{CacheLimits, StorageManager, StorageStatistics};
pub use transport::{FetchResponse, FetchTransport, HttpTransport};
