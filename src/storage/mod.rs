//! Persistent model artifact cache
//!
//! Provides functionality for:
//! - Atomic artifact and metadata writes
//! - LRU eviction under byte and model-count limits, with pinning
//! - Recovering the index after an interrupted write

pub mod backend;
pub mod eviction;
pub mod manager;

pub use backend::{FileSystemStorage, StorageBackend};
pub use eviction::{EvictionCandidate, EvictionPlan, plan_eviction};
pub use manager::{CacheLimits, StorageManager, StorageStatistics, StoredModel, StoredRecord};
