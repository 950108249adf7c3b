//! Delta updates
//!
//! A delta update replaces a cached model with a newer version by fetching a
//! binary patch instead of the full artifact. The active artifact is only
//! swapped after the patched result verifies.

pub mod manager;
pub mod patch;

pub use manager::{
    BackupInfo, BackupRecord, DEFAULT_BACKUP_RETENTION_DAYS, DeltaUpdateManager, UpdateProgress,
    UpdateState,
};
pub use patch::PatchError;
