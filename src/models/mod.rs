//! Model data types
//!
//! Provides:
//! - Model metadata and SHA-256 checksum helpers
//! - Update descriptors received from a catalog
//! - Load results with provenance

pub mod metadata;
pub mod result;
pub mod update;

pub use metadata::{ModelMetadata, checksums_match, is_valid_checksum, sha256_hex};
pub use result::{LoadResult, LoadSource};
pub use update::ModelUpdate;
