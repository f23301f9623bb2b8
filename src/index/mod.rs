//! Metadata index
//!
//! The index records which handles exist, when they were uploaded, and which
//! content hashes are banned. It is the authority for visibility: a file in
//! the storage root is served only while its record exists and is inside the
//! retention window.
//!
//! No transaction spans the index and the filesystem. The upload path orders
//! its writes (file, then record) and the sweeper reconciles whatever a crash
//! leaves in between.

mod sled_index;
mod sqlite_index;

pub use sled_index::SledIndex;
pub use sqlite_index::SqliteIndex;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::config::IndexBackend;
use crate::error::RelayError;

/// Index record for one stored upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    /// Retrieval key and filename of the backing bytes
    pub handle: String,
    /// Base64 SHA-256 of the content
    pub content_hash: String,
    /// Uploader address, kept for abuse investigation only
    pub origin: String,
    /// Stored length in bytes
    pub size_bytes: u64,
    /// Upload time, the sole expiry criterion
    pub uploaded_at: DateTime<Utc>,
}

impl StoredObject {
    /// Build a record. `uploaded_at` is truncated to milliseconds, the
    /// resolution every backend stores.
    pub fn new(
        handle: impl Into<String>,
        content_hash: impl Into<String>,
        origin: impl Into<String>,
        size_bytes: u64,
        uploaded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            handle: handle.into(),
            content_hash: content_hash.into(),
            origin: origin.into(),
            size_bytes,
            uploaded_at: uploaded_at.trunc_subsecs(3),
        }
    }
}

/// A banned content hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub content_hash: String,
    pub banned_at: DateTime<Utc>,
}

/// Operations the relay needs from its metadata store.
///
/// Implementations must be safe for concurrent inserts from request tasks
/// alongside reads and batch deletes from the sweeper.
pub trait MetadataIndex: Send + Sync {
    /// Commit a new record. Fails with [`RelayError::AlreadyExists`] when
    /// the handle is taken; existing records are never overwritten.
    fn insert(&self, object: &StoredObject) -> Result<(), RelayError>;

    /// Look up a record by handle
    fn get(&self, handle: &str) -> Result<Option<StoredObject>, RelayError>;

    /// Blacklist lookup by content hash
    fn find_blacklisted(&self, content_hash: &str) -> Result<Option<BlacklistEntry>, RelayError>;

    /// All records with `uploaded_at < cutoff`, oldest first
    fn find_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<StoredObject>, RelayError>;

    /// Remove records in one batch. Unknown handles are ignored; returns how
    /// many records were removed.
    fn delete_many(&self, handles: &[String]) -> Result<usize, RelayError>;

    /// Remove the records in an expiry snapshot, but only those whose stored
    /// `uploaded_at` still matches the snapshot. A handle re-uploaded after
    /// the snapshot was taken keeps its new record. Returns how many records
    /// were removed.
    fn delete_expired(&self, snapshot: &[StoredObject]) -> Result<usize, RelayError>;

    /// Ban a content hash. Banning twice keeps the first entry.
    fn ban(&self, content_hash: &str, at: DateTime<Utc>) -> Result<BlacklistEntry, RelayError>;

    /// Lift a ban; returns whether one existed
    fn unban(&self, content_hash: &str) -> Result<bool, RelayError>;

    /// Number of stored records
    fn count(&self) -> Result<u64, RelayError>;

    /// Make pending writes durable
    fn flush(&self) -> Result<(), RelayError> {
        Ok(())
    }
}

/// Open the configured index backend at `path`
pub fn open_index(
    backend: IndexBackend,
    path: &Path,
) -> Result<Arc<dyn MetadataIndex>, RelayError> {
    let index: Arc<dyn MetadataIndex> = match backend {
        IndexBackend::Sled => Arc::new(SledIndex::open(path)?),
        IndexBackend::Sqlite => Arc::new(SqliteIndex::open(path)?),
    };
    Ok(index)
}
