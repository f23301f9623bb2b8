//! Relay storage engine
//!
//! `RelayStore` ties the allocator, the bounded writer and the metadata index
//! together. It is the capability handed to the HTTP layer and to the
//! retention sweeper; neither touches the filesystem or the index directly.
//!
//! Upload ordering: allocate (spool, hash, blacklist) → write file → commit
//! record → return handle. A handle is only ever returned once its record is
//! committed.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{stream, Stream};
use std::convert::Infallible;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::allocator::{Allocation, HandleAllocator};
use crate::config::{Config, HandleStrategy};
use crate::error::RelayError;
use crate::handle::{normalize_content_hash, validate_handle};
use crate::index::{open_index, BlacklistEntry, MetadataIndex, StoredObject};
use crate::sniff;
use crate::writer::{BoundedWriter, UploadLimit};

/// Chunk size used when handing a spooled upload to the writer
const WRITE_CHUNK: usize = 64 * 1024;

/// Request-side facts about an upload
#[derive(Debug, Clone)]
pub struct UploadMeta {
    /// Upper bound on the upload length, if the caller knows one
    pub declared_len: Option<u64>,
    /// Uploader address
    pub origin: String,
}

/// A file ready to be served
#[derive(Debug, Clone)]
pub struct Download {
    pub handle: String,
    /// Sniffed type, markup already downgraded
    pub content_type: &'static str,
    pub body: Bytes,
}

/// Fixed knobs the engine enforces
#[derive(Debug, Clone)]
pub struct StoreLimits {
    pub max_object_bytes: u64,
    pub retention: chrono::Duration,
}

impl StoreLimits {
    pub fn from_config(config: &Config) -> Result<Self, RelayError> {
        Ok(Self {
            max_object_bytes: config.max_object_bytes,
            retention: chrono::Duration::from_std(config.retention())
                .map_err(|e| RelayError::Config(format!("retention_secs: {}", e)))?,
        })
    }
}

/// Outcome of removing one expired object's file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiredFile {
    Removed,
    /// The file was already gone
    Missing,
    /// The handle now belongs to a newer upload
    Superseded,
}

/// Storage engine for the relay
pub struct RelayStore {
    allocator: HandleAllocator,
    writer: BoundedWriter,
    index: Arc<dyn MetadataIndex>,
    limits: StoreLimits,
    /// Serializes handle reuse against expiry of the same handle
    reclaim: Mutex<()>,
}

impl RelayStore {
    pub fn new(
        allocator: HandleAllocator,
        writer: BoundedWriter,
        index: Arc<dyn MetadataIndex>,
        limits: StoreLimits,
    ) -> Self {
        Self {
            allocator,
            writer,
            index,
            limits,
            reclaim: Mutex::new(()),
        }
    }

    /// Open the engine described by `config`, creating directories and the
    /// index as needed. Failures here are startup faults.
    pub async fn open(config: &Config) -> Result<Self, RelayError> {
        config.validate()?;
        fs::create_dir_all(&config.storage_dir).await?;

        let writer = BoundedWriter::new(config.files_dir(), config.staging_dir()).await?;
        let index = open_index(config.index_backend, &config.index_path())?;
        let store = Self::new(
            HandleAllocator::new(config.handle_strategy),
            writer,
            index,
            StoreLimits::from_config(config)?,
        );

        info!(
            files = %config.files_dir().display(),
            strategy = ?config.handle_strategy,
            backend = ?config.index_backend,
            max_object_bytes = config.max_object_bytes,
            retention_secs = config.retention_secs,
            "Initialized relay store"
        );
        Ok(store)
    }

    pub fn index(&self) -> &Arc<dyn MetadataIndex> {
        &self.index
    }

    pub fn writer(&self) -> &BoundedWriter {
        &self.writer
    }

    pub fn limits(&self) -> &StoreLimits {
        &self.limits
    }

    pub fn root(&self) -> &Path {
        self.writer.root()
    }

    /// Records uploaded strictly before this instant are expired at `now`
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.limits.retention
    }

    pub fn is_expired(&self, object: &StoredObject, now: DateTime<Utc>) -> bool {
        object.uploaded_at < self.cutoff(now)
    }

    /// Store an upload and return its committed record.
    ///
    /// With the content strategy a live record for the same bytes is returned
    /// as is; nothing is rewritten.
    pub async fn upload<S, E>(&self, source: S, meta: UploadMeta) -> Result<StoredObject, RelayError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let limit = UploadLimit::new(self.limits.max_object_bytes, meta.declared_len);

        let allocation = self
            .allocator
            .allocate(source, &limit, self.index.as_ref())
            .await?;

        if self.allocator.strategy() == HandleStrategy::Content {
            if let Some(existing) = self.index.get(&allocation.handle)? {
                if !self.is_expired(&existing, Utc::now()) {
                    debug!(handle = %existing.handle, "Upload matches a live object");
                    return Ok(existing);
                }

                // lapsed but not yet swept: retire it and commit the
                // replacement under the reclaim lock
                let _reclaim = self.reclaim.lock().await;
                match self.index.get(&allocation.handle)? {
                    Some(current) if !self.is_expired(&current, Utc::now()) => return Ok(current),
                    Some(current) => self.retire(&current).await?,
                    None => {}
                }
                return self.commit(allocation, &limit, meta.origin).await;
            }
        }

        self.commit(allocation, &limit, meta.origin).await
    }

    /// Write the file for an admitted upload, then its record
    async fn commit(
        &self,
        allocation: Allocation,
        limit: &UploadLimit,
        origin: String,
    ) -> Result<StoredObject, RelayError> {
        let Allocation {
            handle,
            content_hash,
            body,
        } = allocation;
        let content = self.allocator.strategy() == HandleStrategy::Content;
        let size = body.len() as u64;

        let (written, created) = match self.writer.write(&handle, chunked(body), limit).await {
            Ok(written) => (written, true),
            Err(RelayError::AlreadyExists(_)) if content => {
                // content-addressed: the existing file holds these bytes
                debug!(handle = %handle, "Object file already present");
                (size, false)
            }
            Err(e) => return Err(e),
        };
        let object = StoredObject::new(&handle, content_hash, origin, written, Utc::now());

        match self.index.insert(&object) {
            Ok(()) => {
                info!(handle = %handle, size = written, "Stored object");
                Ok(object)
            }
            Err(RelayError::AlreadyExists(_)) if content => {
                // a concurrent identical upload committed first; the file
                // holds the same bytes either way
                self.index.get(&handle)?.ok_or_else(|| {
                    RelayError::Internal(format!("record for {} vanished after conflict", handle))
                })
            }
            Err(e) => {
                if created {
                    if let Err(cleanup) = self.writer.remove(&handle).await {
                        warn!(handle = %handle, error = %cleanup, "Failed to remove orphaned file");
                    }
                }
                Err(e)
            }
        }
    }

    /// Remove the file behind one record from an expiry snapshot.
    ///
    /// The record is re-read under the reclaim lock; if the handle was
    /// re-uploaded since the snapshot, or is inside the window at `now`, the
    /// file is left alone and `Superseded` is returned.
    pub async fn remove_expired_file(
        &self,
        expired: &StoredObject,
        now: DateTime<Utc>,
    ) -> Result<ExpiredFile, RelayError> {
        let _reclaim = self.reclaim.lock().await;
        match self.index.get(&expired.handle)? {
            Some(current)
                if current.uploaded_at == expired.uploaded_at && self.is_expired(&current, now) => {}
            _ => return Ok(ExpiredFile::Superseded),
        }
        if self.writer.remove(&expired.handle).await? {
            Ok(ExpiredFile::Removed)
        } else {
            Ok(ExpiredFile::Missing)
        }
    }

    /// Load a live object for serving.
    ///
    /// Unknown, malformed, expired and already-deleted handles are all
    /// `NotFound`.
    pub async fn open_object(&self, handle: &str) -> Result<Download, RelayError> {
        let not_found = || RelayError::NotFound(handle.to_string());

        validate_handle(handle).map_err(|_| not_found())?;
        let record = self.index.get(handle)?.ok_or_else(not_found)?;
        if self.is_expired(&record, Utc::now()) {
            return Err(not_found());
        }

        let body = match fs::read(self.writer.object_path(handle)?).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(handle = %handle, "Record present but file missing");
                return Err(not_found());
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Download {
            handle: handle.to_string(),
            content_type: sniff::served_content_type(&body),
            body: Bytes::from(body),
        })
    }

    /// Names of the regular files directly under the storage root, sorted
    pub async fn list(&self) -> Result<Vec<String>, RelayError> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(self.root()).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Ban a content hash (either base64 alphabet)
    pub fn ban(&self, content_hash: &str) -> Result<BlacklistEntry, RelayError> {
        let hash = normalize_content_hash(content_hash)?;
        let entry = self.index.ban(&hash, Utc::now())?;
        info!(content_hash = %hash, "Content hash blacklisted");
        Ok(entry)
    }

    /// Lift a ban; returns whether one existed
    pub fn unban(&self, content_hash: &str) -> Result<bool, RelayError> {
        let hash = normalize_content_hash(content_hash)?;
        let removed = self.index.unban(&hash)?;
        if removed {
            info!(content_hash = %hash, "Content hash removed from blacklist");
        }
        Ok(removed)
    }

    /// Administrative delete of one object, file first then record
    pub async fn delete(&self, handle: &str) -> Result<(), RelayError> {
        validate_handle(handle)?;
        let file_removed = self.writer.remove(handle).await?;
        let records_removed = self.index.delete_many(&[handle.to_string()])?;
        if !file_removed && records_removed == 0 {
            return Err(RelayError::NotFound(handle.to_string()));
        }
        info!(handle = %handle, "Deleted object");
        Ok(())
    }

    /// Number of committed records
    pub fn object_count(&self) -> Result<u64, RelayError> {
        self.index.count()
    }

    async fn retire(&self, object: &StoredObject) -> Result<(), RelayError> {
        self.writer.remove(&object.handle).await?;
        self.index.delete_many(&[object.handle.clone()])?;
        debug!(handle = %object.handle, "Retired lapsed object before re-upload");
        Ok(())
    }
}

/// Feed a spooled body to the writer in fixed-size slices
fn chunked(body: Bytes) -> impl Stream<Item = Result<Bytes, Infallible>> + Unpin {
    let len = body.len();
    stream::iter(
        (0..len)
            .step_by(WRITE_CHUNK)
            .map(move |start| Ok(body.slice(start..(start + WRITE_CHUNK).min(len)))),
    )
}
