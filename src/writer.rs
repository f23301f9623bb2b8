//! Bounded writer
//!
//! Streams upload bytes into a staging file, then links it into the storage
//! root. A file under the storage root is therefore always complete; partial
//! writes only ever exist in the staging directory and are removed on any
//! failure. Publishing never replaces an existing file.
//!
//! ```text
//! {storage_dir}/
//! ├── files/       # one regular file per handle
//! └── incoming/    # {uuid}.partial while a write is in flight
//! ```

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::RelayError;
use crate::handle::validate_handle;

/// Suffix of in-flight staging files
pub const STAGING_SUFFIX: &str = "partial";

/// Byte budget for one upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadLimit {
    ceiling: u64,
    declared: Option<u64>,
}

impl UploadLimit {
    pub fn new(ceiling: u64, declared: Option<u64>) -> Self {
        Self { ceiling, declared }
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    pub fn declared(&self) -> Option<u64> {
        self.declared
    }

    /// Reject a declared length over the ceiling before any byte is read.
    pub fn check_declared(&self) -> Result<(), RelayError> {
        match self.declared {
            Some(declared) if declared > self.ceiling => {
                Err(RelayError::TooLarge { limit: self.ceiling })
            }
            _ => Ok(()),
        }
    }

    /// Most bytes the source may produce: the declared length or the
    /// ceiling, whichever is smaller.
    pub fn bound(&self) -> u64 {
        self.declared.map_or(self.ceiling, |d| d.min(self.ceiling))
    }

    /// Check a running byte total against the bound.
    pub fn check_total(&self, total: u64) -> Result<(), RelayError> {
        if total > self.ceiling {
            return Err(RelayError::TooLarge { limit: self.ceiling });
        }
        if let Some(declared) = self.declared {
            if total > declared {
                return Err(RelayError::BadRequest(format!(
                    "body longer than declared length of {} bytes",
                    declared
                )));
            }
        }
        Ok(())
    }
}

/// Map an upstream stream failure (client reset, truncated body) to an I/O
/// error so it is reported as a storage-side failure.
pub(crate) fn stream_error<E>(e: E) -> RelayError
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    RelayError::Io(std::io::Error::new(std::io::ErrorKind::ConnectionAborted, e))
}

/// Writes objects into the storage root under a byte ceiling
pub struct BoundedWriter {
    root: PathBuf,
    staging: PathBuf,
}

impl BoundedWriter {
    /// Create the writer, creating both directories if needed
    pub async fn new<P: AsRef<Path>, Q: AsRef<Path>>(
        root: P,
        staging: Q,
    ) -> Result<Self, RelayError> {
        let root = root.as_ref().to_path_buf();
        let staging = staging.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        fs::create_dir_all(&staging).await?;
        Ok(Self { root, staging })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging
    }

    /// Path of the backing file for `handle`
    pub fn object_path(&self, handle: &str) -> Result<PathBuf, RelayError> {
        Ok(self.root.join(validate_handle(handle)?))
    }

    /// Stream `source` into `root/handle`, enforcing `limit`.
    ///
    /// Returns the number of bytes written. Fails with `AlreadyExists` when
    /// `root/handle` is already present, leaving that file untouched. On
    /// error nothing is left behind in either directory.
    pub async fn write<S, E>(
        &self,
        handle: &str,
        source: S,
        limit: &UploadLimit,
    ) -> Result<u64, RelayError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let dest = self.object_path(handle)?;
        limit.check_declared()?;

        let staging = self
            .staging
            .join(format!("{}.{}", uuid::Uuid::new_v4(), STAGING_SUFFIX));

        let written = match copy_bounded(&staging, source, limit).await {
            Ok(n) => n,
            Err(e) => {
                discard(&staging).await;
                return Err(e);
            }
        };

        // hard_link fails instead of replacing an existing destination
        let published = fs::hard_link(&staging, &dest).await;
        discard(&staging).await;
        match published {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(RelayError::AlreadyExists(handle.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        debug!(handle = %handle, size = written, "Wrote object file");
        Ok(written)
    }

    /// Remove the backing file for `handle`.
    ///
    /// Returns `Ok(false)` when the file was already gone.
    pub async fn remove(&self, handle: &str) -> Result<bool, RelayError> {
        let path = self.object_path(handle)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

async fn copy_bounded<S, E>(
    staging: &Path,
    mut source: S,
    limit: &UploadLimit,
) -> Result<u64, RelayError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(staging)
        .await?;

    let mut written = 0u64;
    while let Some(chunk) = source.next().await {
        let chunk = chunk.map_err(stream_error)?;
        written += chunk.len() as u64;
        limit.check_total(written)?;
        file.write_all(&chunk).await?;
    }

    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

async fn discard(staging: &Path) {
    match fs::remove_file(staging).await {
        Ok(()) => debug!(path = %staging.display(), "Discarded partial upload"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %staging.display(), error = %e, "Failed to discard partial upload"),
    }
}
