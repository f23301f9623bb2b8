//! Handle allocator
//!
//! Consumes the upload once under its [`UploadLimit`], hashing as it goes,
//! then derives the handle and consults the blacklist. Nothing reaches the
//! filesystem here: a blacklisted or oversized upload is rejected while its
//! bytes are still only in the spool buffer.

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::HandleStrategy;
use crate::error::RelayError;
use crate::handle::{content_handle, encode_content_hash, validate_handle, TimeTokens};
use crate::index::MetadataIndex;
use crate::writer::{stream_error, UploadLimit};

/// Initial spool capacity; grows up to the upload bound
const SPOOL_CAPACITY: u64 = 64 * 1024;

/// An admitted upload, ready to be written
#[derive(Debug, Clone)]
pub struct Allocation {
    pub handle: String,
    pub content_hash: String,
    pub body: Bytes,
}

/// Derives handles for uploads with the deployment's fixed strategy
pub struct HandleAllocator {
    strategy: HandleStrategy,
    tokens: TimeTokens,
}

impl HandleAllocator {
    pub fn new(strategy: HandleStrategy) -> Self {
        Self {
            strategy,
            tokens: TimeTokens::new(),
        }
    }

    pub fn strategy(&self) -> HandleStrategy {
        self.strategy
    }

    /// Spool, hash and admit an upload.
    ///
    /// Fails with `TooLarge` when the declared or actual length passes the
    /// ceiling, `Blacklisted` when the digest is banned, and an I/O error
    /// when the source stream breaks.
    pub async fn allocate<S, E>(
        &self,
        source: S,
        limit: &UploadLimit,
        index: &dyn MetadataIndex,
    ) -> Result<Allocation, RelayError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        limit.check_declared()?;

        let (body, digest) = spool(source, limit).await?;

        let content_hash = encode_content_hash(&digest);
        let handle = match self.strategy {
            HandleStrategy::Content => content_handle(&digest),
            HandleStrategy::Time => self.tokens.next_handle(),
        };
        validate_handle(&handle)?;

        if let Some(entry) = index.find_blacklisted(&content_hash)? {
            info!(
                content_hash = %content_hash,
                banned_at = %entry.banned_at,
                "Rejected blacklisted upload"
            );
            return Err(RelayError::Blacklisted);
        }

        debug!(handle = %handle, size = body.len(), "Allocated handle");
        Ok(Allocation {
            handle,
            content_hash,
            body,
        })
    }
}

async fn spool<S, E>(mut source: S, limit: &UploadLimit) -> Result<(Bytes, [u8; 32]), RelayError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let mut buf = BytesMut::with_capacity(limit.bound().min(SPOOL_CAPACITY) as usize);
    let mut hasher = Sha256::new();

    while let Some(chunk) = source.next().await {
        let chunk = chunk.map_err(stream_error)?;
        limit.check_total((buf.len() + chunk.len()) as u64)?;
        hasher.update(&chunk);
        buf.extend_from_slice(&chunk);
    }

    Ok((buf.freeze(), hasher.finalize().into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::SledIndex;
    use chrono::Utc;
    use futures_util::stream;

    fn body(parts: Vec<&'static [u8]>) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Unpin {
        stream::iter(parts.into_iter().map(|p| Ok(Bytes::from_static(p))).collect::<Vec<_>>())
    }

    #[tokio::test]
    async fn test_content_handles_are_idempotent() {
        let index = SledIndex::temporary().unwrap();
        let allocator = HandleAllocator::new(HandleStrategy::Content);
        let limit = UploadLimit::new(1024, None);

        let a = allocator.allocate(body(vec![b"same ", b"content"]), &limit, &index).await.unwrap();
        let b = allocator.allocate(body(vec![b"same content"]), &limit, &index).await.unwrap();

        assert_eq!(a.handle, b.handle);
        assert_eq!(a.content_hash, b.content_hash);
        assert_eq!(&a.body[..], b"same content");
    }

    #[tokio::test]
    async fn test_time_handles_are_distinct_but_hash_matches() {
        let index = SledIndex::temporary().unwrap();
        let allocator = HandleAllocator::new(HandleStrategy::Time);
        let limit = UploadLimit::new(1024, None);

        let a = allocator.allocate(body(vec![b"same"]), &limit, &index).await.unwrap();
        let b = allocator.allocate(body(vec![b"same"]), &limit, &index).await.unwrap();

        assert_ne!(a.handle, b.handle);
        assert_eq!(a.content_hash, b.content_hash);
    }

    #[tokio::test]
    async fn test_blacklisted_digest_rejected() {
        let index = SledIndex::temporary().unwrap();
        let banned = encode_content_hash(&Sha256::digest(b"forbidden"));
        index.ban(&banned, Utc::now()).unwrap();

        let allocator = HandleAllocator::new(HandleStrategy::Content);
        let result = allocator
            .allocate(body(vec![b"forbidden"]), &UploadLimit::new(1024, None), &index)
            .await;

        assert!(matches!(result, Err(RelayError::Blacklisted)));
    }

    #[tokio::test]
    async fn test_spool_enforces_ceiling() {
        let index = SledIndex::temporary().unwrap();
        let allocator = HandleAllocator::new(HandleStrategy::Content);

        let result = allocator
            .allocate(body(vec![b"12345", b"67890"]), &UploadLimit::new(8, None), &index)
            .await;

        assert!(matches!(result, Err(RelayError::TooLarge { limit: 8 })));
    }

    #[tokio::test]
    async fn test_read_error_is_not_an_empty_hash() {
        let index = SledIndex::temporary().unwrap();
        let allocator = HandleAllocator::new(HandleStrategy::Content);
        let broken = stream::iter(vec![Err::<Bytes, _>(std::io::Error::other("reset"))]);

        let result = allocator
            .allocate(broken, &UploadLimit::new(8, None), &index)
            .await;

        assert!(matches!(result, Err(RelayError::Io(_))));
    }

    #[tokio::test]
    async fn test_empty_upload_admitted() {
        let index = SledIndex::temporary().unwrap();
        let allocator = HandleAllocator::new(HandleStrategy::Content);

        let allocation = allocator
            .allocate(body(vec![]), &UploadLimit::new(8, None), &index)
            .await
            .unwrap();

        assert!(allocation.body.is_empty());
        assert_eq!(allocation.content_hash, encode_content_hash(&Sha256::digest(b"")));
    }
}
