//! sled-backed metadata index
//!
//! Trees:
//! - `objects`: handle -> StoredObject (MessagePack)
//! - `by_upload_time`: be_u64(uploaded_at millis) ++ handle -> ()
//! - `blacklist`: content hash -> BlacklistEntry (MessagePack)
//!
//! The time tree makes `find_expired` a prefix range scan instead of a full
//! table walk.

use chrono::{DateTime, SubsecRound, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use std::path::Path;
use tracing::{info, warn};

use super::{BlacklistEntry, MetadataIndex, StoredObject};
use crate::error::RelayError;

/// Metadata index backed by sled
pub struct SledIndex {
    db: Db,
    objects: Tree,
    by_time: Tree,
    blacklist: Tree,
}

impl SledIndex {
    /// Open or create the index database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RelayError> {
        let db = sled::open(path.as_ref())?;
        let index = Self::from_db(db)?;
        info!(path = %path.as_ref().display(), "Opened metadata index");
        Ok(index)
    }

    /// Temporary index that is removed on drop (for tests)
    pub fn temporary() -> Result<Self, RelayError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self, RelayError> {
        let objects = db.open_tree("objects")?;
        let by_time = db.open_tree("by_upload_time")?;
        let blacklist = db.open_tree("blacklist")?;
        Ok(Self {
            db,
            objects,
            by_time,
            blacklist,
        })
    }
}

fn millis_key(at: &DateTime<Utc>) -> [u8; 8] {
    (at.timestamp_millis().max(0) as u64).to_be_bytes()
}

fn time_key(at: &DateTime<Utc>, handle: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + handle.len());
    key.extend_from_slice(&millis_key(at));
    key.extend_from_slice(handle.as_bytes());
    key
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, RelayError> {
    rmp_serde::to_vec(value).map_err(|e| RelayError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RelayError> {
    rmp_serde::from_slice(bytes).map_err(|e| RelayError::Serialization(e.to_string()))
}

fn tx_error(e: TransactionError<()>) -> RelayError {
    match e {
        TransactionError::Abort(()) => RelayError::Internal("index transaction aborted".into()),
        TransactionError::Storage(e) => e.into(),
    }
}

impl MetadataIndex for SledIndex {
    fn insert(&self, object: &StoredObject) -> Result<(), RelayError> {
        let value = encode(object)?;
        let handle = object.handle.as_bytes();
        let time_key = time_key(&object.uploaded_at, &object.handle);

        let result = (&self.objects, &self.by_time).transaction(|(objects, by_time)| {
            if objects.get(handle)?.is_some() {
                return Err(ConflictableTransactionError::Abort(()));
            }
            objects.insert(handle, value.as_slice())?;
            by_time.insert(time_key.as_slice(), &[] as &[u8])?;
            Ok(())
        });

        match result {
            Ok(()) => Ok(()),
            Err(TransactionError::Abort(())) => {
                Err(RelayError::AlreadyExists(object.handle.clone()))
            }
            Err(e) => Err(tx_error(e)),
        }
    }

    fn get(&self, handle: &str) -> Result<Option<StoredObject>, RelayError> {
        match self.objects.get(handle.as_bytes())? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    fn find_blacklisted(&self, content_hash: &str) -> Result<Option<BlacklistEntry>, RelayError> {
        match self.blacklist.get(content_hash.as_bytes())? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    fn find_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<StoredObject>, RelayError> {
        let mut expired = Vec::new();
        for item in self.by_time.range(..millis_key(&cutoff).to_vec()) {
            let (key, _) = item?;
            let handle = String::from_utf8_lossy(&key[8..]).into_owned();
            match self.get(&handle)? {
                Some(object) => expired.push(object),
                None => warn!(handle = %handle, "Time index entry without record"),
            }
        }
        Ok(expired)
    }

    fn delete_many(&self, handles: &[String]) -> Result<usize, RelayError> {
        if handles.is_empty() {
            return Ok(0);
        }

        (&self.objects, &self.by_time)
            .transaction(|(objects, by_time)| {
                let mut removed = 0usize;
                for handle in handles {
                    if let Some(value) = objects.remove(handle.as_bytes())? {
                        removed += 1;
                        if let Ok(object) = rmp_serde::from_slice::<StoredObject>(&value) {
                            by_time.remove(time_key(&object.uploaded_at, handle))?;
                        }
                    }
                }
                Ok::<_, ConflictableTransactionError<()>>(removed)
            })
            .map_err(tx_error)
    }

    fn delete_expired(&self, snapshot: &[StoredObject]) -> Result<usize, RelayError> {
        if snapshot.is_empty() {
            return Ok(0);
        }

        (&self.objects, &self.by_time)
            .transaction(|(objects, by_time)| {
                let mut removed = 0usize;
                for expired in snapshot {
                    let handle = expired.handle.as_bytes();
                    let Some(value) = objects.get(handle)? else {
                        continue;
                    };
                    let current = match rmp_serde::from_slice::<StoredObject>(&value) {
                        Ok(current) => current,
                        Err(_) => continue,
                    };
                    if current.uploaded_at != expired.uploaded_at {
                        continue;
                    }
                    objects.remove(handle)?;
                    by_time.remove(time_key(&current.uploaded_at, &current.handle))?;
                    removed += 1;
                }
                Ok::<_, ConflictableTransactionError<()>>(removed)
            })
            .map_err(tx_error)
    }

    fn ban(&self, content_hash: &str, at: DateTime<Utc>) -> Result<BlacklistEntry, RelayError> {
        if let Some(existing) = self.find_blacklisted(content_hash)? {
            return Ok(existing);
        }
        let entry = BlacklistEntry {
            content_hash: content_hash.to_string(),
            banned_at: at.trunc_subsecs(3),
        };
        self.blacklist.insert(content_hash.as_bytes(), encode(&entry)?)?;
        Ok(entry)
    }

    fn unban(&self, content_hash: &str) -> Result<bool, RelayError> {
        Ok(self.blacklist.remove(content_hash.as_bytes())?.is_some())
    }

    fn count(&self) -> Result<u64, RelayError> {
        Ok(self.objects.len() as u64)
    }

    fn flush(&self) -> Result<(), RelayError> {
        self.db.flush()?;
        Ok(())
    }
}
