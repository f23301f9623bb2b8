//! Handle derivation and validation
//!
//! A handle is both the public retrieval key and the filename of the stored
//! bytes, so every handle that reaches the filesystem passes through
//! [`validate_handle`] first.
//!
//! Two derivations exist:
//!
//! - **content**: URL-safe base64 (no padding) of the full SHA-256 digest,
//!   43 characters. Identical uploads map to the same handle.
//! - **time**: lowercase hex of a strictly increasing nanosecond token.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::RelayError;

/// Longest handle accepted from clients
pub const MAX_HANDLE_LEN: usize = 128;

/// Check that `handle` is safe to use as a filename directly under the
/// storage root.
///
/// Accepts 1..=128 characters from `[A-Za-z0-9_-]` and nothing else. This
/// excludes path separators, `.`/`..`, NUL and whitespace, so a valid handle
/// can never name anything outside the storage root. Returns the handle
/// unchanged on success.
pub fn validate_handle(handle: &str) -> Result<&str, RelayError> {
    if handle.is_empty() {
        return Err(RelayError::InvalidHandle("empty handle".into()));
    }
    if handle.len() > MAX_HANDLE_LEN {
        return Err(RelayError::InvalidHandle(format!(
            "handle longer than {} characters",
            MAX_HANDLE_LEN
        )));
    }
    if let Some(c) = handle
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(RelayError::InvalidHandle(format!(
            "unsupported character {:?}",
            c
        )));
    }
    Ok(handle)
}

/// Content hash as recorded in the index and the blacklist
pub fn encode_content_hash(digest: &[u8]) -> String {
    STANDARD.encode(digest)
}

/// Normalize a blacklist hash given in either base64 alphabet.
///
/// Admin routes carry hashes in URL paths where `/` and `+` are awkward, so
/// the URL-safe form is accepted and mapped back to the standard alphabet.
pub fn normalize_content_hash(hash: &str) -> Result<String, RelayError> {
    let trimmed = hash.trim().trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD
        .decode(trimmed.replace('+', "-").replace('/', "_"))
        .map_err(|e| RelayError::BadRequest(format!("invalid content hash: {}", e)))?;
    if bytes.len() != 32 {
        return Err(RelayError::BadRequest(format!(
            "content hash must decode to 32 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(encode_content_hash(&bytes))
}

/// Handle for the content strategy
pub fn content_handle(digest: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(digest)
}

/// Source of time-derived handles.
///
/// Tokens follow the wall clock in nanoseconds but never repeat: when the
/// clock has not advanced past the previous token the counter is bumped
/// instead.
#[derive(Debug, Default)]
pub struct TimeTokens {
    last: AtomicU64,
}

impl TimeTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next token, hex encoded
    pub fn next_handle(&self) -> String {
        let now = Utc::now()
            .timestamp_nanos_opt()
            .map(|n| n.max(0) as u64)
            .unwrap_or(0);

        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(prev + 1);
            match self.last.compare_exchange_weak(
                prev,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return format!("{:016x}", candidate),
                Err(actual) => prev = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_validate_accepts_generated_handles() {
        let digest = Sha256::digest(b"hello");
        let handle = content_handle(&digest);
        assert_eq!(handle.len(), 43);
        assert!(validate_handle(&handle).is_ok());

        let tokens = TimeTokens::new();
        assert!(validate_handle(&tokens.next_handle()).is_ok());
    }

    #[test]
    fn test_validate_rejects_adversarial_handles() {
        let bad = [
            "",
            ".",
            "..",
            "../etc/passwd",
            "a/b",
            "a\\b",
            "/abs",
            "nul\0byte",
            "with space",
            "dot.file",
            "percent%2F",
            "ünïcode",
            "tab\t",
        ];
        for handle in bad {
            assert!(
                matches!(validate_handle(handle), Err(RelayError::InvalidHandle(_))),
                "accepted {:?}",
                handle
            );
        }

        let too_long = "a".repeat(MAX_HANDLE_LEN + 1);
        assert!(validate_handle(&too_long).is_err());
        assert!(validate_handle(&"a".repeat(MAX_HANDLE_LEN)).is_ok());
    }

    #[test]
    fn test_content_handle_is_deterministic() {
        let a = content_handle(&Sha256::digest(b"same bytes"));
        let b = content_handle(&Sha256::digest(b"same bytes"));
        let c = content_handle(&Sha256::digest(b"other bytes"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_normalize_content_hash_accepts_both_alphabets() {
        let digest = Sha256::digest(b"banned");
        let standard = encode_content_hash(&digest);
        let url_safe = content_handle(&digest);

        assert_eq!(normalize_content_hash(&standard).unwrap(), standard);
        assert_eq!(normalize_content_hash(&url_safe).unwrap(), standard);
        assert!(normalize_content_hash("not-a-hash").is_err());
        assert!(normalize_content_hash(&encode_content_hash(b"short")).is_err());
    }

    #[test]
    fn test_time_tokens_never_repeat_across_threads() {
        let tokens = Arc::new(TimeTokens::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tokens = Arc::clone(&tokens);
                std::thread::spawn(move || {
                    (0..500).map(|_| tokens.next_handle()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for token in h.join().unwrap() {
                assert!(seen.insert(token), "duplicate time token");
            }
        }
        assert_eq!(seen.len(), 8 * 500);
    }
}
