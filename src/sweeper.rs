//! Retention sweeper
//!
//! Periodically deletes objects whose records fall outside the retention
//! window. Files go first, then the records for every file that is gone, so
//! a record never outlives a successful pass while its file survives. Both
//! steps are conditional on the record still matching the expiry snapshot, so
//! a handle re-uploaded mid-pass keeps its new file and record.
//!
//! Each pass also reconciles the storage root against the index: files with
//! no record (a crash between rename and insert) and stale staging files are
//! removed once they are older than the cutoff.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::engine::{ExpiredFile, RelayStore};
use crate::error::RelayError;

/// Counts from one sweep pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Records found outside the window
    pub expired: usize,
    pub files_removed: usize,
    /// Expired records whose file was already gone
    pub files_missing: usize,
    /// Files that could not be removed; their records are kept for retry
    pub file_errors: usize,
    /// Expired records replaced by a fresh upload before removal
    pub superseded: usize,
    pub records_removed: usize,
    pub orphans_removed: usize,
    pub staging_removed: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SweeperState {
    Idle,
    Sweeping,
}

const IDLE: u8 = 0;
const SWEEPING: u8 = 1;

/// Run one pass against `store` as if the current time were `now`.
pub async fn sweep_pass(store: &RelayStore, now: DateTime<Utc>) -> SweepReport {
    let cutoff = store.cutoff(now);
    let mut report = SweepReport::default();

    let expired = match store.index().find_expired(cutoff) {
        Ok(expired) => expired,
        Err(e) => {
            error!(error = %e, "Failed to query expired objects");
            return report;
        }
    };
    report.expired = expired.len();

    let mut gone = Vec::with_capacity(expired.len());
    for object in expired {
        match store.remove_expired_file(&object, now).await {
            Ok(ExpiredFile::Removed) => {
                report.files_removed += 1;
                gone.push(object);
            }
            Ok(ExpiredFile::Missing) => {
                debug!(handle = %object.handle, "Expired file already removed");
                report.files_missing += 1;
                gone.push(object);
            }
            Ok(ExpiredFile::Superseded) => {
                debug!(handle = %object.handle, "Handle re-uploaded since the expiry query");
                report.superseded += 1;
            }
            Err(e) => {
                warn!(handle = %object.handle, error = %e, "Failed to remove expired file");
                report.file_errors += 1;
            }
        }
    }

    if !gone.is_empty() {
        match store.index().delete_expired(&gone) {
            Ok(n) => report.records_removed = n,
            Err(e) => error!(error = %e, count = gone.len(), "Failed to delete expired records"),
        }
    }

    match remove_orphans(store, cutoff).await {
        Ok(n) => report.orphans_removed = n,
        Err(e) => warn!(error = %e, "Orphan reconciliation failed"),
    }
    match remove_stale(store.writer().staging_dir(), cutoff).await {
        Ok(n) => report.staging_removed = n,
        Err(e) => warn!(error = %e, "Staging cleanup failed"),
    }

    if report.is_empty() {
        debug!("Retention sweep: nothing expired");
    } else {
        info!(
            expired = report.expired,
            files_removed = report.files_removed,
            records_removed = report.records_removed,
            file_errors = report.file_errors,
            superseded = report.superseded,
            orphans = report.orphans_removed,
            staging = report.staging_removed,
            "Retention sweep complete"
        );
    }
    report
}

fn older_than(modified: std::time::SystemTime, cutoff: DateTime<Utc>) -> bool {
    DateTime::<Utc>::from(modified) < cutoff
}

async fn remove_orphans(store: &RelayStore, cutoff: DateTime<Utc>) -> Result<usize, RelayError> {
    let mut removed = 0;
    let mut entries = fs::read_dir(store.root()).await?;
    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        if !meta.is_file() || !older_than(meta.modified()?, cutoff) {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if store.index().get(&name)?.is_some() {
            continue;
        }
        match fs::remove_file(entry.path()).await {
            Ok(()) => {
                info!(handle = %name, "Removed orphaned file");
                removed += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(handle = %name, error = %e, "Failed to remove orphaned file"),
        }
    }
    Ok(removed)
}

async fn remove_stale(dir: &Path, cutoff: DateTime<Utc>) -> Result<usize, RelayError> {
    let mut removed = 0;
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        if meta.is_file() && older_than(meta.modified()?, cutoff) {
            match fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "Failed to remove staging file")
                }
            }
        }
    }
    Ok(removed)
}

/// Background task that sweeps the store on a fixed interval
pub struct RetentionSweeper {
    store: Arc<RelayStore>,
    interval: Duration,
    state: AtomicU8,
}

impl RetentionSweeper {
    pub fn new(store: Arc<RelayStore>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            state: AtomicU8::new(IDLE),
        }
    }

    pub fn state(&self) -> SweeperState {
        match self.state.load(Ordering::Acquire) {
            SWEEPING => SweeperState::Sweeping,
            _ => SweeperState::Idle,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one pass now
    pub async fn sweep_now(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    /// Run one pass with an explicit clock
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        self.state.store(SWEEPING, Ordering::Release);
        let report = sweep_pass(&self.store, now).await;
        self.state.store(IDLE, Ordering::Release);
        report
    }

    /// Sweep every interval until a shutdown signal arrives
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.interval.as_secs(),
            retention_secs = self.store.limits().retention.num_seconds(),
            "Retention sweeper started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.sweep_now().await;
                }
                _ = shutdown.recv() => {
                    info!("Retention sweeper stopping");
                    break;
                }
            }
        }
    }
}
