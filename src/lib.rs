//! relay-storage - Ephemeral file relay
//!
//! Accepts anonymous uploads, hands back a retrieval URL, and forgets the
//! file once its retention window lapses.
//!
//! ## Architecture
//!
//! - **Allocator**: spools and hashes an upload, derives its handle, checks the blacklist
//! - **Writer**: stages bytes under a ceiling and renames them into the storage root
//! - **Index**: records handles, upload times and banned hashes (sled or SQLite)
//! - **Sweeper**: deletes expired files and records on an interval
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/relay-storage/
//! ├── files/                 # One regular file per handle
//! ├── incoming/              # {uuid}.partial while an upload is in flight
//! ├── index.sled/            # Metadata index (or index.db with SQLite)
//! └── config.toml            # Configuration
//! ```

pub mod allocator;
pub mod config;
pub mod engine;
pub mod error;
pub mod handle;
pub mod http;
pub mod index;
pub mod response;
pub mod sniff;
pub mod sweeper;
pub mod writer;

// Re-exports
pub use config::{Config, HandleStrategy, IndexBackend};
pub use engine::{Download, ExpiredFile, RelayStore, StoreLimits, UploadMeta};
pub use error::RelayError;
pub use http::HttpServer;
pub use index::{BlacklistEntry, MetadataIndex, SledIndex, SqliteIndex, StoredObject};
pub use sweeper::{RetentionSweeper, SweepReport, SweeperState};
