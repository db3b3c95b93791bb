pub mod backup;
pub mod memory;
pub mod mysql;

pub use backup::{Backup, BackupError, FileBackup, SnapshotEntry};
pub use memory::InMemoryRepository;
pub use mysql::MySqlRepository;
pub use snip_core::repository::{Inserted, ReadRepository, Repository, UrlRecord};
pub use snip_core::StorageError;

/// How many times a colliding short code is re-rolled before giving up.
pub const MAX_REROLL_ATTEMPTS: usize = 16;
