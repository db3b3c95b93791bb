use crate::error::StorageError;
use crate::shortcode::ShortCode;
use async_trait::async_trait;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// A stored URL record in the repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlRecord {
    /// Backend-assigned row identifier, if the backend has one.
    pub id: Option<i64>,
    /// The public short code. Unique forever, even after soft deletion.
    pub code: ShortCode,
    /// The original URL that was shortened.
    pub original_url: String,
    /// Owner of the mapping. Empty for ownerless records.
    pub owner_id: String,
    /// When the record was first stored.
    pub created_at: Timestamp,
    /// Tombstone flag set by soft deletion.
    pub deleted: bool,
}

impl UrlRecord {
    /// Creates a fresh, not-yet-stored record proposing `code`.
    pub fn new(code: ShortCode, original_url: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            id: None,
            code,
            original_url: original_url.into(),
            owner_id: owner_id.into(),
            created_at: Timestamp::now(),
            deleted: false,
        }
    }
}

/// Outcome of [`Repository::insert`].
#[derive(Debug, Clone, PartialEq)]
pub enum Inserted {
    /// A new record was stored, possibly under a re-rolled code.
    Created(UrlRecord),
    /// The original URL was already known; this is the stored record.
    Existing(UrlRecord),
}

impl Inserted {
    pub fn record(&self) -> &UrlRecord {
        match self {
            Self::Created(record) | Self::Existing(record) => record,
        }
    }

    pub fn into_record(self) -> UrlRecord {
        match self {
            Self::Created(record) | Self::Existing(record) => record,
        }
    }

    pub fn is_existing(&self) -> bool {
        matches!(self, Self::Existing(_))
    }
}

/// A read-only view of a repository.
///
/// Every method checks `cancel` on entry and fails with
/// [`StorageError::Cancelled`] if it already fired.
#[async_trait]
pub trait ReadRepository: Send + Sync + 'static {
    /// Retrieves the record for a given short code, including tombstoned ones.
    /// Returns `None` if the code does not exist.
    async fn find_by_code(
        &self,
        code: &ShortCode,
        cancel: &CancellationToken,
    ) -> Result<Option<UrlRecord>>;

    /// Retrieves every record created by `owner_id`. Empty when there are none.
    async fn find_by_owner(
        &self,
        owner_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<UrlRecord>>;

    /// Retrieves all records, used for snapshotting.
    async fn list(&self, cancel: &CancellationToken) -> Result<Vec<UrlRecord>>;

    /// Liveness check.
    async fn ping(&self, cancel: &CancellationToken) -> Result<()>;

    /// Total number of stored records, tombstoned ones included.
    async fn count_urls(&self, cancel: &CancellationToken) -> Result<u64>;

    /// Number of distinct non-empty owner ids.
    async fn count_users(&self, cancel: &CancellationToken) -> Result<u64>;
}

#[async_trait]
pub trait Repository: ReadRepository {
    /// Stores a record, deduplicating on `original_url`.
    ///
    /// If the original URL is already known the existing record is returned
    /// unchanged as [`Inserted::Existing`]. Otherwise the record is stored
    /// under its proposed code, re-rolled on collision.
    async fn insert(&self, record: UrlRecord, cancel: &CancellationToken) -> Result<Inserted>;

    /// Applies [`Repository::insert`] to every record as one logical batch.
    async fn insert_list(
        &self,
        records: Vec<UrlRecord>,
        cancel: &CancellationToken,
    ) -> Result<Vec<UrlRecord>>;

    /// Sets the tombstone on every listed code owned by `owner_id`.
    /// Codes owned by someone else, or unknown codes, are skipped.
    async fn delete_by_owner_and_codes(
        &self,
        owner_id: &str,
        codes: &[ShortCode],
        cancel: &CancellationToken,
    ) -> Result<()>;
}
