use crate::MAX_REROLL_ATTEMPTS;
use async_trait::async_trait;
use jiff::Timestamp;
use snip_core::repository::{Inserted, ReadRepository, Repository, Result, UrlRecord};
use snip_core::{ensure_active, run_cancellable, CancellationToken, ShortCode, StorageError};
use snip_generator::{Generator, RandomGenerator};
use sqlx::mysql::MySqlRow;
use sqlx::{MySql, MySqlConnection, MySqlPool, QueryBuilder, Row};
use tracing::{debug, trace};

/// Table definition applied by [`MySqlRepository::ensure_schema`].
pub const SCHEMA: &str = include_str!("../ddl/mysql/short_urls.sql");

const RECORD_COLUMNS: &str = "id, short_code, original_url, owner_id, created_at, is_deleted";

/// MySQL implementation of the repository contract.
///
/// Soft delete is implemented with `is_deleted`. Rows are never removed, so
/// a short code is never reused once issued. Inserts deduplicate on
/// `original_url` and return the existing row unchanged. Every mutation runs
/// in a transaction that is rolled back if the caller's token fires.
#[derive(Debug, Clone)]
pub struct MySqlRepository<G = RandomGenerator> {
    pool: MySqlPool,
    generator: G,
}

impl MySqlRepository<RandomGenerator> {
    /// Creates a repository from an existing MySQL connection pool.
    pub fn new(pool: MySqlPool) -> Self {
        Self::with_generator(pool, RandomGenerator::default())
    }

    /// Creates a repository by opening a new MySQL connection pool.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = MySqlPool::connect(database_url)
            .await
            .map_err(map_sqlx_error)?;
        Ok(Self::new(pool))
    }
}

impl<G: Generator> MySqlRepository<G> {
    /// Creates a repository that draws replacement codes from `generator`.
    pub fn with_generator(pool: MySqlPool, generator: G) -> Self {
        Self { pool, generator }
    }

    /// Creates the `short_urls` table if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn insert_all(&self, records: Vec<UrlRecord>) -> Result<Vec<Inserted>> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let mut stored = Vec::with_capacity(records.len());
        for record in records {
            // An early return drops `tx`, which rolls the whole batch back.
            stored.push(insert_one(&mut *tx, &self.generator, record).await?);
        }
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(stored)
    }
}

/// Looks up the row for `original_url`.
///
/// A plain read inside a transaction sees the snapshot taken by its first
/// read. With `locking` set it reads the latest committed row instead, which
/// is what a retry after a unique violation needs to find a row that raced in.
async fn find_by_url(
    conn: &mut MySqlConnection,
    original_url: &str,
    locking: bool,
) -> Result<Option<UrlRecord>> {
    let lock = if locking { " FOR SHARE" } else { "" };
    let row = sqlx::query(&format!(
        "SELECT {RECORD_COLUMNS} FROM short_urls \
         WHERE original_url_hash = UNHEX(SHA2(?, 256)) AND original_url = ? \
         LIMIT 1{lock}"
    ))
    .bind(original_url)
    .bind(original_url)
    .fetch_optional(&mut *conn)
    .await
    .map_err(map_sqlx_error)?;

    row.as_ref().map(record_from_row).transpose()
}

async fn insert_one<G: Generator>(
    conn: &mut MySqlConnection,
    generator: &G,
    mut record: UrlRecord,
) -> Result<Inserted> {
    for attempt in 0..=MAX_REROLL_ATTEMPTS {
        if let Some(existing) = find_by_url(conn, &record.original_url, attempt > 0).await? {
            trace!(code = %existing.code, "original url already stored");
            return Ok(Inserted::Existing(existing));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO short_urls (short_code, original_url, owner_id, created_at, is_deleted)
            VALUES (?, ?, ?, ?, FALSE)
            "#,
        )
        .bind(record.code.as_str())
        .bind(&record.original_url)
        .bind(&record.owner_id)
        .bind(record.created_at.as_second())
        .execute(&mut *conn)
        .await;

        match result {
            Ok(done) => {
                record.id = Some(done.last_insert_id() as i64);
                record.deleted = false;
                return Ok(Inserted::Created(record));
            }
            // Either the code is taken or the url raced in. The next pass
            // re-checks the url with a locking read before a fresh code.
            Err(err) if is_unique_violation(&err) && attempt < MAX_REROLL_ATTEMPTS => {
                let rerolled = generator.generate();
                debug!(taken = %record.code, code = %rerolled, "unique violation on insert, re-rolling");
                record.code = rerolled;
            }
            Err(err) if is_unique_violation(&err) => break,
            Err(err) => return Err(map_sqlx_error(err)),
        }
    }

    Err(StorageError::Exhausted {
        attempts: MAX_REROLL_ATTEMPTS,
    })
}

fn record_from_row(row: &MySqlRow) -> Result<UrlRecord> {
    let id: i64 = row.try_get("id").map_err(map_sqlx_error)?;
    let code: String = row.try_get("short_code").map_err(map_sqlx_error)?;
    let original_url: String = row.try_get("original_url").map_err(map_sqlx_error)?;
    let owner_id: String = row.try_get("owner_id").map_err(map_sqlx_error)?;
    let created_at: i64 = row.try_get("created_at").map_err(map_sqlx_error)?;
    let deleted: bool = row.try_get("is_deleted").map_err(map_sqlx_error)?;

    let created_at = Timestamp::from_second(created_at).map_err(|e| {
        StorageError::InvalidData(format!("invalid created_at timestamp '{}': {e}", created_at))
    })?;

    Ok(UrlRecord {
        id: Some(id),
        code: ShortCode::new_unchecked(code),
        original_url,
        owner_id,
        created_at,
        deleted,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(sqlx::error::DatabaseError::is_unique_violation)
}

fn map_sqlx_error(err: sqlx::Error) -> StorageError {
    let message = err.to_string();

    match err {
        sqlx::Error::PoolTimedOut => StorageError::Timeout(message),
        sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_) => StorageError::Unavailable(message),
        sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::RowNotFound => StorageError::InvalidData(message),
        _ => StorageError::Query(message),
    }
}

fn count_from_row(row: &MySqlRow) -> Result<u64> {
    let count: i64 = row.try_get(0).map_err(map_sqlx_error)?;
    u64::try_from(count).map_err(|_| StorageError::InvalidData(format!("negative count {count}")))
}

#[async_trait]
impl<G: Generator> ReadRepository for MySqlRepository<G> {
    async fn find_by_code(
        &self,
        code: &ShortCode,
        cancel: &CancellationToken,
    ) -> Result<Option<UrlRecord>> {
        run_cancellable(cancel, async {
            let row = sqlx::query(&format!(
                "SELECT {RECORD_COLUMNS} FROM short_urls WHERE short_code = ? LIMIT 1"
            ))
            .bind(code.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

            row.as_ref().map(record_from_row).transpose()
        })
        .await
    }

    async fn find_by_owner(
        &self,
        owner_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<UrlRecord>> {
        run_cancellable(cancel, async {
            let rows = sqlx::query(&format!(
                "SELECT {RECORD_COLUMNS} FROM short_urls WHERE owner_id = ? ORDER BY id"
            ))
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

            rows.iter().map(record_from_row).collect()
        })
        .await
    }

    async fn list(&self, cancel: &CancellationToken) -> Result<Vec<UrlRecord>> {
        run_cancellable(cancel, async {
            let rows = sqlx::query(&format!(
                "SELECT {RECORD_COLUMNS} FROM short_urls ORDER BY id"
            ))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

            rows.iter().map(record_from_row).collect()
        })
        .await
    }

    async fn ping(&self, cancel: &CancellationToken) -> Result<()> {
        run_cancellable(cancel, async {
            sqlx::query("SELECT 1")
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
            Ok(())
        })
        .await
    }

    async fn count_urls(&self, cancel: &CancellationToken) -> Result<u64> {
        run_cancellable(cancel, async {
            let row = sqlx::query("SELECT COUNT(*) FROM short_urls")
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
            count_from_row(&row)
        })
        .await
    }

    async fn count_users(&self, cancel: &CancellationToken) -> Result<u64> {
        run_cancellable(cancel, async {
            let row = sqlx::query(
                "SELECT COUNT(DISTINCT owner_id) FROM short_urls WHERE owner_id <> ''",
            )
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
            count_from_row(&row)
        })
        .await
    }
}

#[async_trait]
impl<G: Generator> Repository for MySqlRepository<G> {
    async fn insert(&self, record: UrlRecord, cancel: &CancellationToken) -> Result<Inserted> {
        ensure_active(cancel)?;
        let mut stored = run_cancellable(cancel, self.insert_all(vec![record])).await?;
        stored
            .pop()
            .ok_or_else(|| StorageError::Operation("insert returned no record".to_string()))
    }

    async fn insert_list(
        &self,
        records: Vec<UrlRecord>,
        cancel: &CancellationToken,
    ) -> Result<Vec<UrlRecord>> {
        ensure_active(cancel)?;
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let stored = run_cancellable(cancel, self.insert_all(records)).await?;
        Ok(stored.into_iter().map(Inserted::into_record).collect())
    }

    async fn delete_by_owner_and_codes(
        &self,
        owner_id: &str,
        codes: &[ShortCode],
        cancel: &CancellationToken,
    ) -> Result<()> {
        ensure_active(cancel)?;
        if codes.is_empty() {
            return Ok(());
        }

        run_cancellable(cancel, async {
            let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

            let mut query = QueryBuilder::<MySql>::new(
                "UPDATE short_urls SET is_deleted = TRUE WHERE owner_id = ",
            );
            query.push_bind(owner_id);
            query.push(" AND short_code IN (");
            {
                let mut separated = query.separated(", ");
                for code in codes {
                    separated.push_bind(code.as_str());
                }
                separated.push_unseparated(")");
            }

            let result = query
                .build()
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
            tx.commit().await.map_err(map_sqlx_error)?;

            debug!(
                owner = %owner_id,
                requested = codes.len(),
                affected = result.rows_affected(),
                "marked short codes as deleted"
            );
            Ok(())
        })
        .await
    }
}
