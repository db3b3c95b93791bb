use crate::deletion::{
    DeletionPipeline, DeletionTask, ShortenerTask, ShortenerTaskKind, DEFAULT_BATCH_SIZE,
};
use crate::error::SnapshotError;
use crate::validate::validate_url;
use serde::{Deserialize, Serialize};
use snip_core::{CancellationToken, ReadRepository, Repository, ShortCode, ShortenerError, UrlRecord};
use snip_generator::Generator;
use snip_storage::Backup;
use snip_worker::{EngineError, TaskEngine};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";

#[derive(Debug, Clone, TypedBuilder)]
pub struct ServiceSettings {
    /// Prefix of every short URL handed out.
    #[builder(default = DEFAULT_BASE_URL.to_string(), setter(into))]
    pub base_url: String,
    #[builder(default = DEFAULT_BATCH_SIZE)]
    pub delete_batch_size: usize,
    /// Batches of one deletion applied at once. Defaults to the engine's
    /// worker count.
    #[builder(default, setter(strip_option))]
    pub delete_concurrency: Option<usize>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchShortenRequest {
    pub correlation_id: String,
    pub original_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchShortenResult {
    pub correlation_id: String,
    pub short_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserUrl {
    pub short_url: String,
    pub original_url: String,
}

/// The URL shortening service.
///
/// Owns the repository and generator, and registers the deletion handler on
/// the shared task engine when constructed.
pub struct UrlService<R, G> {
    repository: Arc<R>,
    generator: Arc<G>,
    engine: Arc<TaskEngine<ShortenerTask>>,
    base_url: String,
}

impl<R: Repository, G: Generator> UrlService<R, G> {
    pub fn new(
        repository: R,
        generator: G,
        engine: Arc<TaskEngine<ShortenerTask>>,
        settings: ServiceSettings,
    ) -> Self {
        let repository = Arc::new(repository);

        let concurrency = settings
            .delete_concurrency
            .unwrap_or_else(|| engine.workers());
        let pipeline = DeletionPipeline::new(Arc::clone(&repository))
            .with_batch_size(settings.delete_batch_size)
            .with_concurrency(concurrency);
        engine.register_handler(ShortenerTaskKind::DeleteUrls, pipeline);

        Self {
            repository,
            generator: Arc::new(generator),
            engine,
            base_url: settings.base_url,
        }
    }

    pub fn engine(&self) -> &Arc<TaskEngine<ShortenerTask>> {
        &self.engine
    }

    /// Shortens `original_url` for `owner_id` and returns the short URL.
    ///
    /// A URL that was shortened before yields [`ShortenerError::Conflict`]
    /// carrying the existing short URL.
    pub async fn shorten(
        &self,
        owner_id: &str,
        original_url: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ShortenerError> {
        if let Err(err) = validate_url(original_url) {
            warn!(url = %original_url, error = %err, "rejected url");
            return Err(err);
        }

        let record = UrlRecord::new(self.generator.generate(), original_url, owner_id);
        let inserted = self.repository.insert(record, cancel).await?;
        let short_url = inserted.record().code.to_url(&self.base_url);

        if inserted.is_existing() {
            info!(url = %original_url, %short_url, "url already shortened");
            return Err(ShortenerError::Conflict { short_url });
        }

        info!(owner = %owner_id, url = %original_url, %short_url, "shortened url");
        Ok(short_url)
    }

    /// Shortens every valid item in one store batch.
    ///
    /// Invalid items are skipped and absent from the result. Each result
    /// carries the short URL actually stored, which for a known URL is the
    /// existing one.
    pub async fn shorten_batch(
        &self,
        owner_id: &str,
        items: Vec<BatchShortenRequest>,
        cancel: &CancellationToken,
    ) -> Result<Vec<BatchShortenResult>, ShortenerError> {
        let mut correlation_ids = Vec::with_capacity(items.len());
        let mut records = Vec::with_capacity(items.len());

        for item in items {
            if let Err(err) = validate_url(&item.original_url) {
                warn!(correlation_id = %item.correlation_id, error = %err, "skipping invalid url");
                continue;
            }
            records.push(UrlRecord::new(
                self.generator.generate(),
                item.original_url,
                owner_id,
            ));
            correlation_ids.push(item.correlation_id);
        }

        if records.is_empty() {
            return Ok(Vec::new());
        }

        let stored = self.repository.insert_list(records, cancel).await?;
        debug!(owner = %owner_id, stored = stored.len(), "shortened batch");

        Ok(correlation_ids
            .into_iter()
            .zip(stored)
            .map(|(correlation_id, record)| BatchShortenResult {
                correlation_id,
                short_url: record.code.to_url(&self.base_url),
            })
            .collect())
    }

    /// Resolves a short code to its original URL.
    pub async fn get_original(
        &self,
        code: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ShortenerError> {
        let code = ShortCode::new(code)?;

        let record = self
            .repository
            .find_by_code(&code, cancel)
            .await?
            .ok_or_else(|| ShortenerError::NotFound(code.to_string()))?;

        if record.deleted {
            debug!(%code, "short code is deleted");
            return Err(ShortenerError::Deleted(code.to_string()));
        }

        Ok(record.original_url)
    }

    /// Every URL `owner_id` has shortened, deleted ones included.
    pub async fn get_user_urls(
        &self,
        owner_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<UserUrl>, ShortenerError> {
        let records = self.repository.find_by_owner(owner_id, cancel).await?;

        Ok(records
            .into_iter()
            .map(|record| UserUrl {
                short_url: record.code.to_url(&self.base_url),
                original_url: record.original_url,
            })
            .collect())
    }

    /// Schedules soft deletion of `codes` owned by `owner_id`.
    ///
    /// Returns once the task is queued; the deletion itself happens later.
    pub async fn delete_user_urls(
        &self,
        owner_id: &str,
        codes: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), ShortenerError> {
        let codes: Vec<ShortCode> = codes
            .iter()
            .filter_map(|raw| match ShortCode::new(raw.as_str()) {
                Ok(code) => Some(code),
                Err(_) => {
                    debug!(code = %raw, "ignoring malformed short code");
                    None
                }
            })
            .collect();

        if codes.is_empty() {
            return Ok(());
        }

        let count = codes.len();
        let task = ShortenerTask::DeleteUrls(DeletionTask {
            owner_id: owner_id.to_string(),
            codes,
        });

        self.engine
            .enqueue(task, cancel)
            .await
            .map_err(|err| match err {
                EngineError::Cancelled => ShortenerError::Cancelled,
                other => ShortenerError::Task(other.to_string()),
            })?;

        info!(owner = %owner_id, codes = count, "queued deletion task");
        Ok(())
    }

    /// Record and owner counts, keyed `urls` and `users`.
    pub async fn stats(
        &self,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, u64>, ShortenerError> {
        let urls = self.repository.count_urls(cancel).await?;
        let users = self.repository.count_users(cancel).await?;

        Ok(BTreeMap::from([
            ("urls".to_string(), urls),
            ("users".to_string(), users),
        ]))
    }

    pub async fn ping(&self, cancel: &CancellationToken) -> Result<(), ShortenerError> {
        self.repository.ping(cancel).await?;
        Ok(())
    }

    /// Restores saved mappings as ownerless records and returns how many
    /// were new. Entries that fail to insert are logged and skipped.
    pub async fn load_snapshot<B>(
        &self,
        backup: &B,
        cancel: &CancellationToken,
    ) -> Result<usize, SnapshotError>
    where
        B: Backup + ?Sized,
    {
        let data = backup.load().await?;
        let mut restored = 0;

        for (code, original_url) in data {
            let code = match ShortCode::new(code.as_str()) {
                Ok(code) => code,
                Err(err) => {
                    warn!(%code, error = %err, "skipping snapshot entry");
                    continue;
                }
            };

            match self
                .repository
                .insert(UrlRecord::new(code, original_url, ""), cancel)
                .await
            {
                Ok(inserted) if inserted.is_existing() => {}
                Ok(_) => restored += 1,
                Err(err) => {
                    let err = ShortenerError::from(err);
                    if err == ShortenerError::Cancelled {
                        return Err(err.into());
                    }
                    warn!(error = %err, "failed to restore snapshot entry");
                }
            }
        }

        info!(restored, "loaded snapshot");
        Ok(restored)
    }

    /// Writes every stored mapping to `backup` and returns how many.
    pub async fn save_snapshot<B>(
        &self,
        backup: &B,
        cancel: &CancellationToken,
    ) -> Result<usize, SnapshotError>
    where
        B: Backup + ?Sized,
    {
        let records = self
            .repository
            .list(cancel)
            .await
            .map_err(ShortenerError::from)?;

        let data: BTreeMap<String, String> = records
            .into_iter()
            .map(|record| (record.code.to_string(), record.original_url))
            .collect();

        backup.save(&data).await?;
        info!(saved = data.len(), "saved snapshot");
        Ok(data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use snip_core::repository::Result as StoreResult;
    use snip_core::Inserted;
    use snip_generator::SeqGenerator;
    use snip_storage::{FileBackup, InMemoryRepository};
    use snip_worker::EngineSettings;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    const BASE: &str = "http://localhost:8080";

    fn test_service() -> UrlService<InMemoryRepository, SeqGenerator> {
        let engine = Arc::new(TaskEngine::new(
            EngineSettings::builder().workers(2).queue_size(8).build(),
        ));
        UrlService::new(
            InMemoryRepository::new(),
            SeqGenerator::with_prefix("wh"),
            engine,
            ServiceSettings::builder().base_url(BASE).build(),
        )
    }

    fn live() -> CancellationToken {
        CancellationToken::new()
    }

    fn request(correlation_id: &str, original_url: &str) -> BatchShortenRequest {
        BatchShortenRequest {
            correlation_id: correlation_id.to_string(),
            original_url: original_url.to_string(),
        }
    }

    #[tokio::test]
    async fn shorten_returns_short_url() {
        let service = test_service();

        let short_url = service
            .shorten("u1", "http://example.com", &live())
            .await
            .unwrap();
        assert_eq!(short_url, format!("{BASE}/wh000000"));
    }

    #[tokio::test]
    async fn shorten_twice_conflicts_with_existing_url() {
        let service = test_service();

        let first = service
            .shorten("u1", "http://example.com", &live())
            .await
            .unwrap();
        let err = service
            .shorten("u1", "http://example.com", &live())
            .await
            .unwrap_err();

        assert_eq!(err, ShortenerError::Conflict { short_url: first });
    }

    #[tokio::test]
    async fn shorten_rejects_invalid_url() {
        let service = test_service();

        let err = service
            .shorten("u1", "not-a-valid-url", &live())
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(service.stats(&live()).await.unwrap()["urls"], 0);
    }

    #[tokio::test]
    async fn get_original_round_trip() {
        let service = test_service();
        service
            .shorten("u1", "http://example.com", &live())
            .await
            .unwrap();

        assert_eq!(
            service.get_original("wh000000", &live()).await.unwrap(),
            "http://example.com"
        );
    }

    #[tokio::test]
    async fn get_original_distinguishes_invalid_and_missing() {
        let service = test_service();

        assert!(matches!(
            service.get_original("short", &live()).await,
            Err(ShortenerError::InvalidShortCode(_))
        ));
        assert!(matches!(
            service.get_original("nope-!!!", &live()).await,
            Err(ShortenerError::InvalidShortCode(_))
        ));
        assert_eq!(
            service.get_original("AbCdEfGh", &live()).await,
            Err(ShortenerError::NotFound("AbCdEfGh".to_string()))
        );
    }

    #[tokio::test]
    async fn shorten_batch_skips_invalid_items() {
        let service = test_service();

        let results = service
            .shorten_batch(
                "u1",
                vec![request("1", "not a url"), request("2", "https://b.example")],
                &live(),
            )
            .await
            .unwrap();

        assert_eq!(
            results,
            vec![BatchShortenResult {
                correlation_id: "2".to_string(),
                short_url: format!("{BASE}/wh000000"),
            }]
        );
    }

    #[tokio::test]
    async fn shorten_batch_reports_stored_code_for_known_url() {
        let service = test_service();
        let existing = service
            .shorten("u1", "https://a.example", &live())
            .await
            .unwrap();

        let results = service
            .shorten_batch(
                "u1",
                vec![request("x", "https://a.example"), request("y", "https://c.example")],
                &live(),
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].correlation_id, "x");
        assert_eq!(results[0].short_url, existing);
        assert_eq!(results[1].correlation_id, "y");
        assert_ne!(results[1].short_url, existing);
    }

    #[tokio::test]
    async fn shorten_batch_with_nothing_valid_is_empty() {
        let service = test_service();
        let results = service
            .shorten_batch("u1", vec![request("1", "ftp://x.example")], &live())
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn get_user_urls_lists_owned_urls() {
        let service = test_service();
        assert!(service.get_user_urls("u1", &live()).await.unwrap().is_empty());

        service
            .shorten("u1", "https://a.example", &live())
            .await
            .unwrap();
        service
            .shorten("u2", "https://b.example", &live())
            .await
            .unwrap();

        assert_eq!(
            service.get_user_urls("u1", &live()).await.unwrap(),
            vec![UserUrl {
                short_url: format!("{BASE}/wh000000"),
                original_url: "https://a.example".to_string(),
            }]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delete_user_urls_eventually_tombstones() {
        let service = test_service();
        service
            .shorten("u1", "http://example.com", &live())
            .await
            .unwrap();

        service
            .delete_user_urls("u1", &["wh000000".to_string()], &live())
            .await
            .unwrap();

        awaitility::at_most(Duration::from_secs(2))
            .poll_interval(Duration::from_millis(10))
            .until_async(|| async {
                matches!(
                    service.get_original("wh000000", &live()).await,
                    Err(ShortenerError::Deleted(_))
                )
            })
            .await;

        // The row is still there, only flagged.
        let stats = service.stats(&live()).await.unwrap();
        assert_eq!(stats["urls"], 1);
        assert_eq!(stats["users"], 1);
    }

    /// Holds every delete for a moment and records the most seen at once.
    struct SlowDeletes {
        inner: InMemoryRepository,
        in_flight: AtomicUsize,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ReadRepository for SlowDeletes {
        async fn find_by_code(
            &self,
            code: &ShortCode,
            cancel: &CancellationToken,
        ) -> StoreResult<Option<UrlRecord>> {
            self.inner.find_by_code(code, cancel).await
        }

        async fn find_by_owner(
            &self,
            owner_id: &str,
            cancel: &CancellationToken,
        ) -> StoreResult<Vec<UrlRecord>> {
            self.inner.find_by_owner(owner_id, cancel).await
        }

        async fn list(&self, cancel: &CancellationToken) -> StoreResult<Vec<UrlRecord>> {
            self.inner.list(cancel).await
        }

        async fn ping(&self, cancel: &CancellationToken) -> StoreResult<()> {
            self.inner.ping(cancel).await
        }

        async fn count_urls(&self, cancel: &CancellationToken) -> StoreResult<u64> {
            self.inner.count_urls(cancel).await
        }

        async fn count_users(&self, cancel: &CancellationToken) -> StoreResult<u64> {
            self.inner.count_users(cancel).await
        }
    }

    #[async_trait]
    impl Repository for SlowDeletes {
        async fn insert(&self, record: UrlRecord, cancel: &CancellationToken) -> StoreResult<Inserted> {
            self.inner.insert(record, cancel).await
        }

        async fn insert_list(
            &self,
            records: Vec<UrlRecord>,
            cancel: &CancellationToken,
        ) -> StoreResult<Vec<UrlRecord>> {
            self.inner.insert_list(records, cancel).await
        }

        async fn delete_by_owner_and_codes(
            &self,
            owner_id: &str,
            codes: &[ShortCode],
            cancel: &CancellationToken,
        ) -> StoreResult<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            let result = self.inner.delete_by_owner_and_codes(owner_id, codes, cancel).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    #[tokio::test]
    async fn delete_batches_run_up_to_the_worker_count() {
        let peak = Arc::new(AtomicUsize::new(0));
        let engine = Arc::new(TaskEngine::new(
            EngineSettings::builder().workers(3).queue_size(8).build(),
        ));
        let service = UrlService::new(
            SlowDeletes {
                inner: InMemoryRepository::new(),
                in_flight: AtomicUsize::new(0),
                peak: Arc::clone(&peak),
            },
            SeqGenerator::with_prefix("wh"),
            engine,
            ServiceSettings::builder()
                .base_url(BASE)
                .delete_batch_size(1)
                .build(),
        );

        let mut codes = Vec::new();
        for i in 0..9 {
            let short_url = service
                .shorten("u1", &format!("https://site{i}.example"), &live())
                .await
                .unwrap();
            codes.push(short_url.rsplit('/').next().unwrap().to_string());
        }

        service.delete_user_urls("u1", &codes, &live()).await.unwrap();
        service.engine().shutdown().await;

        assert_eq!(service.engine().monitor().errors, 0);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        for code in &codes {
            assert!(matches!(
                service.get_original(code, &live()).await,
                Err(ShortenerError::Deleted(_))
            ));
        }
    }

    #[tokio::test]
    async fn delete_user_urls_leaves_other_owners_alone() {
        let service = test_service();
        service
            .shorten("bob", "https://bob.example", &live())
            .await
            .unwrap();

        service
            .delete_user_urls("alice", &["wh000000".to_string()], &live())
            .await
            .unwrap();
        service.engine().shutdown().await;

        assert_eq!(service.engine().monitor().processed, 1);
        assert_eq!(
            service.get_original("wh000000", &live()).await.unwrap(),
            "https://bob.example"
        );
    }

    #[tokio::test]
    async fn delete_user_urls_with_no_codes_is_a_no_op() {
        let service = test_service();

        service.delete_user_urls("u1", &[], &live()).await.unwrap();
        service
            .delete_user_urls("u1", &["bad".to_string()], &live())
            .await
            .unwrap();
        service.engine().shutdown().await;

        assert_eq!(service.engine().monitor().processed, 0);
    }

    #[tokio::test]
    async fn delete_after_engine_shutdown_fails() {
        let service = test_service();
        service.engine().shutdown().await;

        let err = service
            .delete_user_urls("u1", &["wh000000".to_string()], &live())
            .await
            .unwrap_err();
        assert!(matches!(err, ShortenerError::Task(_)));
    }

    #[tokio::test]
    async fn stats_counts_urls_and_users() {
        let service = test_service();
        service
            .shorten("u1", "https://a.example", &live())
            .await
            .unwrap();
        service
            .shorten("u1", "https://b.example", &live())
            .await
            .unwrap();
        service
            .shorten("u2", "https://c.example", &live())
            .await
            .unwrap();

        let stats = service.stats(&live()).await.unwrap();
        assert_eq!(
            stats,
            BTreeMap::from([("urls".to_string(), 3), ("users".to_string(), 2)])
        );
    }

    #[tokio::test]
    async fn cancelled_token_surfaces_as_cancelled() {
        let service = test_service();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(
            service.shorten("u1", "https://a.example", &cancel).await,
            Err(ShortenerError::Cancelled)
        );
        assert_eq!(service.ping(&cancel).await, Err(ShortenerError::Cancelled));
        assert!(service.ping(&live()).await.is_ok());
    }

    #[tokio::test]
    async fn snapshot_survives_a_restart() {
        let dir = TempDir::new().unwrap();
        let backup = FileBackup::new(dir.path().join("storage.txt"));

        let before = test_service();
        before
            .shorten("u1", "https://a.example", &live())
            .await
            .unwrap();
        before
            .shorten("u1", "https://b.example", &live())
            .await
            .unwrap();
        assert_eq!(before.save_snapshot(&backup, &live()).await.unwrap(), 2);

        let after = test_service();
        assert_eq!(after.load_snapshot(&backup, &live()).await.unwrap(), 2);
        assert_eq!(
            after.get_original("wh000001", &live()).await.unwrap(),
            "https://b.example"
        );

        // Restored records have no owner.
        let stats = after.stats(&live()).await.unwrap();
        assert_eq!(stats["urls"], 2);
        assert_eq!(stats["users"], 0);
    }
}
