use crate::MAX_REROLL_ATTEMPTS;
use async_trait::async_trait;
use snip_core::repository::{Inserted, ReadRepository, Repository, Result, UrlRecord};
use snip_core::{ensure_active, CancellationToken, ShortCode, StorageError};
use snip_generator::{Generator, RandomGenerator};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct State {
    /// Records keyed by short code. Tombstoned records stay here forever.
    records: HashMap<String, UrlRecord>,
    /// original_url -> short code, for dedup on insert.
    by_url: HashMap<String, String>,
    next_id: i64,
}

impl State {
    fn insert<G: Generator>(&mut self, mut record: UrlRecord, generator: &G) -> Result<Inserted> {
        if let Some(code) = self.by_url.get(&record.original_url) {
            if let Some(existing) = self.records.get(code) {
                trace!(code = %existing.code, "original url already stored");
                return Ok(Inserted::Existing(existing.clone()));
            }
        }

        let mut attempts = 0;
        while self.records.contains_key(record.code.as_str()) {
            attempts += 1;
            if attempts > MAX_REROLL_ATTEMPTS {
                return Err(StorageError::Exhausted { attempts: MAX_REROLL_ATTEMPTS });
            }
            let rerolled = generator.generate();
            debug!(taken = %record.code, code = %rerolled, "short code collision, re-rolling");
            record.code = rerolled;
        }

        self.next_id += 1;
        record.id = Some(self.next_id);
        self.by_url
            .insert(record.original_url.clone(), record.code.as_str().to_owned());
        self.records
            .insert(record.code.as_str().to_owned(), record.clone());
        Ok(Inserted::Created(record))
    }
}

/// In-memory implementation of the Repository trait.
///
/// All mutations are serialized behind the write half of a single
/// [`RwLock`]; lookups share the read half. Batch inserts are best-effort:
/// records stored before a failing one stay stored.
#[derive(Debug)]
pub struct InMemoryRepository<G = RandomGenerator> {
    state: RwLock<State>,
    generator: G,
}

impl InMemoryRepository<RandomGenerator> {
    /// Creates a new in-memory repository re-rolling with random codes.
    pub fn new() -> Self {
        Self::with_generator(RandomGenerator::default())
    }
}

impl Default for InMemoryRepository<RandomGenerator> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G: Generator> InMemoryRepository<G> {
    /// Creates a repository that draws replacement codes from `generator`.
    pub fn with_generator(generator: G) -> Self {
        Self {
            state: RwLock::new(State::default()),
            generator,
        }
    }
}

#[async_trait]
impl<G: Generator> ReadRepository for InMemoryRepository<G> {
    async fn find_by_code(
        &self,
        code: &ShortCode,
        cancel: &CancellationToken,
    ) -> Result<Option<UrlRecord>> {
        let state = self.state.read().await;
        ensure_active(cancel)?;
        Ok(state.records.get(code.as_str()).cloned())
    }

    async fn find_by_owner(
        &self,
        owner_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<UrlRecord>> {
        let state = self.state.read().await;
        ensure_active(cancel)?;
        let mut records: Vec<_> = state
            .records
            .values()
            .filter(|record| record.owner_id == owner_id)
            .cloned()
            .collect();
        records.sort_by_key(|record| record.id);
        Ok(records)
    }

    async fn list(&self, cancel: &CancellationToken) -> Result<Vec<UrlRecord>> {
        let state = self.state.read().await;
        ensure_active(cancel)?;
        let mut records: Vec<_> = state.records.values().cloned().collect();
        records.sort_by_key(|record| record.id);
        Ok(records)
    }

    async fn ping(&self, cancel: &CancellationToken) -> Result<()> {
        ensure_active(cancel)
    }

    async fn count_urls(&self, cancel: &CancellationToken) -> Result<u64> {
        let state = self.state.read().await;
        ensure_active(cancel)?;
        Ok(state.records.len() as u64)
    }

    async fn count_users(&self, cancel: &CancellationToken) -> Result<u64> {
        let state = self.state.read().await;
        ensure_active(cancel)?;
        let owners: HashSet<&str> = state
            .records
            .values()
            .map(|record| record.owner_id.as_str())
            .filter(|owner| !owner.is_empty())
            .collect();
        Ok(owners.len() as u64)
    }
}

#[async_trait]
impl<G: Generator> Repository for InMemoryRepository<G> {
    async fn insert(&self, record: UrlRecord, cancel: &CancellationToken) -> Result<Inserted> {
        let mut state = self.state.write().await;
        ensure_active(cancel)?;
        state.insert(record, &self.generator)
    }

    async fn insert_list(
        &self,
        records: Vec<UrlRecord>,
        cancel: &CancellationToken,
    ) -> Result<Vec<UrlRecord>> {
        let mut state = self.state.write().await;
        ensure_active(cancel)?;
        let mut stored = Vec::with_capacity(records.len());
        for record in records {
            stored.push(state.insert(record, &self.generator)?.into_record());
        }
        Ok(stored)
    }

    async fn delete_by_owner_and_codes(
        &self,
        owner_id: &str,
        codes: &[ShortCode],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        ensure_active(cancel)?;
        for code in codes {
            match state.records.get_mut(code.as_str()) {
                Some(record) if record.owner_id == owner_id => record.deleted = true,
                Some(_) => trace!(code = %code, owner = %owner_id, "skipping code owned by someone else"),
                None => trace!(code = %code, "skipping unknown code"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snip_generator::SeqGenerator;
    use std::sync::Arc;

    /// Always proposes the same code, so every collision is permanent.
    struct StuckGenerator;

    impl Generator for StuckGenerator {
        fn generate(&self) -> ShortCode {
            code("stuck000")
        }
    }

    fn code(s: &str) -> ShortCode {
        ShortCode::new_unchecked(s)
    }

    fn record(c: &str, url: &str, owner: &str) -> UrlRecord {
        UrlRecord::new(code(c), url, owner)
    }

    fn live() -> CancellationToken {
        CancellationToken::new()
    }

    fn cancelled() -> CancellationToken {
        let token = CancellationToken::new();
        token.cancel();
        token
    }

    #[tokio::test]
    async fn insert_and_find() {
        let repo = InMemoryRepository::new();

        let stored = repo
            .insert(record("abc12345", "https://example.com", "u1"), &live())
            .await
            .unwrap();
        assert!(!stored.is_existing());
        let stored = stored.into_record();
        assert_eq!(stored.code.as_str(), "abc12345");
        assert_eq!(stored.id, Some(1));

        let found = repo.find_by_code(&code("abc12345"), &live()).await.unwrap().unwrap();
        assert_eq!(found.original_url, "https://example.com");
        assert_eq!(found.owner_id, "u1");
        assert!(!found.deleted);
    }

    #[tokio::test]
    async fn find_nonexistent() {
        let repo = InMemoryRepository::new();
        assert!(repo.find_by_code(&code("nope0000"), &live()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn insert_known_url_returns_existing_record() {
        let repo = InMemoryRepository::new();

        repo.insert(record("first000", "https://example.com", "u1"), &live())
            .await
            .unwrap();
        let again = repo
            .insert(record("second00", "https://example.com", "u2"), &live())
            .await
            .unwrap();

        assert!(again.is_existing());
        let again = again.into_record();
        assert_eq!(again.code.as_str(), "first000");
        assert_eq!(again.owner_id, "u1");
        assert_eq!(repo.count_urls(&live()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn colliding_code_is_rerolled() {
        let repo = InMemoryRepository::with_generator(SeqGenerator::with_prefix("sq"));

        repo.insert(record("sq000000", "https://one.example", "u1"), &live())
            .await
            .unwrap();
        // Proposed code is taken; the first re-roll also collides.
        let stored = repo
            .insert(record("sq000000", "https://two.example", "u1"), &live())
            .await
            .unwrap();

        assert!(!stored.is_existing());
        assert_eq!(stored.record().code.as_str(), "sq000001");
        let first = repo.find_by_code(&code("sq000000"), &live()).await.unwrap().unwrap();
        assert_eq!(first.original_url, "https://one.example");
    }

    #[tokio::test]
    async fn reroll_gives_up_eventually() {
        let repo = InMemoryRepository::with_generator(StuckGenerator);

        repo.insert(record("stuck000", "https://one.example", "u1"), &live())
            .await
            .unwrap();
        let err = repo
            .insert(record("stuck000", "https://two.example", "u1"), &live())
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::Exhausted { .. }));
        assert_eq!(repo.count_urls(&live()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn insert_list_dedups_within_and_across_batches() {
        let repo = InMemoryRepository::new();
        repo.insert(record("exist000", "https://a.example", "u1"), &live())
            .await
            .unwrap();

        let stored = repo
            .insert_list(
                vec![
                    record("new00000", "https://a.example", "u1"),
                    record("new00001", "https://b.example", "u1"),
                    record("new00002", "https://b.example", "u1"),
                ],
                &live(),
            )
            .await
            .unwrap();

        let codes: Vec<_> = stored.iter().map(|r| r.code.as_str()).collect();
        assert_eq!(codes, ["exist000", "new00001", "new00001"]);
        assert_eq!(repo.count_urls(&live()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn insert_list_keeps_records_stored_before_a_failure() {
        let repo = InMemoryRepository::with_generator(StuckGenerator);
        repo.insert(record("stuck000", "https://taken.example", "u1"), &live())
            .await
            .unwrap();

        let err = repo
            .insert_list(
                vec![
                    record("fresh000", "https://one.example", "u1"),
                    record("stuck000", "https://two.example", "u1"),
                    record("fresh001", "https://three.example", "u1"),
                ],
                &live(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::Exhausted { .. }));
        assert!(repo.find_by_code(&code("fresh000"), &live()).await.unwrap().is_some());
        assert!(repo.find_by_code(&code("fresh001"), &live()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn find_by_owner_filters_and_defaults_to_empty() {
        let repo = InMemoryRepository::new();
        repo.insert(record("aaaa0000", "https://a.example", "u1"), &live())
            .await
            .unwrap();
        repo.insert(record("bbbb0000", "https://b.example", "u2"), &live())
            .await
            .unwrap();
        repo.insert(record("cccc0000", "https://c.example", "u1"), &live())
            .await
            .unwrap();

        let owned = repo.find_by_owner("u1", &live()).await.unwrap();
        let codes: Vec<_> = owned.iter().map(|r| r.code.as_str()).collect();
        assert_eq!(codes, ["aaaa0000", "cccc0000"]);

        assert!(repo.find_by_owner("nobody", &live()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_sets_tombstone_only_for_owned_codes() {
        let repo = InMemoryRepository::new();
        repo.insert(record("mine0000", "https://mine.example", "alice"), &live())
            .await
            .unwrap();
        repo.insert(record("yours000", "https://yours.example", "bob"), &live())
            .await
            .unwrap();

        repo.delete_by_owner_and_codes(
            "alice",
            &[code("mine0000"), code("yours000"), code("ghost000")],
            &live(),
        )
        .await
        .unwrap();

        let mine = repo.find_by_code(&code("mine0000"), &live()).await.unwrap().unwrap();
        let yours = repo.find_by_code(&code("yours000"), &live()).await.unwrap().unwrap();
        assert!(mine.deleted);
        assert!(!yours.deleted);

        // Tombstoned rows stay listed and counted.
        assert_eq!(repo.list(&live()).await.unwrap().len(), 2);
        assert_eq!(repo.count_urls(&live()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn tombstoned_code_is_never_reused() {
        let repo = InMemoryRepository::with_generator(SeqGenerator::with_prefix("zz"));
        repo.insert(record("gone0000", "https://old.example", "u1"), &live())
            .await
            .unwrap();
        repo.delete_by_owner_and_codes("u1", &[code("gone0000")], &live())
            .await
            .unwrap();

        let stored = repo
            .insert(record("gone0000", "https://new.example", "u1"), &live())
            .await
            .unwrap()
            .into_record();
        assert_eq!(stored.code.as_str(), "zz000000");
    }

    #[tokio::test]
    async fn cancelled_token_prevents_mutation() {
        let repo = InMemoryRepository::new();

        let err = repo
            .insert(record("abc12345", "https://example.com", "u1"), &cancelled())
            .await
            .unwrap_err();
        assert_eq!(err, StorageError::Cancelled);

        let err = repo
            .insert_list(vec![record("abc12345", "https://example.com", "u1")], &cancelled())
            .await
            .unwrap_err();
        assert_eq!(err, StorageError::Cancelled);
        assert_eq!(repo.count_urls(&live()).await.unwrap(), 0);

        repo.insert(record("abc12345", "https://example.com", "u1"), &live())
            .await
            .unwrap();
        let err = repo
            .delete_by_owner_and_codes("u1", &[code("abc12345")], &cancelled())
            .await
            .unwrap_err();
        assert_eq!(err, StorageError::Cancelled);
        let stored = repo.find_by_code(&code("abc12345"), &live()).await.unwrap().unwrap();
        assert!(!stored.deleted);
    }

    #[tokio::test]
    async fn ping_checks_cancellation_only() {
        let repo = InMemoryRepository::new();
        assert!(repo.ping(&live()).await.is_ok());
        assert_eq!(repo.ping(&cancelled()).await, Err(StorageError::Cancelled));
    }

    #[tokio::test]
    async fn count_users_counts_distinct_owners() {
        let repo = InMemoryRepository::new();
        repo.insert(record("aaaa0000", "https://a.example", "u1"), &live())
            .await
            .unwrap();
        repo.insert(record("bbbb0000", "https://b.example", "u1"), &live())
            .await
            .unwrap();
        repo.insert(record("cccc0000", "https://c.example", "u2"), &live())
            .await
            .unwrap();
        repo.insert(record("dddd0000", "https://d.example", ""), &live())
            .await
            .unwrap();

        assert_eq!(repo.count_urls(&live()).await.unwrap(), 4);
        assert_eq!(repo.count_users(&live()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn concurrent_access() {
        let repo = Arc::new(InMemoryRepository::new());
        let mut handles = vec![];

        for i in 0..10u64 {
            let repo = Arc::clone(&repo);
            handles.push(tokio::spawn(async move {
                let r = UrlRecord::new(
                    ShortCode::new_unchecked(format!("code{:04}", i)),
                    format!("https://example{}.com", i),
                    "u1",
                );
                repo.insert(r, &CancellationToken::new()).await.unwrap();
            }));
        }

        for i in 0..10u64 {
            let repo = Arc::clone(&repo);
            handles.push(tokio::spawn(async move {
                let c = ShortCode::new_unchecked(format!("code{:04}", i));
                let _ = repo.find_by_code(&c, &CancellationToken::new()).await;
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        for i in 0..10u64 {
            let c = ShortCode::new_unchecked(format!("code{:04}", i));
            let result = repo.find_by_code(&c, &live()).await.unwrap().unwrap();
            assert_eq!(result.original_url, format!("https://example{}.com", i));
        }
    }
}
