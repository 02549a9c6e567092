//! The in-memory stand-in for the out-of-scope durable KV engine (spec §6
//! "In-memory durable engine"). A single process implementation of every
//! collaborator trait in `persistence::traits`, backed by `BTreeMap`s behind
//! `async-lock::Mutex` — mirroring the split the teacher's `local/memory.rs`
//! made between `async_lock::Mutex` (state read across `.await` points) and
//! `std::sync::Mutex` (short synchronous bookkeeping).
//!
//! Not a product of this spec's scope: a real on-device engine (LevelDB/
//! SQLite-backed) is an alternate collaborator behind the same trait seam.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_lock::Mutex;
use async_trait::async_trait;

use crate::bundle::{BundleMetadata, NamedQuery};
use crate::document::MaybeDocument;
use crate::error::{aborted, not_found, FirestoreResult};
use crate::model::{DocumentKey, ResourcePath, Timestamp};
use crate::mutation::MutationBatch;
use crate::persistence::traits::{
    BundleCache, IndexManager, MutationQueue, Persistence, ReferenceDelegate, RemoteDocumentCache,
    Transaction, TransactionMode,
};
use crate::target::{Target, TargetData};
use crate::user::User;

/// Tuning knobs for the in-memory engine (spec §1.1 "Configuration", §4.4).
#[derive(Clone, Copy, Debug)]
pub struct PersistenceSettings {
    /// How stale a target's persisted `snapshotVersion` may get before
    /// `shouldPersistTargetData` forces a write even with an empty diff.
    /// Defaults to the spec's 5-minute constant; tests shrink it rather
    /// than sleeping real wall-clock minutes.
    pub resume_token_max_staleness: Duration,
    /// How many times `run_transaction` retries a body that returns
    /// `Aborted` before surfacing it to the caller as fatal. The stand-in
    /// has no blocking wait primitive to retry against, so unlike a real
    /// engine this bound is finite (§5 "Concrete transaction retry
    /// discipline").
    pub max_transaction_retries: u32,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            resume_token_max_staleness: Duration::from_secs(5 * 60),
            max_transaction_retries: 8,
        }
    }
}

#[derive(Default)]
struct MutationQueueState {
    batches: BTreeMap<i64, MutationBatch>,
    next_batch_id: i64,
}

struct MemoryMutationQueue {
    state: Mutex<MutationQueueState>,
}

impl MemoryMutationQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(MutationQueueState {
                batches: BTreeMap::new(),
                next_batch_id: 1,
            }),
        }
    }
}

#[async_trait]
impl MutationQueue for MemoryMutationQueue {
    async fn add_mutation_batch(&self, mut batch: MutationBatch) -> FirestoreResult<MutationBatch> {
        let mut state = self.state.lock().await;
        let batch_id = state.next_batch_id;
        state.next_batch_id += 1;
        batch.batch_id = batch_id;
        state.batches.insert(batch_id, batch.clone());
        Ok(batch)
    }

    async fn remove_mutation_batch(&self, batch_id: i64) -> FirestoreResult<()> {
        self.state.lock().await.batches.remove(&batch_id);
        Ok(())
    }

    async fn lookup_mutation_batch(&self, batch_id: i64) -> FirestoreResult<Option<MutationBatch>> {
        Ok(self.state.lock().await.batches.get(&batch_id).cloned())
    }

    async fn get_all_mutation_batches(&self) -> FirestoreResult<Vec<MutationBatch>> {
        Ok(self.state.lock().await.batches.values().cloned().collect())
    }

    async fn get_next_mutation_batch_after_batch_id(
        &self,
        batch_id: i64,
    ) -> FirestoreResult<Option<MutationBatch>> {
        Ok(self
            .state
            .lock()
            .await
            .batches
            .range((batch_id + 1)..)
            .next()
            .map(|(_, batch)| batch.clone()))
    }

    async fn get_highest_unacknowledged_batch_id(&self) -> FirestoreResult<Option<i64>> {
        Ok(self.state.lock().await.batches.keys().next_back().copied())
    }

    async fn perform_consistency_check(&self) -> FirestoreResult<()> {
        Ok(())
    }

    async fn batches_affecting_key(&self, key: &DocumentKey) -> FirestoreResult<Vec<MutationBatch>> {
        Ok(self
            .state
            .lock()
            .await
            .batches
            .values()
            .filter(|batch| batch.keys().contains(key))
            .cloned()
            .collect())
    }
}

struct MemoryRemoteDocumentCache {
    documents: Mutex<BTreeMap<DocumentKey, MaybeDocument>>,
}

impl MemoryRemoteDocumentCache {
    fn new() -> Self {
        Self {
            documents: Mutex::new(BTreeMap::new()),
        }
    }
}

#[async_trait]
impl RemoteDocumentCache for MemoryRemoteDocumentCache {
    async fn get_entry(&self, key: &DocumentKey) -> FirestoreResult<Option<MaybeDocument>> {
        Ok(self.documents.lock().await.get(key).cloned())
    }

    async fn get_entries(
        &self,
        keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MaybeDocument>> {
        let documents = self.documents.lock().await;
        Ok(keys
            .iter()
            .filter_map(|key| documents.get(key).cloned().map(|doc| (key.clone(), doc)))
            .collect())
    }

    async fn add_entry(&self, doc: MaybeDocument) -> FirestoreResult<()> {
        self.documents.lock().await.insert(doc.key().clone(), doc);
        Ok(())
    }

    async fn remove_entry(&self, key: &DocumentKey) -> FirestoreResult<()> {
        self.documents.lock().await.remove(key);
        Ok(())
    }

    async fn get_entries_for_collection(
        &self,
        collection: &ResourcePath,
        collection_group: Option<&str>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MaybeDocument>> {
        let documents = self.documents.lock().await;
        Ok(documents
            .iter()
            .filter(|(key, _)| match collection_group {
                Some(group) => key.collection_path().last_segment() == Some(group),
                None => &key.collection_path() == collection,
            })
            .map(|(key, doc)| (key.clone(), doc.clone()))
            .collect())
    }
}

#[derive(Default)]
struct TargetCacheState {
    by_id: BTreeMap<i32, TargetData>,
    by_canonical_id: BTreeMap<String, i32>,
    matching_keys: BTreeMap<i32, BTreeSet<DocumentKey>>,
    last_remote_snapshot_version: Timestamp,
}

struct MemoryTargetCache {
    state: Mutex<TargetCacheState>,
    next_target_id: AtomicI32,
}

impl MemoryTargetCache {
    fn new() -> Self {
        Self {
            state: Mutex::new(TargetCacheState {
                by_id: BTreeMap::new(),
                by_canonical_id: BTreeMap::new(),
                matching_keys: BTreeMap::new(),
                last_remote_snapshot_version: Timestamp::min_value(),
            }),
            next_target_id: AtomicI32::new(1),
        }
    }
}

#[async_trait]
impl crate::persistence::traits::TargetCache for MemoryTargetCache {
    async fn get_target_data(&self, target: &Target) -> FirestoreResult<Option<TargetData>> {
        let state = self.state.lock().await;
        Ok(state
            .by_canonical_id
            .get(&target.canonical_id())
            .and_then(|id| state.by_id.get(id))
            .cloned())
    }

    async fn get_target_data_by_id(&self, target_id: i32) -> FirestoreResult<Option<TargetData>> {
        Ok(self.state.lock().await.by_id.get(&target_id).cloned())
    }

    async fn allocate_target_id(&self) -> FirestoreResult<i32> {
        Ok(self.next_target_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn add_target_data(&self, data: TargetData) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        state
            .by_canonical_id
            .insert(data.target.canonical_id(), data.target_id);
        state.by_id.insert(data.target_id, data);
        Ok(())
    }

    async fn update_target_data(&self, data: TargetData) -> FirestoreResult<()> {
        self.add_target_data(data).await
    }

    async fn remove_target_data(&self, target_id: i32) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        if let Some(data) = state.by_id.remove(&target_id) {
            state.by_canonical_id.remove(&data.target.canonical_id());
        }
        state.matching_keys.remove(&target_id);
        Ok(())
    }

    async fn add_matching_keys(
        &self,
        target_id: i32,
        keys: BTreeSet<DocumentKey>,
    ) -> FirestoreResult<()> {
        self.state
            .lock()
            .await
            .matching_keys
            .entry(target_id)
            .or_default()
            .extend(keys);
        Ok(())
    }

    async fn remove_matching_keys(
        &self,
        target_id: i32,
        keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<()> {
        if let Some(existing) = self.state.lock().await.matching_keys.get_mut(&target_id) {
            for key in keys {
                existing.remove(key);
            }
        }
        Ok(())
    }

    async fn remove_matching_keys_for_target_id(&self, target_id: i32) -> FirestoreResult<()> {
        self.state.lock().await.matching_keys.remove(&target_id);
        Ok(())
    }

    async fn set_matching_keys(
        &self,
        target_id: i32,
        keys: BTreeSet<DocumentKey>,
    ) -> FirestoreResult<()> {
        self.state.lock().await.matching_keys.insert(target_id, keys);
        Ok(())
    }

    async fn get_matching_keys_for_target_id(
        &self,
        target_id: i32,
    ) -> FirestoreResult<BTreeSet<DocumentKey>> {
        Ok(self
            .state
            .lock()
            .await
            .matching_keys
            .get(&target_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_last_remote_snapshot_version(&self) -> FirestoreResult<Timestamp> {
        Ok(self.state.lock().await.last_remote_snapshot_version)
    }

    async fn set_targets_metadata(
        &self,
        _sequence_number: u64,
        snapshot_version: Timestamp,
    ) -> FirestoreResult<()> {
        self.state.lock().await.last_remote_snapshot_version = snapshot_version;
        Ok(())
    }
}

struct MemoryBundleCache {
    bundles: Mutex<BTreeMap<String, BundleMetadata>>,
    named_queries: Mutex<BTreeMap<String, NamedQuery>>,
}

impl MemoryBundleCache {
    fn new() -> Self {
        Self {
            bundles: Mutex::new(BTreeMap::new()),
            named_queries: Mutex::new(BTreeMap::new()),
        }
    }
}

#[async_trait]
impl BundleCache for MemoryBundleCache {
    async fn get_bundle_metadata(&self, bundle_id: &str) -> FirestoreResult<Option<BundleMetadata>> {
        Ok(self.bundles.lock().await.get(bundle_id).cloned())
    }

    async fn save_bundle_metadata(&self, metadata: BundleMetadata) -> FirestoreResult<()> {
        self.bundles.lock().await.insert(metadata.id.clone(), metadata);
        Ok(())
    }

    async fn get_named_query(&self, name: &str) -> FirestoreResult<Option<NamedQuery>> {
        Ok(self.named_queries.lock().await.get(name).cloned())
    }

    async fn save_named_query(&self, query: NamedQuery) -> FirestoreResult<()> {
        self.named_queries.lock().await.insert(query.name.clone(), query);
        Ok(())
    }
}

struct MemoryIndexManager;

impl IndexManager for MemoryIndexManager {}

/// An in-process, single-user-at-a-time `Persistence` implementation.
pub struct MemoryPersistence {
    settings: PersistenceSettings,
    mutation_queues: Mutex<BTreeMap<User, Arc<MemoryMutationQueue>>>,
    remote_document_cache: Arc<MemoryRemoteDocumentCache>,
    target_cache: Arc<MemoryTargetCache>,
    bundle_cache: Arc<MemoryBundleCache>,
    index_manager: Arc<MemoryIndexManager>,
    reference_delegate: Arc<dyn ReferenceDelegate>,
    sequence_number: AtomicI64,
}

impl MemoryPersistence {
    pub fn new(settings: PersistenceSettings) -> Arc<Self> {
        let target_cache = Arc::new(MemoryTargetCache::new());
        let remote_document_cache = Arc::new(MemoryRemoteDocumentCache::new());
        let reference_delegate = Arc::new(crate::gc::MemoryReferenceDelegate::new(
            target_cache.clone() as Arc<dyn crate::persistence::traits::TargetCache>,
            remote_document_cache.clone() as Arc<dyn RemoteDocumentCache>,
        ));
        Arc::new(Self {
            settings,
            mutation_queues: Mutex::new(BTreeMap::new()),
            remote_document_cache,
            target_cache,
            bundle_cache: Arc::new(MemoryBundleCache::new()),
            index_manager: Arc::new(MemoryIndexManager),
            reference_delegate,
            sequence_number: AtomicI64::new(1),
        })
    }

    pub fn settings(&self) -> PersistenceSettings {
        self.settings
    }
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Arc::try_unwrap(Self::new(PersistenceSettings::default()))
            .unwrap_or_else(|_| unreachable!("freshly constructed Arc always has one owner"))
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    fn mutation_queue(&self, user: &User) -> Arc<dyn MutationQueue> {
        // `mutation_queue` is documented as a synchronous accessor on the
        // trait (spec §6); the per-user map only ever grows, so a blocking
        // try_lock is enough here without making the whole seam async.
        let mut queues = self
            .mutation_queues
            .try_lock()
            .expect("mutation queue map is only ever touched synchronously and briefly");
        queues
            .entry(user.clone())
            .or_insert_with(|| Arc::new(MemoryMutationQueue::new()))
            .clone()
    }

    fn remote_document_cache(&self) -> Arc<dyn RemoteDocumentCache> {
        self.remote_document_cache.clone()
    }

    fn target_cache(&self) -> Arc<dyn crate::persistence::traits::TargetCache> {
        self.target_cache.clone()
    }

    fn bundle_cache(&self) -> Arc<dyn BundleCache> {
        self.bundle_cache.clone()
    }

    fn index_manager(&self) -> Arc<dyn IndexManager> {
        self.index_manager.clone()
    }

    fn reference_delegate(&self) -> Arc<dyn ReferenceDelegate> {
        self.reference_delegate.clone()
    }

    async fn run_transaction<F, Fut, T>(
        &self,
        label: &str,
        mode: TransactionMode,
        body: F,
    ) -> FirestoreResult<T>
    where
        F: Fn(Transaction) -> Fut + Send + Sync,
        Fut: Future<Output = FirestoreResult<T>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            let sequence_number = self.sequence_number.fetch_add(1, Ordering::SeqCst) as u64;
            let txn = Transaction::new(sequence_number, mode);
            match body(txn).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => {
                    attempt += 1;
                    log::debug!(
                        "transaction '{label}' aborted, retrying (attempt {attempt}/{})",
                        self.settings.max_transaction_retries
                    );
                    if attempt >= self.settings.max_transaction_retries {
                        log::error!("transaction '{label}' exhausted retries");
                        return Err(aborted(format!(
                            "transaction '{label}' did not converge after {attempt} attempts"
                        )));
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Convenience used by `rejectBatch` to turn the mutation queue's bare
/// `lookupMutationBatch` `None` into a `NotFound` error.
pub(crate) fn require_batch(
    batch: Option<MutationBatch>,
    batch_id: i64,
) -> FirestoreResult<MutationBatch> {
    batch.ok_or_else(|| not_found(format!("no mutation batch with id {batch_id}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::traits::TargetCache as _;

    #[tokio::test]
    async fn mutation_queue_assigns_increasing_batch_ids() {
        let persistence = MemoryPersistence::new(PersistenceSettings::default());
        let queue = persistence.mutation_queue(&User::unauthenticated());
        let first = queue
            .add_mutation_batch(MutationBatch {
                batch_id: 0,
                local_write_time: Timestamp::now(),
                base_mutations: vec![],
                mutations: vec![],
            })
            .await
            .unwrap();
        let second = queue
            .add_mutation_batch(MutationBatch {
                batch_id: 0,
                local_write_time: Timestamp::now(),
                base_mutations: vec![],
                mutations: vec![],
            })
            .await
            .unwrap();
        assert_eq!(first.batch_id, 1);
        assert_eq!(second.batch_id, 2);
    }

    #[tokio::test]
    async fn target_cache_reuses_target_by_canonical_id() {
        let persistence = MemoryPersistence::new(PersistenceSettings::default());
        let target_cache = persistence.target_cache();
        let target = Target::for_collection(ResourcePath::from_string("cities").unwrap());
        let data = TargetData::new(target.clone(), 1, crate::target::TargetPurpose::Listen, 0);
        target_cache.add_target_data(data.clone()).await.unwrap();
        let fetched = target_cache.get_target_data(&target).await.unwrap().unwrap();
        assert_eq!(fetched.target_id, 1);
    }
}
