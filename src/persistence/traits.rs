//! Trait seams for the collaborators the coordinator consumes (spec §6).
//! No inheritance: the coordinator is parameterized over these capability
//! sets via trait objects, per spec §9 "Polymorphism across collaborators".

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::bundle::{BundleMetadata, NamedQuery};
use crate::document::MaybeDocument;
use crate::error::FirestoreResult;
use crate::model::{DocumentKey, ResourcePath, Timestamp};
use crate::mutation::MutationBatch;
use crate::target::{Target, TargetData};
use crate::user::User;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    ReadWritePrimary,
}

/// A persistence transaction handle. The in-memory engine's transactions
/// are not genuinely isolated (see SPEC_FULL.md §5 "Concrete transaction
/// retry discipline"); this carries only what operation bodies need to read:
/// the sequence number assigned to this attempt, and the requested mode.
#[derive(Clone, Copy, Debug)]
pub struct Transaction {
    sequence_number: u64,
    mode: TransactionMode,
}

impl Transaction {
    pub fn new(sequence_number: u64, mode: TransactionMode) -> Self {
        Self {
            sequence_number,
            mode,
        }
    }

    pub fn current_sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }
}

#[async_trait]
pub trait MutationQueue: Send + Sync {
    async fn add_mutation_batch(&self, batch: MutationBatch) -> FirestoreResult<MutationBatch>;
    async fn remove_mutation_batch(&self, batch_id: i64) -> FirestoreResult<()>;
    async fn lookup_mutation_batch(&self, batch_id: i64) -> FirestoreResult<Option<MutationBatch>>;
    async fn get_all_mutation_batches(&self) -> FirestoreResult<Vec<MutationBatch>>;
    async fn get_next_mutation_batch_after_batch_id(
        &self,
        batch_id: i64,
    ) -> FirestoreResult<Option<MutationBatch>>;
    async fn get_highest_unacknowledged_batch_id(&self) -> FirestoreResult<Option<i64>>;
    /// Asserts the queue's batch ordering is still consistent after a
    /// removal; a façade over the durable engine's own checks (spec §6).
    async fn perform_consistency_check(&self) -> FirestoreResult<()>;
    async fn batches_affecting_key(&self, key: &DocumentKey) -> FirestoreResult<Vec<MutationBatch>>;
}

#[async_trait]
pub trait RemoteDocumentCache: Send + Sync {
    async fn get_entry(&self, key: &DocumentKey) -> FirestoreResult<Option<MaybeDocument>>;
    async fn get_entries(
        &self,
        keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MaybeDocument>>;
    async fn add_entry(&self, doc: MaybeDocument) -> FirestoreResult<()>;
    async fn remove_entry(&self, key: &DocumentKey) -> FirestoreResult<()>;
    /// Full scan of a collection (or, with `collection_group` set, every
    /// collection sharing that id at any depth). Stands in for the
    /// out-of-scope index manager when the query engine has no index to
    /// consult (spec §6 "IndexManager").
    async fn get_entries_for_collection(
        &self,
        collection: &ResourcePath,
        collection_group: Option<&str>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MaybeDocument>>;
}

/// A transactional staging area over the remote document cache (spec
/// §4.3 "Remote document change-buffer population"). Buffers writes/removes
/// in memory; `apply` commits them to the underlying cache atomically from
/// the caller's perspective (the in-memory engine has no concurrent writers
/// to race against).
pub struct RemoteDocumentChangeBuffer {
    cache: Arc<dyn RemoteDocumentCache>,
    track_removals: bool,
    pending: Mutex<BTreeMap<DocumentKey, Option<MaybeDocument>>>,
}

impl RemoteDocumentChangeBuffer {
    pub fn new(cache: Arc<dyn RemoteDocumentCache>, track_removals: bool) -> Self {
        Self {
            cache,
            track_removals,
            pending: Mutex::new(BTreeMap::new()),
        }
    }

    /// Reads through pending writes to the underlying cache for keys not
    /// yet staged in this buffer.
    pub async fn get_entry(&self, key: &DocumentKey) -> FirestoreResult<Option<MaybeDocument>> {
        if let Some(staged) = self.pending.lock().unwrap().get(key).cloned() {
            return Ok(staged);
        }
        self.cache.get_entry(key).await
    }

    pub fn stage_write(&self, doc: MaybeDocument) {
        self.pending.lock().unwrap().insert(doc.key().clone(), Some(doc));
    }

    pub fn stage_removal(&self, key: DocumentKey) {
        let value = if self.track_removals { None } else { return };
        self.pending.lock().unwrap().insert(key, value);
    }

    pub async fn apply(&self) -> FirestoreResult<()> {
        let pending = std::mem::take(&mut *self.pending.lock().unwrap());
        for (key, value) in pending {
            match value {
                Some(doc) => self.cache.add_entry(doc).await?,
                None => self.cache.remove_entry(&key).await?,
            }
        }
        Ok(())
    }
}

#[async_trait]
pub trait TargetCache: Send + Sync {
    async fn get_target_data(&self, target: &Target) -> FirestoreResult<Option<TargetData>>;
    async fn get_target_data_by_id(&self, target_id: i32) -> FirestoreResult<Option<TargetData>>;
    async fn allocate_target_id(&self) -> FirestoreResult<i32>;
    async fn add_target_data(&self, data: TargetData) -> FirestoreResult<()>;
    async fn update_target_data(&self, data: TargetData) -> FirestoreResult<()>;
    async fn remove_target_data(&self, target_id: i32) -> FirestoreResult<()>;
    async fn add_matching_keys(
        &self,
        target_id: i32,
        keys: BTreeSet<DocumentKey>,
    ) -> FirestoreResult<()>;
    async fn remove_matching_keys(
        &self,
        target_id: i32,
        keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<()>;
    async fn remove_matching_keys_for_target_id(&self, target_id: i32) -> FirestoreResult<()>;
    async fn set_matching_keys(
        &self,
        target_id: i32,
        keys: BTreeSet<DocumentKey>,
    ) -> FirestoreResult<()>;
    async fn get_matching_keys_for_target_id(
        &self,
        target_id: i32,
    ) -> FirestoreResult<BTreeSet<DocumentKey>>;
    async fn get_last_remote_snapshot_version(&self) -> FirestoreResult<Timestamp>;
    async fn set_targets_metadata(
        &self,
        sequence_number: u64,
        snapshot_version: Timestamp,
    ) -> FirestoreResult<()>;
}

#[async_trait]
pub trait BundleCache: Send + Sync {
    async fn get_bundle_metadata(&self, bundle_id: &str) -> FirestoreResult<Option<BundleMetadata>>;
    async fn save_bundle_metadata(&self, metadata: BundleMetadata) -> FirestoreResult<()>;
    async fn get_named_query(&self, name: &str) -> FirestoreResult<Option<NamedQuery>>;
    async fn save_named_query(&self, query: NamedQuery) -> FirestoreResult<()>;
}

/// Hooks invoked as documents and targets gain/lose listeners, so an
/// injected LRU garbage collector (out of scope: policy) can track
/// reference counts. See spec §6, §9 "Multi-tab coupling".
#[async_trait]
pub trait ReferenceDelegate: Send + Sync {
    async fn add_reference(&self, target_id: i32, key: &DocumentKey) -> FirestoreResult<()>;
    async fn remove_reference(&self, target_id: i32, key: &DocumentKey) -> FirestoreResult<()>;
    async fn update_limbo_document(&self, key: &DocumentKey) -> FirestoreResult<()>;
    /// Invoked by `releaseTarget`; may trigger eager GC of now-unpinned docs.
    async fn remove_target(&self, target_id: i32) -> FirestoreResult<()>;
    /// Keys with no remaining target reference — the floor any injected LRU
    /// policy (out of scope) must respect regardless of its own tuning.
    async fn orphaned_documents(&self) -> FirestoreResult<BTreeSet<DocumentKey>>;
}

/// Marker collaborator for the out-of-scope index manager (spec §6). The
/// local store only needs to be able to hold a handle to one.
pub trait IndexManager: Send + Sync {}

#[async_trait]
pub trait Persistence: Send + Sync {
    fn mutation_queue(&self, user: &User) -> Arc<dyn MutationQueue>;
    fn remote_document_cache(&self) -> Arc<dyn RemoteDocumentCache>;
    fn target_cache(&self) -> Arc<dyn TargetCache>;
    fn bundle_cache(&self) -> Arc<dyn BundleCache>;
    fn index_manager(&self) -> Arc<dyn IndexManager>;
    fn reference_delegate(&self) -> Arc<dyn ReferenceDelegate>;

    fn new_change_buffer(&self, track_removals: bool) -> RemoteDocumentChangeBuffer {
        RemoteDocumentChangeBuffer::new(self.remote_document_cache(), track_removals)
    }

    /// Runs `body` inside one transaction with automatic retry on
    /// `Retryable` errors (spec §5, §7). `body` must be safely re-callable:
    /// it may run more than once if an earlier attempt conflicts.
    async fn run_transaction<F, Fut, T>(
        &self,
        label: &str,
        mode: TransactionMode,
        body: F,
    ) -> FirestoreResult<T>
    where
        F: Fn(Transaction) -> Fut + Send + Sync,
        Fut: Future<Output = FirestoreResult<T>> + Send,
        T: Send;
}
