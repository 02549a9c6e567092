//! Overlays pending mutations atop remote documents to produce the "local
//! view" reads and queries observe. See spec §4.5.
//!
//! Grounded on the teacher's `local/overlay.rs` fold-mutations-in-batch
//! -order idea, rebuilt atop this crate's `MutationBatch::
//! apply_to_local_view` rather than a standalone field-transform folder,
//! since that fold already lives on `MutationBatch` (spec §4.5 "Overlay
//! application").

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::document::{MaybeDocument, NoDocument};
use crate::error::FirestoreResult;
use crate::model::{DocumentKey, ResourcePath};
use crate::persistence::{MutationQueue, RemoteDocumentCache};
use crate::target::Target;

/// A read-your-writes view over one user's mutation queue atop the remote
/// document cache. Cheap to construct; holds no state of its own beyond the
/// two collaborator handles, so the coordinator builds a fresh one per
/// transaction.
pub struct LocalDocumentsView {
    remote_documents: Arc<dyn RemoteDocumentCache>,
    mutation_queue: Arc<dyn MutationQueue>,
}

impl LocalDocumentsView {
    pub fn new(remote_documents: Arc<dyn RemoteDocumentCache>, mutation_queue: Arc<dyn MutationQueue>) -> Self {
        Self {
            remote_documents,
            mutation_queue,
        }
    }

    /// Reads `key`'s remote state and overlays every unacknowledged mutation
    /// affecting it, in batch order.
    pub async fn get_document(&self, key: &DocumentKey) -> FirestoreResult<MaybeDocument> {
        let remote = self.remote_documents.get_entry(key).await?;
        self.get_document_with_base(key, remote).await
    }

    /// Same overlay, but starting from an already-loaded remote document
    /// instead of re-reading the cache — used by `LocalStore::local_write`,
    /// which loads the pre-mutation local view once and reuses it (spec
    /// §4.1 step 1).
    pub async fn get_document_with_base(
        &self,
        key: &DocumentKey,
        base: Option<MaybeDocument>,
    ) -> FirestoreResult<MaybeDocument> {
        let batches = self.mutation_queue.batches_affecting_key(key).await?;
        let mut current = base;
        for batch in &batches {
            current = batch.apply_to_local_view(key, current);
        }
        Ok(current.unwrap_or_else(|| MaybeDocument::NoDocument(NoDocument::manufactured(key.clone()))))
    }

    pub async fn get_documents(
        &self,
        keys: &std::collections::BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MaybeDocument>> {
        let remote = self.remote_documents.get_entries(keys).await?;
        let mut result = BTreeMap::new();
        for key in keys {
            let base = remote.get(key).cloned();
            result.insert(key.clone(), self.get_document_with_base(key, base).await?);
        }
        Ok(result)
    }

    /// Overlays pending mutations atop an already-materialized map of
    /// remote documents, rather than re-reading the cache — used after
    /// `acknowledgeBatch`/`applyRemoteEventToLocalCache` mutate the remote
    /// cache and need the resulting local view over just the touched keys.
    pub async fn get_local_view_of_documents(
        &self,
        documents: BTreeMap<DocumentKey, MaybeDocument>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MaybeDocument>> {
        let mut result = BTreeMap::new();
        for (key, doc) in documents {
            result.insert(key.clone(), self.get_document_with_base(&key, Some(doc)).await?);
        }
        Ok(result)
    }

    /// Local view of an entire collection (or collection group): the remote
    /// cache's matching entries, plus any key touched by a pending mutation
    /// that would place it in the collection even before the remote cache
    /// has anything there (e.g. a not-yet-acknowledged `Set` into a brand
    /// new document). Used by the query engine's full-scan fallback (spec
    /// §4.1 `executeQuery`, no index manager available).
    pub async fn get_documents_matching_collection(
        &self,
        collection: &ResourcePath,
        collection_group: Option<&str>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MaybeDocument>> {
        let remote = self
            .remote_documents
            .get_entries_for_collection(collection, collection_group)
            .await?;
        let mut keys: std::collections::BTreeSet<DocumentKey> = remote.keys().cloned().collect();

        let mut probe = Target::for_collection(collection.clone());
        probe.collection_group = collection_group.map(|group| group.to_string());
        for batch in self.mutation_queue.get_all_mutation_batches().await? {
            for key in batch.keys() {
                if probe.matches_key(&key) {
                    keys.insert(key);
                }
            }
        }

        let mut result = BTreeMap::new();
        for key in keys {
            let base = remote.get(&key).cloned();
            result.insert(key.clone(), self.get_document_with_base(&key, base).await?);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Timestamp;
    use crate::mutation::{Mutation, MutationBatch, Precondition};
    use crate::persistence::{MemoryPersistence, PersistenceSettings, Persistence};
    use crate::user::User;
    use crate::value::MapValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[tokio::test]
    async fn pending_write_overlays_empty_remote_state() {
        let persistence = MemoryPersistence::new(PersistenceSettings::default());
        let queue = persistence.mutation_queue(&User::unauthenticated());
        queue
            .add_mutation_batch(MutationBatch {
                batch_id: 0,
                local_write_time: Timestamp::new(1, 0),
                base_mutations: vec![],
                mutations: vec![Mutation::Set {
                    key: key("cities/sf"),
                    value: MapValue::empty(),
                    precondition: Precondition::None,
                }],
            })
            .await
            .unwrap();
        let view = LocalDocumentsView::new(persistence.remote_document_cache(), queue);
        let doc = view.get_document(&key("cities/sf")).await.unwrap();
        assert!(doc.has_pending_writes());
    }

    #[tokio::test]
    async fn unwritten_key_resolves_to_manufactured_no_document() {
        let persistence = MemoryPersistence::new(PersistenceSettings::default());
        let queue = persistence.mutation_queue(&User::unauthenticated());
        let view = LocalDocumentsView::new(persistence.remote_document_cache(), queue);
        let doc = view.get_document(&key("cities/nowhere")).await.unwrap();
        match doc {
            MaybeDocument::NoDocument(no_doc) => assert!(no_doc.is_manufactured()),
            _ => panic!("expected manufactured tombstone"),
        }
    }
}
