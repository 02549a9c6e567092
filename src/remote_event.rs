//! The aggregated result of a batch of server watch/write responses, as
//! consumed by [`crate::local_store::LocalStore::apply_remote_event_to_local_cache`].
//! See spec §3 and §4.2.
//!
//! Grounded on the teacher's `remote/remote_event.rs` (same shape), with
//! `document_updates` retyped from the teacher's wire-level `WatchDocument`
//! to this crate's `MaybeDocument` — the local store deals in the already
//! -decoded document model, not wire bytes (the wire serializer is out of
//! scope).

use std::collections::{BTreeMap, BTreeSet};

use crate::document::MaybeDocument;
use crate::error::{internal_error, FirestoreResult};
use crate::model::{DocumentKey, Timestamp};
use crate::persistence::RemoteDocumentChangeBuffer;

#[derive(Debug, Clone)]
pub struct RemoteEvent {
    pub snapshot_version: Timestamp,
    pub target_changes: BTreeMap<i32, TargetChange>,
    pub document_updates: BTreeMap<DocumentKey, MaybeDocument>,
    pub resolved_limbo_documents: BTreeSet<DocumentKey>,
}

impl RemoteEvent {
    pub fn new(snapshot_version: Timestamp) -> Self {
        Self {
            snapshot_version,
            target_changes: BTreeMap::new(),
            document_updates: BTreeMap::new(),
            resolved_limbo_documents: BTreeSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.document_updates.is_empty()
            && self.resolved_limbo_documents.is_empty()
    }
}

/// Per-target change metadata: which docs entered/left the target's
/// matching set, and the new resume token if the server advanced it.
#[derive(Debug, Clone, Default)]
pub struct TargetChange {
    pub resume_token: Vec<u8>,
    pub current: bool,
    pub added_documents: BTreeSet<DocumentKey>,
    pub modified_documents: BTreeSet<DocumentKey>,
    pub removed_documents: BTreeSet<DocumentKey>,
}

impl TargetChange {
    pub fn has_document_changes(&self) -> bool {
        !self.added_documents.is_empty()
            || !self.modified_documents.is_empty()
            || !self.removed_documents.is_empty()
    }
}

/// Implements §4.3 "Remote document change-buffer population": stages
/// `updates` into `buffer`, dropping stale ones, and returns the set of keys
/// actually changed (manufactured tombstones included). Shared by
/// `apply_remote_event_to_local_cache` (one `global_version` for every key)
/// and bundle application (a per-key `document_versions` map, `global_version
/// = Timestamp::min_value()`).
pub async fn populate_change_buffer(
    buffer: &RemoteDocumentChangeBuffer,
    updates: &BTreeMap<DocumentKey, MaybeDocument>,
    global_version: Timestamp,
    document_versions: &BTreeMap<DocumentKey, Timestamp>,
) -> FirestoreResult<BTreeSet<DocumentKey>> {
    let mut changed = BTreeSet::new();

    for (key, incoming) in updates {
        let existing = buffer.get_entry(key).await?;

        if let MaybeDocument::NoDocument(no_doc) = incoming {
            if no_doc.is_manufactured() {
                buffer.stage_removal(key.clone());
                changed.insert(key.clone());
                continue;
            }
        }

        let should_write = match &existing {
            None => true,
            Some(current) => {
                incoming.version() > current.version()
                    || (incoming.version() == current.version() && current.has_pending_writes())
            }
        };

        if !should_write {
            log::debug!("dropping stale remote update for {key:?}");
            continue;
        }

        let read_time = document_versions.get(key).copied().unwrap_or(global_version);
        if read_time == Timestamp::min_value() {
            return Err(internal_error(format!(
                "remote update for {key:?} resolved to an unset read time"
            )));
        }

        buffer.stage_write(stamped_with_read_time(incoming.clone(), read_time));
        changed.insert(key.clone());
    }

    Ok(changed)
}

fn stamped_with_read_time(doc: MaybeDocument, read_time: Timestamp) -> MaybeDocument {
    match doc {
        MaybeDocument::Document(mut document) => {
            document.version = read_time;
            MaybeDocument::Document(document)
        }
        MaybeDocument::NoDocument(mut no_doc) => {
            no_doc.version = read_time;
            MaybeDocument::NoDocument(no_doc)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Document, NoDocument};
    use crate::persistence::{MemoryPersistence, Persistence, PersistenceSettings};
    use crate::value::MapValue;

    #[test]
    fn empty_event_has_no_changes() {
        let event = RemoteEvent::new(Timestamp::new(1, 0));
        assert!(event.is_empty());
    }

    #[test]
    fn target_change_reports_document_changes() {
        let mut change = TargetChange::default();
        assert!(!change.has_document_changes());
        change
            .added_documents
            .insert(DocumentKey::from_string("cities/sf").unwrap());
        assert!(change.has_document_changes());
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[tokio::test]
    async fn stale_update_is_dropped() {
        let persistence = MemoryPersistence::new(PersistenceSettings::default());
        let buffer = persistence.new_change_buffer(true);
        buffer.stage_write(MaybeDocument::Document(Document {
            key: key("cities/sf"),
            version: Timestamp::new(10, 0),
            fields: MapValue::empty(),
            has_pending_writes: false,
        }));
        buffer.apply().await.unwrap();

        let mut updates = BTreeMap::new();
        updates.insert(
            key("cities/sf"),
            MaybeDocument::Document(Document {
                key: key("cities/sf"),
                version: Timestamp::new(7, 0),
                fields: MapValue::empty(),
                has_pending_writes: false,
            }),
        );
        let changed = populate_change_buffer(&buffer, &updates, Timestamp::new(7, 0), &BTreeMap::new())
            .await
            .unwrap();
        assert!(changed.is_empty());
    }

    #[tokio::test]
    async fn manufactured_tombstone_removes_entry() {
        let persistence = MemoryPersistence::new(PersistenceSettings::default());
        let buffer = persistence.new_change_buffer(true);
        buffer.stage_write(MaybeDocument::Document(Document {
            key: key("cities/sf"),
            version: Timestamp::new(10, 0),
            fields: MapValue::empty(),
            has_pending_writes: false,
        }));
        buffer.apply().await.unwrap();

        let mut updates = BTreeMap::new();
        updates.insert(
            key("cities/sf"),
            MaybeDocument::NoDocument(NoDocument::manufactured(key("cities/sf"))),
        );
        let changed = populate_change_buffer(&buffer, &updates, Timestamp::new(11, 0), &BTreeMap::new())
            .await
            .unwrap();
        assert!(changed.contains(&key("cities/sf")));
        assert_eq!(buffer.get_entry(&key("cities/sf")).await.unwrap(), None);
    }
}
