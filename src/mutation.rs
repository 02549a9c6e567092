//! Mutations, preconditions, and the non-idempotent field transforms they
//! may carry. See spec §3 (`Mutation`, `MutationBatch`, `MutationBatchResult`)
//! and §9 ("Non-idempotent transforms").
//!
//! Grounded on the teacher's `remote/mutation.rs` (batch/result shape) and
//! `local/overlay.rs` (the four transform kinds and their fold semantics),
//! neither of which compiled as retrieved — `FieldTransform`/
//! `TransformOperation` did not exist anywhere in the teacher repo and are
//! authored here from the usage pattern in `overlay.rs`.

use std::collections::BTreeSet;

use crate::document::{Document, MaybeDocument, NoDocument};
use crate::model::{DocumentKey, FieldPath, Timestamp};
use crate::value::{FirestoreValue, MapValue, ValueKind};

#[derive(Clone, Debug, PartialEq)]
pub enum Precondition {
    None,
    Exists(bool),
    UpdateTimeLessOrEqual(Timestamp),
}

impl Precondition {
    fn holds(&self, existing: Option<&MaybeDocument>) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(expected) => {
                existing.map(MaybeDocument::is_document).unwrap_or(false) == *expected
            }
            Precondition::UpdateTimeLessOrEqual(bound) => existing
                .filter(|doc| doc.is_document())
                .map(|doc| doc.version() <= *bound)
                .unwrap_or(false),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    Increment(FirestoreValue),
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldTransform {
    pub field_path: FieldPath,
    pub operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field_path: FieldPath, operation: TransformOperation) -> Self {
        Self {
            field_path,
            operation,
        }
    }

    /// Computes this transform's new value against a snapshot of the fields
    /// taken before any transform in the same mutation was applied — every
    /// transform in one mutation reads the same pre-image, it does not see
    /// its siblings' writes.
    fn resolve(&self, base: &MapValue, local_write_time: Timestamp) -> FirestoreValue {
        let current = base.get(&self.field_path).cloned();
        match &self.operation {
            TransformOperation::ServerTimestamp => FirestoreValue::from_timestamp(local_write_time),
            TransformOperation::ArrayUnion(elements) => array_union(current, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(current, elements),
            TransformOperation::Increment(operand) => numeric_increment(current, operand),
        }
    }
}

fn array_union(existing: Option<FirestoreValue>, additions: &[FirestoreValue]) -> FirestoreValue {
    let mut values = existing_array(existing);
    for element in additions {
        if !values.iter().any(|candidate| candidate == element) {
            values.push(element.clone());
        }
    }
    FirestoreValue::from_array(values)
}

fn array_remove(existing: Option<FirestoreValue>, removals: &[FirestoreValue]) -> FirestoreValue {
    let values = existing_array(existing);
    let filtered = values
        .into_iter()
        .filter(|candidate| !removals.iter().any(|needle| needle == candidate))
        .collect();
    FirestoreValue::from_array(filtered)
}

fn existing_array(existing: Option<FirestoreValue>) -> Vec<FirestoreValue> {
    match existing {
        Some(value) => match value.kind() {
            ValueKind::Array(array) => array.values().to_vec(),
            _ => Vec::new(),
        },
        None => Vec::new(),
    }
}

fn numeric_increment(existing: Option<FirestoreValue>, operand: &FirestoreValue) -> FirestoreValue {
    let delta_i = match operand.kind() {
        ValueKind::Integer(d) => Some(*d),
        _ => None,
    };
    let delta_f = match operand.kind() {
        ValueKind::Double(d) => Some(*d),
        _ => None,
    };

    match existing.as_ref().map(|v| v.kind()) {
        Some(ValueKind::Integer(current)) => {
            if let Some(delta) = delta_i {
                match current.checked_add(delta) {
                    Some(sum) => FirestoreValue::from_integer(sum),
                    None => FirestoreValue::from_double(*current as f64 + delta as f64),
                }
            } else {
                FirestoreValue::from_double(*current as f64 + delta_f.unwrap_or(0.0))
            }
        }
        Some(ValueKind::Double(current)) => {
            FirestoreValue::from_double(current + delta_f.or(delta_i.map(|d| d as f64)).unwrap_or(0.0))
        }
        _ => match (delta_i, delta_f) {
            (Some(d), _) => FirestoreValue::from_integer(d),
            (None, Some(d)) => FirestoreValue::from_double(d),
            (None, None) => FirestoreValue::from_integer(0),
        },
    }
}

/// A single write to be applied to one document. See spec §3.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    Set {
        key: DocumentKey,
        value: MapValue,
        precondition: Precondition,
    },
    Patch {
        key: DocumentKey,
        value: MapValue,
        field_mask: Vec<FieldPath>,
        precondition: Precondition,
    },
    Delete {
        key: DocumentKey,
        precondition: Precondition,
    },
    Transform {
        key: DocumentKey,
        field_transforms: Vec<FieldTransform>,
        precondition: Precondition,
    },
}

impl Mutation {
    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set { key, .. }
            | Mutation::Patch { key, .. }
            | Mutation::Delete { key, .. }
            | Mutation::Transform { key, .. } => key,
        }
    }

    pub fn precondition(&self) -> &Precondition {
        match self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Transform { precondition, .. } => precondition,
        }
    }

    /// Field paths touched by non-idempotent transforms, used by
    /// `LocalStore::local_write` to synthesize a base mutation (spec §4.1
    /// step 2, §9 "Non-idempotent transforms").
    pub fn transform_paths(&self) -> &[FieldTransform] {
        match self {
            Mutation::Transform { field_transforms, .. } => field_transforms,
            _ => &[],
        }
    }

    /// Applies this mutation to `existing`, returning the new document, or
    /// `None` if the precondition does not hold — callers fold mutations in
    /// order and keep the previous value when `None` comes back, rather than
    /// aborting the whole fold (see SPEC_FULL.md §4.5).
    pub fn apply(
        &self,
        existing: Option<&MaybeDocument>,
        write_time: Timestamp,
    ) -> Option<MaybeDocument> {
        if !self.precondition().holds(existing) {
            return None;
        }

        match self {
            Mutation::Set { key, value, .. } => Some(MaybeDocument::Document(Document {
                key: key.clone(),
                version: write_time,
                fields: value.clone(),
                has_pending_writes: true,
            })),
            Mutation::Patch {
                key,
                value,
                field_mask,
                ..
            } => {
                let mut fields = existing_fields(existing);
                for path in field_mask {
                    match value.get(path) {
                        Some(v) => fields.set(path, v.clone()),
                        None => fields.remove(path),
                    }
                }
                Some(MaybeDocument::Document(Document {
                    key: key.clone(),
                    version: write_time,
                    fields,
                    has_pending_writes: true,
                }))
            }
            Mutation::Delete { key, .. } => {
                let prev_version = existing.map(MaybeDocument::version).unwrap_or(Timestamp::min_value());
                Some(MaybeDocument::NoDocument(NoDocument {
                    key: key.clone(),
                    version: prev_version,
                }))
            }
            Mutation::Transform {
                key,
                field_transforms,
                ..
            } => {
                let mut fields = existing_fields(existing);
                let base = fields.clone();
                for transform in field_transforms {
                    let value = transform.resolve(&base, write_time);
                    fields.set(&transform.field_path, value);
                }
                Some(MaybeDocument::Document(Document {
                    key: key.clone(),
                    version: write_time,
                    fields,
                    has_pending_writes: true,
                }))
            }
        }
    }
}

fn existing_fields(existing: Option<&MaybeDocument>) -> MapValue {
    match existing {
        Some(MaybeDocument::Document(doc)) => doc.fields.clone(),
        _ => MapValue::empty(),
    }
}

/// A group of mutations written atomically by the local client (spec §3).
/// `base_mutations` are synthetic `Patch`es capturing the pre-image of
/// fields feeding non-idempotent transforms, applied before `mutations`.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatch {
    pub batch_id: i64,
    pub local_write_time: Timestamp,
    pub base_mutations: Vec<Mutation>,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.base_mutations
            .iter()
            .chain(self.mutations.iter())
            .map(|m| m.key().clone())
            .collect()
    }

    fn ordered_mutations(&self) -> impl Iterator<Item = &Mutation> {
        self.base_mutations.iter().chain(self.mutations.iter())
    }

    /// Folds this batch's mutations for `key` atop `existing`, using the
    /// batch's local write time — the read path while the batch is still
    /// pending (`hasPendingWrites = true`).
    pub fn apply_to_local_view(
        &self,
        key: &DocumentKey,
        existing: Option<MaybeDocument>,
    ) -> Option<MaybeDocument> {
        let mut current = existing;
        for mutation in self.ordered_mutations().filter(|m| m.key() == key) {
            if let Some(next) = mutation.apply(current.as_ref(), self.local_write_time) {
                current = Some(next);
            }
        }
        current
    }

    /// Folds this batch's mutations for `key` atop the remote doc at ack
    /// time, using the server's commit version and clearing
    /// `hasPendingWrites` (spec §4.1 `acknowledgeBatch`).
    pub fn apply_to_remote_document(
        &self,
        key: &DocumentKey,
        existing: Option<MaybeDocument>,
        commit_version: Timestamp,
    ) -> Option<MaybeDocument> {
        let mut current = existing;
        let mut touched = false;
        for mutation in self.ordered_mutations().filter(|m| m.key() == key) {
            if let Some(next) = mutation.apply(current.as_ref(), commit_version) {
                current = Some(next);
                touched = true;
            }
        }
        if !touched {
            return current;
        }
        current.map(|doc| match doc {
            MaybeDocument::Document(mut document) => {
                document.has_pending_writes = false;
                MaybeDocument::Document(document)
            }
            other => other,
        })
    }
}

/// Server acknowledgement of a previously appended [`MutationBatch`].
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: Timestamp,
    pub doc_versions: std::collections::BTreeMap<DocumentKey, Timestamp>,
    pub stream_token: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn set_ignores_existing_fields() {
        let mut fields = BTreeMap::new();
        fields.insert("x".to_string(), FirestoreValue::from_integer(1));
        let mutation = Mutation::Set {
            key: key("cities/sf"),
            value: MapValue::new(fields),
            precondition: Precondition::None,
        };
        let result = mutation.apply(None, Timestamp::new(1, 0)).unwrap();
        match result {
            MaybeDocument::Document(doc) => assert!(doc.has_pending_writes),
            _ => panic!("expected document"),
        }
    }

    #[test]
    fn exists_precondition_blocks_patch_on_missing_doc() {
        let mutation = Mutation::Patch {
            key: key("cities/sf"),
            value: MapValue::empty(),
            field_mask: vec![],
            precondition: Precondition::Exists(true),
        };
        assert!(mutation.apply(None, Timestamp::new(1, 0)).is_none());
    }

    #[test]
    fn delete_produces_tombstone_at_previous_version() {
        let existing = MaybeDocument::Document(Document {
            key: key("cities/sf"),
            version: Timestamp::new(5, 0),
            fields: MapValue::empty(),
            has_pending_writes: false,
        });
        let mutation = Mutation::Delete {
            key: key("cities/sf"),
            precondition: Precondition::None,
        };
        let result = mutation.apply(Some(&existing), Timestamp::new(9, 0)).unwrap();
        match result {
            MaybeDocument::NoDocument(doc) => assert_eq!(doc.version, Timestamp::new(5, 0)),
            _ => panic!("expected tombstone"),
        }
    }

    #[test]
    fn increment_accumulates_against_base_snapshot() {
        let mut fields = BTreeMap::new();
        fields.insert("count".to_string(), FirestoreValue::from_integer(4));
        let existing = MaybeDocument::Document(Document {
            key: key("counters/c"),
            version: Timestamp::new(1, 0),
            fields: MapValue::new(fields),
            has_pending_writes: false,
        });
        let mutation = Mutation::Transform {
            key: key("counters/c"),
            field_transforms: vec![FieldTransform::new(
                FieldPath::from_dot_separated("count").unwrap(),
                TransformOperation::Increment(FirestoreValue::from_integer(3)),
            )],
            precondition: Precondition::None,
        };
        let result = mutation.apply(Some(&existing), Timestamp::new(2, 0)).unwrap();
        match result {
            MaybeDocument::Document(doc) => {
                let path = FieldPath::from_dot_separated("count").unwrap();
                match doc.fields.get(&path).unwrap().kind() {
                    ValueKind::Integer(value) => assert_eq!(*value, 7),
                    _ => panic!("expected integer"),
                }
            }
            _ => panic!("expected document"),
        }
    }

    #[test]
    fn batch_acknowledgement_clears_pending_writes() {
        let batch = MutationBatch {
            batch_id: 1,
            local_write_time: Timestamp::new(1, 0),
            base_mutations: vec![],
            mutations: vec![Mutation::Set {
                key: key("cities/sf"),
                value: MapValue::empty(),
                precondition: Precondition::None,
            }],
        };
        let result = batch
            .apply_to_remote_document(&key("cities/sf"), None, Timestamp::new(10, 0))
            .unwrap();
        assert!(!result.has_pending_writes());
    }
}
