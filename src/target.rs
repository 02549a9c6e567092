//! A client-side representation of a server-side listen query (spec §3,
//! glossary "Target"), plus the persisted metadata the target registry keeps
//! about it.
//!
//! `Target`'s filter/order/bound shape is modeled on the teacher's
//! `api/query.rs::QueryDefinition` — stripped of the public fluent builder
//! and validation (out of scope: CLI/SDK surface), keeping only the already
//! -normalized shape the local store and query engine actually operate on.

use std::cmp::Ordering as CmpOrdering;

use crate::model::{ResourcePath, Timestamp};
use crate::value::FirestoreValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterOperator {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    pub field: crate::model::FieldPath,
    pub operator: FilterOperator,
    pub value: FirestoreValue,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderDirection {
    Ascending,
    Descending,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderBy {
    pub field: crate::model::FieldPath,
    pub direction: OrderDirection,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimitType {
    First,
    Last,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Bound {
    pub values: Vec<FirestoreValue>,
    pub inclusive: bool,
}

/// The normalized, already-compiled shape a query reduces to before it
/// reaches the target registry. Two `Target`s that would produce the same
/// server-side listen compare equal.
#[derive(Clone, Debug, PartialEq)]
pub struct Target {
    pub path: ResourcePath,
    pub collection_group: Option<String>,
    pub filters: Vec<FieldFilter>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<(u32, LimitType)>,
    pub start_at: Option<Bound>,
    pub end_at: Option<Bound>,
}

impl Target {
    pub fn for_collection(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            start_at: None,
            end_at: None,
        }
    }

    /// Canonical string identifying an equivalent server-side listen, used
    /// to key the umbrella target for a given bundle (spec §4.8) and to
    /// detect when `allocateTarget` can reuse an existing `TargetData`.
    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            id.push_str("|group=");
            id.push_str(group);
        }
        for filter in &self.filters {
            id.push('|');
            id.push_str(&filter.field.canonical_string());
            id.push_str(&format!("{:?}", filter.operator));
        }
        for order in &self.order_by {
            id.push('|');
            id.push_str(&order.field.canonical_string());
            id.push_str(&format!("{:?}", order.direction));
        }
        id
    }

    /// Whether `key` belongs to this target's collection, or — for a
    /// collection-group target — any collection sharing its id at any depth.
    /// Used to find locally pending writes a query should see even before
    /// the remote cache has anything matching to scan (spec §4.1
    /// `executeQuery`).
    pub fn matches_key(&self, key: &crate::model::DocumentKey) -> bool {
        match &self.collection_group {
            Some(group) => key.collection_path().last_segment() == Some(group.as_str()),
            None => key.collection_path() == self.path,
        }
    }

    /// Synthesizes a target keyed by the synthetic umbrella path
    /// `__bundle__/docs/<bundle_name>` (spec §4.8).
    pub fn umbrella_for_bundle(bundle_name: &str) -> Self {
        Self::for_collection(ResourcePath::from_string(&format!(
            "__bundle__/docs/{bundle_name}"
        ))
        .expect("bundle name must not introduce empty path segments"))
    }
}

/// Why a target exists: an app-initiated listen, a diagnostic re-listen
/// after an existence-filter mismatch, or a limbo-document resolution watch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetPurpose {
    Listen,
    ExistenceFilterMismatch,
    LimboResolution,
}

/// Persisted (and in-memory working-copy) bookkeeping for one target. See
/// spec §3.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetData {
    pub target: Target,
    pub target_id: i32,
    pub purpose: TargetPurpose,
    pub sequence_number: u64,
    pub snapshot_version: Timestamp,
    pub last_limbo_free_snapshot_version: Timestamp,
    pub resume_token: Vec<u8>,
}

impl TargetData {
    pub fn new(target: Target, target_id: i32, purpose: TargetPurpose, sequence_number: u64) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: Timestamp::min_value(),
            last_limbo_free_snapshot_version: Timestamp::min_value(),
            resume_token: Vec::new(),
        }
    }

    /// Returns a copy with the resume token, snapshot version, and sequence
    /// number updated, as done when applying a non-empty-token
    /// `TargetChange` (spec §4.2 step 1b).
    pub fn with_resume_token(
        &self,
        resume_token: Vec<u8>,
        snapshot_version: Timestamp,
        sequence_number: u64,
    ) -> Self {
        Self {
            resume_token,
            snapshot_version,
            sequence_number,
            ..self.clone()
        }
    }

    /// Ordering used by `allocateTarget`'s multi-tab race guard: "insert
    /// iff the returned data's snapshotVersion is newer than any cached
    /// in-memory entry" (spec §4.1).
    pub fn is_newer_than(&self, other: &TargetData) -> bool {
        self.snapshot_version.cmp(&other.snapshot_version) == CmpOrdering::Greater
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn umbrella_target_path_is_synthetic() {
        let target = Target::umbrella_for_bundle("b1");
        assert_eq!(target.path.canonical_string(), "__bundle__/docs/b1");
    }

    #[test]
    fn newer_snapshot_version_wins_race() {
        let target = Target::for_collection(ResourcePath::from_string("cities").unwrap());
        let older = TargetData::new(target.clone(), 1, TargetPurpose::Listen, 0);
        let mut newer = older.clone();
        newer.snapshot_version = Timestamp::new(5, 0);
        assert!(newer.is_newer_than(&older));
        assert!(!older.is_newer_than(&newer));
    }
}
