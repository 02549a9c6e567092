//! Evaluates a [`Target`] against the local view: filter, order, bound,
//! and limit, in that order. See spec §4.1 `executeQuery`, §6 `QueryEngine`.
//!
//! Grounded on the teacher's `src/firestore/query_evaluator.rs` — same
//! filter/compare/bound pipeline, retargeted from `QueryDefinition`/
//! `DocumentSnapshot` to this crate's `Target`/`Document` and fed by
//! [`crate::local_documents::LocalDocumentsView`] instead of an
//! already-fetched snapshot list.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::document::MaybeDocument;
use crate::error::FirestoreResult;
use crate::local_documents::LocalDocumentsView;
use crate::model::{DocumentKey, FieldPath, Timestamp};
use crate::target::{Bound, FieldFilter, FilterOperator, LimitType, OrderBy, OrderDirection, Target};
use crate::value::{FirestoreValue, ValueKind};

/// The result of executing a query against the local view (spec §4.1
/// `executeQuery`): the matched documents plus which remote keys were
/// consulted, so a caller tracking limbo resolution knows what the server
/// side of this listen currently contains.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub documents: Vec<MaybeDocument>,
    pub remote_keys: BTreeSet<DocumentKey>,
}

/// Evaluates targets against a [`LocalDocumentsView`]. Stateless beyond the
/// view handle; the coordinator constructs one per `executeQuery` call.
pub struct QueryEngine<'a> {
    local_documents: &'a LocalDocumentsView,
}

impl<'a> QueryEngine<'a> {
    pub fn new(local_documents: &'a LocalDocumentsView) -> Self {
        Self { local_documents }
    }

    /// `sinceVersion`/`remote_keys` implement the "previous results"
    /// optimization (spec §8 invariant 7): when non-trivial, the caller is
    /// asserting it already knows the expected result set as of
    /// `sinceVersion` and the engine may use it to avoid rescanning docs
    /// with no reason to have changed. The in-memory engine has no index to
    /// skip work with, so it always does the full scan — the parameters
    /// exist so the public signature matches what a smarter engine would
    /// take, and so correctness (same answer either way) is observable.
    pub async fn get_documents_matching_query(
        &self,
        target: &Target,
        _since_version: Timestamp,
        _remote_keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<QueryResult> {
        let candidates = self
            .local_documents
            .get_documents_matching_collection(&target.path, target.collection_group.as_deref())
            .await?;

        let remote_keys = candidates.keys().cloned().collect();

        let mut matched: Vec<MaybeDocument> = candidates
            .into_values()
            .filter(|doc| doc.is_document())
            .filter(|doc| satisfies_filters(doc, &target.filters))
            .collect();

        matched.sort_by(|left, right| compare_documents(left, right, &target.order_by));

        if let Some(bound) = &target.start_at {
            matched.retain(|doc| !is_before_start_bound(doc, bound, &target.order_by));
        }
        if let Some(bound) = &target.end_at {
            matched.retain(|doc| !is_after_end_bound(doc, bound, &target.order_by));
        }

        if let Some((limit, limit_type)) = target.limit {
            let limit = limit as usize;
            match limit_type {
                LimitType::First => matched.truncate(limit),
                LimitType::Last => {
                    if matched.len() > limit {
                        let start = matched.len() - limit;
                        matched.drain(0..start);
                    }
                }
            }
        }

        Ok(QueryResult {
            documents: matched,
            remote_keys,
        })
    }
}

fn satisfies_filters(doc: &MaybeDocument, filters: &[FieldFilter]) -> bool {
    filters.iter().all(|filter| match field_value(doc, &filter.field) {
        Some(value) => evaluate_filter(filter, &value),
        None => matches!(filter.operator, FilterOperator::NotEqual | FilterOperator::NotIn),
    })
}

fn evaluate_filter(filter: &FieldFilter, value: &FirestoreValue) -> bool {
    match filter.operator {
        FilterOperator::Equal => *value == filter.value,
        FilterOperator::NotEqual => *value != filter.value,
        FilterOperator::LessThan => compare_values(value, &filter.value) == Some(Ordering::Less),
        FilterOperator::LessThanOrEqual => {
            matches!(compare_values(value, &filter.value), Some(Ordering::Less | Ordering::Equal))
        }
        FilterOperator::GreaterThan => compare_values(value, &filter.value) == Some(Ordering::Greater),
        FilterOperator::GreaterThanOrEqual => matches!(
            compare_values(value, &filter.value),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        FilterOperator::ArrayContains => match value.kind() {
            ValueKind::Array(array) => array.values().iter().any(|candidate| candidate == &filter.value),
            _ => false,
        },
        FilterOperator::ArrayContainsAny => match (value.kind(), filter.value.kind()) {
            (ValueKind::Array(array), ValueKind::Array(needles)) => needles
                .values()
                .iter()
                .any(|needle| array.values().iter().any(|candidate| candidate == needle)),
            _ => false,
        },
        FilterOperator::In => match filter.value.kind() {
            ValueKind::Array(values) => values.values().iter().any(|needle| needle == value),
            _ => false,
        },
        FilterOperator::NotIn => match filter.value.kind() {
            ValueKind::Array(values) => {
                !matches!(value.kind(), ValueKind::Null)
                    && values.values().iter().all(|needle| needle != value)
            }
            _ => false,
        },
    }
}

fn field_value(doc: &MaybeDocument, field: &FieldPath) -> Option<FirestoreValue> {
    let document = doc.as_document()?;
    if field == &FieldPath::document_id() {
        return Some(FirestoreValue::from_reference(document.key.path().canonical_string()));
    }
    document.fields.get(field).cloned()
}

fn compare_documents(left: &MaybeDocument, right: &MaybeDocument, order_by: &[OrderBy]) -> Ordering {
    for order in order_by {
        let left_value = field_value(left, &order.field).unwrap_or_else(FirestoreValue::null);
        let right_value = field_value(right, &order.field).unwrap_or_else(FirestoreValue::null);
        let mut ordering = compare_values(&left_value, &right_value).unwrap_or(Ordering::Equal);
        if order.direction == OrderDirection::Descending {
            ordering = ordering.reverse();
        }
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left.key().cmp(right.key())
}

fn compare_values(left: &FirestoreValue, right: &FirestoreValue) -> Option<Ordering> {
    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => Some(Ordering::Equal),
        (ValueKind::Boolean(a), ValueKind::Boolean(b)) => Some(a.cmp(b)),
        (ValueKind::Integer(a), ValueKind::Integer(b)) => Some(a.cmp(b)),
        (ValueKind::Double(a), ValueKind::Double(b)) => a.partial_cmp(b),
        (ValueKind::Integer(a), ValueKind::Double(b)) => (*a as f64).partial_cmp(b),
        (ValueKind::Double(a), ValueKind::Integer(b)) => a.partial_cmp(&(*b as f64)),
        (ValueKind::String(a), ValueKind::String(b)) => Some(a.cmp(b)),
        (ValueKind::Reference(a), ValueKind::Reference(b)) => Some(a.cmp(b)),
        (ValueKind::Timestamp(a), ValueKind::Timestamp(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn compare_to_bound(doc: &MaybeDocument, bound: &Bound, order_by: &[OrderBy]) -> Ordering {
    for (index, order) in order_by.iter().enumerate() {
        let Some(bound_value) = bound.values.get(index) else {
            break;
        };
        let doc_value = field_value(doc, &order.field).unwrap_or_else(FirestoreValue::null);
        let mut ordering = compare_values(&doc_value, bound_value).unwrap_or(Ordering::Equal);
        if order.direction == OrderDirection::Descending {
            ordering = ordering.reverse();
        }
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn is_before_start_bound(doc: &MaybeDocument, bound: &Bound, order_by: &[OrderBy]) -> bool {
    let ordering = compare_to_bound(doc, bound, order_by);
    if bound.inclusive {
        ordering == Ordering::Less
    } else {
        ordering != Ordering::Greater
    }
}

fn is_after_end_bound(doc: &MaybeDocument, bound: &Bound, order_by: &[OrderBy]) -> bool {
    let ordering = compare_to_bound(doc, bound, order_by);
    if bound.inclusive {
        ordering == Ordering::Greater
    } else {
        ordering != Ordering::Less
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DocumentKey as Key, ResourcePath};
    use crate::mutation::{Mutation, MutationBatch, Precondition};
    use crate::persistence::{MemoryPersistence, Persistence, PersistenceSettings};
    use crate::user::User;
    use crate::value::MapValue;
    use std::collections::BTreeMap;

    async fn seed_city(persistence: &MemoryPersistence, id: &str, population: i64) {
        let mut fields = BTreeMap::new();
        fields.insert("population".to_string(), FirestoreValue::from_integer(population));
        let queue = persistence.mutation_queue(&User::unauthenticated());
        queue
            .add_mutation_batch(MutationBatch {
                batch_id: 0,
                local_write_time: Timestamp::new(1, 0),
                base_mutations: vec![],
                mutations: vec![Mutation::Set {
                    key: Key::from_string(&format!("cities/{id}")).unwrap(),
                    value: MapValue::new(fields),
                    precondition: Precondition::None,
                }],
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn orders_and_limits_results() {
        let persistence = MemoryPersistence::new(PersistenceSettings::default());
        seed_city(&persistence, "sf", 100).await;
        seed_city(&persistence, "nyc", 50).await;
        seed_city(&persistence, "la", 75).await;

        let view = LocalDocumentsView::new(
            persistence.remote_document_cache(),
            persistence.mutation_queue(&User::unauthenticated()),
        );
        let engine = QueryEngine::new(&view);

        let mut target = Target::for_collection(ResourcePath::from_string("cities").unwrap());
        target.order_by.push(OrderBy {
            field: FieldPath::from_dot_separated("population").unwrap(),
            direction: OrderDirection::Ascending,
        });
        target.limit = Some((2, LimitType::First));

        let result = engine
            .get_documents_matching_query(&target, Timestamp::min_value(), &BTreeSet::new())
            .await
            .unwrap();

        assert_eq!(result.documents.len(), 2);
        assert_eq!(result.documents[0].key().id(), "nyc");
        assert_eq!(result.documents[1].key().id(), "la");
    }

    #[tokio::test]
    async fn equality_filter_narrows_results() {
        let persistence = MemoryPersistence::new(PersistenceSettings::default());
        seed_city(&persistence, "sf", 100).await;
        seed_city(&persistence, "nyc", 50).await;

        let view = LocalDocumentsView::new(
            persistence.remote_document_cache(),
            persistence.mutation_queue(&User::unauthenticated()),
        );
        let engine = QueryEngine::new(&view);

        let mut target = Target::for_collection(ResourcePath::from_string("cities").unwrap());
        target.filters.push(FieldFilter {
            field: FieldPath::from_dot_separated("population").unwrap(),
            operator: FilterOperator::Equal,
            value: FirestoreValue::from_integer(50),
        });

        let result = engine
            .get_documents_matching_query(&target, Timestamp::min_value(), &BTreeSet::new())
            .await
            .unwrap();

        assert_eq!(result.documents.len(), 1);
        assert_eq!(result.documents[0].key().id(), "nyc");
    }
}
