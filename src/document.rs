//! The tagged document variant at the heart of the local view: either a
//! live `Document` with fields, or a `NoDocument` tombstone. See spec §3.

use crate::model::{DocumentKey, Timestamp};
use crate::value::MapValue;

/// A document as last known from the server, or a local view overlaying
/// pending mutations atop it. `version = Timestamp::min_value()` marks a
/// manufactured tombstone (see [`NoDocument::is_manufactured`]) and must
/// never be written to the remote document cache.
#[derive(Clone, Debug, PartialEq)]
pub enum MaybeDocument {
    Document(Document),
    NoDocument(NoDocument),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    pub key: DocumentKey,
    pub version: Timestamp,
    pub fields: MapValue,
    pub has_pending_writes: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NoDocument {
    pub key: DocumentKey,
    pub version: Timestamp,
}

impl NoDocument {
    /// A tombstone manufactured locally (e.g. permission-denied limbo
    /// resolution) rather than reported by the server.
    pub fn is_manufactured(&self) -> bool {
        self.version == Timestamp::min_value()
    }

    pub fn manufactured(key: DocumentKey) -> Self {
        Self {
            key,
            version: Timestamp::min_value(),
        }
    }
}

impl MaybeDocument {
    pub fn key(&self) -> &DocumentKey {
        match self {
            MaybeDocument::Document(doc) => &doc.key,
            MaybeDocument::NoDocument(doc) => &doc.key,
        }
    }

    pub fn version(&self) -> Timestamp {
        match self {
            MaybeDocument::Document(doc) => doc.version,
            MaybeDocument::NoDocument(doc) => doc.version,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        match self {
            MaybeDocument::Document(doc) => doc.has_pending_writes,
            MaybeDocument::NoDocument(_) => false,
        }
    }

    pub fn is_document(&self) -> bool {
        matches!(self, MaybeDocument::Document(_))
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            MaybeDocument::Document(doc) => Some(doc),
            MaybeDocument::NoDocument(_) => None,
        }
    }

    /// True for a manufactured permission-denied tombstone. See invariant 2
    /// in spec §3: these must never reach the remote document cache.
    pub fn is_manufactured_no_document(&self) -> bool {
        matches!(self, MaybeDocument::NoDocument(doc) if doc.is_manufactured())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn manufactured_tombstone_has_min_version() {
        let doc = NoDocument::manufactured(key("cities/sf"));
        assert!(doc.is_manufactured());
        assert_eq!(doc.version, Timestamp::min_value());
    }

    #[test]
    fn ordinary_no_document_is_not_manufactured() {
        let doc = NoDocument {
            key: key("cities/sf"),
            version: Timestamp::new(10, 0),
        };
        assert!(!doc.is_manufactured());
    }

    #[test]
    fn document_reports_pending_writes() {
        let doc = MaybeDocument::Document(Document {
            key: key("cities/sf"),
            version: Timestamp::new(5, 0),
            fields: MapValue::new(BTreeMap::new()),
            has_pending_writes: true,
        });
        assert!(doc.has_pending_writes());
        assert!(doc.is_document());
    }
}
