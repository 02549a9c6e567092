//! Client-side local persistence and sync bookkeeping for a Firestore-style
//! document database: a mutation queue, remote document cache, target
//! registry, local view overlay, and bundle loader, coordinated through a
//! single-threaded, transactional [`LocalStore`](crate::local_store::LocalStore).

pub mod bundle;
pub mod document;
pub mod error;
pub mod gc;
pub mod local_documents;
pub mod local_store;
pub mod model;
pub mod mutation;
pub mod persistence;
pub mod query_engine;
pub mod remote_event;
pub mod target;
pub mod user;
pub mod value;

pub use document::{Document, MaybeDocument, NoDocument};
pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
pub use local_store::{LocalStore, LocalViewChanges, LocalWriteResult};
pub use model::{DocumentKey, FieldPath, ResourcePath, Timestamp};
pub use mutation::{Mutation, MutationBatch, MutationBatchResult, Precondition};
pub use target::{Target, TargetData, TargetPurpose};
pub use user::User;
