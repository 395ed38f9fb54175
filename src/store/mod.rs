//! Document store collaborator.
//!
//! The relay only depends on the [`DocumentStore`] trait: per-document CRUD plus a
//! callback-style listen primitive with snapshot-diff semantics. The in-memory
//! implementation is the reference for those semantics.

mod memory;
mod models;

pub use memory::InMemoryDocumentStore;
pub use models::{
    is_collection_path, is_document_path, parent_collection, ChangeKind, Direction, Document,
    DocumentChange, FieldFilter, Fields, OrderBy, OrderField, Query, WatchTarget,
};

use async_trait::async_trait;
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("document store unavailable: {0}")]
    Unavailable(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("document store call timed out: {0}")]
    Timeout(String),
}

impl StoreError {
    /// Transient errors are worth re-listening after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::Unavailable(_) => "unavailable",
            StoreError::PermissionDenied(_) => "permission_denied",
            StoreError::NotFound(_) => "not_found",
            StoreError::InvalidPath(_) => "invalid_path",
            StoreError::Timeout(_) => "timeout",
        }
    }
}

/// Callback invoked by the store with each change batch, in commit order.
///
/// Invoked while the store serializes writes; implementations must not block and must
/// not call back into the store.
pub type SnapshotListener = Box<dyn Fn(StoreResult<Vec<DocumentChange>>) + Send + Sync>;

/// Handle returned by [`DocumentStore::listen`]. Removing twice is a no-op.
pub trait ListenerRegistration: Send + Sync {
    fn remove(&self);
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, path: &str) -> StoreResult<Option<Document>>;

    /// Creates a document with a generated id under `collection`.
    async fn add(&self, collection: &str, fields: Fields) -> StoreResult<Document>;

    /// Creates or replaces the document at `path`.
    async fn set(&self, path: &str, fields: Fields) -> StoreResult<Document>;

    /// Merges `fields` into an existing document.
    async fn update(&self, path: &str, fields: Fields) -> StoreResult<Document>;

    async fn delete(&self, path: &str) -> StoreResult<()>;

    async fn query(&self, query: &Query) -> StoreResult<Vec<Document>>;

    /// Attaches a listener. The first batch describes the current state as `Added`
    /// changes and, unless empty, is delivered before this returns; later batches
    /// describe the diff caused by each write.
    fn listen(
        &self,
        target: &WatchTarget,
        listener: SnapshotListener,
    ) -> StoreResult<Box<dyn ListenerRegistration>>;
}
