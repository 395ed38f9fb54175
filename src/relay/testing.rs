//! Store double whose listeners keep firing after removal.

use async_trait::async_trait;

use crate::store::{
    Document, DocumentStore, Fields, InMemoryDocumentStore, ListenerRegistration, Query,
    SnapshotListener, StoreResult, WatchTarget,
};

/// Wraps an [`InMemoryDocumentStore`] but never detaches listeners, so callbacks
/// arrive after the consumer cancelled, the way a remote backend may deliver a
/// snapshot that was already in flight.
#[derive(Clone, Default)]
pub(crate) struct LateDeliveryStore {
    inner: InMemoryDocumentStore,
}

struct IgnoredRegistration;

impl ListenerRegistration for IgnoredRegistration {
    fn remove(&self) {}
}

impl LateDeliveryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn late_listener_count(&self) -> usize {
        self.inner.listener_count()
    }
}

#[async_trait]
impl DocumentStore for LateDeliveryStore {
    async fn get(&self, path: &str) -> StoreResult<Option<Document>> {
        self.inner.get(path).await
    }

    async fn add(&self, collection: &str, fields: Fields) -> StoreResult<Document> {
        self.inner.add(collection, fields).await
    }

    async fn set(&self, path: &str, fields: Fields) -> StoreResult<Document> {
        self.inner.set(path, fields).await
    }

    async fn update(&self, path: &str, fields: Fields) -> StoreResult<Document> {
        self.inner.update(path, fields).await
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        self.inner.delete(path).await
    }

    async fn query(&self, query: &Query) -> StoreResult<Vec<Document>> {
        self.inner.query(query).await
    }

    fn listen(
        &self,
        target: &WatchTarget,
        listener: SnapshotListener,
    ) -> StoreResult<Box<dyn ListenerRegistration>> {
        self.inner.listen(target, listener)?;
        Ok(Box::new(IgnoredRegistration))
    }
}
