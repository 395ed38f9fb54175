//! In-process document store with change-feed listeners.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::debug;

use super::models::{is_collection_path, is_document_path, ChangeKind, DocumentChange};
use super::{
    Document, DocumentStore, Fields, ListenerRegistration, Query, SnapshotListener, StoreError,
    StoreResult, WatchTarget,
};

struct ListenerEntry {
    target: WatchTarget,
    callback: SnapshotListener,
    /// Result set last reported to this listener.
    current: Vec<Document>,
}

struct StoreInner {
    documents: BTreeMap<String, Document>,
    listeners: BTreeMap<u64, ListenerEntry>,
    next_listener_id: u64,
    last_time: DateTime<Utc>,
    unavailable: Option<String>,
}

impl StoreInner {
    /// Strictly increasing server time.
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = if now > self.last_time {
            now
        } else {
            self.last_time + Duration::microseconds(1)
        };
        self.last_time = stamp;
        stamp
    }

    fn check_available(&self) -> StoreResult<()> {
        match &self.unavailable {
            Some(reason) => Err(StoreError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }

    fn evaluate(&self, target: &WatchTarget) -> Vec<Document> {
        match target {
            WatchTarget::Document(path) => self.documents.get(path).cloned().into_iter().collect(),
            WatchTarget::Query(query) => self.run_query(query),
        }
    }

    fn run_query(&self, query: &Query) -> Vec<Document> {
        let mut results: Vec<Document> = self
            .documents
            .values()
            .filter(|d| query.matches(d))
            .cloned()
            .collect();
        query.arrange(&mut results);
        results
    }

    fn write(&mut self, path: &str, fields: Fields, merge: bool) -> Document {
        let now = self.next_timestamp();
        let document = match self.documents.get(path) {
            Some(existing) => {
                let data = if merge {
                    let mut data = existing.data.clone();
                    data.extend(fields);
                    data
                } else {
                    fields
                };
                Document {
                    data,
                    update_time: now,
                    ..existing.clone()
                }
            }
            None => Document {
                id: path.rsplit('/').next().unwrap_or(path).to_string(),
                path: path.to_string(),
                data: fields,
                create_time: now,
                update_time: now,
            },
        };
        self.documents.insert(path.to_string(), document.clone());
        self.notify(path);
        document
    }

    /// Re-evaluates every listener affected by a write to `path` and reports the diff.
    fn notify(&mut self, path: &str) {
        let affected: Vec<u64> = self
            .listeners
            .iter()
            .filter(|(_, l)| l.target.is_affected_by(path))
            .map(|(id, _)| *id)
            .collect();

        for id in affected {
            let Some(target) = self.listeners.get(&id).map(|l| l.target.clone()) else {
                continue;
            };
            let next = self.evaluate(&target);
            if let Some(listener) = self.listeners.get_mut(&id) {
                let changes = diff(&listener.current, &next);
                listener.current = next;
                if !changes.is_empty() {
                    (listener.callback)(Ok(changes));
                }
            }
        }
    }
}

fn diff(previous: &[Document], next: &[Document]) -> Vec<DocumentChange> {
    let mut changes = Vec::new();
    for old in previous {
        if !next.iter().any(|d| d.path == old.path) {
            changes.push(DocumentChange {
                kind: ChangeKind::Removed,
                document: old.clone(),
            });
        }
    }
    for new in next {
        match previous.iter().find(|d| d.path == new.path) {
            None => changes.push(DocumentChange {
                kind: ChangeKind::Added,
                document: new.clone(),
            }),
            Some(old) if old.update_time != new.update_time => changes.push(DocumentChange {
                kind: ChangeKind::Modified,
                document: new.clone(),
            }),
            Some(_) => {}
        }
    }
    changes
}

/// Document store kept entirely in memory.
///
/// Listener callbacks run synchronously inside the write that caused them, which gives
/// each listener strict commit-order delivery.
#[derive(Clone)]
pub struct InMemoryDocumentStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                documents: BTreeMap::new(),
                listeners: BTreeMap::new(),
                next_listener_id: 1,
                last_time: DateTime::<Utc>::MIN_UTC,
                unavailable: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Loads `{ "<document path>": { fields } }` entries. Returns the number written.
    pub fn seed(&self, documents: &serde_json::Map<String, Value>) -> StoreResult<usize> {
        let mut inner = self.lock();
        let mut written = 0;
        for (path, fields) in documents {
            if !is_document_path(path) {
                return Err(StoreError::InvalidPath(path.clone()));
            }
            let fields = match fields {
                Value::Object(map) => map.clone(),
                _ => return Err(StoreError::InvalidPath(format!("{path}: fields must be an object"))),
            };
            inner.write(path, fields, false);
            written += 1;
        }
        Ok(written)
    }

    /// Makes every call fail with [`StoreError::Unavailable`] until cleared with `None`.
    pub fn set_unavailable(&self, reason: Option<String>) {
        self.lock().unavailable = reason;
    }

    /// Delivers `error` to every listener and detaches them, like a dropped backend stream.
    pub fn fail_listeners(&self, error: StoreError) {
        let mut inner = self.lock();
        let listeners = std::mem::take(&mut inner.listeners);
        for (_, listener) in listeners {
            (listener.callback)(Err(error.clone()));
        }
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    pub fn document_count(&self) -> usize {
        self.lock().documents.len()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, path: &str) -> StoreResult<Option<Document>> {
        let inner = self.lock();
        inner.check_available()?;
        if !is_document_path(path) {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        Ok(inner.documents.get(path).cloned())
    }

    async fn add(&self, collection: &str, fields: Fields) -> StoreResult<Document> {
        let mut inner = self.lock();
        inner.check_available()?;
        if !is_collection_path(collection) {
            return Err(StoreError::InvalidPath(collection.to_string()));
        }
        let id = uuid::Uuid::new_v4().simple().to_string();
        let path = format!("{}/{}", collection, id);
        Ok(inner.write(&path, fields, false))
    }

    async fn set(&self, path: &str, fields: Fields) -> StoreResult<Document> {
        let mut inner = self.lock();
        inner.check_available()?;
        if !is_document_path(path) {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        Ok(inner.write(path, fields, false))
    }

    async fn update(&self, path: &str, fields: Fields) -> StoreResult<Document> {
        let mut inner = self.lock();
        inner.check_available()?;
        if !inner.documents.contains_key(path) {
            return Err(StoreError::NotFound(path.to_string()));
        }
        Ok(inner.write(path, fields, true))
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        let mut inner = self.lock();
        inner.check_available()?;
        if inner.documents.remove(path).is_some() {
            inner.notify(path);
        }
        Ok(())
    }

    async fn query(&self, query: &Query) -> StoreResult<Vec<Document>> {
        let inner = self.lock();
        inner.check_available()?;
        if !is_collection_path(&query.collection) {
            return Err(StoreError::InvalidPath(query.collection.clone()));
        }
        Ok(inner.run_query(query))
    }

    fn listen(
        &self,
        target: &WatchTarget,
        listener: SnapshotListener,
    ) -> StoreResult<Box<dyn ListenerRegistration>> {
        let mut inner = self.lock();
        inner.check_available()?;
        let valid = match target {
            WatchTarget::Document(path) => is_document_path(path),
            WatchTarget::Query(query) => is_collection_path(&query.collection),
        };
        if !valid {
            return Err(StoreError::InvalidPath(target.to_string()));
        }

        let current = inner.evaluate(target);
        let initial = diff(&[], &current);
        if !initial.is_empty() {
            listener(Ok(initial));
        }

        let id = inner.next_listener_id;
        inner.next_listener_id += 1;
        inner.listeners.insert(
            id,
            ListenerEntry {
                target: target.clone(),
                callback: listener,
                current,
            },
        );
        debug!("Attached store listener {} on {}", id, target);

        Ok(Box::new(MemoryRegistration {
            id,
            inner: Arc::downgrade(&self.inner),
        }))
    }
}

struct MemoryRegistration {
    id: u64,
    inner: Weak<Mutex<StoreInner>>,
}

impl ListenerRegistration for MemoryRegistration {
    fn remove(&self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut inner = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if inner.listeners.remove(&self.id).is_some() {
                debug!("Detached store listener {}", self.id);
            }
        }
    }
}
