use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use dg_core::core::{BlobError, BlobFuture, BlobStore, ObjectPage};

use super::{page_of, validate_key};

#[derive(Debug, Clone)]
struct StoredObject {
    content_type: String,
    body: Vec<u8>,
}

/// In-process blob store. Counts successful writes and can be switched to
/// an unreachable state to exercise failure paths.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    puts: AtomicUsize,
    unreachable: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `put` calls so far.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Seeds an object without counting it as a write.
    pub fn insert(&self, key: impl Into<String>, body: impl Into<Vec<u8>>) {
        self.objects().insert(
            key.into(),
            StoredObject {
                content_type: "application/octet-stream".to_owned(),
                body: body.into(),
            },
        );
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects().keys().cloned().collect()
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects().get(key).map(|o| o.content_type.clone())
    }

    pub fn body(&self, key: &str) -> Option<Vec<u8>> {
        self.objects().get(key).map(|o| o.body.clone())
    }

    fn objects(&self) -> MutexGuard<'_, BTreeMap<String, StoredObject>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_reachable(&self) -> Result<(), BlobError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(BlobError::Unreachable("memory store offline".to_owned()));
        }
        Ok(())
    }
}

impl BlobStore for MemoryBlobStore {
    fn put<'a>(
        &'a self,
        key: &'a str,
        content_type: &'a str,
        body: Vec<u8>,
    ) -> BlobFuture<'a, ()> {
        Box::pin(async move {
            self.check_reachable()?;
            validate_key(key)?;
            match self.objects().entry(key.to_owned()) {
                Entry::Occupied(_) => return Err(BlobError::AlreadyExists(key.to_owned())),
                Entry::Vacant(slot) => {
                    slot.insert(StoredObject {
                        content_type: content_type.to_owned(),
                        body,
                    });
                }
            }
            self.puts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
        continuation: Option<&'a str>,
        limit: usize,
    ) -> BlobFuture<'a, ObjectPage> {
        Box::pin(async move {
            self.check_reachable()?;
            let keys = self
                .objects()
                .keys()
                .filter(|key| key.starts_with(prefix))
                .cloned()
                .collect();
            Ok(page_of(keys, continuation, limit))
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BlobFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.check_reachable()?;
            self.body(key)
                .ok_or_else(|| BlobError::ObjectNotFound(key.to_owned()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_counts_and_records_content_type() {
        let store = MemoryBlobStore::new();
        store
            .put("fine_tune/240101000000_x.json", "application/json", b"{}".to_vec())
            .await
            .expect("put");

        assert_eq!(store.put_count(), 1);
        assert_eq!(
            store.content_type("fine_tune/240101000000_x.json").as_deref(),
            Some("application/json")
        );
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_without_writing() {
        let store = MemoryBlobStore::new();
        store.set_unreachable(true);

        let err = store
            .put("a/b.json", "application/json", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::Unreachable(_)));
        assert_eq!(store.put_count(), 0);
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_put_never_overwrites() {
        let store = MemoryBlobStore::new();
        store
            .put("dataset_generation/a.json", "application/json", b"first".to_vec())
            .await
            .expect("put");

        let err = store
            .put("dataset_generation/a.json", "application/json", b"second".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::AlreadyExists(_)));
        assert_eq!(store.put_count(), 1);
        assert_eq!(
            store.body("dataset_generation/a.json").as_deref(),
            Some(&b"first"[..])
        );
    }

    #[tokio::test]
    async fn test_seeded_objects_are_listed_but_not_counted() {
        let store = MemoryBlobStore::new();
        store.insert("results/d/part-0.json", "{}");
        store.insert("results/d/part-1.json", "{}");

        let page = store.list("results/d/", None, 10).await.expect("list");
        assert_eq!(page.keys.len(), 2);
        assert_eq!(store.put_count(), 0);
        assert_eq!(store.get("results/d/part-1.json").await.expect("get"), b"{}");
    }
}
