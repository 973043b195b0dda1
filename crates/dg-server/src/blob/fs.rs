use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use dg_core::core::{BlobError, BlobFuture, BlobStore, ObjectPage};
use uuid::Uuid;

use super::{page_of, validate_key};

const PARTIAL_SUFFIX: &str = ".partial";

/// Blob store backed by a directory tree: key `a/b/c.json` lives at
/// `{root}/a/b/c.json`. Writes go to a sibling temp file that is then
/// hard-linked into place, so readers never see a half-written object and
/// an existing object is never replaced.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        key.split('/')
            .fold(self.root.clone(), |path, segment| path.join(segment))
    }
}

impl BlobStore for FsBlobStore {
    fn put<'a>(
        &'a self,
        key: &'a str,
        _content_type: &'a str,
        body: Vec<u8>,
    ) -> BlobFuture<'a, ()> {
        Box::pin(async move {
            validate_key(key)?;
            let path = self.path_for(key);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
            }

            let mut temp = path.clone().into_os_string();
            temp.push(format!(".{}{PARTIAL_SUFFIX}", Uuid::new_v4().simple()));
            let temp = PathBuf::from(temp);

            tokio::fs::write(&temp, &body).await.map_err(io_error)?;
            let linked = tokio::fs::hard_link(&temp, &path).await;
            tokio::fs::remove_file(&temp).await.map_err(io_error)?;
            match linked {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    Err(BlobError::AlreadyExists(key.to_owned()))
                }
                Err(e) => Err(io_error(e)),
            }
        })
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
        continuation: Option<&'a str>,
        limit: usize,
    ) -> BlobFuture<'a, ObjectPage> {
        Box::pin(async move {
            // Only the directory that can hold matching keys is walked.
            let dir_key = prefix.rsplit_once('/').map_or("", |(dir, _)| dir);
            let start = if dir_key.is_empty() {
                self.root.clone()
            } else {
                self.path_for(dir_key)
            };
            let root = self.root.clone();

            let mut keys = tokio::task::spawn_blocking(move || collect_keys(&root, &start))
                .await
                .map_err(|e| BlobError::Io(e.to_string()))??;
            keys.retain(|key| key.starts_with(prefix));
            keys.sort();
            Ok(page_of(keys, continuation, limit))
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BlobFuture<'a, Vec<u8>> {
        Box::pin(async move {
            validate_key(key)?;
            match tokio::fs::read(self.path_for(key)).await {
                Ok(bytes) => Ok(bytes),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    Err(BlobError::ObjectNotFound(key.to_owned()))
                }
                Err(e) => Err(io_error(e)),
            }
        })
    }
}

fn collect_keys(root: &Path, start: &Path) -> Result<Vec<String>, BlobError> {
    let mut keys = Vec::new();
    let mut pending = vec![start.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(io_error(e)),
        };
        for entry in entries {
            let entry = entry.map_err(io_error)?;
            let path = entry.path();
            if entry.file_type().map_err(io_error)?.is_dir() {
                pending.push(path);
                continue;
            }
            if path.to_string_lossy().ends_with(PARTIAL_SUFFIX) {
                continue;
            }
            if let Ok(relative) = path.strip_prefix(root) {
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                keys.push(key);
            }
        }
    }
    Ok(keys)
}

fn io_error(err: std::io::Error) -> BlobError {
    BlobError::Io(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FsBlobStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path().join("blobs")).expect("blob root");
        (dir, store)
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let (_dir, store) = store();
        store
            .put("dataset_generation/240101000000_a.json", "application/json", b"{}".to_vec())
            .await
            .expect("put");

        let body = store
            .get("dataset_generation/240101000000_a.json")
            .await
            .expect("get");
        assert_eq!(body, b"{}");
    }

    #[tokio::test]
    async fn test_put_existing_key_keeps_first_body() {
        let (_dir, store) = store();
        let key = "fine_tune/240101000000_a.json";
        store
            .put(key, "application/json", b"first".to_vec())
            .await
            .expect("put");

        let err = store
            .put(key, "application/json", b"second".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::AlreadyExists(ref k) if k == key));
        assert_eq!(store.get(key).await.expect("get"), b"first");

        let page = store.list("fine_tune/", None, 10).await.expect("list");
        assert_eq!(page.keys, [key]);
    }

    #[tokio::test]
    async fn test_get_missing_object() {
        let (_dir, store) = store();
        let err = store.get("results/none.json").await.unwrap_err();
        assert!(matches!(err, BlobError::ObjectNotFound(_)));
    }

    #[tokio::test]
    async fn test_put_rejects_escaping_key() {
        let (_dir, store) = store();
        let err = store
            .put("../outside.json", "application/json", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn test_list_is_sorted_paged_and_prefix_scoped() {
        let (_dir, store) = store();
        for key in [
            "results/ds1/part-2.json",
            "results/ds1/part-0.json",
            "results/ds1/nested/part-1.json",
            "results/ds10/part-0.json",
            "other/x.json",
        ] {
            store
                .put(key, "application/json", b"{}".to_vec())
                .await
                .expect("put");
        }

        let first = store.list("results/ds1/", None, 2).await.expect("list");
        assert_eq!(
            first.keys,
            ["results/ds1/nested/part-1.json", "results/ds1/part-0.json"]
        );
        let second = store
            .list("results/ds1/", first.next.as_deref(), 2)
            .await
            .expect("list");
        assert_eq!(second.keys, ["results/ds1/part-2.json"]);
        assert!(second.next.is_none());
    }

    #[tokio::test]
    async fn test_list_missing_prefix_is_empty() {
        let (_dir, store) = store();
        let page = store.list("results/unknown/", None, 10).await.expect("list");
        assert!(page.keys.is_empty());
        assert!(page.next.is_none());
    }
}
