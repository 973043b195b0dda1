mod fs;
mod memory;

use std::sync::Arc;

use anyhow::Context;
use dg_core::core::{BlobError, BlobStore, ObjectPage};

use crate::bootstrap::BlobBackend;

pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;

pub fn build(backend: &BlobBackend) -> Result<Arc<dyn BlobStore>, anyhow::Error> {
    let store: Arc<dyn BlobStore> = match backend {
        BlobBackend::Filesystem(root) => Arc::new(
            FsBlobStore::new(root.clone())
                .with_context(|| format!("opening blob root {}", root.display()))?,
        ),
        BlobBackend::Memory => Arc::new(MemoryBlobStore::new()),
    };
    Ok(store)
}

/// Rejects keys that could escape the store root or address a directory.
pub(crate) fn validate_key(key: &str) -> Result<(), BlobError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.ends_with('/')
        || key.contains('\\')
        || key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if bad {
        return Err(BlobError::InvalidKey(key.to_owned()));
    }
    Ok(())
}

/// Cuts one page out of a sorted key list. The continuation token is the
/// last key already returned.
pub(crate) fn page_of(keys: Vec<String>, continuation: Option<&str>, limit: usize) -> ObjectPage {
    let limit = limit.max(1);
    let mut remaining = keys
        .into_iter()
        .filter(|key| continuation.is_none_or(|after| key.as_str() > after))
        .peekable();
    let page: Vec<String> = remaining.by_ref().take(limit).collect();
    let next = if remaining.peek().is_some() {
        page.last().cloned()
    } else {
        None
    };
    ObjectPage { keys: page, next }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("dataset_generation/240101000000_x.json").is_ok());
        for bad in ["", "/abs", "dir/", "a//b", "a/../b", "./a", "a\\b"] {
            assert!(
                matches!(validate_key(bad), Err(BlobError::InvalidKey(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_page_of_walks_all_keys() {
        let keys: Vec<String> = (0..5).map(|i| format!("k{i}")).collect();

        let first = page_of(keys.clone(), None, 2);
        assert_eq!(first.keys, ["k0", "k1"]);
        assert_eq!(first.next.as_deref(), Some("k1"));

        let second = page_of(keys.clone(), first.next.as_deref(), 2);
        assert_eq!(second.keys, ["k2", "k3"]);

        let last = page_of(keys, second.next.as_deref(), 2);
        assert_eq!(last.keys, ["k4"]);
        assert!(last.next.is_none());
    }

    #[test]
    fn test_page_of_exact_fit_has_no_next() {
        let keys = vec!["a".to_string(), "b".to_string()];
        let page = page_of(keys, None, 2);
        assert_eq!(page.keys.len(), 2);
        assert!(page.next.is_none());
    }
}
