use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};

use crate::core::BlobError;

pub type BlobFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BlobError>> + Send + 'a>>;

// ---------------------------------------------------------------------------
// BlobStore — the durable job sink and the results source
// ---------------------------------------------------------------------------

/// One page of a prefix listing. `next` is the continuation token for the
/// following page, absent on the last one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectPage {
    pub keys: Vec<String>,
    pub next: Option<String>,
}

/// Object storage addressed by `/`-separated keys (object-safe async via
/// `Pin<Box>`).
pub trait BlobStore: Send + Sync {
    /// Writes a new object. Objects are write-once: an existing `key` fails
    /// with [`BlobError::AlreadyExists`] and keeps its first body.
    fn put<'a>(
        &'a self,
        key: &'a str,
        content_type: &'a str,
        body: Vec<u8>,
    ) -> BlobFuture<'a, ()>;

    /// Lists keys under `prefix` in lexicographic order, at most `limit`
    /// per page, resuming after `continuation` when given.
    fn list<'a>(
        &'a self,
        prefix: &'a str,
        continuation: Option<&'a str>,
        limit: usize,
    ) -> BlobFuture<'a, ObjectPage>;

    fn get<'a>(&'a self, key: &'a str) -> BlobFuture<'a, Vec<u8>>;
}

// ---------------------------------------------------------------------------
// Clock — injectable time source for deterministic testing
// ---------------------------------------------------------------------------

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
