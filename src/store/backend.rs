//! Durable key-value store contract and the in-memory implementation
//!
//! A backend holds named buckets, each an ordered map of byte keys to byte
//! values. Writes are single-writer transactions: the current value is read,
//! handed to a caller closure, and the closure's result is written back, all
//! under one lock. If the closure fails nothing is written and no bucket is
//! created.

use crate::common::{Error, Result};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

/// Computes the new value from the current one (`None` when the key is absent)
pub type ApplyFn<'a> = dyn FnMut(Option<&[u8]>) -> Result<Vec<u8>> + 'a;

/// Receives `(bucket, key, value)` during a scan
pub type VisitFn<'a> = dyn FnMut(&str, &[u8], &[u8]) -> Result<()> + 'a;

/// Trait for bucketed key-value storage backends
pub trait Backend: Send + Sync {
    /// Short engine name for logs
    fn name(&self) -> &'static str;

    /// Read-modify-write of one key inside one write transaction.
    ///
    /// Serialized against every other `update` on the same backend. The
    /// bucket is created on first successful write. Durable on return.
    fn update(&self, bucket: &str, key: &[u8], apply: &mut ApplyFn<'_>) -> Result<()>;

    /// Read one value outside of any write transaction
    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Visit every key of every bucket from one point-in-time view, buckets
    /// in name order and keys in byte order. A visitor error stops the scan.
    fn scan(&self, visit: &mut VisitFn<'_>) -> Result<()>;

    /// Names of the existing buckets, sorted
    fn buckets(&self) -> Result<Vec<String>>;

    /// Push buffered state to disk
    fn flush(&self) -> Result<()>;
}

pub(crate) fn lock_writer<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| Error::Internal("store writer lock poisoned".into()))
}

/// In-memory store, not durable
#[derive(Debug, Default)]
pub struct MemStore {
    buckets: Mutex<BTreeMap<String, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn update(&self, bucket: &str, key: &[u8], apply: &mut ApplyFn<'_>) -> Result<()> {
        let mut buckets = lock_writer(&self.buckets)?;
        let current = buckets.get(bucket).and_then(|b| b.get(key));
        let next = apply(current.map(|v| v.as_slice()))?;
        buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_vec(), next);
        Ok(())
    }

    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let buckets = lock_writer(&self.buckets)?;
        Ok(buckets.get(bucket).and_then(|b| b.get(key)).cloned())
    }

    fn scan(&self, visit: &mut VisitFn<'_>) -> Result<()> {
        let snapshot = lock_writer(&self.buckets)?.clone();
        for (bucket, entries) in &snapshot {
            for (key, value) in entries {
                visit(bucket.as_str(), key.as_slice(), value.as_slice())?;
            }
        }
        Ok(())
    }

    fn buckets(&self) -> Result<Vec<String>> {
        Ok(lock_writer(&self.buckets)?.keys().cloned().collect())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_creates_bucket() {
        let store = MemStore::new();
        assert!(store.buckets().unwrap().is_empty());

        store
            .update("svc", b"start", &mut |current| {
                assert!(current.is_none());
                Ok(b"1".to_vec())
            })
            .unwrap();

        assert_eq!(store.buckets().unwrap(), vec!["svc".to_string()]);
        assert_eq!(store.get("svc", b"start").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_failed_apply_leaves_no_trace() {
        let store = MemStore::new();
        let err = store
            .update("svc", b"start", &mut |_| Err(Error::Store("boom".into())))
            .unwrap_err();

        assert!(matches!(err, Error::Store(_)));
        assert!(store.buckets().unwrap().is_empty());
        assert_eq!(store.get("svc", b"start").unwrap(), None);
    }

    #[test]
    fn test_scan_order() {
        let store = MemStore::new();
        for (bucket, key) in [("b", "y"), ("a", "z"), ("b", "x"), ("a", "a")] {
            store
                .update(bucket, key.as_bytes(), &mut |_| Ok(b"0".to_vec()))
                .unwrap();
        }

        let mut seen = Vec::new();
        store
            .scan(&mut |bucket, key, _| {
                seen.push(format!("{}/{}", bucket, String::from_utf8_lossy(key)));
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec!["a/a", "a/z", "b/x", "b/y"]);
    }

    #[test]
    fn test_scan_stops_on_visitor_error() {
        let store = MemStore::new();
        for key in ["a", "b", "c"] {
            store
                .update("svc", key.as_bytes(), &mut |_| Ok(b"0".to_vec()))
                .unwrap();
        }

        let mut visited = 0;
        let result = store.scan(&mut |_, _, _| {
            visited += 1;
            if visited == 2 {
                return Err(Error::Internal("stop".into()));
            }
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(visited, 2);
    }
}
