//! RocksDB backend
//!
//! All buckets share one column family, `counters`. A stored key is the
//! bucket name escaped so that it sorts before any continuation, a `00 01`
//! terminator, then the caller's key:
//!
//! ```text
//!   bucket bytes (00 -> 00 ff) | 00 01 | key
//! ```
//!
//! Byte order of stored keys is therefore `(bucket, key)` order, and the
//! number of buckets costs nothing beyond their keys. The set of bucket names
//! is rebuilt at open by seeking from one bucket to the next.

use crate::common::{Error, Result};
use crate::store::backend::{lock_writer, ApplyFn, Backend, VisitFn};
use rocksdb::{
    BoundColumnFamily, DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options,
    WriteBatch, WriteOptions, DEFAULT_COLUMN_FAMILY_NAME,
};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

type Db = DBWithThreadMode<MultiThreaded>;

const COUNTERS_CF: &str = "counters";

const ESCAPE: u8 = 0x00;
const ESCAPED_NUL: u8 = 0xff;
const TERMINATOR: u8 = 0x01;

fn bucket_prefix(bucket: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(bucket.len() + 2);
    for &b in bucket.as_bytes() {
        out.push(b);
        if b == ESCAPE {
            out.push(ESCAPED_NUL);
        }
    }
    out.extend_from_slice(&[ESCAPE, TERMINATOR]);
    out
}

fn encode_key(bucket: &str, key: &[u8]) -> Vec<u8> {
    let mut out = bucket_prefix(bucket);
    out.extend_from_slice(key);
    out
}

/// Split a stored key into `(bucket, key)`
fn decode_key(raw: &[u8]) -> Result<(String, &[u8])> {
    let mut bucket = Vec::new();
    let mut i = 0;
    while i < raw.len() {
        match (raw[i], raw.get(i + 1)) {
            (ESCAPE, Some(&TERMINATOR)) => {
                let bucket = String::from_utf8(bucket)
                    .map_err(|e| Error::Store(format!("bucket name is not utf-8: {}", e)))?;
                return Ok((bucket, &raw[i + 2..]));
            }
            (ESCAPE, Some(&ESCAPED_NUL)) => {
                bucket.push(ESCAPE);
                i += 2;
            }
            (ESCAPE, _) => break,
            (b, _) => {
                bucket.push(b);
                i += 1;
            }
        }
    }
    Err(Error::Store(format!("malformed stored key {:?}", raw)))
}

pub struct RocksStore {
    db: Db,
    path: PathBuf,
    /// Writer lock; also owns the set of known buckets
    writer: Mutex<BTreeSet<String>>,
}

impl RocksStore {
    /// Open or create a store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        // list_cf fails when nothing exists yet
        let mut families = match Db::list_cf(&opts, path) {
            Ok(families) => families,
            Err(_) if !path.join("CURRENT").exists() => {
                vec![DEFAULT_COLUMN_FAMILY_NAME.to_string()]
            }
            Err(e) => return Err(e.into()),
        };
        for family in &families {
            if family != DEFAULT_COLUMN_FAMILY_NAME && family != COUNTERS_CF {
                tracing::warn!(family = %family, "Ignoring unknown column family");
            }
        }
        if !families.iter().any(|f| f == COUNTERS_CF) {
            families.push(COUNTERS_CF.to_string());
        }

        let db = Db::open_cf(&opts, path, &families)?;
        let buckets = Self::load_buckets(&db)?;

        tracing::debug!(path = %path.display(), buckets = buckets.len(), "Opened RocksDB store");

        Ok(Self {
            db,
            path: path.to_path_buf(),
            writer: Mutex::new(buckets),
        })
    }

    /// One seek per bucket: after reading a bucket name, jump past its keys
    fn load_buckets(db: &Db) -> Result<BTreeSet<String>> {
        let cf = Self::counters_cf(db)?;
        let mut buckets = BTreeSet::new();
        let mut from = Vec::new();
        loop {
            let next = db
                .iterator_cf(&cf, IteratorMode::From(&from, Direction::Forward))
                .next();
            let Some(item) = next else { break };
            let (raw, _) = item?;
            let (bucket, _) = decode_key(&raw)?;
            from = bucket_prefix(&bucket);
            // terminator 00 01 becomes 00 02: the first key past this bucket
            if let Some(last) = from.last_mut() {
                *last = TERMINATOR + 1;
            }
            buckets.insert(bucket);
        }
        Ok(buckets)
    }

    fn counters_cf(db: &Db) -> Result<Arc<BoundColumnFamily<'_>>> {
        db.cf_handle(COUNTERS_CF)
            .ok_or_else(|| Error::Store(format!("missing column family {}", COUNTERS_CF)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_options() -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        opts
    }
}

impl Backend for RocksStore {
    fn name(&self) -> &'static str {
        "rocksdb"
    }

    fn update(&self, bucket: &str, key: &[u8], apply: &mut ApplyFn<'_>) -> Result<()> {
        let mut buckets = lock_writer(&self.writer)?;
        let cf = Self::counters_cf(&self.db)?;
        let stored_key = encode_key(bucket, key);

        let current = self.db.get_cf(&cf, &stored_key)?;
        let next = apply(current.as_deref())?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, &stored_key, next);
        self.db.write_opt(batch, &Self::write_options())?;

        if buckets.insert(bucket.to_string()) {
            tracing::debug!(bucket = %bucket, "Created bucket");
        }
        Ok(())
    }

    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = Self::counters_cf(&self.db)?;
        Ok(self.db.get_cf(&cf, encode_key(bucket, key))?)
    }

    fn scan(&self, visit: &mut VisitFn<'_>) -> Result<()> {
        let cf = Self::counters_cf(&self.db)?;
        // Taken under the writer lock so no update is half-applied in the view
        let snapshot = {
            let _buckets = lock_writer(&self.writer)?;
            self.db.snapshot()
        };

        for item in snapshot.iterator_cf(&cf, IteratorMode::Start) {
            let (raw, value) = item?;
            let (bucket, key) = decode_key(&raw)?;
            visit(bucket.as_str(), key, &value[..])?;
        }
        Ok(())
    }

    fn buckets(&self) -> Result<Vec<String>> {
        Ok(lock_writer(&self.writer)?.iter().cloned().collect())
    }

    fn flush(&self) -> Result<()> {
        let _buckets = lock_writer(&self.writer)?;
        let cf = Self::counters_cf(&self.db)?;
        self.db.flush_cf(&cf)?;
        self.db.flush_wal(true)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_rocks_update_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("counters.db");

        {
            let store = RocksStore::open(&path).unwrap();
            store
                .update("svc", b"start", &mut |current| {
                    assert!(current.is_none());
                    Ok(b"7".to_vec())
                })
                .unwrap();
            assert_eq!(store.get("svc", b"start").unwrap(), Some(b"7".to_vec()));
        }

        let store = RocksStore::open(&path).unwrap();
        assert_eq!(store.buckets().unwrap(), vec!["svc".to_string()]);
        assert_eq!(store.get("svc", b"start").unwrap(), Some(b"7".to_vec()));
        assert_eq!(store.get("other", b"start").unwrap(), None);
    }

    #[test]
    fn test_rocks_bucket_named_default() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        store
            .update("default", b"k", &mut |_| Ok(b"1".to_vec()))
            .unwrap();

        let mut seen = Vec::new();
        store
            .scan(&mut |bucket, key, value| {
                seen.push((bucket.to_string(), key.to_vec(), value.to_vec()));
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![("default".to_string(), b"k".to_vec(), b"1".to_vec())]);
    }

    #[test]
    fn test_rocks_failed_apply_creates_nothing() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        let result = store.update("svc", b"start", &mut |_| Err(Error::validation("nope")));

        assert!(result.is_err());
        assert!(store.buckets().unwrap().is_empty());
    }

    #[test]
    fn test_rocks_buckets_share_one_family() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("counters.db");

        {
            let store = RocksStore::open(&path).unwrap();
            for i in 0..100 {
                store
                    .update(&format!("app{:03}", i), b"start", &mut |_| Ok(b"1".to_vec()))
                    .unwrap();
            }
        }

        let mut families = Db::list_cf(&Options::default(), &path).unwrap();
        families.sort();
        assert_eq!(families, vec![COUNTERS_CF.to_string(), DEFAULT_COLUMN_FAMILY_NAME.to_string()]);

        let store = RocksStore::open(&path).unwrap();
        let buckets = store.buckets().unwrap();
        assert_eq!(buckets.len(), 100);
        assert_eq!(buckets[0], "app000");
        assert_eq!(buckets[99], "app099");
    }

    #[test]
    fn test_rocks_scan_orders_by_bucket_then_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("counters.db");

        {
            let store = RocksStore::open(&path).unwrap();
            for (bucket, key) in [("ab", "a"), ("a", "zz"), ("a\0b", "k"), ("a", "b"), ("", "x")] {
                store
                    .update(bucket, key.as_bytes(), &mut |_| Ok(b"1".to_vec()))
                    .unwrap();
            }
        }

        let store = RocksStore::open(&path).unwrap();
        assert_eq!(store.buckets().unwrap(), vec!["", "a", "a\0b", "ab"]);

        let mut seen = Vec::new();
        store
            .scan(&mut |bucket, key, _| {
                seen.push((bucket.to_string(), String::from_utf8_lossy(key).into_owned()));
                Ok(())
            })
            .unwrap();
        let expected: Vec<(String, String)> = [
            ("", "x"),
            ("a", "b"),
            ("a", "zz"),
            ("a\0b", "k"),
            ("ab", "a"),
        ]
        .iter()
        .map(|(b, k)| (b.to_string(), k.to_string()))
        .collect();
        assert_eq!(seen, expected);
        assert_eq!(store.get("a\0b", b"k").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get("a", b"k").unwrap(), None);
    }

    #[test]
    fn test_key_escaping() {
        assert_eq!(encode_key("a\0", b"k"), b"a\x00\xff\x00\x01k".to_vec());
        let raw = encode_key("a\0b", b"\0\x01");
        let (bucket, key) = decode_key(&raw).unwrap();
        assert_eq!(bucket, "a\0b");
        assert_eq!(key, b"\0\x01");
        assert!(decode_key(b"no-terminator").is_err());
    }

    #[test]
    fn test_rocks_second_open_is_refused() {
        let dir = tempdir().unwrap();
        let _store = RocksStore::open(dir.path()).unwrap();
        assert!(RocksStore::open(dir.path()).is_err());
    }
}
