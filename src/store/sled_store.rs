//! Sled backend (feature `sled-backend`)
//!
//! One tree per bucket, named `bucket:<name>`. Sled has no cross-tree
//! snapshot, so scans hold the writer lock for their whole duration.

use crate::common::Result;
use crate::store::backend::{lock_writer, ApplyFn, Backend, VisitFn};
use std::path::Path;
use std::sync::Mutex;

const BUCKET_PREFIX: &[u8] = b"bucket:";

fn tree_name(bucket: &str) -> Vec<u8> {
    let mut name = BUCKET_PREFIX.to_vec();
    name.extend_from_slice(bucket.as_bytes());
    name
}

pub struct SledStore {
    db: sled::Db,
    writer: Mutex<()>,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            db,
            writer: Mutex::new(()),
        })
    }

    fn bucket_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .db
            .tree_names()
            .iter()
            .filter_map(|name| name.strip_prefix(BUCKET_PREFIX))
            .map(|name| String::from_utf8_lossy(name).into_owned())
            .collect();
        names.sort();
        names
    }

    fn has_tree(&self, bucket: &str) -> bool {
        let wanted = tree_name(bucket);
        self.db.tree_names().iter().any(|name| &name[..] == wanted.as_slice())
    }
}

impl Backend for SledStore {
    fn name(&self) -> &'static str {
        "sled"
    }

    fn update(&self, bucket: &str, key: &[u8], apply: &mut ApplyFn<'_>) -> Result<()> {
        let _guard = lock_writer(&self.writer)?;

        let current = if self.has_tree(bucket) {
            self.db.open_tree(tree_name(bucket))?.get(key)?
        } else {
            None
        };
        let next = apply(current.as_deref())?;

        let tree = self.db.open_tree(tree_name(bucket))?;
        tree.insert(key, next)?;
        tree.flush()?;
        Ok(())
    }

    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if !self.has_tree(bucket) {
            return Ok(None);
        }
        let tree = self.db.open_tree(tree_name(bucket))?;
        Ok(tree.get(key)?.map(|v| v.to_vec()))
    }

    fn scan(&self, visit: &mut VisitFn<'_>) -> Result<()> {
        let _guard = lock_writer(&self.writer)?;
        for bucket in self.bucket_names() {
            let tree = self.db.open_tree(tree_name(&bucket))?;
            for item in tree.iter() {
                let (key, value) = item?;
                visit(bucket.as_str(), &key[..], &value[..])?;
            }
        }
        Ok(())
    }

    fn buckets(&self) -> Result<Vec<String>> {
        Ok(self.bucket_names())
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
