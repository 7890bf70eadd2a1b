//! Counter persistence
//!
//! - [`backend`]: the bucketed key-value contract plus the in-memory engine
//! - [`rocks`] / `sled_store`: durable engines
//! - [`codec`]: decimal encoding of totals
//! - [`counter`]: increment / read over a backend, mirrored into metrics
//! - [`bootstrap`]: one-shot replay of stored totals at startup

pub mod backend;
pub mod bootstrap;
pub mod codec;
pub mod counter;
pub mod rocks;
#[cfg(feature = "sled-backend")]
pub mod sled_store;

pub use backend::{Backend, MemStore};
pub use bootstrap::{Bootstrapper, ReconcileReport};
pub use counter::{read_totals, scan_totals, CounterStore, CounterTotal};
pub use rocks::RocksStore;
#[cfg(feature = "sled-backend")]
pub use sled_store::SledStore;

use crate::common::{BackendKind, Result};
use std::path::Path;
use std::sync::Arc;

/// Open the configured engine at `path`
pub fn open_backend(kind: BackendKind, path: &Path) -> Result<Arc<dyn Backend>> {
    let backend: Arc<dyn Backend> = match kind {
        BackendKind::Rocksdb => Arc::new(RocksStore::open(path)?),
        #[cfg(feature = "sled-backend")]
        BackendKind::Sled => Arc::new(SledStore::open(path)?),
        #[cfg(not(feature = "sled-backend"))]
        BackendKind::Sled => {
            return Err(crate::Error::InvalidConfig(
                "sled backend requires the `sled-backend` feature".into(),
            ))
        }
        BackendKind::Memory => {
            tracing::warn!("Using in-memory backend, counters will not survive a restart");
            Arc::new(MemStore::new())
        }
    };
    tracing::info!(backend = backend.name(), path = %path.display(), "Opened counter store");
    Ok(backend)
}
