//! Counter store
//!
//! Maps `(app, type)` to a durable, increment-only total. `app` selects the
//! bucket and `type` the key inside it; values use the decimal form from
//! [`codec`](crate::store::codec). Every committed increment is mirrored into
//! the [`CounterMirror`] after the write is durable, never before.

use crate::common::{CounterMirror, Error, ErrorKind, Result};
use crate::store::backend::Backend;
use crate::store::codec::{decode_total, encode_total};
use serde::Serialize;
use std::sync::Arc;

/// One durable total
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CounterTotal {
    pub app: String,
    #[serde(rename = "type")]
    pub counter_type: String,
    pub total: u64,
}

fn validate_identifier(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::validation(format!("missing key: {}", field)));
    }
    Ok(())
}

fn corrupted(app: &str, counter_type: &str, value: &[u8], reason: impl ToString) -> Error {
    Error::Corrupted {
        app: app.to_string(),
        counter_type: counter_type.to_string(),
        value: String::from_utf8_lossy(value).into_owned(),
        reason: reason.to_string(),
    }
}

fn decode_stored(app: &str, counter_type: &str, value: &[u8]) -> Result<u64> {
    decode_total(value).map_err(|e| corrupted(app, counter_type, value, e))
}

/// Visit every stored total from one consistent view of the backend.
///
/// Values are decoded as they are visited; the first undecodable entry
/// stops the scan with [`Error::Corrupted`].
pub fn scan_totals(
    backend: &dyn Backend,
    mut visit: impl FnMut(CounterTotal) -> Result<()>,
) -> Result<()> {
    backend.scan(&mut |bucket, key, value| {
        let counter_type = std::str::from_utf8(key)
            .map_err(|e| corrupted(bucket, &String::from_utf8_lossy(key), value, e))?;
        let total = decode_stored(bucket, counter_type, value)?;
        visit(CounterTotal {
            app: bucket.to_string(),
            counter_type: counter_type.to_string(),
            total,
        })
    })
}

/// Collect every stored total
pub fn read_totals(backend: &dyn Backend) -> Result<Vec<CounterTotal>> {
    let mut totals = Vec::new();
    scan_totals(backend, |total| {
        totals.push(total);
        Ok(())
    })?;
    Ok(totals)
}

/// Durable counters plus their in-memory mirror.
///
/// Built by [`Bootstrapper::run`](crate::store::Bootstrapper::run) so the
/// mirror is always reconciled before the store is handed out.
pub struct CounterStore {
    backend: Arc<dyn Backend>,
    mirror: Arc<CounterMirror>,
}

impl CounterStore {
    pub(crate) fn new(backend: Arc<dyn Backend>, mirror: Arc<CounterMirror>) -> Self {
        Self { backend, mirror }
    }

    /// Add one to `(app, counter_type)` and return the new durable total
    pub fn increment(&self, app: &str, counter_type: &str) -> Result<u64> {
        validate_identifier("app", app)?;
        validate_identifier("type", counter_type)?;

        let mut total = 0;
        let result = self.backend.update(app, counter_type.as_bytes(), &mut |current| {
            let current = match current {
                Some(bytes) => decode_stored(app, counter_type, bytes)?,
                None => 0,
            };
            total = current.checked_add(1).ok_or_else(|| Error::Overflow {
                app: app.to_string(),
                counter_type: counter_type.to_string(),
            })?;
            Ok(encode_total(total))
        });

        match result {
            Ok(()) => {
                self.mirror.inc(app, counter_type);
                tracing::debug!(app = %app, counter_type = %counter_type, total, "Counter incremented");
                Ok(total)
            }
            Err(e) => {
                match e.kind() {
                    ErrorKind::Corruption => {
                        tracing::error!(app = %app, counter_type = %counter_type, error = %e, "Stored counter is corrupted")
                    }
                    ErrorKind::Store => {
                        tracing::error!(app = %app, counter_type = %counter_type, error = %e, "Counter update failed")
                    }
                    ErrorKind::Validation => {}
                }
                Err(e)
            }
        }
    }

    /// Current durable total, 0 if never incremented
    pub fn get(&self, app: &str, counter_type: &str) -> Result<u64> {
        validate_identifier("app", app)?;
        validate_identifier("type", counter_type)?;
        match self.backend.get(app, counter_type.as_bytes())? {
            Some(bytes) => decode_stored(app, counter_type, &bytes),
            None => Ok(0),
        }
    }

    /// Lazily visit every durable total inside one read snapshot
    pub fn for_each(&self, visit: impl FnMut(CounterTotal) -> Result<()>) -> Result<()> {
        scan_totals(self.backend.as_ref(), visit)
    }

    /// Every durable total, ordered by `(app, type)`
    pub fn read_all(&self) -> Result<Vec<CounterTotal>> {
        read_totals(self.backend.as_ref())
    }

    pub fn mirror(&self) -> &Arc<CounterMirror> {
        &self.mirror
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn flush(&self) -> Result<()> {
        self.backend.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::MetricsConfig;
    use crate::store::backend::MemStore;

    fn store() -> CounterStore {
        CounterStore::new(
            Arc::new(MemStore::new()),
            Arc::new(CounterMirror::new(&MetricsConfig::default())),
        )
    }

    #[test]
    fn test_increment_from_zero() {
        let store = store();
        assert_eq!(store.get("svc", "start").unwrap(), 0);
        assert_eq!(store.increment("svc", "start").unwrap(), 1);
        assert_eq!(store.increment("svc", "start").unwrap(), 2);
        assert_eq!(store.get("svc", "start").unwrap(), 2);
        assert_eq!(store.mirror().get("svc", "start"), 2);
    }

    #[test]
    fn test_empty_identifiers_rejected() {
        let store = store();
        for (app, counter_type) in [("", "start"), ("svc", ""), ("  ", "start")] {
            let err = store.increment(app, counter_type).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);
        }
        assert!(store.backend().buckets().unwrap().is_empty());
        assert!(store.mirror().is_empty());
    }

    #[test]
    fn test_corrupt_value_is_not_reset() {
        let store = store();
        store
            .backend()
            .update("svc", b"start", &mut |_| Ok(b"abc".to_vec()))
            .unwrap();

        let err = store.increment("svc", "start").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corruption);
        assert_eq!(
            store.backend().get("svc", b"start").unwrap(),
            Some(b"abc".to_vec())
        );
        assert_eq!(store.mirror().get("svc", "start"), 0);
    }

    #[test]
    fn test_overflow_leaves_value() {
        let store = store();
        store
            .backend()
            .update("svc", b"start", &mut |_| Ok(encode_total(u64::MAX)))
            .unwrap();

        let err = store.increment("svc", "start").unwrap_err();
        assert!(matches!(err, Error::Overflow { .. }));
        assert_eq!(store.get("svc", "start").unwrap(), u64::MAX);
    }

    #[test]
    fn test_read_all_ordered() {
        let store = store();
        store.increment("web", "click").unwrap();
        store.increment("api", "call").unwrap();
        store.increment("api", "call").unwrap();

        let totals = store.read_all().unwrap();
        assert_eq!(
            totals,
            vec![
                CounterTotal {
                    app: "api".into(),
                    counter_type: "call".into(),
                    total: 2
                },
                CounterTotal {
                    app: "web".into(),
                    counter_type: "click".into(),
                    total: 1
                },
            ]
        );
    }

    #[test]
    fn test_total_serializes_type_field() {
        let json = serde_json::to_value(CounterTotal {
            app: "svc".into(),
            counter_type: "start".into(),
            total: 3,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"app": "svc", "type": "start", "total": 3}));
    }
}
