//! Startup reconciliation
//!
//! Replays every durable total into a fresh [`CounterMirror`] exactly once.
//! [`Bootstrapper::run`] consumes the bootstrapper and is the only public way
//! to obtain a [`CounterStore`]. It refuses a mirror that already holds any
//! series, so replaying twice into a shared mirror fails instead of doubling
//! the totals.

use crate::common::{CounterMirror, Error, Result};
use crate::store::backend::Backend;
use crate::store::counter::{scan_totals, CounterStore};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome of a reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Distinct apps holding at least one counter
    pub apps: usize,
    pub counters: usize,
    /// Sum of all replayed totals
    pub total: u64,
    pub took: Duration,
}

pub struct Bootstrapper {
    backend: Arc<dyn Backend>,
    mirror: Arc<CounterMirror>,
}

impl Bootstrapper {
    pub fn new(backend: Arc<dyn Backend>, mirror: Arc<CounterMirror>) -> Self {
        Self { backend, mirror }
    }

    /// Scan the store and add each total to the mirror.
    ///
    /// The mirror must be empty, otherwise [`Error::Internal`] is returned
    /// before anything is read.
    ///
    /// Any undecodable value aborts with [`Error::Corrupted`](crate::Error::Corrupted);
    /// the caller must not start serving in that case. The mirror may hold a
    /// partial replay after a failure and should be discarded with it.
    pub fn run(self) -> Result<(CounterStore, ReconcileReport)> {
        if !self.mirror.is_empty() {
            tracing::error!(series = self.mirror.len(), "Refusing to reconcile into a non-empty mirror");
            return Err(Error::Internal(format!(
                "mirror already holds {} series",
                self.mirror.len()
            )));
        }

        tracing::info!(backend = self.backend.name(), "Loading previous metrics");
        let start = Instant::now();

        let mut report = ReconcileReport::default();
        let mut last_app: Option<String> = None;

        let scanned = scan_totals(self.backend.as_ref(), |entry| {
            if last_app.as_deref() != Some(entry.app.as_str()) {
                report.apps += 1;
                last_app = Some(entry.app.clone());
            }
            report.counters += 1;
            report.total = report.total.saturating_add(entry.total);
            self.mirror.add(&entry.app, &entry.counter_type, entry.total);
            Ok(())
        });

        if let Err(e) = scanned {
            tracing::error!(error = %e, "Failed to load previous metrics");
            return Err(e);
        }

        report.took = start.elapsed();
        tracing::info!(
            apps = report.apps,
            counters = report.counters,
            total = report.total,
            took_ms = %report.took.as_millis(),
            "Loaded previous metrics"
        );

        Ok((CounterStore::new(self.backend, self.mirror), report))
    }
}
