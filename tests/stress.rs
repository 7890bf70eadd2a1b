//! Stress test: many writers over many counters, then restart
#![cfg(feature = "heavy-tests")]

use insight::common::MetricsConfig;
use insight::store::{Backend, Bootstrapper, RocksStore};
use insight::CounterMirror;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tempfile::TempDir;

#[test]
fn stress_concurrent_increments() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("insight.db");

    let threads = 16;
    let per_thread = 500;
    let apps = ["api", "web", "worker", "cron"];

    {
        let backend: Arc<dyn Backend> = Arc::new(RocksStore::open(&path).unwrap());
        let mirror = Arc::new(CounterMirror::new(&MetricsConfig::default()));
        let (store, _) = Bootstrapper::new(backend, mirror).run().unwrap();
        let store = Arc::new(store);

        let start = Instant::now();
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let store = store.clone();
                thread::spawn(move || {
                    for i in 0..per_thread {
                        let app = apps[(t + i) % apps.len()];
                        store.increment(app, "call").unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let took = start.elapsed();
        println!("{} increments: {:?}", threads * per_thread, took);

        let sum: u64 = store.read_all().unwrap().iter().map(|t| t.total).sum();
        assert_eq!(sum, (threads * per_thread) as u64);
    }

    let backend: Arc<dyn Backend> = Arc::new(RocksStore::open(&path).unwrap());
    let mirror = Arc::new(CounterMirror::new(&MetricsConfig::default()));
    let (_, report) = Bootstrapper::new(backend, mirror).run().unwrap();
    assert_eq!(report.apps, apps.len());
    assert_eq!(report.total, (threads * per_thread) as u64);
}
