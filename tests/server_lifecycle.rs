//! Server lifecycle: reconcile before serving, graceful shutdown

use insight::common::BackendKind;
use insight::store::{Backend, RocksStore};
use insight::{Config, ErrorKind, InsightServer};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

fn config(dir: &TempDir, backend: BackendKind) -> Config {
    Config {
        db_path: dir.path().join("insight.db"),
        backend,
        shutdown_timeout_secs: 1,
        ..Config::default()
    }
}

async fn request(addr: std::net::SocketAddr, raw: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn test_corrupt_store_never_serves() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, BackendKind::Rocksdb);

    {
        let store = RocksStore::open(&config.db_path).unwrap();
        store
            .update("svc", b"start", &mut |_| Ok(b"-1".to_vec()))
            .unwrap();
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let err = InsightServer::new(config)
        .serve_with_shutdown(listener, std::future::pending())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Corruption);
}

#[tokio::test]
async fn test_serve_and_shutdown() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, BackendKind::Rocksdb);
    let db_path = config.db_path.clone();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let server = tokio::spawn(InsightServer::new(config).serve_with_shutdown(listener, async move {
        let _ = stop_rx.await;
    }));

    let body = r#"{"type":"start","app":"svc"}"#;
    let add = format!(
        "POST /add HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let response = request(addr, &add).await;
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.contains(r#""total":1"#));

    let response = request(
        addr,
        "GET /health/ready HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);

    stop_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    // The store lock is released once the server returns
    let store = RocksStore::open(&db_path).unwrap();
    assert_eq!(store.get("svc", b"start").unwrap(), Some(b"1".to_vec()));
}

#[tokio::test]
async fn test_restart_continues_totals() {
    let dir = TempDir::new().unwrap();

    for expected in 1..=2 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(
            InsightServer::new(config(&dir, BackendKind::Rocksdb)).serve_with_shutdown(
                listener,
                async move {
                    let _ = stop_rx.await;
                },
            ),
        );

        let body = r#"{"type":"start","app":"svc"}"#;
        let add = format!(
            "POST /add HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        let response = request(addr, &add).await;
        assert!(
            response.contains(&format!(r#""total":{}"#, expected)),
            "{}",
            response
        );

        let metrics = request(
            addr,
            "GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(metrics.contains(&format!(
            r#"infinity_insight_calls_sum{{type="start",app="svc"}} {}"#,
            expected
        )));

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

#[tokio::test]
async fn test_stalled_upload_does_not_block_shutdown() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, BackendKind::Memory);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(InsightServer::new(config).serve_with_shutdown(listener, async move {
        let _ = stop_rx.await;
    }));

    // Announce a body that never fully arrives
    let mut stalled = TcpStream::connect(addr).await.unwrap();
    stalled
        .write_all(b"POST /add HTTP/1.1\r\nHost: localhost\r\nContent-Length: 100\r\n\r\n{\"type\":")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let start = std::time::Instant::now();
    stop_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(start.elapsed() < Duration::from_secs(4), "{:?}", start.elapsed());

    drop(stalled);
}
