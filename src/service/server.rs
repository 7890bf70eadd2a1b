//! Insight server lifecycle: open store, reconcile, serve, shut down

use crate::common::{Config, CounterMirror, Error, Result};
use crate::service::http::{create_router, AppState};
use crate::store::{open_backend, Bootstrapper};
use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

pub struct InsightServer {
    config: Config,
}

impl InsightServer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Open the store and replay it into a fresh mirror.
    ///
    /// Runs on the blocking pool; the returned state is not yet marked ready.
    pub async fn bootstrap(&self) -> Result<AppState> {
        let kind = self.config.backend;
        let path = self.config.db_path.clone();
        let metrics_config = self.config.metrics.clone();

        let span = tracing::Span::current();
        let (counters, _report) = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            let backend = open_backend(kind, &path)?;
            let mirror = Arc::new(CounterMirror::new(&metrics_config));
            Bootstrapper::new(backend, mirror).run()
        })
        .await
        .map_err(|e| Error::Internal(format!("bootstrap task failed: {}", e)))??;

        Ok(AppState::new(counters))
    }

    /// Reconcile, then bind the configured address and serve until SIGINT/SIGTERM
    pub async fn serve(self) -> Result<()> {
        self.log_startup();
        let state = self.bootstrap().await?;
        let listener = TcpListener::bind(self.config.http_addr).await?;
        self.run(state, listener, shutdown_signal()).await
    }

    /// Reconcile, then serve on an already bound `listener` until `shutdown` resolves.
    ///
    /// If reconciliation fails the listener is dropped without accepting anything.
    ///
    /// Open connections get `shutdown_timeout_secs` to finish. After that the
    /// accept loop is aborted and this returns; connection tasks still running
    /// keep their handle on the store until the runtime drops them.
    pub async fn serve_with_shutdown(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        self.log_startup();
        let state = self.bootstrap().await?;
        self.run(state, listener, shutdown).await
    }

    fn log_startup(&self) {
        tracing::info!("Starting insight server");
        tracing::info!("  HTTP API: {}", self.config.http_addr);
        tracing::info!("  DB path: {}", self.config.db_path.display());
        tracing::info!("  Backend: {:?}", self.config.backend);
    }

    async fn run(
        self,
        state: AppState,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        tracing::info!(address = %listener.local_addr()?, "Listening");
        let router = create_router(state.clone(), self.config.max_body_bytes);

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = stop_rx.await;
        });
        let mut server = tokio::spawn(server.into_future());

        state.set_ready(true);
        tracing::info!("✓ Insight server ready");

        tokio::select! {
            res = &mut server => {
                state.set_ready(false);
                let res = res.map_err(|e| Error::Internal(format!("server task failed: {}", e)))?;
                if let Err(e) = res {
                    tracing::error!("HTTP server error: {}", e);
                    state.counters.flush()?;
                    return Err(e.into());
                }
            }
            _ = shutdown => {
                state.set_ready(false);
                let timeout = self.config.shutdown_timeout();
                tracing::info!(timeout_secs = timeout.as_secs(), "Shutting down");
                let _ = stop_tx.send(());

                match tokio::time::timeout(timeout, &mut server).await {
                    Ok(Ok(Ok(()))) => tracing::info!("Shutdown complete"),
                    Ok(Ok(Err(e))) => tracing::error!("Error shutting down: {}", e),
                    Ok(Err(e)) => tracing::error!("Server task failed: {}", e),
                    Err(_) => {
                        tracing::warn!("Graceful shutdown timed out, leaving open connections to runtime teardown");
                        server.abort();
                    }
                }
            }
        }

        tracing::info!(path = %self.config.db_path.display(), "Closing db");
        state.counters.flush()?;
        Ok(())
    }
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
