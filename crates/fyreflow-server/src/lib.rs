//! HTTP server and realtime runtime for the Fyreflow engine. The engine
//! itself does not own process exit: `start` returns a handle whose `stop`
//! disposes the listener and the realtime pollers.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use fyreflow_core::{EngineConfig, PipelineEngine, RunStore};

pub mod http;
pub mod ws;

#[derive(Clone)]
pub struct AppState {
    pub engine: PipelineEngine,
    pub store: Arc<RunStore>,
    pub config: EngineConfig,
}

impl AppState {
    pub fn new(engine: PipelineEngine) -> Self {
        let store = engine.store();
        let config = engine.config().clone();
        Self {
            engine,
            store,
            config,
        }
    }
}

pub struct EngineHandle {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

impl EngineHandle {
    /// Stops accepting connections and ends every realtime session.
    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.join.await;
    }
}

/// Binds the HTTP listener, reattaches orphaned runs, and serves until the
/// returned handle is stopped.
pub async fn start(engine: PipelineEngine) -> anyhow::Result<EngineHandle> {
    let state = AppState::new(engine);
    let port = state.config.port;

    let reattached = state.engine.reattach_orphans().await;
    if !reattached.is_empty() {
        tracing::info!(
            target: "fyreflow.server",
            "reattached {} interrupted run(s): {}",
            reattached.len(),
            reattached.join(", ")
        );
    }

    let router = http::build_router(state);
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    let addr = listener.local_addr()?;
    tracing::info!(target: "fyreflow.server", "listening on {addr}");

    let shutdown = CancellationToken::new();
    let serve_shutdown = shutdown.clone();
    let join = tokio::spawn(async move {
        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            serve_shutdown.cancelled().await;
        });
        if let Err(err) = server.await {
            tracing::error!(target: "fyreflow.server", "server error: {err}");
        }
    });

    Ok(EngineHandle {
        addr,
        shutdown,
        join,
    })
}
