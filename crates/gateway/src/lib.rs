//! HTTP gateway for the Portray server.
//!
//! Exposes the submission and observation API over plain HTTP/1:
//!
//! - `POST /api/v1/tasks` — submit a generation job, get tracking URLs
//! - `GET /api/v1/tasks/{id}/status` — registry status plus latest event
//! - `GET /api/v1/tasks/{id}/history` — every retained progress event
//! - `GET /api/v1/tasks/{id}/stream` — live progress as NDJSON
//! - `GET /api/v1/tasks/{id}/events` — live progress as SSE
//! - `POST /api/v1/tasks/{id}/cancel` — request cooperative cancellation
//! - `GET /api/v1/gpu` — VRAM ledger and admission queue snapshot
//! - `GET /api/v1/assets/{id}` — fetch a stored asset
//! - `GET /healthz`, `GET /metrics` — liveness and Prometheus exposition
//!
//! Both stream flavors replay the retained history before going live, so a
//! client that connects mid-run sees every event exactly once.

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use portray_events::ProgressBus;
use portray_gpu::GpuResourceManager;
use portray_pipeline::{JobSubmitter, TaskRegistry};
use portray_storage::StorageManager;

pub mod handlers;
pub mod metrics;
pub mod router;
pub mod stream;

pub use metrics::GatewayMetrics;

/// Errors from the gateway server itself (not from request handling).
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Request size limits applied before any parsing.
#[derive(Debug, Clone)]
pub struct RequestLimits {
    /// Cap on the raw request body.
    pub max_body_bytes: usize,
    /// Cap on the decoded portrait image.
    pub max_image_bytes: usize,
    /// Cap on the decoded audio clip.
    pub max_audio_bytes: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_body_bytes: 64 * 1024 * 1024,
            max_image_bytes: 20 * 1024 * 1024,
            max_audio_bytes: 20 * 1024 * 1024,
        }
    }
}

/// Shared state handed to every request handler.
pub struct AppState {
    pub bus: ProgressBus,
    pub gpu: GpuResourceManager,
    pub storage: StorageManager,
    pub registry: Arc<TaskRegistry>,
    pub submitter: JobSubmitter,
    /// Registry all server metrics are registered against.
    pub metrics_registry: prometheus::Registry,
    pub limits: RequestLimits,
    pub metrics: Option<Arc<GatewayMetrics>>,
}

/// Bind `addr` and serve the API until `shutdown` fires.
///
/// Each connection runs on its own task; open streams on those tasks keep
/// draining after the accept loop stops.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> GatewayResult<()> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    info!(addr = %local, "gateway listening");

    serve_on(listener, state, shutdown).await
}

/// Serve the API on an already bound listener.
pub async fn serve_on(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> GatewayResult<()> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("gateway shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (tcp, remote) = accepted?;
                let io = TokioIo::new(tcp);
                let state = Arc::clone(&state);

                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move {
                            Ok::<_, std::convert::Infallible>(router::dispatch(state, req).await)
                        }
                    });
                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        debug!(remote = %remote, error = %err, "connection closed with error");
                    }
                });
            }
        }
    }
}
