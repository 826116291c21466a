use crate::service_context::ServiceContext;
use crate::web::api::{healthz, stats};
use anyhow::Result;
use axum::{routing::get, Router};
use std::future::Future;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Ports tried after the configured one is taken
const PORT_ATTEMPTS: u16 = 10;

pub fn status_router(ctx: Arc<ServiceContext>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/stats", get(stats))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let mut current = addr;
    for _ in 0..PORT_ATTEMPTS {
        match TcpListener::bind(current) {
            Ok(listener) => {
                // Tokio requires a non-blocking socket
                listener.set_nonblocking(true)?;
                return Ok(listener);
            }
            Err(e) => {
                warn!("Failed to bind to {}: {}. Trying next port...", current, e);
                match current.port().checked_add(1) {
                    Some(port) => current.set_port(port),
                    None => break,
                }
            }
        }
    }
    Err(anyhow::anyhow!("No available port near {}", addr))
}

/// Serve the read-only status endpoint until `shutdown` resolves.
pub async fn run_status_server<F>(addr: SocketAddr, ctx: Arc<ServiceContext>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::from_std(bind(addr)?)?;
    info!("Status endpoint listening on http://{}", listener.local_addr()?);

    axum::serve(listener, status_router(ctx))
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
