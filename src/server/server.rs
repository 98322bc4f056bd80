//! HTTP listener setup and lifecycle. Mirrors the teacher's split between
//! `server.rs` (binding, `axum::serve`, shutdown races) and `http_api.rs`
//! (routing and handlers).

use crate::app_state::PipelineState;
use crate::server::http_api::create_router;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Binds and serves the HTTP API, racing against an optional test duration
/// and Ctrl+C. Returns once the server has stopped accepting connections;
/// callers are responsible for flushing shared state afterward.
pub async fn run_server_with_duration(
    state: Arc<PipelineState>,
    duration: Option<u64>,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let start = Instant::now();
    let port = state.config.backend.port;
    let app = create_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Box::<dyn Error + Send + Sync>::from(format!("listener error: {e}")))?;

    info!("ingestion pipeline listening on {addr}");

    if let Some(duration) = duration {
        tokio::select! {
            result = axum::serve(listener, app) => {
                if let Err(e) = result {
                    error!("server error: {e}");
                }
            }
            _ = tokio::time::sleep(Duration::from_secs(duration)) => {
                info!("duration limit reached, shutting down");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal");
            }
        }
    } else {
        tokio::select! {
            result = axum::serve(listener, app) => {
                if let Err(e) = result {
                    error!("server error: {e}");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal");
            }
        }
    }

    info!("server stopped after {:.2}s", start.elapsed().as_secs_f64());
    Ok(())
}
