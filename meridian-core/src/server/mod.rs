//! Status API server

pub mod api;

pub use api::{create_api_routes, ApiState, HealthResponse, WorkflowSummary, WorkflowsResponse};

use std::future::Future;
use std::net::SocketAddr;
use tokio::task::JoinHandle;

/// Bind the status API and serve it until `shutdown` resolves.
/// Returns the bound address (useful with port 0) and the server task.
pub fn spawn_api_server(
    state: ApiState,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let routes = create_api_routes(state);
    let (bound, server) = warp::serve(routes)
        .try_bind_with_graceful_shutdown(addr, shutdown)
        .map_err(|e| anyhow::anyhow!("Failed to bind status API on {}: {}", addr, e))?;
    tracing::info!(addr = %bound, "Status API listening");
    Ok((bound, tokio::spawn(server)))
}
