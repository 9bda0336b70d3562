//! MCP server front end: JSON-RPC handling plus stdio and HTTP transports.

pub mod routes;
pub mod rpc;
pub mod state;
pub mod stdio;

pub use rpc::McpServer;
pub use stdio::run_stdio;

use axum::Router;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the Axum application router.
pub fn build_router(mcp: Arc<McpServer>) -> Router {
    let app_state = Arc::new(state::AppState::new(mcp));

    Router::new()
        .merge(routes::mcp_routes())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(app_state)
}

/// Start the HTTP transport.
pub async fn start_server(mcp: Arc<McpServer>, bind_addr: &str) -> anyhow::Result<()> {
    let app = build_router(mcp);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!("MCP HTTP server listening on {}", bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
