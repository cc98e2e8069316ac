//! Read-only HTTP surface
//!
//! ## Architecture
//!
//! - **Axum** web framework with Tower middleware
//! - **Manager** for the in-memory freshness cache
//! - **StorageBackend** for drained records
//!
//! ## Endpoints
//!
//! - `GET /api/v1/health` - Liveness plus storage health
//! - `GET /api/v1/data` - Stored records (`vmids`, `from`, `to`, `limit`)
//! - `GET /api/v1/manager` - Latest sample of every guest

pub mod error;
pub mod routes;
pub mod state;
pub mod types;

pub use error::{ApiError, ApiResult};
pub use state::ApiState;
pub use types::{DataResponse, HealthResponse};

use std::net::SocketAddr;

use axum::{Router, routing::get};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Build the router with every route and middleware
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(routes::health::health_check))
        .route("/api/v1/data", get(routes::data::list_data))
        .route("/api/v1/manager", get(routes::manager::list_latest))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Spawn the API server
///
/// This starts an Axum HTTP server in a background task.
/// Returns the server's local address.
pub async fn spawn_api_server(
    bind_addr: SocketAddr,
    state: ApiState,
) -> anyhow::Result<SocketAddr> {
    info!("starting API server on {bind_addr}");

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    let addr = listener.local_addr()?;
    let app = router(state);

    info!("API server listening on {addr}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("API server error: {e}");
        }
    });

    Ok(addr)
}
