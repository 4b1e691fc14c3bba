pub mod authorization;
pub mod http_proxy;
pub mod ws_proxy;

use crate::app::Web3GatewayApp;
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Extension, Router};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

/// Run the frontend until the process dies. The bound port lands in
/// `bound_port` so tests can listen on port 0.
pub async fn serve(
    port: u16,
    app: Arc<Web3GatewayApp>,
    bound_port: Arc<AtomicU16>,
) -> anyhow::Result<()> {
    // body size is enforced by the dispatcher so oversize gets an rpc
    // envelope instead of a bare 413
    let router = Router::new()
        .route("/healthz", get(health))
        .route(
            "/",
            post(http_proxy::proxy_web3_rpc).get(http_proxy::websocket_handler),
        )
        .route(
            "/:auth_alias",
            post(http_proxy::proxy_web3_rpc_with_auth)
                .get(http_proxy::websocket_handler_with_auth),
        )
        .layer(Extension(app))
        // websocket clients connect from anywhere
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::disable());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let server = axum::Server::bind(&addr)
        .serve(router.into_make_service_with_connect_info::<SocketAddr>());

    let local_addr = server.local_addr();
    bound_port.store(local_addr.port(), Ordering::Relaxed);

    info!("listening on {}", local_addr);

    server.await?;

    Ok(())
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
