//! HTTP and websocket entrypoints.

use crate::app::Web3GatewayApp;
use crate::frontend::authorization::RequestContext;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path};
use axum::http::{HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use hyper::body::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

pub const CACHE_STATUS_HEADER: &str = "X-Proxyd-Cache-Status";
pub const SERVED_BY_HEADER: &str = "x-served-by";

pub async fn proxy_web3_rpc(
    Extension(app): Extension<Arc<Web3GatewayApp>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    _proxy(app, headers, peer, None, body).await
}

pub async fn proxy_web3_rpc_with_auth(
    Extension(app): Extension<Arc<Web3GatewayApp>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(auth_alias): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    _proxy(app, headers, peer, Some(auth_alias), body).await
}

async fn _proxy(
    app: Arc<Web3GatewayApp>,
    headers: HeaderMap,
    peer: SocketAddr,
    auth_alias: Option<String>,
    body: Bytes,
) -> Response {
    if let Err(err) = app.check_auth(auth_alias.as_deref()) {
        return err.into_response_with_id(None);
    }

    let ctx = RequestContext::new(&headers, Some(peer), app.ip_header(), auth_alias);

    let response = match app.proxy_web3_rpc(&ctx, body).await {
        Ok(result) => {
            let mut response = (result.status, Json(result.response)).into_response();

            let response_headers = response.headers_mut();

            response_headers.insert(
                CACHE_STATUS_HEADER,
                HeaderValue::from_static(result.cache_status),
            );

            if let Some(served_by) = &result.served_by {
                if let Ok(value) = HeaderValue::from_str(served_by) {
                    response_headers.insert(SERVED_BY_HEADER, value);
                }
            }

            response
        }
        Err(err) => err.into_response_with_id(None),
    };

    app.metrics().http_response(response.status().as_u16());

    response
}

pub async fn websocket_handler(
    Extension(app): Extension<Arc<Web3GatewayApp>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    _upgrade(app, headers, peer, None, ws)
}

pub async fn websocket_handler_with_auth(
    Extension(app): Extension<Arc<Web3GatewayApp>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(auth_alias): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    _upgrade(app, headers, peer, Some(auth_alias), ws)
}

fn _upgrade(
    app: Arc<Web3GatewayApp>,
    headers: HeaderMap,
    peer: SocketAddr,
    auth_alias: Option<String>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(err) = app.check_auth(auth_alias.as_deref()) {
        return err.into_response_with_id(None);
    }

    let ctx = RequestContext::new(&headers, Some(peer), app.ip_header(), auth_alias);

    // read limit matches the http body cap
    ws.max_message_size(app.max_body_size())
        .on_upgrade(move |socket| async move {
            if let Err(err) = app.proxy_ws(ctx, socket).await {
                debug!(?err, "ws proxy ended");
            }
        })
        .into_response()
}
