//! axum binding for [`GatewayService`].

use crate::auth::TraceId;
use crate::service::{GatewayRequest, GatewayResponse, GatewayService, ResponseBody};
use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::response::Response;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

/// Create the application router.
///
/// Routing lives in [`GatewayService`], so every path goes through the
/// fallback handler. Without `ConnectInfo` (as in tests driving the router
/// directly) the client address is unknown.
pub fn create_router(service: Arc<GatewayService>) -> Router {
    Router::new()
        .fallback(gateway_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

async fn gateway_handler(State(service): State<Arc<GatewayService>>, req: Request) -> Response {
    let trace_id = TraceId::from_headers(req.headers());
    let peer_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let (parts, _body) = req.into_parts();
    let request = GatewayRequest {
        method: parts.method,
        path: parts.uri.path().to_string(),
        headers: parts.headers,
        peer_addr,
        trace_id: Some(trace_id.0.clone()),
    };

    let span = tracing::info_span!("request", trace_id = %trace_id);
    let response = service.handle(request).instrument(span).await;
    into_axum_response(response)
}

fn into_axum_response(response: GatewayResponse) -> Response {
    let GatewayResponse {
        status,
        headers,
        body,
    } = response;
    let body = match body {
        ResponseBody::Empty => Body::empty(),
        ResponseBody::Full(bytes) => Body::from(bytes),
        ResponseBody::Stream(stream) => Body::from_stream(stream),
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
