//! Bearer-authenticated management API, nested under `/api/v1/websocket`.

pub mod error;
pub mod handlers;

use axum::{
    Router,
    body::Body,
    extract::MatchedPath,
    http::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use metrics::counter;

use crate::auth::{TokenSet, require_bearer};
use crate::metrics::API_REQUESTS_TOTAL;
use crate::server::AppState;

/// Management routes. Every route requires a configured bearer token.
pub fn routes(tokens: TokenSet) -> Router<AppState> {
    Router::new()
        .route("/stats", get(handlers::stats))
        .route("/broadcast", post(handlers::broadcast))
        .route("/rooms/{room_id}/broadcast", post(handlers::broadcast_to_room))
        .route("/clients", get(handlers::clients))
        .route(
            "/clients/{client_id}",
            get(handlers::client).delete(handlers::disconnect_client),
        )
        .route("/clients/{client_id}/send", post(handlers::send_to_client))
        .route_layer(middleware::from_fn_with_state(tokens, require_bearer))
        .layer(middleware::from_fn(track_requests))
}

/// Count requests by route and status.
async fn track_requests(request: Request<Body>, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path().to_owned(), |p| p.as_str().to_owned());
    let response = next.run(request).await;
    counter!(
        API_REQUESTS_TOTAL,
        "method" => method,
        "path" => path,
        "status" => response.status().as_u16().to_string()
    )
    .increment(1);
    response
}
