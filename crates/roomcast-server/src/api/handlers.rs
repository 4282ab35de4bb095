//! Management API handlers.
//!
//! Successful responses share the envelope `{success, data, timestamp}`;
//! failures are [`ApiError`]s rendered as plain text.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
};
use chrono::{DateTime, Utc};
use roomcast_core::{ConnectionId, Frame, RoomId};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use super::error::{ApiError, ApiResult};
use crate::server::AppState;
use crate::websocket::broadcast::{ConnectionInfo, DeliveryReport, StatsSnapshot};
use crate::websocket::registry::RegistryError;

/// Confirmation text for delivered broadcasts.
const BROADCAST_OK: &str = "Message broadcasted successfully";

/// Success envelope.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    /// Always `true`; failures are not enveloped.
    pub success: bool,
    /// Payload.
    pub data: T,
    /// Response time.
    pub timestamp: DateTime<Utc>,
}

impl<T> ApiResponse<T> {
    /// Wrap `data` in a success envelope.
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Broadcast outcome returned to the caller.
#[derive(Debug, Serialize)]
pub struct BroadcastResult {
    /// Fixed confirmation text.
    pub message: &'static str,
    /// `type` of the frame that went out.
    pub message_type: String,
    /// Connections a send was attempted on.
    pub recipients: usize,
    /// Of those, connections that rejected it.
    pub failed: usize,
}

impl BroadcastResult {
    fn new(frame: &Frame, report: DeliveryReport) -> Self {
        Self {
            message: BROADCAST_OK,
            message_type: frame.frame_type.clone(),
            recipients: report.recipients,
            failed: report.failed,
        }
    }
}

/// Client listing payload.
#[derive(Debug, Serialize)]
pub struct ClientList {
    /// Number of entries in `clients`.
    pub count: usize,
    /// One row per live connection.
    pub clients: Vec<ConnectionInfo>,
}

/// Result of an operator disconnect.
#[derive(Debug, Serialize)]
pub struct DisconnectResult {
    /// Fixed confirmation text.
    pub message: &'static str,
    /// The connection that was closed.
    pub client_id: ConnectionId,
}

fn unknown_client(e: RegistryError) -> ApiError {
    match e {
        RegistryError::UnknownConnection(id) => ApiError::NotFound(format!("client {id}")),
        other => ApiError::Internal(other.to_string()),
    }
}

/// Validate a `{type, data}` body and build the frame to send.
///
/// `type` must be a non-empty string and `data` a JSON object.
pub fn parse_frame_body(body: &[u8]) -> ApiResult<Frame> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| ApiError::InvalidBody(e.to_string()))?;
    let Value::Object(mut obj) = value else {
        return Err(ApiError::InvalidBody("expected a JSON object".into()));
    };

    let frame_type = match obj.remove("type") {
        Some(Value::String(t)) if !t.trim().is_empty() => t,
        _ => return Err(ApiError::InvalidBody("type must be a non-empty string".into())),
    };
    let data = match obj.remove("data") {
        Some(Value::Object(data)) => data,
        _ => return Err(ApiError::InvalidBody("data must be an object".into())),
    };
    Ok(Frame::new(frame_type, data))
}

/// `GET /stats`
pub async fn stats(State(state): State<AppState>) -> Json<ApiResponse<StatsSnapshot>> {
    Json(ApiResponse::ok(state.gateway.stats()))
}

/// `POST /broadcast`
pub async fn broadcast(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<ApiResponse<BroadcastResult>>> {
    let frame = parse_frame_body(&body)?;
    let report = state.gateway.broadcast(&frame);
    info!(
        message_type = %frame.frame_type,
        recipients = report.recipients,
        failed = report.failed,
        "broadcast via management API"
    );
    Ok(Json(ApiResponse::ok(BroadcastResult::new(&frame, report))))
}

/// `POST /rooms/{room_id}/broadcast`
pub async fn broadcast_to_room(
    State(state): State<AppState>,
    Path(room_id): Path<i64>,
    body: Bytes,
) -> ApiResult<Json<ApiResponse<BroadcastResult>>> {
    let frame = parse_frame_body(&body)?;
    let room = RoomId::new(room_id);
    let report = state.gateway.broadcast_to_room(room, &frame);
    info!(
        message_type = %frame.frame_type,
        room_id = %room,
        recipients = report.recipients,
        "room broadcast via management API"
    );
    Ok(Json(ApiResponse::ok(BroadcastResult::new(&frame, report))))
}

/// `GET /clients`
pub async fn clients(State(state): State<AppState>) -> Json<ApiResponse<ClientList>> {
    let clients = state.gateway.connections();
    Json(ApiResponse::ok(ClientList {
        count: clients.len(),
        clients,
    }))
}

/// `GET /clients/{client_id}`
pub async fn client(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> ApiResult<Json<ApiResponse<ConnectionInfo>>> {
    let id = ConnectionId::from(client_id);
    let info = state
        .gateway
        .connection(&id)
        .ok_or_else(|| ApiError::NotFound(format!("client {id}")))?;
    Ok(Json(ApiResponse::ok(info)))
}

/// `DELETE /clients/{client_id}`
pub async fn disconnect_client(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> ApiResult<Json<ApiResponse<DisconnectResult>>> {
    let id = ConnectionId::from(client_id);
    state.gateway.disconnect(&id).map_err(unknown_client)?;
    Ok(Json(ApiResponse::ok(DisconnectResult {
        message: "Client disconnected",
        client_id: id,
    })))
}

/// `POST /clients/{client_id}/send`
pub async fn send_to_client(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<ApiResponse<BroadcastResult>>> {
    let frame = parse_frame_body(&body)?;
    let id = ConnectionId::from(client_id);
    let report = state.gateway.send_to(&id, &frame).map_err(unknown_client)?;
    Ok(Json(ApiResponse::ok(BroadcastResult::new(&frame, report))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use tower::ServiceExt;

    use crate::config::ServerConfig;
    use crate::server::RoomcastServer;
    use crate::websocket::connection::{Outbound, Principal};
    use crate::websocket::registry::Admission;

    const TOKEN: &str = "test-token";

    fn make_server(tokens: &[&str]) -> RoomcastServer {
        let config = ServerConfig {
            api_tokens: tokens.iter().map(|t| (*t).to_owned()).collect(),
            ..ServerConfig::default()
        };
        RoomcastServer::new(config, None)
    }

    fn admit(server: &RoomcastServer) -> Admission {
        let mut adm = server.registry().admit(Principal::Anonymous).unwrap();
        let _ = adm.outbound.try_recv().unwrap();
        adm
    }

    fn get(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut req = Request::builder().uri(uri);
        if let Some(t) = token {
            req = req.header(header::AUTHORIZATION, format!("Bearer {t}"));
        }
        req.body(Body::empty()).unwrap()
    }

    fn post(uri: &str, token: Option<&str>, body: &str) -> Request<Body> {
        let mut req = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(t) = token {
            req = req.header(header::AUTHORIZATION, format!("Bearer {t}"));
        }
        req.body(Body::from(body.to_owned())).unwrap()
    }

    async fn body_json(resp: axum::response::Response) -> Value {
        let body = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    async fn body_text(resp: axum::response::Response) -> String {
        let body = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[test]
    fn parse_valid_body() {
        let frame = parse_frame_body(br#"{"type":"test_broadcast","data":{"message":"hi"}}"#).unwrap();
        assert_eq!(frame.frame_type, "test_broadcast");
        assert_eq!(frame.data["message"], "hi");
    }

    #[test]
    fn parse_rejects_bad_bodies() {
        for body in [
            &b"not json"[..],
            br#"[1,2]"#,
            br#"{"data":{}}"#,
            br#"{"type":"","data":{}}"#,
            br#"{"type":7,"data":{}}"#,
            br#"{"type":"x"}"#,
            br#"{"type":"x","data":"str"}"#,
        ] {
            assert_matches!(parse_frame_body(body), Err(ApiError::InvalidBody(_)));
        }
    }

    #[tokio::test]
    async fn stats_requires_token() {
        let app = make_server(&[TOKEN]).router();
        let resp = app.oneshot(get("/api/v1/websocket/stats", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let ct = resp.headers()[header::CONTENT_TYPE].to_str().unwrap().to_owned();
        assert!(ct.starts_with("text/plain"));
    }

    #[tokio::test]
    async fn stats_rejects_wrong_token() {
        let app = make_server(&[TOKEN]).router();
        let resp = app
            .oneshot(get("/api/v1/websocket/stats", Some("wrong")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unconfigured_tokens_reject_everything() {
        let app = make_server(&[]).router();
        let resp = app
            .oneshot(get("/api/v1/websocket/stats", Some("anything")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(body_text(resp).await.contains("no tokens configured"));
    }

    #[tokio::test]
    async fn stats_returns_envelope() {
        let server = make_server(&[TOKEN]);
        let adm = admit(&server);
        let _ = server
            .registry()
            .subscribe(&adm.connection.id, RoomId::new(1))
            .unwrap();

        let resp = server
            .router()
            .oneshot(get("/api/v1/websocket/stats", Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert_eq!(v["success"], true);
        assert!(v["timestamp"].is_string());
        assert_eq!(v["data"]["total_connections"], 1);
        assert_eq!(v["data"]["total_rooms"], 1);
        assert_eq!(v["data"]["rooms"]["1"], 1);
    }

    #[tokio::test]
    async fn broadcast_delivers_and_counts() {
        let server = make_server(&[TOKEN]);
        let mut adm = admit(&server);

        let resp = server
            .router()
            .oneshot(post(
                "/api/v1/websocket/broadcast",
                Some(TOKEN),
                r#"{"type":"test_broadcast","data":{"message":"hi"}}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert_eq!(v["data"]["message"], BROADCAST_OK);
        assert_eq!(v["data"]["message_type"], "test_broadcast");
        assert_eq!(v["data"]["recipients"], 1);
        assert_eq!(v["data"]["failed"], 0);

        let Ok(Outbound::Text(text)) = adm.outbound.try_recv() else {
            panic!("expected broadcast frame");
        };
        let frame: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(frame["type"], "test_broadcast");
        assert_eq!(frame["data"]["message"], "hi");
    }

    #[tokio::test]
    async fn broadcast_bad_body_is_400() {
        let server = make_server(&[TOKEN]);
        let resp = server
            .router()
            .oneshot(post("/api/v1/websocket/broadcast", Some(TOKEN), r#"{"data":{}}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(resp).await.starts_with("Invalid request body:"));
    }

    #[tokio::test]
    async fn room_broadcast_unknown_room_is_zero() {
        let server = make_server(&[TOKEN]);
        let _adm = admit(&server);
        let resp = server
            .router()
            .oneshot(post(
                "/api/v1/websocket/rooms/99/broadcast",
                Some(TOKEN),
                r#"{"type":"x","data":{}}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["data"]["recipients"], 0);
    }

    #[tokio::test]
    async fn clients_lists_connections() {
        let server = make_server(&[TOKEN]);
        let adm = admit(&server);
        let resp = server
            .router()
            .oneshot(get("/api/v1/websocket/clients", Some(TOKEN)))
            .await
            .unwrap();
        let v = body_json(resp).await;
        assert_eq!(v["data"]["count"], 1);
        assert_eq!(v["data"]["clients"][0]["id"], adm.connection.id.as_str());
    }

    fn delete(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut req = Request::builder().method("DELETE").uri(uri);
        if let Some(t) = token {
            req = req.header(header::AUTHORIZATION, format!("Bearer {t}"));
        }
        req.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn client_lookup_returns_row() {
        let server = make_server(&[TOKEN]);
        let adm = admit(&server);
        let _ = server
            .registry()
            .subscribe(&adm.connection.id, RoomId::new(3))
            .unwrap();
        let uri = format!("/api/v1/websocket/clients/{}", adm.connection.id);

        let resp = server.router().oneshot(get(&uri, Some(TOKEN))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert_eq!(v["data"]["id"], adm.connection.id.as_str());
        assert_eq!(v["data"]["subscriptions"], serde_json::json!([3]));
        assert_eq!(v["data"]["state"], "ACTIVE");
    }

    #[tokio::test]
    async fn client_lookup_unknown_is_404() {
        let server = make_server(&[TOKEN]);
        let resp = server
            .router()
            .oneshot(get("/api/v1/websocket/clients/conn_missing", Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(body_text(resp).await.contains("conn_missing"));
    }

    #[tokio::test]
    async fn disconnect_client_removes_once() {
        let server = make_server(&[TOKEN]);
        let adm = admit(&server);
        let _ = server
            .registry()
            .subscribe(&adm.connection.id, RoomId::new(3))
            .unwrap();
        let uri = format!("/api/v1/websocket/clients/{}", adm.connection.id);

        let resp = server.router().oneshot(delete(&uri, Some(TOKEN))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert_eq!(v["data"]["client_id"], adm.connection.id.as_str());
        assert!(server.registry().is_empty());
        assert!(server.registry().members_of(RoomId::new(3)).is_empty());
        assert!(adm.connection.is_closed());

        let resp = server.router().oneshot(delete(&uri, Some(TOKEN))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn disconnect_requires_token() {
        let server = make_server(&[TOKEN]);
        let adm = admit(&server);
        let uri = format!("/api/v1/websocket/clients/{}", adm.connection.id);
        let resp = server.router().oneshot(delete(&uri, None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(server.registry().len(), 1);
    }

    #[tokio::test]
    async fn send_to_unknown_client_is_404() {
        let server = make_server(&[TOKEN]);
        let resp = server
            .router()
            .oneshot(post(
                "/api/v1/websocket/clients/conn_missing/send",
                Some(TOKEN),
                r#"{"type":"x","data":{}}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn send_to_known_client() {
        let server = make_server(&[TOKEN]);
        let mut adm = admit(&server);
        let uri = format!("/api/v1/websocket/clients/{}/send", adm.connection.id);
        let resp = server
            .router()
            .oneshot(post(&uri, Some(TOKEN), r#"{"type":"direct","data":{"n":1}}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(adm.outbound.try_recv().is_ok());
    }
}
