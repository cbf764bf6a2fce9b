/**
 * API REST RVC - Plan de contrôle HTTP du pont Matter
 *
 * RÔLE :
 * Expose l'état du robot aspirateur et l'envoi de commandes aux UIs/scripts.
 * Toutes les routes lisent/écrivent via le DeviceLink injecté dans l'état Axum.
 *
 * ROUTES :
 * - /health, /api/system/health : supervision
 * - /api/status, /api/nodes, /api/node/{id} : lecture du store
 * - /api/control : commande vers le serveur Matter (whitelist d'actions)
 * - /api/config : lecture/changement de l'adresse amont (reconnexion en fond)
 * - /ws : relais temps réel (voir relay.rs)
 *
 * ERREURS :
 * Toujours `{status:"error", message}` avec 400/404/500.
 */

use crate::error::BridgeError;
use crate::health::KernelHealth;
use crate::link::DeviceLink;
use crate::models::{DeviceStatusSummary, NodeView};
use crate::relay::ws_handler;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

// Actions acceptées par POST /api/control, avec leur libellé
const ALLOWED_ACTIONS: &[(&str, &str)] = &[
    ("start", "start cleaning"),
    ("stop", "stop cleaning"),
    ("pause", "pause cleaning"),
    ("resume", "resume cleaning"),
    ("return_to_base", "return to base"),
];

#[derive(Clone)]
pub struct AppState {
    pub link: Arc<DeviceLink>,
}

#[derive(Debug)]
pub struct ApiError {
    code: StatusCode,
    message: String,
}

impl ApiError {
    fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        let code = match err {
            BridgeError::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(code, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "status": "error", "message": self.message }));
        (self.code, body).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/system/health", get(get_system_health))
        .route("/api/status", get(get_status))
        .route("/api/nodes", get(get_nodes))
        .route("/api/node/{id}", get(get_node))
        .route("/api/control", post(control_device))
        .route("/api/config", get(get_config).post(update_config))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

// GET /api/system/health (état du pont)
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.link.health().await)
}

// GET /api/status (fiche produit + résumé courant + connexion amont)
async fn get_status(State(app): State<AppState>, headers: HeaderMap) -> Json<Value> {
    let link = &app.link;
    let info = link.config().device_info;
    let ip_address = info.ip_address.clone().unwrap_or_else(|| {
        headers
            .get(header::HOST)
            .and_then(|host| host.to_str().ok())
            .unwrap_or("unknown")
            .to_string()
    });
    Json(json!({
        "status": "success",
        "data": {
            "device_info": {
                "product_name": info.product_name,
                "manufacturer": info.manufacturer,
                "hardware_version": info.hardware_version,
                "software_version": info.software_version,
                "serial_number": info.serial_number,
                "matter_version": info.matter_version,
                "ip_address": ip_address,
            },
            "device_status": link.store().status(),
            "node_id": link.store().active_node_id(),
            "connected": link.is_connected(),
            "server_url": link.config().matter_server_url,
        }
    }))
}

// GET /api/nodes (liste)
async fn get_nodes(State(app): State<AppState>) -> Json<Value> {
    let nodes: Vec<NodeView> = app.link.store().nodes().iter().map(NodeView::from).collect();
    Json(json!({ "status": "success", "data": nodes }))
}

// GET /api/node/{id} (résumé dérivé + métadonnées)
async fn get_node(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let Some(node) = app.link.store().node(&id) else {
        return Err(ApiError::new(StatusCode::NOT_FOUND, format!("unknown node: {id}")));
    };
    Ok(Json(json!({
        "status": "success",
        "data": {
            "node": NodeView::from(&node),
            "device_status": DeviceStatusSummary::from_node(&node).to_value(),
        }
    })))
}

// POST /api/control {action, node_id?, params?}
async fn control_device(
    State(app): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let body = body.map(|Json(v)| v).unwrap_or(Value::Null);
    let Some(action) = body.get("action").and_then(Value::as_str) else {
        return Err(ApiError::bad_request("missing required field: action"));
    };
    let Some((_, label)) = ALLOWED_ACTIONS.iter().find(|(name, _)| *name == action) else {
        return Err(ApiError::bad_request(format!("unsupported action: {action}")));
    };

    let node_id = match body.get("node_id") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => app.link.store().active_node_id(),
    };
    let params = body.get("params").cloned().unwrap_or_else(|| json!({}));

    let accepted = app
        .link
        .send_command(node_id.as_deref(), action, params)
        .map_err(|e| {
            warn!(action, "[http] command rejected: {e}");
            ApiError::from(e)
        })?;

    info!(action, message_id = %accepted.message_id, "[http] command sent");
    Ok(Json(json!({
        "status": "success",
        "message": format!("{label} command sent"),
        "message_id": accepted.message_id,
    })))
}

// GET /api/config
async fn get_config(State(app): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "success",
        "data": { "matter_server_url": app.link.config().matter_server_url }
    }))
}

// POST /api/config {matter_server_url}
async fn update_config(
    State(app): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let body = body.map(|Json(v)| v).unwrap_or(Value::Null);
    let Some(url) = body.get("matter_server_url").and_then(Value::as_str) else {
        return Err(ApiError::bad_request("nothing to update"));
    };

    app.link.set_server_url(url)?;
    Ok(Json(json!({
        "status": "success",
        "message": "configuration updated, reconnecting to the Matter server",
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::models::NodeRecord;
    use crate::state::new_state;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::collections::HashMap;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<DeviceLink>) {
        let link = DeviceLink::new(new_state(KernelConfig::default()));
        (build_router(AppState { link: link.clone() }), link)
    }

    async fn call(router: Router, req: Request<Body>) -> (StatusCode, Value) {
        let res = router.oneshot(req).await.unwrap();
        let code = res.status();
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (code, body)
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn node(id: &str, available: bool, state: i64) -> NodeRecord {
        NodeRecord {
            node_id: id.into(),
            available,
            date_commissioned: Some("2024-01-01T00:00:00".into()),
            last_interview: None,
            attributes: HashMap::from([("1/97/4".to_string(), json!(state))]),
        }
    }

    #[tokio::test]
    async fn test_health_is_plain_ok() {
        let (router, _) = app();
        let res = router.oneshot(get_req("/health")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"ok");
    }

    #[tokio::test]
    async fn test_status_when_disconnected() {
        let (router, _) = app();
        let (code, body) = call(router, get_req("/api/status")).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["data"]["connected"], false);
        assert_eq!(body["data"]["device_status"]["operational_state"], "offline");
        assert_eq!(body["data"]["server_url"], "ws://127.0.0.1:5580/ws");
    }

    #[tokio::test]
    async fn test_status_carries_device_info() {
        let (router, _) = app();
        let req = Request::get("/api/status")
            .header("host", "192.168.1.20:5005")
            .body(Body::empty())
            .unwrap();
        let (_, body) = call(router, req).await;
        let info = &body["data"]["device_info"];
        assert_eq!(info["product_name"], "unknown");
        assert_eq!(info["matter_version"], "unknown");
        assert_eq!(info["ip_address"], "192.168.1.20:5005");

        let mut cfg = KernelConfig::default();
        cfg.device_info.manufacturer = "Acme".into();
        cfg.device_info.ip_address = Some("10.0.0.9".into());
        let router = build_router(AppState { link: DeviceLink::new(new_state(cfg)) });
        let (_, body) = call(router, get_req("/api/status")).await;
        assert_eq!(body["data"]["device_info"]["manufacturer"], "Acme");
        assert_eq!(body["data"]["device_info"]["ip_address"], "10.0.0.9");
    }

    #[tokio::test]
    async fn test_cross_origin_requests_are_allowed() {
        let (router, _) = app();
        let req = Request::get("/api/status")
            .header("origin", "http://dashboard.local")
            .body(Body::empty())
            .unwrap();
        let res = router.oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()["access-control-allow-origin"], "*");
    }

    #[tokio::test]
    async fn test_nodes_and_node_detail() {
        let (router, link) = app();
        link.store().replace_nodes(vec![node("4", true, 1), node("7", false, 0)]);

        let (_, body) = call(router.clone(), get_req("/api/nodes")).await;
        let nodes = body["data"].as_array().unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0]["node_id"], "4");
        assert!(nodes[0].get("attributes").is_none());

        let (code, body) = call(router.clone(), get_req("/api/node/4")).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["data"]["device_status"]["operational_state"], "Running");
        assert_eq!(body["data"]["node"]["date_commissioned"], "2024-01-01T00:00:00");

        let (code, body) = call(router, get_req("/api/node/99")).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn test_control_rejects_missing_or_unknown_action() {
        let (router, _) = app();
        let (code, body) = call(router.clone(), post_json("/api/control", json!({}))).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");

        let (code, body) =
            call(router, post_json("/api/control", json!({ "action": "dance" }))).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap().contains("dance"));
    }

    #[tokio::test]
    async fn test_control_when_disconnected_is_500() {
        let (router, link) = app();
        let (code, body) =
            call(router, post_json("/api/control", json!({ "action": "start" }))).await;
        assert_eq!(code, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["message"], "upstream server not connected");
        assert!(link.dispatcher().pending().is_empty());
    }

    #[tokio::test]
    async fn test_config_get_and_update() {
        let (router, link) = app();
        let (_, body) = call(router.clone(), get_req("/api/config")).await;
        assert_eq!(body["data"]["matter_server_url"], "ws://127.0.0.1:5580/ws");

        let (code, _) = call(
            router.clone(),
            post_json("/api/config", json!({ "matter_server_url": "ftp://x" })),
        )
        .await;
        assert_eq!(code, StatusCode::BAD_REQUEST);

        let (code, _) = call(router.clone(), post_json("/api/config", json!({}))).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);

        let (code, body) = call(
            router,
            post_json("/api/config", json!({ "matter_server_url": "ws://10.0.0.2:5580/ws" })),
        )
        .await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(link.config().matter_server_url, "ws://10.0.0.2:5580/ws");
    }

    #[tokio::test]
    async fn test_system_health() {
        let (router, _) = app();
        let (code, body) = call(router, get_req("/api/system/health")).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["upstream_status"], "disconnected");
        assert_eq!(body["nodes_tracked"], 0);
    }
}
