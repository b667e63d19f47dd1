use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use civic_sync_core::models::{Conflict, ConflictId, ManualResolution, NewAction};
use civic_sync_core::sync::{DownloadPage, SessionReport, SessionRequest, UploadReport};
use civic_sync_core::SyncEngine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::identity::{extract_user, AuthenticatedUser};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub engine: Arc<SyncEngine>,
}

impl AppState {
    pub const fn new(config: Arc<AppConfig>, engine: Arc<SyncEngine>) -> Self {
        Self { config, engine }
    }
}

pub fn app_router(state: AppState) -> Router {
    let sync_routes = Router::new()
        .route("/sync/batch-upload", post(batch_upload))
        .route("/sync/incremental-download", get(incremental_download))
        .route("/sync/conflicts", get(list_conflicts))
        .route("/sync/conflicts/{id}/resolve", post(resolve_conflict))
        .route("/sync/session", post(run_session))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_identity,
        ));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", sync_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    pending_actions: u64,
    timestamp: i64,
}

async fn healthz(State(state): State<AppState>) -> Result<Json<HealthResponse>, AppError> {
    let pending_actions = state.engine.pending_count().await?;
    Ok(Json(HealthResponse {
        status: "ok",
        pending_actions,
        timestamp: Utc::now().timestamp(),
    }))
}

async fn require_identity(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let user = extract_user(request.headers(), &state.config.identity_header)?;
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

#[derive(Debug, Deserialize)]
struct BatchUploadRequest {
    device_id: String,
    #[serde(default)]
    actions: Vec<NewAction>,
}

async fn batch_upload(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(request): Json<BatchUploadRequest>,
) -> Result<Json<UploadReport>, AppError> {
    let report = state
        .engine
        .batch_upload(&user.user_id, &request.device_id, request.actions)
        .await?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    device_id: String,
    since_version: Option<i64>,
    page_token: Option<String>,
}

async fn incremental_download(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(query): Query<DownloadQuery>,
) -> Result<Json<DownloadPage>, AppError> {
    let page = state
        .engine
        .download_page(
            &user.user_id,
            &query.device_id,
            query.since_version,
            query.page_token.as_deref(),
        )
        .await?;
    Ok(Json(page))
}

#[derive(Debug, Deserialize)]
struct ConflictQuery {
    device_id: String,
    resolved: Option<bool>,
}

async fn list_conflicts(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(query): Query<ConflictQuery>,
) -> Result<Json<Vec<Conflict>>, AppError> {
    let conflicts = state
        .engine
        .list_conflicts(&user.user_id, &query.device_id, query.resolved)
        .await?;
    Ok(Json(conflicts))
}

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    #[serde(default)]
    resolved_payload: Option<Value>,
    #[serde(default)]
    abandon: bool,
}

impl ResolveRequest {
    fn into_resolution(self) -> Result<ManualResolution, AppError> {
        match (self.abandon, self.resolved_payload) {
            (true, Some(_)) => Err(AppError::bad_request(
                "abandon cannot be combined with resolved_payload",
            )),
            (true, None) => Ok(ManualResolution::Abandon),
            (false, payload) => Ok(ManualResolution::Apply { payload }),
        }
    }
}

async fn resolve_conflict(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<Conflict>, AppError> {
    let conflict_id: ConflictId = id
        .parse()
        .map_err(|_| AppError::bad_request(format!("`{id}` is not a conflict id")))?;
    let conflict = state
        .engine
        .resolve_conflict(&user.user_id, &conflict_id, request.into_resolution()?)
        .await?;
    Ok(Json(conflict))
}

#[derive(Debug, Deserialize)]
struct SessionBody {
    device_id: String,
    #[serde(default)]
    device_metadata: Option<Value>,
    #[serde(default)]
    actions: Vec<NewAction>,
}

async fn run_session(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(body): Json<SessionBody>,
) -> Result<Json<SessionReport>, AppError> {
    let report = state
        .engine
        .run_session(SessionRequest {
            user_id: user.user_id,
            device_id: body.device_id,
            device_metadata: body.device_metadata,
            actions: body.actions,
        })
        .await?;
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use civic_sync_core::db::Database;
    use civic_sync_core::models::ResolutionStrategy;
    use civic_sync_core::store::EntityStore;
    use civic_sync_core::sync::StrategyPolicy;
    use civic_sync_core::SyncConfig;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;

    async fn test_app(sync: SyncConfig) -> (Router, Arc<SyncEngine>) {
        let mut config = AppConfig::from_lookup(|_| None).unwrap();
        config.sync = sync.clone();
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let engine = Arc::new(SyncEngine::local(db, sync));
        let state = AppState::new(Arc::new(config), Arc::clone(&engine));
        (app_router(state), engine)
    }

    fn request(method: &str, uri: &str, user: Option<&str>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header("x-civic-user-id", user);
        }
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn healthz_reports_queue_depth_without_identity() {
        let (app, _engine) = test_app(SyncConfig::default()).await;
        let (status, body) = send(&app, request("GET", "/healthz", None, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["pending_actions"], 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sync_routes_require_identity() {
        let (app, _engine) = test_app(SyncConfig::default()).await;
        let (status, body) = send(
            &app,
            request(
                "POST",
                "/v1/sync/batch-upload",
                None,
                Some(json!({"device_id": "phone", "actions": []})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].as_str().unwrap().contains("x-civic-user-id"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn upload_then_download_round_trip() {
        let (app, _engine) = test_app(SyncConfig::default()).await;

        let (status, body) = send(
            &app,
            request(
                "POST",
                "/v1/sync/batch-upload",
                Some("user-1"),
                Some(json!({
                    "device_id": "phone",
                    "actions": [{
                        "client_entity_id": "c1",
                        "entity_type": "report",
                        "action_kind": "create",
                        "payload": {"title": "pothole on 5th"}
                    }]
                })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["results"][0]["outcome"], "applied");
        assert_eq!(body["results"][0]["server_id"], "c1");

        let (status, body) = send(
            &app,
            request(
                "GET",
                "/v1/sync/incremental-download?device_id=tablet",
                Some("user-1"),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body["changes"],
            json!([{
                "entity_type": "report",
                "entity_id": "c1",
                "version": 1,
                "record": {"title": "pothole on 5th"}
            }])
        );
        assert_eq!(body["next_page_token"], Value::Null);
        assert_eq!(body["cursor_version"], 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn malformed_page_token_is_bad_request() {
        let (app, _engine) = test_app(SyncConfig::default()).await;
        let (status, _body) = send(
            &app,
            request(
                "GET",
                "/v1/sync/incremental-download?device_id=phone&page_token=nope!",
                Some("user-1"),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn manual_conflict_is_listed_and_resolved() {
        let sync = SyncConfig {
            strategies: StrategyPolicy::new(ResolutionStrategy::Manual),
            ..SyncConfig::default()
        };
        let (app, engine) = test_app(sync).await;
        let v1 = engine
            .store()
            .create("report", "r-1", &json!({"status": "open"}))
            .await
            .unwrap();
        engine
            .store()
            .put("report", "r-1", &json!({"status": "triaged"}), v1)
            .await
            .unwrap();

        let (_, body) = send(
            &app,
            request(
                "POST",
                "/v1/sync/session",
                Some("user-1"),
                Some(json!({
                    "device_id": "phone",
                    "actions": [{
                        "client_entity_id": "c1",
                        "entity_type": "report",
                        "action_kind": "update",
                        "entity_id": "r-1",
                        "baseline_version": v1,
                        "payload": {"status": "closed"}
                    }]
                })),
            ),
        )
        .await;
        assert_eq!(body["state"], "DONE");
        assert_eq!(body["conflicted"], 1);
        let conflict_id = body["results"][0]["conflict_id"].as_str().unwrap().to_string();

        let (status, body) = send(
            &app,
            request(
                "GET",
                "/v1/sync/conflicts?device_id=phone&resolved=false",
                Some("user-1"),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let uri = format!("/v1/sync/conflicts/{conflict_id}/resolve");
        let (status, _) = send(
            &app,
            request(
                "POST",
                &uri,
                Some("user-2"),
                Some(json!({"abandon": true})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(
            &app,
            request(
                "POST",
                &uri,
                Some("user-1"),
                Some(json!({"resolved_payload": {"status": "closed", "note": "fixed"}})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["resolved"], true);
        assert_eq!(
            body["resolved_payload"],
            json!({"status": "closed", "note": "fixed"})
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resolve_rejects_abandon_with_payload() {
        let (app, _engine) = test_app(SyncConfig::default()).await;
        let uri = format!("/v1/sync/conflicts/{}/resolve", ConflictId::new());
        let (status, _) = send(
            &app,
            request(
                "POST",
                &uri,
                Some("user-1"),
                Some(json!({"abandon": true, "resolved_payload": {}})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
