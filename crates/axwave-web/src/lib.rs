//! Axum routes for the AXWAVE club and mission backends.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use axwave_service::{
    build_services, AppConfig, ClubService, CompletionInput, CompletionReceipt, MissionService,
    RecommendOptions, ServiceError, Services,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "axwave-web";
pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthorized => StatusCode::FORBIDDEN,
            AppError::Service(ServiceError::FeatureNotFound { .. }) => StatusCode::NOT_FOUND,
            AppError::Service(ServiceError::InvalidInput(_)) => StatusCode::BAD_REQUEST,
            AppError::Service(ServiceError::Upstream(_)) => StatusCode::BAD_GATEWAY,
            AppError::Service(ServiceError::Store(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(%status, error = %self, "request failed");
        }
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub api_key: Option<String>,
    pub services: Services,
    pub upstream_timeout: Duration,
}

impl AppState {
    pub fn new(config: &AppConfig, services: Services) -> Self {
        Self {
            api_key: config.api_key.clone(),
            services,
            upstream_timeout: config.upstream_timeout,
        }
    }
}

#[derive(Clone)]
struct MissionState {
    service: Arc<MissionService>,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct PredictRequest {
    user_id: String,
    #[serde(default)]
    segment_id: String,
}

#[derive(Debug, Deserialize)]
struct SelectClubRequest {
    user_id: String,
    club_domain: String,
}

#[derive(Debug, Deserialize)]
struct LeaveClubRequest {
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct RecommendRequest {
    user_id: String,
    #[serde(default = "default_k")]
    k: u32,
    #[serde(default = "default_exclude_days")]
    exclude_days: u32,
}

fn default_k() -> u32 {
    RecommendOptions::default().k
}

fn default_exclude_days() -> u32 {
    RecommendOptions::default().exclude_days
}

#[derive(Debug, Deserialize)]
struct CompleteRequest {
    user_id: String,
    #[serde(default)]
    date_str: Option<String>,
    completed_mission_ids: Vec<JsonValue>,
    #[serde(default)]
    completed_at: Option<String>,
}

/// Health is open; every other route sits behind the API key check.
pub fn app(state: AppState) -> Router {
    let mut protected = Router::new();
    if let Some(service) = state.services.missions.clone() {
        protected = protected.merge(mission_routes(MissionState {
            service,
            timeout: state.upstream_timeout,
        }));
    }
    if let Some(service) = state.services.clubs.clone() {
        protected = protected.merge(club_routes(service));
    }

    let api_key = Arc::new(state.api_key);
    Router::new()
        .route("/health", get(health_handler))
        .merge(protected.layer(middleware::from_fn_with_state(api_key, require_api_key)))
}

fn mission_routes(state: MissionState) -> Router {
    Router::new()
        .route("/missions/recommend", post(recommend_handler))
        .route("/missions/complete", post(complete_handler))
        .with_state(state)
}

fn club_routes(service: Arc<ClubService>) -> Router {
    Router::new()
        .route("/predict", post(predict_handler))
        .route("/select_club", post(select_club_handler))
        .route("/leave_club", post(leave_club_handler))
        .with_state(service)
}

async fn require_api_key(
    State(expected): State<Arc<Option<String>>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if let Some(expected) = expected.as_deref() {
        let supplied = request
            .headers()
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok());
        if supplied != Some(expected) {
            warn!(path = %request.uri().path(), "rejected request with bad api key");
            return Err(AppError::Unauthorized);
        }
    }
    Ok(next.run(request).await)
}

async fn health_handler() -> Json<JsonValue> {
    Json(json!({ "ok": true }))
}

async fn recommend_handler(
    State(state): State<MissionState>,
    Json(req): Json<RecommendRequest>,
) -> Result<Json<JsonValue>, AppError> {
    let options = RecommendOptions {
        k: req.k,
        exclude_days: req.exclude_days,
        timeout: state.timeout,
    };
    Ok(Json(state.service.recommend(&req.user_id, options).await?))
}

async fn complete_handler(
    State(state): State<MissionState>,
    Json(req): Json<CompleteRequest>,
) -> Result<Json<CompletionReceipt>, AppError> {
    let receipt = state
        .service
        .record_completion(CompletionInput {
            user_id: req.user_id,
            date: req.date_str,
            completed_mission_ids: req.completed_mission_ids,
            completed_at: req.completed_at,
        })
        .await?;
    Ok(Json(receipt))
}

async fn predict_handler(
    State(service): State<Arc<ClubService>>,
    Json(req): Json<PredictRequest>,
) -> Result<Json<JsonValue>, AppError> {
    Ok(Json(service.predict(&req.user_id, &req.segment_id).await?))
}

async fn select_club_handler(
    State(service): State<Arc<ClubService>>,
    Json(req): Json<SelectClubRequest>,
) -> Result<Json<JsonValue>, AppError> {
    service.select(&req.user_id, &req.club_domain).await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn leave_club_handler(
    State(service): State<Arc<ClubService>>,
    Json(req): Json<LeaveClubRequest>,
) -> Result<Json<JsonValue>, AppError> {
    service.leave(&req.user_id).await?;
    Ok(Json(json!({ "status": "ok" })))
}

pub async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let services = build_services(&config).await?;
    if config.api_key.is_none() {
        warn!("API_KEY is not set; protected routes accept any caller");
    }

    let addr = format!("{}:{}", config.bind_host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, variant = %config.variant, store = config.store.backend_name(), "listening");

    axum::serve(listener, app(AppState::new(&config, services)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received Ctrl+C, shutting down"),
            Err(err) => {
                error!(error = %err, "failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("received terminate signal, shutting down");
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::header;
    use axwave_adapters::{MissionApi, MissionPayload, PredictApi, PredictPayload, UpstreamError};
    use axwave_core::{ClubStatus, UserFeatureSnapshot};
    use axwave_storage::{FeatureStore, MemoryStore, StoreError};
    use http_body_util::BodyExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    /// Feature store that counts lookups before delegating.
    struct CountingFeatures {
        inner: Arc<MemoryStore>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FeatureStore for CountingFeatures {
        async fn latest_feature(
            &self,
            user_id: &str,
        ) -> Result<Option<UserFeatureSnapshot>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.latest_feature(user_id).await
        }
    }

    #[derive(Default)]
    struct FakeApis {
        calls: AtomicUsize,
        fail_with: Option<u16>,
    }

    #[async_trait]
    impl MissionApi for FakeApis {
        async fn recommend(
            &self,
            payload: &MissionPayload,
            _timeout: Duration,
        ) -> Result<JsonValue, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(status) = self.fail_with {
                return Err(UpstreamError::Status {
                    api: "Mission",
                    status,
                    body: "boom".into(),
                });
            }
            Ok(json!({ "k": payload.k, "excluded": payload.exclude_mission_ids }))
        }
    }

    #[async_trait]
    impl PredictApi for FakeApis {
        async fn predict(
            &self,
            payload: &PredictPayload,
            _timeout: Duration,
        ) -> Result<JsonValue, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "segment_id": payload.config.input_data["segment_id"] }))
        }
    }

    struct Harness {
        app: Router,
        store: Arc<MemoryStore>,
        features: Arc<CountingFeatures>,
        apis: Arc<FakeApis>,
    }

    async fn harness(api_key: Option<&str>, fail_with: Option<u16>) -> Harness {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_feature(
                serde_json::from_value(json!({
                    "user_id": "U1",
                    "snapshot_date": "2026-02-23",
                    "segment_id": "F_20"
                }))
                .unwrap(),
            )
            .await;
        let features = Arc::new(CountingFeatures {
            inner: store.clone(),
            calls: AtomicUsize::new(0),
        });
        let apis = Arc::new(FakeApis {
            calls: AtomicUsize::new(0),
            fail_with,
        });

        let services = Services {
            missions: Some(Arc::new(MissionService::new(
                features.clone(),
                store.clone(),
                apis.clone(),
            ))),
            clubs: Some(Arc::new(ClubService::new(
                features.clone(),
                store.clone(),
                store.clone(),
                apis.clone(),
            ))),
        };
        let app = app(AppState {
            api_key: api_key.map(str::to_string),
            services,
            upstream_timeout: Duration::from_secs(5),
        });
        Harness {
            app,
            store,
            features,
            apis,
        }
    }

    fn post_json(uri: &str, key: Option<&str>, body: JsonValue) -> axum::http::Request<Body> {
        let mut builder = axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(key) = key {
            builder = builder.header(API_KEY_HEADER, key);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn json_body(resp: Response) -> JsonValue {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_open() {
        let h = harness(Some("secret"), None).await;
        let resp = h
            .app
            .oneshot(axum::http::Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await, json!({ "ok": true }));
    }

    #[tokio::test]
    async fn bad_key_is_rejected_before_any_downstream_call() {
        let h = harness(Some("secret"), None).await;
        for key in [None, Some("wrong")] {
            let resp = h
                .app
                .clone()
                .oneshot(post_json("/missions/recommend", key, json!({ "user_id": "U1" })))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::FORBIDDEN);
            assert_eq!(json_body(resp).await, json!({ "detail": "Unauthorized" }));
        }

        // Unparseable body still gets 403, not a body rejection.
        let resp = h
            .app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/predict")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        assert_eq!(h.features.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.apis.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn recommend_uses_defaults_and_returns_upstream_body() {
        let h = harness(Some("secret"), None).await;
        let resp = h
            .app
            .oneshot(post_json("/missions/recommend", Some("secret"), json!({ "user_id": "U1" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await, json!({ "k": 3, "excluded": [] }));
    }

    #[tokio::test]
    async fn missing_snapshot_maps_to_404() {
        let h = harness(None, None).await;
        let resp = h
            .app
            .oneshot(post_json("/predict", None, json!({ "user_id": "nobody" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            json_body(resp).await,
            json!({ "detail": "user_feature_30d not found for user_id=nobody" })
        );
    }

    #[tokio::test]
    async fn upstream_failure_maps_to_502() {
        let h = harness(None, Some(500)).await;
        let resp = h
            .app
            .oneshot(post_json("/missions/recommend", None, json!({ "user_id": "U1", "k": 2 })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            json_body(resp).await,
            json!({ "detail": "Mission API error: status=500, body=boom" })
        );
    }

    #[tokio::test]
    async fn oversized_exclude_days_is_a_bad_request() {
        let h = harness(None, None).await;
        let resp = h
            .app
            .oneshot(post_json(
                "/missions/recommend",
                None,
                json!({ "user_id": "U1", "exclude_days": 100_000_000u32 }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(resp).await,
            json!({ "detail": "exclusion window of 100000000 days is out of range" })
        );
        assert_eq!(h.apis.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn complete_returns_saved_and_stored_rows() {
        let h = harness(None, None).await;
        let resp = h
            .app
            .clone()
            .oneshot(post_json(
                "/missions/complete",
                None,
                json!({
                    "user_id": "U1",
                    "date_str": "2026-02-20",
                    "completed_mission_ids": ["m1", 2, null, "m1"],
                    "completed_at": "2026-02-20 21:53:00"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["saved"]["exclude_mission_ids"], json!(["m1", "2"]));
        assert_eq!(body["saved"]["status"], json!("completed"));
        assert_eq!(body["saved"]["date"], json!("2026-02-20"));
        assert_eq!(body["stored"].as_array().map(Vec::len), Some(1));

        let resp = h
            .app
            .oneshot(post_json(
                "/missions/complete",
                None,
                json!({
                    "user_id": "U1",
                    "date_str": "not-a-date",
                    "completed_mission_ids": []
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn club_select_and_leave_update_selection() {
        let h = harness(None, None).await;
        let resp = h
            .app
            .clone()
            .oneshot(post_json(
                "/select_club",
                None,
                json!({ "user_id": "U1", "club_domain": "food" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await, json!({ "status": "ok" }));

        let resp = h
            .app
            .clone()
            .oneshot(post_json("/leave_club", None, json!({ "user_id": "U1" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let selection = h.store.club_selection("U1").await.unwrap();
        assert_eq!(selection.status, ClubStatus::Left);

        let resp = h
            .app
            .oneshot(post_json("/predict", None, json!({ "user_id": "U1" })))
            .await
            .unwrap();
        assert_eq!(json_body(resp).await, json!({ "segment_id": "" }));
    }

    #[tokio::test]
    async fn variant_only_mounts_its_routes() {
        let store = Arc::new(MemoryStore::new());
        let apis = Arc::new(FakeApis::default());
        let services = Services {
            missions: Some(Arc::new(MissionService::new(
                store.clone(),
                store,
                apis,
            ))),
            clubs: None,
        };
        let app = app(AppState {
            api_key: None,
            services,
            upstream_timeout: Duration::from_secs(5),
        });
        let resp = app
            .oneshot(post_json("/predict", None, json!({ "user_id": "U1" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
