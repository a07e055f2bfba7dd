mod draft;
mod http;
mod idempotency;
mod llm;
mod matching;
mod metrics;
mod models;
mod pipeline;
mod pricing;
mod qr;
mod security;
mod stripe;
mod supabase;

use axum::{
    Json, Router,
    extract::{Extension, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use llm::RealtimeSecret;
use matching::{
    BatchFailure, FanOutLimits, LlmRelevanceScorer, LogSink, RelevanceScorer, ResultSink,
    enumerate_pairs, score_batch,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, CreateListingRequest, ListingResponse, PushReceipt, PushRequest};
use pipeline::{Pipeline, PipelineError, PipelineErrorKind};
use pricing::PriceRange;
use security::{AuthContext, AuthState, require_api_auth};
use serde::Deserialize;
use serde_json::json;
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use supabase::{ListingRow, SupabaseClient};
use tokio::sync::Mutex;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "peddler.api", "server crashed: {err}");
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let auth_state = AuthState::from_env();
    let pipeline = Pipeline::from_env();
    let scorer: Arc<dyn RelevanceScorer> = Arc::new(LlmRelevanceScorer::new(pipeline.llm.clone()));
    let sink: Arc<dyn ResultSink> = Arc::new(LogSink);
    let store = pipeline.store().cloned();
    let openapi: serde_json::Value =
        serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
            .unwrap_or(serde_json::json!({"openapi":"3.0.3"}));
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("prom recorder");
    let redis = std::env::var("REDIS_URL")
        .ok()
        .and_then(|u| redis::Client::open(u).ok());
    let state = AppState {
        pipeline,
        scorer,
        sink,
        store,
        limits: FanOutLimits::from_env(),
        openapi: Arc::new(openapi),
        idempotency: Arc::new(Mutex::new(HashMap::new())),
        prometheus_handle,
        redis,
    };

    let app = app(state, auth_state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "peddler.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

fn app(state: AppState, auth_state: AuthState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    // The catalog read sits behind the same key as the write side.
    let protected = Router::new()
        .route("/listings", post(create_listing).get(list_listings))
        .route("/price-range", get(price_range))
        .route("/matching/push", post(push_listings))
        .route("/realtime/session", post(realtime_session))
        .route_layer(middleware::from_fn_with_state(auth_state, require_api_auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .route("/qr", get(qr_svg))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()))
}

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
    scorer: Arc<dyn RelevanceScorer>,
    sink: Arc<dyn ResultSink>,
    store: Option<SupabaseClient>,
    limits: FanOutLimits,
    openapi: Arc<serde_json::Value>,
    idempotency: Arc<Mutex<HashMap<String, ListingResponse>>>,
    prometheus_handle: PrometheusHandle,
    redis: Option<redis::Client>,
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
///
/// Returns a small JSON payload with `status` and `service`.
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "peddler-api-rs",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return Err(AppError::Pipeline(PipelineError::invalid_input(
                "docs",
                "unauthorized",
            )));
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> axum::http::Response<String> {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Peddler API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#;
    axum::http::Response::builder()
        .header("Content-Type", "text/html; charset=utf-8")
        .body(html.to_string())
        .unwrap()
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(8 * 1024 * 1024)
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> axum::http::Response<String> {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return axum::http::Response::builder()
                .status(axum::http::StatusCode::UNAUTHORIZED)
                .body("unauthorized".into())
                .unwrap();
        }
    }
    let body = state.prometheus_handle.render();
    axum::http::Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .unwrap()
}

/// Run the photo → published listing pipeline.
///
/// - Method: `POST`
/// - Path: `/listings`
/// - Auth: `Authorization: Bearer <key>` or `X-Peddler-Key: <key>`
/// - Body: `CreateListingRequest`
/// - Response: `ListingResponse` (listing id, optional payment link, per-stage transcript)
async fn create_listing(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    headers: axum::http::HeaderMap,
    Json(payload): Json<CreateListingRequest>,
) -> Result<Json<ListingResponse>, AppError> {
    crate::metrics::inc_requests("POST /listings");
    info!(
        target = "peddler.api",
        merchant = %context.merchant_id,
        api_key = %context.api_key_id,
        "listing pipeline invoked",
    );

    if let Some(key) = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    {
        if let Some(client) = &state.redis {
            if let Some(existing) = idempotency::redis_get::<ListingResponse>(client, &key).await {
                return Ok(Json(existing));
            }
            let response = state.pipeline.run(payload, Some(context)).await?;
            let ttl = std::env::var("IDEMPOTENCY_TTL_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(3600);
            idempotency::redis_set(client, &key, &response, ttl).await;
            return Ok(Json(response));
        }
        if let Some(existing) = state.idempotency.lock().await.get(&key).cloned() {
            return Ok(Json(existing));
        }
        let response = state.pipeline.run(payload, Some(context)).await?;
        state.idempotency.lock().await.insert(key, response.clone());
        return Ok(Json(response));
    }

    let response = state.pipeline.run(payload, Some(context)).await?;

    Ok(Json(response))
}

async fn list_listings(State(state): State<AppState>) -> Result<Json<Vec<ListingRow>>, AppError> {
    crate::metrics::inc_requests("GET /listings");
    let Some(store) = &state.store else {
        return Ok(Json(Vec::new()));
    };
    let rows = store.list_listings().await.map_err(|err| {
        AppError::Pipeline(PipelineError::internal("fetch_listings", err.to_string()))
    })?;
    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
struct PriceQuery {
    q: String,
}

async fn price_range(
    State(state): State<AppState>,
    Query(query): Query<PriceQuery>,
) -> Result<Json<PriceRange>, AppError> {
    crate::metrics::inc_requests("GET /price-range");
    let q = query.q.trim();
    if q.is_empty() {
        return Err(AppError::Pipeline(PipelineError::invalid_input(
            "price_range",
            "empty query",
        )));
    }
    let range = pricing::suggest_price_range(&state.pipeline.llm, q)
        .await
        .map_err(|err| {
            AppError::Pipeline(PipelineError::internal("price_range", err.to_string()))
        })?;
    Ok(Json(range))
}

#[derive(Debug, Deserialize)]
struct QrQuery {
    link: String,
}

async fn qr_svg(Query(query): Query<QrQuery>) -> Result<axum::http::Response<String>, AppError> {
    crate::metrics::inc_requests("GET /qr");
    let svg = qr::render_svg(&query.link)
        .map_err(|err| AppError::Pipeline(PipelineError::invalid_input("qr", err.to_string())))?;
    Ok(axum::http::Response::builder()
        .header("Content-Type", "image/svg+xml")
        .body(svg)
        .unwrap())
}

/// Score every (listing, buyer) pair for one merchant and notify the sink.
///
/// - Method: `POST`
/// - Path: `/matching/push`
/// - Auth: `Authorization: Bearer <key>` or `X-Peddler-Key: <key>`
/// - Body: `PushRequest` (optional `merchant_id` override)
/// - Response: `PushReceipt` with every scored match in pair order
async fn push_listings(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<PushRequest>,
) -> Result<Json<PushReceipt>, AppError> {
    crate::metrics::inc_requests("POST /matching/push");
    let merchant = payload
        .merchant_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| context.merchant_id.clone());

    let Some(store) = &state.store else {
        return Err(AppError::Pipeline(PipelineError::internal(
            "fetch_listings",
            "supabase is not configured",
        )));
    };

    let started = std::time::Instant::now();
    let listings = store.fetch_listings(&merchant).await.map_err(|err| {
        AppError::Pipeline(PipelineError::internal("fetch_listings", err.to_string()))
    })?;
    let buyers = store.fetch_buyers().await.map_err(|err| {
        AppError::Pipeline(PipelineError::internal("fetch_buyers", err.to_string()))
    })?;

    let pairs = enumerate_pairs(&listings, &buyers);
    let matches = score_batch(state.scorer.as_ref(), &pairs, state.limits).await?;
    state.sink.consume(&matches).await;
    crate::metrics::batch_scored(pairs.len(), started.elapsed().as_millis());

    info!(
        target = "peddler.api",
        merchant = %merchant,
        listings = listings.len(),
        buyers = buyers.len(),
        pairs = pairs.len(),
        "relevance push completed",
    );

    Ok(Json(PushReceipt {
        merchant_id: merchant,
        listings: listings.len(),
        buyers: buyers.len(),
        matches,
    }))
}

async fn realtime_session(State(state): State<AppState>) -> Result<Json<RealtimeSecret>, AppError> {
    crate::metrics::inc_requests("POST /realtime/session");
    let secret = state.pipeline.llm.mint_realtime_secret().await.map_err(|err| {
        AppError::Pipeline(PipelineError::internal("realtime_session", err.to_string()))
    })?;
    Ok(Json(secret))
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
    Batch(BatchFailure),
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl From<BatchFailure> for AppError {
    fn from(value: BatchFailure) -> Self {
        Self::Batch(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.detail().to_string()),
                };
                (status, Json(payload)).into_response()
            }
            AppError::Batch(failure) => {
                warn!(
                    target = "peddler.api",
                    pair_index = failure.pair_index,
                    listing_id = failure.listing_id,
                    buyer_id = failure.buyer_id,
                    error = %failure,
                    "scoring batch aborted",
                );
                let payload = json!({
                    "error": "scoring_batch_failed",
                    "detail": failure.to_string(),
                    "pair_index": failure.pair_index,
                    "listing_id": failure.listing_id,
                    "buyer_id": failure.buyer_id,
                });
                (StatusCode::BAD_GATEWAY, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmClient, LlmConfig};
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt; // for `oneshot`

    fn offline_state() -> AppState {
        let llm = Arc::new(LlmClient::new(LlmConfig {
            base_url: "http://localhost:0".into(),
            api_key: None,
            model: "test-model".into(),
            realtime_model: "test-realtime".into(),
            realtime_voice: "verse".into(),
        }));
        AppState {
            pipeline: Pipeline::new(llm.clone(), None, false),
            scorer: Arc::new(LlmRelevanceScorer::new(llm)),
            sink: Arc::new(LogSink),
            store: None,
            limits: FanOutLimits::default(),
            openapi: Arc::new(json!({"openapi": "3.0.3"})),
            idempotency: Arc::new(Mutex::new(HashMap::new())),
            prometheus_handle: PrometheusBuilder::new().build_recorder().handle(),
            redis: None,
        }
    }

    // Unconfigured env resolves to the demo credentials, so "demo-key" is
    // the one key the router accepts here.
    fn test_app() -> Router {
        app(offline_state(), AuthState::from_env())
    }

    fn request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    #[tokio::test]
    async fn health_is_open() {
        let response = test_app()
            .oneshot(request("GET", "/health"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn catalog_requires_api_key() {
        let response = test_app()
            .oneshot(request("GET", "/listings"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"], "missing_api_key");
    }

    #[tokio::test]
    async fn catalog_accepts_the_demo_key() {
        let keyed = Request::builder()
            .method("GET")
            .uri("/listings")
            .header("X-Peddler-Key", "demo-key")
            .body(Body::empty())
            .unwrap();
        let response = test_app().oneshot(keyed).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!([]));
    }

    #[tokio::test]
    async fn push_without_store_reports_the_fetch_stage() {
        let push = Request::builder()
            .method("POST")
            .uri("/matching/push")
            .header("X-Peddler-Key", "demo-key")
            .header("Content-Type", "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let response = test_app().oneshot(push).await.expect("response");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(response).await["error"], "fetch_listings");
    }
}
