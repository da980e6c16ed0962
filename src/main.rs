mod catalog;
mod config;
mod draft;
mod http;
mod imagegen;
mod metrics;
mod models;
mod proxy;
mod supabase;
mod sync;
mod workflow;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use catalog::{CatalogClient, view::CatalogPage};
use config::AppConfig;
use imagegen::OpenAiImageClient;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::ApiError;
use proxy::HttpImageProxy;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use supabase::SupabaseClient;
use sync::SyncRecorder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use workflow::{
    GenerationSummary, PromotionWorkflow, WorkflowError, WorkflowErrorKind, WorkflowSnapshot,
};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "promo.api", "server crashed: {err:?}");
    }
}

async fn run() -> eyre::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = AppConfig::from_env();
    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;

    let storage = SupabaseClient::new(&config.storage, config.http);
    if !storage.is_configured() {
        warn!(
            target = "promo.api",
            "SUPABASE_URL or service key missing; uploads will fail"
        );
    }
    let storage = Arc::new(storage);
    let workflow = PromotionWorkflow::new(
        Arc::new(CatalogClient::new(&config.catalog_url, config.http)),
        Arc::new(OpenAiImageClient::new(config.image.clone(), config.http)),
        Arc::new(HttpImageProxy::new(&config.proxy_base_url, config.http)),
        storage.clone(),
        SyncRecorder::new(storage, config.storage.collection.clone()),
        config.storage.prefix.clone(),
    )
    .with_page_size(config.page_size);

    if let Err(err) = workflow.refresh_catalog().await {
        warn!(target = "promo.api", error = %err, "initial catalog load failed");
    }

    let state = AppState {
        workflow,
        prometheus_handle: Some(prometheus_handle),
        metrics_key: config.metrics_key.clone(),
    };

    let app = app(
        state,
        http::build_client(config.http),
        config.image_max_bytes,
    )
    .layer(axum::extract::DefaultBodyLimit::max(config.body_limit));

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    info!(target = "promo.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    workflow: PromotionWorkflow,
    prometheus_handle: Option<PrometheusHandle>,
    metrics_key: Option<String>,
}

fn app(state: AppState, proxy_http: reqwest::Client, image_max_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/catalog", get(catalog_page))
        .route("/catalog/refresh", post(catalog_refresh))
        .route("/workflow", get(workflow_snapshot))
        .route("/workflow/open", post(workflow_open))
        .route("/workflow/discount", post(workflow_discount))
        .route("/workflow/generate", post(workflow_generate))
        .route("/workflow/close", post(workflow_close))
        .route("/workflow/confirm", post(workflow_confirm))
        .merge(proxy::router::<AppState>(proxy_http, image_max_bytes))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "promo-studio",
    }))
}

/// Prometheus text exposition.
///
/// - Method: `GET`
/// - Path: `/metrics`
/// - Auth: `X-Metrics-Key: <key>` when `METRICS_KEY` is set
async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Response {
    if let Some(secret) = &state.metrics_key {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    let body = state
        .prometheus_handle
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default();
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        body,
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct CatalogQuery {
    #[serde(default)]
    search: String,
    #[serde(default)]
    page: usize,
}

/// One page of the filtered catalog. Stays available during a generation run.
///
/// - Method: `GET`
/// - Path: `/catalog?search=<term>&page=<n>`
/// - Auth: none
/// - Response: `CatalogPage`
async fn catalog_page(
    State(state): State<AppState>,
    Query(query): Query<CatalogQuery>,
) -> Json<CatalogPage> {
    crate::metrics::inc_requests("/catalog");
    Json(state.workflow.view(&query.search, query.page))
}

/// Re-fetch promotable products. A failure keeps the previous catalog.
///
/// - Method: `POST`
/// - Path: `/catalog/refresh`
/// - Auth: none
/// - Response: `{count}`; 503 `catalog_unavailable` on failure
async fn catalog_refresh(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/catalog/refresh");
    let count = state.workflow.refresh_catalog().await?;
    Ok(Json(json!({ "count": count })))
}

/// Workflow state and the notifications queued since the last call.
///
/// - Method: `GET`
/// - Path: `/workflow`
/// - Auth: none
/// - Response: `WorkflowSnapshot`
async fn workflow_snapshot(State(state): State<AppState>) -> Json<WorkflowSnapshot> {
    Json(state.workflow.snapshot())
}

#[derive(Debug, Deserialize)]
struct OpenRequest {
    #[serde(default)]
    product_id: Option<String>,
    #[serde(default)]
    all: bool,
    #[serde(default)]
    search: String,
    #[serde(default)]
    page: usize,
}

/// Open the promotion dialog for one product or for the displayed page.
///
/// - Method: `POST`
/// - Path: `/workflow/open`
/// - Auth: none
/// - Body: `{product_id}` or `{all: true, search, page}`
/// - Response: `WorkflowSnapshot`
async fn workflow_open(
    State(state): State<AppState>,
    Json(req): Json<OpenRequest>,
) -> Result<Json<WorkflowSnapshot>, AppError> {
    crate::metrics::inc_requests("/workflow/open");
    match (req.all, req.product_id.as_deref()) {
        (true, _) => state.workflow.open_displayed(&req.search, req.page)?,
        (false, Some(id)) => state.workflow.open_product(id)?,
        (false, None) => return Err(AppError::BadRequest("product_id or all is required")),
    }
    Ok(Json(state.workflow.snapshot()))
}

#[derive(Debug, Deserialize)]
struct DiscountRequest {
    discount: String,
}

/// - Method: `POST`
/// - Path: `/workflow/discount`
/// - Auth: none
/// - Body: `{discount}`
async fn workflow_discount(
    State(state): State<AppState>,
    Json(req): Json<DiscountRequest>,
) -> Result<Json<WorkflowSnapshot>, AppError> {
    crate::metrics::inc_requests("/workflow/discount");
    state.workflow.set_discount(req.discount)?;
    Ok(Json(state.workflow.snapshot()))
}

/// Run the prompt → image → proxy → upload pipeline for the open draft.
///
/// - Method: `POST`
/// - Path: `/workflow/generate`
/// - Auth: none
/// - Response: `GenerationSummary` (records awaiting confirmation + per-item failures)
///
/// The run continues if the client disconnects; `GET /workflow` reports its
/// outcome. A second call while a run is in progress gets 409 `busy`.
async fn workflow_generate(
    State(state): State<AppState>,
) -> Result<Json<GenerationSummary>, AppError> {
    crate::metrics::inc_requests("/workflow/generate");
    let summary = state.workflow.generate().await?;
    Ok(Json(summary))
}

/// Close the dialog or discard banners awaiting confirmation. Idempotent.
///
/// - Method: `POST`
/// - Path: `/workflow/close`
/// - Auth: none
async fn workflow_close(State(state): State<AppState>) -> Json<WorkflowSnapshot> {
    crate::metrics::inc_requests("/workflow/close");
    state.workflow.close();
    Json(state.workflow.snapshot())
}

#[derive(Debug, Serialize)]
struct ConfirmResponse {
    synced: usize,
    persisted: usize,
}

/// Record confirmed banners in the metadata store.
///
/// - Method: `POST`
/// - Path: `/workflow/confirm`
/// - Auth: none
/// - Response: `{synced, persisted}`
async fn workflow_confirm(
    State(state): State<AppState>,
) -> Result<Json<ConfirmResponse>, AppError> {
    crate::metrics::inc_requests("/workflow/confirm");
    let outcomes = state.workflow.confirm().await?;
    for outcome in outcomes.iter().filter(|o| !o.persisted) {
        warn!(
            target = "promo.api",
            product_id = %outcome.document.product_id,
            "sync reported to operator but not persisted"
        );
    }
    Ok(Json(ConfirmResponse {
        synced: outcomes.len(),
        persisted: outcomes.iter().filter(|o| o.persisted).count(),
    }))
}

#[derive(Debug)]
enum AppError {
    Workflow(WorkflowError),
    BadRequest(&'static str),
}

impl From<WorkflowError> for AppError {
    fn from(value: WorkflowError) -> Self {
        Self::Workflow(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Workflow(err) => {
                let status = match err.kind() {
                    WorkflowErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    WorkflowErrorKind::Conflict => StatusCode::CONFLICT,
                    WorkflowErrorKind::Upstream => StatusCode::BAD_GATEWAY,
                    WorkflowErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
                };
                let payload = ApiError {
                    error: err.code().to_string(),
                    detail: Some(err.to_string()),
                };
                (status, Json(payload)).into_response()
            }
            AppError::BadRequest(detail) => {
                let payload = ApiError {
                    error: "invalid_request".into(),
                    detail: Some(detail.to_string()),
                };
                (StatusCode::BAD_REQUEST, Json(payload)).into_response()
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
    use crate::catalog::tests::product;
    use crate::workflow::tests::{HarnessBuilder, StubGenerator, eventually, wait_for_state};
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::OnceLock;
    use std::sync::atomic::Ordering;
    use tokio::sync::Notify;
    use tower::ServiceExt;

    fn router_for(workflow: PromotionWorkflow) -> Router {
        let state = AppState {
            workflow,
            prometheus_handle: None,
            metrics_key: None,
        };
        app(state, reqwest::Client::new(), 1024 * 1024)
    }

    // The recorder is process-global, so every test shares one.
    fn prometheus() -> PrometheusHandle {
        static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
        HANDLE
            .get_or_init(|| {
                PrometheusBuilder::new()
                    .install_recorder()
                    .expect("install recorder")
            })
            .clone()
    }

    async fn raw(
        router: &Router,
        request: Request<Body>,
    ) -> (StatusCode, String) {
        let resp = router.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn api(
        router: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        let body = match body {
            Some(v) => Body::from(serde_json::to_string(&v).unwrap()),
            None => Body::empty(),
        };
        let (status, text) = raw(router, builder.body(body).unwrap()).await;
        let json = serde_json::from_str(&text).unwrap_or(serde_json::json!(null));
        (status, json)
    }
    #[tokio::test]
    async fn health_reports_service() {
        let h = HarnessBuilder::new().build();
        let router = router_for(h.workflow);
        let (status, body) = api(&router, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["service"], "promo-studio");
    }

    #[tokio::test]
    async fn full_flow_over_http() {
        let h = HarnessBuilder::new().build();
        h.workflow.refresh_catalog().await.expect("catalog");
        let metadata = h.metadata.clone();
        let router = router_for(h.workflow);

        let (status, page) = api(&router, "GET", "/catalog?search=wid&page=0", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["total"], 1);
        assert_eq!(page["products"][0]["product_Brand"], "Acme");

        let (status, snapshot) =
            api(&router, "POST", "/workflow/open", Some(json!({"product_id": "P1"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(snapshot["state"], "drafting");
        assert_eq!(snapshot["dialog_open"], true);

        let (status, _) =
            api(&router, "POST", "/workflow/discount", Some(json!({"discount": "20"}))).await;
        assert_eq!(status, StatusCode::OK);

        let (status, summary) = api(&router, "POST", "/workflow/generate", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            summary["records"][0]["stored_image_url"],
            "https://blob/promotions/P1_Widget_169999.png"
        );

        let (status, confirm) = api(&router, "POST", "/workflow/confirm", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(confirm["synced"], 1);
        assert_eq!(confirm["persisted"], 1);
        assert_eq!(metadata.writes().len(), 1);

        let (_, snapshot) = api(&router, "GET", "/workflow", None).await;
        assert_eq!(snapshot["state"], "idle");
        assert_eq!(snapshot["notifications"][0]["level"], "success");
    }

    #[tokio::test]
    async fn provider_failure_maps_to_bad_gateway() {
        let h = HarnessBuilder::new()
            .generator(StubGenerator::failing_on(""))
            .build();
        h.workflow.refresh_catalog().await.expect("catalog");
        let router = router_for(h.workflow);

        api(&router, "POST", "/workflow/open", Some(json!({"product_id": "P1"}))).await;
        api(&router, "POST", "/workflow/discount", Some(json!({"discount": "5"}))).await;
        let (status, body) = api(&router, "POST", "/workflow/generate", None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"], "generation_failed");

        let (_, snapshot) = api(&router, "GET", "/workflow", None).await;
        assert_eq!(snapshot["state"], "idle");
        assert_eq!(snapshot["notifications"][0]["message"], "Failed to generate image.");
    }

    #[tokio::test]
    async fn open_requires_a_target() {
        let h = HarnessBuilder::new()
            .products(Ok(vec![product("P1", "Widget")]))
            .build();
        let router = router_for(h.workflow);
        let (status, body) = api(&router, "POST", "/workflow/open", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_request");

        let (status, body) =
            api(&router, "POST", "/workflow/open", Some(json!({"product_id": "nope"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "product_not_found");
    }

    #[tokio::test]
    async fn search_stays_available_while_generating() {
        let gate = Arc::new(Notify::new());
        let h = HarnessBuilder::new()
            .generator(StubGenerator::gated(gate.clone()))
            .build();
        h.workflow.refresh_catalog().await.expect("catalog");
        let workflow = h.workflow.clone();
        let router = router_for(h.workflow);

        api(&router, "POST", "/workflow/open", Some(json!({"product_id": "P1"}))).await;
        api(&router, "POST", "/workflow/discount", Some(json!({"discount": "20"}))).await;
        let running = tokio::spawn({
            let router = router.clone();
            async move { api(&router, "POST", "/workflow/generate", None).await }
        });
        wait_for_state(&workflow, "generating").await;

        let (status, snapshot) = api(&router, "GET", "/workflow", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(snapshot["state"], "generating");
        assert_eq!(snapshot["loading"], true);

        let (status, page) = api(&router, "GET", "/catalog?search=wid", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["total"], 1);

        let (status, body) = api(&router, "POST", "/workflow/generate", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "busy");
        let (status, _) =
            api(&router, "POST", "/workflow/open", Some(json!({"product_id": "P1"}))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        gate.notify_one();
        let (status, summary) = running.await.expect("join");
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["records"].as_array().map(Vec::len), Some(1));
        let (_, snapshot) = api(&router, "GET", "/workflow", None).await;
        assert_eq!(snapshot["state"], "awaiting_confirmation");
        assert_eq!(snapshot["loading"], false);
    }

    #[tokio::test]
    async fn refresh_in_flight_is_not_reported_as_generating() {
        let gate = Arc::new(Notify::new());
        let h = HarnessBuilder::new().catalog_gate(gate.clone()).build();
        let catalog = h.catalog.clone();
        let router = router_for(h.workflow);

        let refreshing = tokio::spawn({
            let router = router.clone();
            async move { api(&router, "POST", "/catalog/refresh", None).await }
        });
        eventually("catalog fetch", || catalog.calls.load(Ordering::SeqCst) == 1).await;

        let (status, snapshot) = api(&router, "GET", "/workflow", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(snapshot["state"], "idle");
        assert_eq!(snapshot["loading"], false);
        let (status, _) = api(&router, "GET", "/catalog", None).await;
        assert_eq!(status, StatusCode::OK);

        gate.notify_one();
        let (status, body) = refreshing.await.expect("join");
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
    }

    #[tokio::test]
    async fn metrics_render_request_counters() {
        let h = HarnessBuilder::new().build();
        h.workflow.refresh_catalog().await.expect("catalog");
        let state = AppState {
            workflow: h.workflow,
            prometheus_handle: Some(prometheus()),
            metrics_key: Some("scrape-secret".into()),
        };
        let router = app(state, reqwest::Client::new(), 1024);

        let (status, _) = api(&router, "GET", "/catalog?search=wid", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = raw(
            &router,
            Request::builder().uri("/metrics").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, text) = raw(
            &router,
            Request::builder()
                .uri("/metrics")
                .header("X-Metrics-Key", "scrape-secret")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("promo_requests_total{route=\"/catalog\"}"));
    }

    #[tokio::test]
    async fn catalog_refresh_failure_is_service_unavailable() {
        let h = HarnessBuilder::new()
            .products(Err(crate::catalog::CatalogError::Request("HTTP 503".into())))
            .build();
        let router = router_for(h.workflow);
        let (status, body) = api(&router, "POST", "/catalog/refresh", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "catalog_unavailable");

        let (status, page) = api(&router, "GET", "/catalog", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["total"], 0);
    }
}
