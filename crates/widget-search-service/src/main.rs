use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use widget_search_api::{
    FilterSearchRequest, PriceRangeSearchRequest, SearchRequest, WidgetSearchApi,
    API_CONTRACT_VERSION,
};
use widget_search_core::{FilterError, FilterPolicy, Widget};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: WidgetSearchApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Search failures never carry a body, so callers learn nothing about why a filter was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SearchRejection {
    BadRequest,
    Internal,
}

#[derive(Debug, Parser)]
#[command(name = "widget-search-service")]
#[command(about = "HTTP service demonstrating expression injection in widget search filters")]
struct Args {
    #[arg(long, default_value = "./widgets.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// Insert the demo catalogue when the database holds no widgets.
    #[arg(long, default_value_t = false)]
    seed_fixtures: bool,
}

impl IntoResponse for SearchRejection {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest => StatusCode::BAD_REQUEST.into_response(),
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        }
    }
}

impl From<anyhow::Error> for SearchRejection {
    fn from(err: anyhow::Error) -> Self {
        if err.downcast_ref::<FilterError>().is_some() {
            Self::BadRequest
        } else {
            tracing::error!("widget search failed: {err:#}");
            Self::Internal
        }
    }
}

impl From<QueryRejection> for SearchRejection {
    fn from(rejection: QueryRejection) -> Self {
        tracing::debug!("rejected query string: {rejection}");
        Self::BadRequest
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/widget/search", get(search))
        .route("/widget/unsafe-search", get(unsafe_search))
        .route("/widget/safer-search", get(safer_search))
        .route("/widget/safest-search", get(safest_search))
        .route("/widget/impermeable-search", get(impermeable_search))
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let api = WidgetSearchApi::new(args.db.clone())?;

    let migration = api.migrate(false)?;
    tracing::info!(
        db = %args.db.display(),
        schema_version = ?migration.after_version,
        "widget store ready"
    );
    if args.seed_fixtures {
        let summary = api.seed_fixtures()?;
        tracing::info!(
            inserted = summary.inserted,
            skipped = summary.skipped_existing_catalogue,
            "seeded demo catalogue"
        );
    }
    tracing::warn!(
        "/widget/unsafe-search evaluates filters with full capability, including process execution"
    );

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "listening");
    axum::serve(listener, app(ServiceState { api })).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

/// Run a search on the blocking pool. Lookups hit SQLite and `unsafe` filters may spawn processes.
async fn run_blocking<F>(search: F) -> Result<Json<Vec<Widget>>, SearchRejection>
where
    F: FnOnce() -> Result<Vec<Widget>> + Send + 'static,
{
    match tokio::task::spawn_blocking(search).await {
        Ok(result) => Ok(Json(result?)),
        Err(err) => {
            tracing::error!("widget search task failed: {err}");
            Err(SearchRejection::Internal)
        }
    }
}

async fn search(
    State(state): State<ServiceState>,
    query: Result<Query<SearchRequest>, QueryRejection>,
) -> Result<Json<Vec<Widget>>, SearchRejection> {
    let Query(request) = query?;
    run_blocking(move || state.api.search(&request)).await
}

async fn run_filtered(
    state: ServiceState,
    policy: FilterPolicy,
    query: Result<Query<FilterSearchRequest>, QueryRejection>,
) -> Result<Json<Vec<Widget>>, SearchRejection> {
    let Query(request) = query?;
    run_blocking(move || state.api.filtered_search(policy, &request)).await
}

async fn unsafe_search(
    State(state): State<ServiceState>,
    query: Result<Query<FilterSearchRequest>, QueryRejection>,
) -> Result<Json<Vec<Widget>>, SearchRejection> {
    run_filtered(state, FilterPolicy::Unsafe, query).await
}

async fn safer_search(
    State(state): State<ServiceState>,
    query: Result<Query<FilterSearchRequest>, QueryRejection>,
) -> Result<Json<Vec<Widget>>, SearchRejection> {
    run_filtered(state, FilterPolicy::Safer, query).await
}

async fn safest_search(
    State(state): State<ServiceState>,
    query: Result<Query<FilterSearchRequest>, QueryRejection>,
) -> Result<Json<Vec<Widget>>, SearchRejection> {
    run_filtered(state, FilterPolicy::Safest, query).await
}

async fn impermeable_search(
    State(state): State<ServiceState>,
    query: Result<Query<PriceRangeSearchRequest>, QueryRejection>,
) -> Result<Json<Vec<Widget>>, SearchRejection> {
    let Query(request) = query?;
    run_blocking(move || state.api.impermeable_search(&request)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use axum::body::to_bytes;
    use http::Request;
    use tower::ServiceExt;

    const BENIGN: &str = "price gt 0";
    const BOUNDARY_ESCAPE: &str = "true)] != null ? #this : #this.?[(true";
    const PROCESS_EXECUTION: &str =
        "price gt 0 and T(Runtime).getRuntime().exec(\"pwd\").waitFor() == 0";

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("widget-search-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn seeded_router() -> (Router, PathBuf) {
        let db_path = unique_temp_db_path();
        let api = WidgetSearchApi::new(db_path.clone())
            .unwrap_or_else(|err| panic!("failed to build api: {err}"));
        api.seed_fixtures().unwrap_or_else(|err| panic!("failed to seed fixtures: {err}"));
        (app(ServiceState { api }), db_path)
    }

    fn encode(value: &str) -> String {
        value
            .bytes()
            .map(|byte| {
                if byte.is_ascii_alphanumeric() || b"-_.~".contains(&byte) {
                    char::from(byte).to_string()
                } else {
                    format!("%{byte:02X}")
                }
            })
            .collect()
    }

    fn uri(path: &str, params: &[(&str, &str)]) -> String {
        let query = params
            .iter()
            .map(|(key, value)| format!("{key}={}", encode(value)))
            .collect::<Vec<_>>()
            .join("&");
        format!("{path}?{query}")
    }

    async fn get_response(router: &Router, uri: &str) -> Response {
        match router
            .clone()
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    async fn response_body(response: Response) -> String {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        }
    }

    async fn widget_names(response: Response) -> Vec<String> {
        let body = response_body(response).await;
        let value: serde_json::Value = match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        };
        value
            .as_array()
            .unwrap_or_else(|| panic!("expected a JSON array: {body}"))
            .iter()
            .map(|widget| {
                widget
                    .get("name")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_else(|| panic!("widget without a name: {widget}"))
                    .to_string()
            })
            .collect()
    }

    async fn filter_status(router: &Router, endpoint: &str, filter: &str) -> StatusCode {
        let uri = uri(endpoint, &[("term", "Widget"), ("filter", filter)]);
        get_response(router, &uri).await.status()
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let (router, db_path) = seeded_router();

        let response = get_response(&router, "/v1/health").await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = response_body(response).await;
        let value: serde_json::Value = serde_json::from_str(&body)
            .unwrap_or_else(|err| panic!("health body is not JSON: {err}"));
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn openapi_endpoint_lists_every_search_route() {
        let (router, db_path) = seeded_router();

        let response = get_response(&router, "/v1/openapi").await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = response_body(response).await;
        assert!(body.contains("openapi: 3.1.0"));
        for path in [
            "/widget/search",
            "/widget/unsafe-search",
            "/widget/safer-search",
            "/widget/safest-search",
            "/widget/impermeable-search",
        ] {
            assert!(body.contains(path), "openapi is missing {path}");
        }

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn plain_search_returns_name_matches_as_json_array() {
        let (router, db_path) = seeded_router();

        let response = get_response(&router, &uri("/widget/search", &[("term", "Widget")])).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            widget_names(response).await,
            vec!["Blue Widget", "Red Widget", "Green Widget", "Widget Deluxe"]
        );

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn unsafe_search_executes_everything_it_is_given() {
        let (router, db_path) = seeded_router();

        assert_eq!(filter_status(&router, "/widget/unsafe-search", BENIGN).await, StatusCode::OK);
        assert_eq!(
            filter_status(&router, "/widget/unsafe-search", BOUNDARY_ESCAPE).await,
            StatusCode::OK
        );
        assert_eq!(
            filter_status(&router, "/widget/unsafe-search", PROCESS_EXECUTION).await,
            StatusCode::OK
        );

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn safer_search_blocks_process_execution_but_not_boundary_escape() {
        let (router, db_path) = seeded_router();

        assert_eq!(filter_status(&router, "/widget/safer-search", BENIGN).await, StatusCode::OK);
        assert_eq!(
            filter_status(&router, "/widget/safer-search", BOUNDARY_ESCAPE).await,
            StatusCode::OK
        );
        assert_eq!(
            filter_status(&router, "/widget/safer-search", PROCESS_EXECUTION).await,
            StatusCode::BAD_REQUEST
        );

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-005
    #[tokio::test]
    async fn safest_search_guards_its_query_boundary() {
        let (router, db_path) = seeded_router();

        assert_eq!(filter_status(&router, "/widget/safest-search", BENIGN).await, StatusCode::OK);
        assert_eq!(
            filter_status(&router, "/widget/safest-search", BOUNDARY_ESCAPE).await,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            filter_status(&router, "/widget/safest-search", PROCESS_EXECUTION).await,
            StatusCode::BAD_REQUEST
        );

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-006
    #[tokio::test]
    async fn impermeable_search_accepts_only_numeric_bounds() {
        let (router, db_path) = seeded_router();

        let injected = uri(
            "/widget/impermeable-search",
            &[
                ("term", "Widget"),
                ("min-price", PROCESS_EXECUTION),
                ("max-price", PROCESS_EXECUTION),
            ],
        );
        assert_eq!(get_response(&router, &injected).await.status(), StatusCode::BAD_REQUEST);

        let numeric = uri(
            "/widget/impermeable-search",
            &[("term", "Widget"), ("min-price", "5"), ("max-price", "20")],
        );
        let response = get_response(&router, &numeric).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(widget_names(response).await, vec!["Blue Widget", "Red Widget"]);

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn escaped_boundary_leaks_disabled_widgets_through_safer_search() {
        let (router, db_path) = seeded_router();

        let benign = get_response(
            &router,
            &uri("/widget/safer-search", &[("term", "Widget"), ("filter", BENIGN)]),
        )
        .await;
        assert!(!widget_names(benign).await.contains(&"Green Widget".to_string()));

        let escaped = get_response(
            &router,
            &uri("/widget/safer-search", &[("term", "Widget"), ("filter", BOUNDARY_ESCAPE)]),
        )
        .await;
        assert!(widget_names(escaped).await.contains(&"Green Widget".to_string()));

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn rejections_have_empty_bodies() {
        let (router, db_path) = seeded_router();

        for uri in [
            uri("/widget/safer-search", &[("term", "Widget"), ("filter", PROCESS_EXECUTION)]),
            uri("/widget/safest-search", &[("term", "Widget"), ("filter", BOUNDARY_ESCAPE)]),
            uri("/widget/unsafe-search", &[("term", "Widget"), ("filter", "price gt")]),
            uri("/widget/safer-search", &[("term", "Widget")]),
            uri("/widget/impermeable-search", &[("term", "Widget"), ("min-price", "5")]),
        ] {
            let response = get_response(&router, &uri).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
            assert!(response_body(response).await.is_empty(), "{uri} leaked a body");
        }

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn deeply_chained_filters_are_rejected_without_crashing() {
        let (router, db_path) = seeded_router();
        let and_chain = format!("price gt 0{}", " and price gt 0".repeat(2000));
        let member_chain = format!("name{}", ".a".repeat(5000));

        for endpoint in ["/widget/safest-search", "/widget/safer-search", "/widget/unsafe-search"] {
            for filter in [&and_chain, &member_chain] {
                let uri = uri(endpoint, &[("term", "Widget"), ("filter", filter.as_str())]);
                let response = get_response(&router, &uri).await;
                assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{endpoint}");
                assert!(response_body(response).await.is_empty());
            }
        }

        let health = get_response(&router, "/v1/health").await;
        assert_eq!(health.status(), StatusCode::OK);

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn slow_filters_do_not_stall_other_requests() {
        let (router, db_path) = seeded_router();
        let slow = uri(
            "/widget/unsafe-search",
            &[
                ("term", "Deluxe"),
                ("filter", "T(Runtime).getRuntime().exec('sleep 2').waitFor() == 0"),
            ],
        );

        let started = Instant::now();
        let slow_router = router.clone();
        let pending =
            tokio::spawn(async move { get_response(&slow_router, &slow).await.status() });
        tokio::task::yield_now().await;

        let health = get_response(&router, "/v1/health").await;
        assert_eq!(health.status(), StatusCode::OK);
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "health check waited on the slow filter"
        );

        let status = pending.await.unwrap_or_else(|err| panic!("slow search task failed: {err}"));
        assert_eq!(status, StatusCode::OK);

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn repeated_requests_are_idempotent() {
        let (router, db_path) = seeded_router();
        let uri = uri("/widget/safest-search", &[("term", "Widget"), ("filter", "price lt 20")]);

        let first = get_response(&router, &uri).await;
        let second = get_response(&router, &uri).await;
        assert_eq!(first.status(), second.status());
        assert_eq!(response_body(first).await, response_body(second).await);

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn storage_failures_map_to_internal_errors() {
        let storage = anyhow::anyhow!("disk I/O error");
        let filter = anyhow::Error::from(FilterError::Validation("bad".to_string()));

        assert_eq!(SearchRejection::from(storage), SearchRejection::Internal);
        assert_eq!(SearchRejection::from(filter), SearchRejection::BadRequest);
    }
}
