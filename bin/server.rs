// Spend Graph - Web Server
// REST API with Axum over a single shared SQLite connection

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use clap::Parser;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use spend_graph::aggregator::{run_spend_report, SpendOrder, SpendQuery, SpendReport, TimeWindow};
use spend_graph::db::{get_events_for_entity, open_database, record_profile, record_purchase, record_store};
use spend_graph::logging::init_tracing;
use spend_graph::{parse_when, Config, Event, GraphError, Profile, Purchase, Store};

#[derive(Parser, Debug)]
#[command(author, version, about = "Spend graph HTTP API")]
struct Args {
    /// Database file (overrides SPEND_GRAPH_DB)
    #[arg(long)]
    db: Option<PathBuf>,
    /// Listen address (overrides SPEND_GRAPH_ADDR)
    #[arg(long)]
    listen: Option<SocketAddr>,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
}

impl AppState {
    fn new(conn: Connection) -> Self {
        Self {
            db: Arc::new(Mutex::new(conn)),
        }
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|poisoned| {
            warn!("database mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<()> {
    fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

fn bad_request(message: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, Json(ApiResponse::<()>::err(message))).into_response()
}

fn status_for(err: &GraphError) -> StatusCode {
    match err {
        GraphError::MissingEndpoint { .. } => StatusCode::NOT_FOUND,
        GraphError::DuplicateEntity { .. } => StatusCode::CONFLICT,
        GraphError::InvalidAmount { .. } | GraphError::InvalidId { .. } => StatusCode::BAD_REQUEST,
        GraphError::Connectivity { .. } | GraphError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        GraphError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn respond<T: Serialize>(result: Result<T, GraphError>, ok_status: StatusCode) -> Response {
    match result {
        Ok(data) => (ok_status, Json(ApiResponse::ok(data))).into_response(),
        Err(e) => {
            let status = status_for(&e);
            if status.is_server_error() {
                error!(error = %e, "request failed");
            }
            (status, Json(ApiResponse::<()>::err(e.to_string()))).into_response()
        }
    }
}

// ============================================================================
// Request bodies
// ============================================================================

#[derive(Deserialize)]
struct CreateProfileRequest {
    id: String,
    country: String,
}

#[derive(Deserialize)]
struct CreateStoreRequest {
    id: String,
}

#[derive(Deserialize)]
struct CreatePurchaseRequest {
    profile_id: String,
    store_id: String,
    when: String,
    amount: f64,
}

#[derive(Deserialize)]
struct SpendersParams {
    from: String,
    to: String,
    country: String,
    threshold: f64,
    order: Option<String>,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// POST /api/profiles
async fn create_profile(
    State(state): State<AppState>,
    Json(body): Json<CreateProfileRequest>,
) -> Response {
    let conn = state.conn();
    let result: Result<Profile, GraphError> = record_profile(&conn, &body.id, &body.country);
    respond(result, StatusCode::CREATED)
}

/// POST /api/stores
async fn create_store(
    State(state): State<AppState>,
    Json(body): Json<CreateStoreRequest>,
) -> Response {
    let conn = state.conn();
    let result: Result<Store, GraphError> = record_store(&conn, &body.id);
    respond(result, StatusCode::CREATED)
}

/// POST /api/purchases
async fn create_purchase(
    State(state): State<AppState>,
    Json(body): Json<CreatePurchaseRequest>,
) -> Response {
    let Some(when) = parse_when(&body.when) else {
        return bad_request(format!("invalid timestamp: {}", body.when));
    };

    let conn = state.conn();
    let result: Result<Purchase, GraphError> =
        record_purchase(&conn, &body.profile_id, &body.store_id, when, body.amount);
    respond(result, StatusCode::CREATED)
}

/// GET /api/stores/:id/spenders - Profiles above a spend threshold in a window
async fn get_spenders(
    State(state): State<AppState>,
    Path(store_id): Path<String>,
    Query(params): Query<SpendersParams>,
) -> Response {
    let (Some(start), Some(end)) = (parse_when(&params.from), parse_when(&params.to)) else {
        return bad_request("from/to must be RFC 3339 or YYYY-MM-DDTHH:MM[:SS]");
    };

    let order = match params.order.as_deref() {
        None => SpendOrder::Unspecified,
        Some(value) => match SpendOrder::parse(value) {
            Some(order) => order,
            None => return bad_request(format!("unknown order: {}", value)),
        },
    };

    let query = SpendQuery::new(store_id, TimeWindow::new(start, end), params.country, params.threshold)
        .ordered_by(order);

    let conn = state.conn();
    let result: Result<SpendReport, GraphError> = run_spend_report(&conn, &query);
    respond(result, StatusCode::OK)
}

/// GET /api/events/:entity_type/:entity_id - Audit trail for one entity
async fn get_events(
    State(state): State<AppState>,
    Path((entity_type, entity_id)): Path<(String, String)>,
) -> Response {
    let conn = state.conn();
    let result: Result<Vec<Event>, GraphError> = get_events_for_entity(&conn, &entity_type, &entity_id);
    respond(result, StatusCode::OK)
}

fn app(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/profiles", post(create_profile))
        .route("/stores", post(create_store))
        .route("/purchases", post(create_purchase))
        .route("/stores/:id/spenders", get(get_spenders))
        .route("/events/:entity_type/:entity_id", get(get_events))
        .with_state(state);

    Router::new().nest("/api", api_routes).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    )
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
    }
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = Config::from_env()?;
    init_tracing(&config.log_filter);

    if let Some(db) = args.db {
        config.database_path = db;
    }
    if let Some(listen) = args.listen {
        config.bind_addr = listen;
    }

    let conn = open_database(&config.database_path)
        .with_context(|| format!("Failed to open {}", config.database_path.display()))?;
    info!(path = %config.database_path.display(), "database opened");

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, "server running, API under /api");

    axum::serve(listener, app(AppState::new(conn)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use spend_graph::db::open_in_memory;
    use spend_graph::scenario::seed_reference_scenario;
    use tower::ServiceExt;

    fn seeded_app() -> Router {
        let conn = open_in_memory().unwrap();
        seed_reference_scenario(&conn).unwrap();
        app(AppState::new(conn))
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_spenders_reference_scenario() {
        let uri = "/api/stores/store1/spenders?from=2021-02-01T10:41:00Z&to=2021-06-01T10:40:00Z&country=il&threshold=2000";
        let (status, body) = send(seeded_app(), Request::get(uri).body(Body::empty()).unwrap()).await;

        assert_eq!(status, StatusCode::OK);
        let results = body["data"]["results"].as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["profile"]["id"], "profile4");
        assert_eq!(results[0]["total_spent"], 2000.63);
    }

    #[tokio::test]
    async fn test_purchase_with_missing_store_is_404() {
        let request = post_json(
            "/api/purchases",
            serde_json::json!({
                "profile_id": "profile1",
                "store_id": "store9",
                "when": "2021-05-20T10:40:00Z",
                "amount": 10.0
            }),
        );
        let (status, body) = send(seeded_app(), request).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "store not found: store9");
    }

    #[tokio::test]
    async fn test_duplicate_profile_is_conflict() {
        let request = post_json(
            "/api/profiles",
            serde_json::json!({ "id": "profile1", "country": "us" }),
        );
        let (status, _) = send(seeded_app(), request).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_bad_window_timestamp_is_400() {
        let uri = "/api/stores/store1/spenders?from=yesterday&to=2021-06-01&country=il&threshold=0";
        let (status, body) = send(seeded_app(), Request::get(uri).body(Body::empty()).unwrap()).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }
}
