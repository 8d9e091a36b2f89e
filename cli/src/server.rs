use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, patch},
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};

use nibble_core::error::StoreError;
use nibble_core::models::{ChangesPage, Entry, EntryId, EntryPatch, NewEntry, UserId};
use nibble_core::sqlite_store::SqliteStore;
use nibble_core::store::{DateRange, EntryQuery};

const BODY_LIMIT: usize = 1024 * 1024; // 1 MB
const DEFAULT_PAGE: u32 = 200;
const MAX_PAGE: u32 = 1000;

#[derive(Clone)]
struct AppState {
    store: Arc<SqliteStore>,
    api_key: Option<String>,
}

// --- Request / Response types ---

#[derive(Deserialize)]
struct UserQuery {
    user: String,
}

#[derive(Deserialize)]
struct EntriesQuery {
    user: String,
    start: NaiveDate,
    end: Option<NaiveDate>,
}

#[derive(Deserialize)]
struct ChangesQuery {
    user: String,
    since: Option<i64>,
    limit: Option<u32>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    seq: i64,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn user_id(raw: &str) -> Result<UserId, ApiError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ApiError::BadRequest("user must not be empty".to_string()));
    }
    Ok(UserId::new(raw))
}

// --- Error handling ---

enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Internal(err) => {
                error!("internal server error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => Self::NotFound(format!("Entry {msg} not found")),
            StoreError::Rejected(msg) => Self::BadRequest(msg),
            other => Self::Internal(anyhow::Error::new(other)),
        }
    }
}

// --- Middleware ---

async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(ref expected_key) = state.api_key {
        let authorized = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token == expected_key);

        if !authorized {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "Invalid or missing API key".to_string(),
                }),
            )
                .into_response();
        }
    }
    next.run(request).await
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// --- Handlers ---

async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let seq = state.store.latest_seq()?;
    Ok(Json(HealthResponse { status: "ok", seq }))
}

async fn list_entries(
    State(state): State<AppState>,
    Query(params): Query<EntriesQuery>,
) -> Result<Json<Vec<Entry>>, ApiError> {
    let end = params.end.unwrap_or(params.start);
    if end < params.start {
        return Err(ApiError::BadRequest(
            "end must not be before start".to_string(),
        ));
    }
    let query = EntryQuery {
        user_id: user_id(&params.user)?,
        range: DateRange {
            start: params.start,
            end,
        },
    };
    Ok(Json(state.store.fetch_entries(&query)?))
}

async fn create_entry(
    State(state): State<AppState>,
    Query(params): Query<UserQuery>,
    Json(req): Json<NewEntry>,
) -> Result<(StatusCode, Json<Entry>), ApiError> {
    let user = user_id(&params.user)?;
    let entry = state.store.insert_entry(&user, &req)?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn update_entry(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<UserQuery>,
    Json(req): Json<EntryPatch>,
) -> Result<Json<Entry>, ApiError> {
    if req.is_empty() {
        return Err(ApiError::BadRequest(
            "At least one field must be provided".to_string(),
        ));
    }
    let user = user_id(&params.user)?;
    let entry = state.store.update_entry(&user, &EntryId::new(id), &req)?;
    Ok(Json(entry))
}

async fn delete_entry(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<UserQuery>,
) -> Result<StatusCode, ApiError> {
    let user = user_id(&params.user)?;
    state.store.delete_entry(&user, &EntryId::new(id))?;
    Ok(StatusCode::NO_CONTENT)
}

/// Change log page after `since`. Without `since`, returns only the current
/// cursor so a new subscriber starts from "now".
async fn list_changes(
    State(state): State<AppState>,
    Query(params): Query<ChangesQuery>,
) -> Result<Json<ChangesPage>, ApiError> {
    let user = user_id(&params.user)?;
    let Some(since) = params.since else {
        let cursor = state.store.latest_seq()?;
        return Ok(Json(ChangesPage {
            changes: Vec::new(),
            cursor,
        }));
    };
    let limit = params.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let changes = state.store.changes_since(&user, since, limit)?;
    let cursor = changes.last().map_or(since, |c| c.seq);
    Ok(Json(ChangesPage { changes, cursor }))
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/entries", get(list_entries).post(create_entry))
        .route("/api/entries/{id}", patch(update_entry).delete(delete_entry))
        .route("/api/changes", get(list_changes))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

/// Router over `store`, for serving or for driving in-process.
pub(crate) fn router(store: Arc<SqliteStore>, api_key: Option<String>) -> Router {
    build_router(AppState { store, api_key })
}

// --- Server startup ---

pub async fn start_server(
    store: SqliteStore,
    port: u16,
    bind: &str,
    api_key: Option<String>,
) -> anyhow::Result<()> {
    let app = router(Arc::new(store), api_key.clone());

    if let Some(ref key) = api_key {
        let shown = key.chars().take(4).collect::<String>();
        eprintln!("API key: {shown}... (see api_key file in data directory)");
    } else {
        eprintln!("Warning: Authentication disabled (--no-auth). API is open to anyone.");
    }

    if bind != "127.0.0.1" && bind != "localhost" && api_key.is_none() {
        warn!(bind, "listening without authentication on a non-loopback address");
        eprintln!(
            "Warning: Listening on {bind} with no authentication. Any device on your network can access this API."
        );
    }

    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}")).await?;
    eprintln!("Listening on http://{bind}:{port}");
    info!(bind, port, "store server started");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    info!("store server stopped");

    Ok(())
}
