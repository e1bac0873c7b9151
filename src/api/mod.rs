use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use log::error;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use crate::db::Database;
use crate::models::Poll;

// Read-only surface over the mirror store. Nothing here writes; syncing
// and reconciliation are independent background tasks, and a stale cache
// is served as-is rather than surfaced as an error.
pub fn router(db: Arc<Database>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/polls", get(list_polls))
        .route("/api/polls/{id}", get(get_poll))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(db)
}

enum ApiError {
    NotFound,
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound => (StatusCode::NOT_FOUND, "Poll not found"),
            Self::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"),
        };
        (status, Json(json!({ "message": message }))).into_response()
    }
}

async fn index() -> &'static str {
    "Democrazy API is running"
}

async fn list_polls(State(db): State<Arc<Database>>) -> Result<Json<Vec<Poll>>, ApiError> {
    let polls = db.list_polls().await.map_err(|e| {
        error!("Failed to list polls: {e}");
        ApiError::Internal
    })?;
    Ok(Json(polls))
}

async fn get_poll(
    State(db): State<Arc<Database>>,
    Path(id): Path<u64>,
) -> Result<Json<Poll>, ApiError> {
    let poll = db
        .get_poll(id)
        .await
        .map_err(|e| {
            error!("Failed to fetch poll #{id}: {e}");
            ApiError::Internal
        })?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(poll))
}
