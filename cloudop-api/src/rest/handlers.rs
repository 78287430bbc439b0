use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::object::{Object, ObjectRef};
use crate::store::{ObjectStore, StoreError};

/// Shared application state
pub struct AppState {
    pub store: Arc<dyn ObjectStore>,
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub code: u32,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match self.code {
            404 => StatusCode::NOT_FOUND,
            409 => StatusCode::CONFLICT,
            400 => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let code = match &e {
            StoreError::NotFound(_) => 404,
            StoreError::Conflict(_) | StoreError::VersionMismatch { .. } => 409,
            StoreError::Invalid(_) => 400,
            StoreError::Serialization(_) | StoreError::Storage(_) => 500,
        };
        ApiError {
            error: e.to_string(),
            code,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub kind: Option<String>,
}

/// List objects, optionally filtered by kind
pub async fn list_objects(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Object>>, ApiError> {
    let objects = state.store.list(query.kind.as_deref()).await?;
    Ok(Json(objects))
}

/// Get one object
pub async fn get_object(
    State(state): State<Arc<AppState>>,
    Path((kind, namespace, name)): Path<(String, String, String)>,
) -> Result<Json<Object>, ApiError> {
    let object = state
        .store
        .get(&ObjectRef::new(kind, namespace, name))
        .await?;
    Ok(Json(object))
}

/// Create an object or replace its spec and labels
pub async fn apply_object(
    State(state): State<Arc<AppState>>,
    Json(object): Json<Object>,
) -> Result<Json<Object>, ApiError> {
    let object = state.store.apply(object).await?;
    info!(object = %object.object_ref(), generation = object.metadata.generation, "Object applied");
    Ok(Json(object))
}

/// Request deletion of an object
pub async fn delete_object(
    State(state): State<Arc<AppState>>,
    Path((kind, namespace, name)): Path<(String, String, String)>,
) -> Result<StatusCode, ApiError> {
    let object_ref = ObjectRef::new(kind, namespace, name);
    state.store.delete(&object_ref).await?;
    info!(object = %object_ref, "Deletion requested");
    Ok(StatusCode::ACCEPTED)
}
