//! REST surface over an `ObjectStore`.
//!
//! Lets users submit and delete desired-state objects while the controller
//! is running against the same store.

mod handlers;

use std::sync::Arc;

use axum::{Router, routing::get};

pub use handlers::{ApiError, AppState, ListQuery};

/// Build the router for `/v1/objects`.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/v1/objects",
            get(handlers::list_objects).put(handlers::apply_object),
        )
        .route(
            "/v1/objects/{kind}/{namespace}/{name}",
            get(handlers::get_object).delete(handlers::delete_object),
        )
        .with_state(state)
}
