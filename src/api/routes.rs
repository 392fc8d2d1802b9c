use axum::{
    routing::{get, patch, post},
    Router,
};

use crate::api::handlers::{self, AppState};
use crate::store::RelationStore;

pub fn create_router<S: RelationStore + 'static>() -> Router<AppState<S>> {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check::<S>))
        // Configured fields
        .route("/fields", get(handlers::list_fields::<S>))
        .route("/fields/:field/sessions", post(handlers::open_session::<S>))
        // Field sessions
        .route(
            "/sessions/:session_id",
            get(handlers::get_session::<S>).delete(handlers::close_session::<S>),
        )
        .route("/sessions/:session_id/rows", post(handlers::create_row::<S>))
        .route(
            "/sessions/:session_id/rows/:key",
            patch(handlers::update_row::<S>).delete(handlers::delete_row::<S>),
        )
        .route("/sessions/:session_id/plan", get(handlers::preview_session::<S>))
        .route("/sessions/:session_id/save", post(handlers::save_session::<S>))
}
