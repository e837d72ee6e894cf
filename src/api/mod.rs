pub mod auth;
mod editing;
pub mod error;
mod files;
mod sites;
mod validation;

use axum::{
    middleware,
    routing::{delete, get, patch, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let site_routes = Router::new()
        .route("/sites", post(sites::create_site))
        .route("/sites", get(sites::list_sites))
        .route("/sites/:id", get(sites::get_site))
        .route("/sites/:id", patch(sites::update_site))
        .route("/sites/:id", delete(sites::delete_site))
        .route("/sites/:id/deploy", post(sites::deploy_site))
        .route("/sites/:id/env", patch(sites::update_env))
        .route("/sites/:name/edit/start", post(editing::start_session))
        .route("/sites/:name/edit/status", get(editing::session_status))
        .route("/sites/:name/edit/:sid/commit", post(editing::commit_session))
        .route("/sites/:name/edit/:sid/deploy", post(editing::deploy_session))
        .route("/sites/:name/edit/:sid", delete(editing::cancel_session))
        .route("/sites/:name/tree", get(files::tree))
        .route("/sites/:name/file/*path", get(files::read_file))
        .route("/sites/:name/file/*path", put(files::write_file))
        .route("/sites/:name/file/*path", post(files::write_file))
        .route("/sites/:name/file/*path", delete(files::delete_file))
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_middleware));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", site_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}
