//! Site Registry HTTP surface (§6: `/api/sites`).

use axum::{
    extract::{Path, State},
    http::Request,
    Json,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::api::auth::caller_id;
use crate::api::error::ApiError;
use crate::api::validation::{validate_git_url, validate_site_name};
use crate::db::repo::{self, NewSite};
use crate::db::{CreateSiteRequest, SiteResponse, UpdateSiteRequest};
use crate::engine::supervisor::{ContainerRole, CreateRequest};
use crate::engine::ports::PortRole;
use crate::AppState;

const HEALTH_WAIT: Duration = Duration::from_secs(30);

pub async fn create_site(
    State(state): State<Arc<AppState>>,
    req: Request<axum::body::Body>,
) -> Result<(axum::http::StatusCode, Json<SiteResponse>), ApiError> {
    let owner = caller_id(&req);
    let body: CreateSiteRequest = parse_json(req).await?;

    validate_site_name(&body.name).map_err(ApiError::bad_request)?;
    if let Some(url) = &body.git_url {
        validate_git_url(url).map_err(ApiError::bad_request)?;
    }

    if repo::get_site_by_name(&state.db, &body.name).await?.is_some() {
        return Err(ApiError::conflict(format!("site '{}' already exists", body.name)));
    }

    let site_path = state.config.server.data_dir.join("sites").join(&body.name);
    let visibility = body.visibility.unwrap_or_else(|| "public".to_string());

    state
        .git
        .initialize(&site_path)
        .await
        .map_err(|e| ApiError::internal(format!("failed to initialize repository: {}", e)))?;

    let site = repo::create_site(
        &state.db,
        NewSite {
            name: body.name,
            path: site_path.display().to_string(),
            git_url: body.git_url,
            owner_user_id: owner,
            visibility,
        },
    )
    .await?;

    Ok((axum::http::StatusCode::CREATED, Json(site.into())))
}

pub async fn list_sites(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<SiteResponse>>, ApiError> {
    let sites = repo::list_sites(&state.db).await?;
    Ok(Json(sites.into_iter().map(SiteResponse::from).collect()))
}

pub async fn get_site(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SiteResponse>, ApiError> {
    let site = repo::get_site(&state.db, &id)
        .await?
        .ok_or_else(|| ApiError::not_found("site not found"))?;
    Ok(Json(site.into()))
}

pub async fn update_site(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<UpdateSiteRequest>,
) -> Result<Json<SiteResponse>, ApiError> {
    let site = repo::get_site(&state.db, &id)
        .await?
        .ok_or_else(|| ApiError::not_found("site not found"))?;

    if let Some(visibility) = &body.visibility {
        repo::update_site_visibility(&state.db, &site.name, visibility).await?;
    }
    if let Some(env) = &body.env_vars {
        repo::update_site_env(&state.db, &site.name, env).await?;
    }

    let site = repo::get_site(&state.db, &id)
        .await?
        .ok_or_else(|| ApiError::not_found("site not found"))?;
    Ok(Json(site.into()))
}

pub async fn delete_site(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<axum::http::StatusCode, ApiError> {
    let site = repo::get_site(&state.db, &id)
        .await?
        .ok_or_else(|| ApiError::not_found("site not found"))?;

    if let Some(container_name) = &site.container_name {
        let _ = state.supervisor.stop(container_name).await;
    }

    repo::delete_site(&state.db, &site.name).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

#[derive(serde::Serialize)]
pub struct DeployAck {
    site_id: String,
}

/// Triggers a production rebuild from the current checkout on `main`.
/// Returns immediately; the build runs in the background (§6).
pub async fn deploy_site(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DeployAck>, ApiError> {
    let site = repo::get_site(&state.db, &id)
        .await?
        .ok_or_else(|| ApiError::not_found("site not found"))?;

    repo::update_site_status(&state.db, &site.name, "building", None, None, None).await?;

    let state = state.clone();
    let site_name = site.name.clone();
    tokio::spawn(async move {
        let site_path = PathBuf::from(&site.path);
        let result = state
            .supervisor
            .create(CreateRequest {
                site_name: site.name.clone(),
                site_path: site_path.clone(),
                role: ContainerRole::Production,
                port_role: PortRole::Production,
                container_name: Some(site.production_container_name()),
                env: site.env_map().into_iter().collect(),
                mount_source: false,
            })
            .await;

        match result {
            Ok(record) => {
                state.supervisor.wait_healthy(record.port, HEALTH_WAIT).await;
                let _ = repo::update_site_status(
                    &state.db,
                    &site.name,
                    "running",
                    record.container_id.as_deref(),
                    Some(&record.name),
                    Some(record.port as i64),
                )
                .await;
                let _ = repo::touch_last_deployed(&state.db, &site.name).await;
            }
            Err(e) => {
                tracing::error!(site = %site.name, error = %e, "production deploy failed");
                let _ = repo::update_site_status(&state.db, &site.name, "failed", None, None, None).await;
            }
        }
    });

    Ok(Json(DeployAck { site_id: site_name }))
}

pub async fn update_env(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<std::collections::HashMap<String, String>>,
) -> Result<axum::http::StatusCode, ApiError> {
    let site = repo::get_site(&state.db, &id)
        .await?
        .ok_or_else(|| ApiError::not_found("site not found"))?;

    for key in body.keys() {
        crate::api::validation::validate_env_key(key).map_err(ApiError::bad_request)?;
    }

    repo::update_site_env(&state.db, &site.name, &body).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

async fn parse_json<T: serde::de::DeserializeOwned>(req: Request<axum::body::Body>) -> Result<T, ApiError> {
    let bytes = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .map_err(|e| ApiError::bad_request(format!("failed to read request body: {}", e)))?;
    serde_json::from_slice(&bytes).map_err(|e| ApiError::bad_request(format!("invalid JSON body: {}", e)))
}
