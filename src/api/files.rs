//! File tree and CRUD HTTP surface (§6: `/api/sites/:name/tree`, `/api/sites/:name/file/*path`).
//!
//! Operates against the site's single working-copy checkout (§9: no git
//! worktrees), switched to the caller's active session branch first if one
//! exists, or `main` otherwise.

use axum::{
    extract::{Path, State},
    http::{Request, StatusCode},
    Json,
};
use serde::Serialize;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use crate::api::auth::caller_id;
use crate::api::error::ApiError;
use crate::db::repo;
use crate::git::resolve_scoped_path;
use crate::AppState;

#[derive(Serialize)]
pub struct TreeEntry {
    path: String,
    is_dir: bool,
}

/// Checks out the caller's active session branch (if any) before touching
/// the working tree, so concurrent editors on different sessions don't see
/// each other's uncommitted files. Single-working-tree design (§9): this
/// means file operations across two *different* sessions for the same site
/// can race; acceptable since a site has at most one caller in practice.
async fn prepare_checkout(
    state: &AppState,
    site: &crate::db::Site,
    user_id: &str,
) -> Result<PathBuf, ApiError> {
    let site_path = PathBuf::from(&site.path);
    let active = repo::get_active_session(&state.db, user_id, &site.name).await?;
    let branch = active.map(|s| s.branch_name).unwrap_or_else(|| "main".to_string());

    state
        .git
        .checkout(&site_path, &branch)
        .await
        .map_err(|e| ApiError::internal(format!("failed to checkout {}: {}", branch, e)))?;

    Ok(site_path)
}

async fn get_site_or_404(state: &AppState, name: &str) -> Result<crate::db::Site, ApiError> {
    repo::get_site_by_name(&state.db, name)
        .await?
        .ok_or_else(|| ApiError::not_found("site not found"))
}

pub async fn tree(
    State(state): State<Arc<AppState>>,
    Path(site_name): Path<String>,
    req: Request<axum::body::Body>,
) -> Result<Json<Vec<TreeEntry>>, ApiError> {
    let user_id = caller_id(&req);
    let site = get_site_or_404(&state, &site_name).await?;
    let site_path = prepare_checkout(&state, &site, &user_id).await?;

    let mut entries = Vec::new();
    walk(&site_path, &site_path, &mut entries)
        .await
        .map_err(|e| ApiError::internal(format!("failed to list files: {}", e)))?;
    Ok(Json(entries))
}

fn walk<'a>(
    root: &'a FsPath,
    dir: &'a FsPath,
    out: &'a mut Vec<TreeEntry>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = std::io::Result<()>> + Send + 'a>> {
    Box::pin(async move {
        let mut read_dir = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name();
            if name == ".git" {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(&path).display().to_string();
            let file_type = entry.file_type().await?;
            out.push(TreeEntry {
                path: relative,
                is_dir: file_type.is_dir(),
            });
            if file_type.is_dir() {
                walk(root, &path, out).await?;
            }
        }
        Ok(())
    })
}

pub async fn read_file(
    State(state): State<Arc<AppState>>,
    Path((site_name, file_path)): Path<(String, String)>,
    req: Request<axum::body::Body>,
) -> Result<String, ApiError> {
    let user_id = caller_id(&req);
    let site = get_site_or_404(&state, &site_name).await?;
    let site_path = prepare_checkout(&state, &site, &user_id).await?;
    let target = resolve_scoped_path(&site_path, &file_path).map_err(|e| ApiError::forbidden(e.to_string()))?;

    tokio::fs::read_to_string(&target)
        .await
        .map_err(|_| ApiError::not_found("file not found"))
}

pub async fn write_file(
    State(state): State<Arc<AppState>>,
    Path((site_name, file_path)): Path<(String, String)>,
    req: Request<axum::body::Body>,
) -> Result<StatusCode, ApiError> {
    let user_id = caller_id(&req);
    let site = get_site_or_404(&state, &site_name).await?;
    let site_path = prepare_checkout(&state, &site, &user_id).await?;
    let target = resolve_scoped_path(&site_path, &file_path).map_err(|e| ApiError::forbidden(e.to_string()))?;

    let body = axum::body::to_bytes(req.into_body(), 16 * 1024 * 1024)
        .await
        .map_err(|e| ApiError::bad_request(format!("failed to read request body: {}", e)))?;

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ApiError::internal(format!("failed to create directory: {}", e)))?;
    }
    tokio::fs::write(&target, &body)
        .await
        .map_err(|e| ApiError::internal(format!("failed to write file: {}", e)))?;

    notify_saved(&state, &site, &user_id, &file_path).await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_file(
    State(state): State<Arc<AppState>>,
    Path((site_name, file_path)): Path<(String, String)>,
    req: Request<axum::body::Body>,
) -> Result<StatusCode, ApiError> {
    let user_id = caller_id(&req);
    let site = get_site_or_404(&state, &site_name).await?;
    let site_path = prepare_checkout(&state, &site, &user_id).await?;
    let target = resolve_scoped_path(&site_path, &file_path).map_err(|e| ApiError::forbidden(e.to_string()))?;

    tokio::fs::remove_file(&target)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;

    notify_saved(&state, &site, &user_id, &file_path).await;
    Ok(StatusCode::NO_CONTENT)
}

/// Every write touches the caller's active session, if any: bumps its
/// activity timestamp and runs the restart-on-save capability probe (§4.6).
async fn notify_saved(state: &AppState, site: &crate::db::Site, user_id: &str, relative_path: &str) {
    if let Ok(Some(session)) = repo::get_active_session(&state.db, user_id, &site.name).await {
        if let Err(e) = state.sessions.on_file_saved(&session.id, relative_path).await {
            tracing::warn!(session_id = %session.id, error = %e, "on_file_saved failed");
        }
    }
}
