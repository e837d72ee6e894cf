//! Editing Session Manager HTTP surface (§6: `/api/sites/:name/edit/...`).

use axum::{
    extract::{Path, State},
    http::{Request, StatusCode},
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::api::auth::caller_id;
use crate::api::error::ApiError;
use crate::db::{CommitRequest, SessionResponse};
use crate::engine::SessionError;
use crate::AppState;

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::SiteNotFound(name) => ApiError::not_found(format!("site '{}' not found", name)),
            SessionError::SessionNotFound(id) => ApiError::not_found(format!("session '{}' not found", id)),
            SessionError::AlreadyActive => {
                ApiError::conflict("an active editing session already exists for this site")
            }
            SessionError::TooManySessions(max) => {
                ApiError::conflict(format!("too many active sessions (max {})", max))
            }
            SessionError::Git(e) => ApiError::internal(format!("git error: {}", e)),
            SessionError::Container(e) => ApiError::new(
                crate::api::error::ErrorCode::ExternalServiceError,
                format!("container runtime error: {}", e),
            ),
            SessionError::Other(e) => ApiError::internal(e.to_string()),
        }
    }
}

pub async fn start_session(
    State(state): State<Arc<AppState>>,
    Path(site_name): Path<String>,
    req: Request<axum::body::Body>,
) -> Result<(StatusCode, Json<SessionResponse>), ApiError> {
    let user_id = caller_id(&req);
    let session = state.sessions.start(&user_id, &site_name).await?;
    Ok((StatusCode::CREATED, Json(session.into())))
}

#[derive(Serialize)]
pub struct SessionStatusResponse {
    #[serde(flatten)]
    session: Option<SessionResponse>,
    container_status: Option<&'static str>,
}

pub async fn session_status(
    State(state): State<Arc<AppState>>,
    Path(site_name): Path<String>,
    req: Request<axum::body::Body>,
) -> Result<Json<SessionStatusResponse>, ApiError> {
    let user_id = caller_id(&req);
    let session = crate::db::repo::get_active_session(&state.db, &user_id, &site_name).await?;

    let container_status = match &session {
        Some(s) => match s.container_name.as_deref() {
            Some(name) if state.supervisor.is_running(name).await => Some("running"),
            Some(_) => Some("error"),
            None => Some("building"),
        },
        None => None,
    };

    Ok(Json(SessionStatusResponse {
        session: session.map(SessionResponse::from),
        container_status,
    }))
}

pub async fn commit_session(
    State(state): State<Arc<AppState>>,
    Path((_site_name, session_id)): Path<(String, String)>,
    Json(body): Json<CommitRequest>,
) -> Result<Json<CommitAck>, ApiError> {
    let hash = state.sessions.commit(&session_id, body.message.as_deref(), None).await?;
    Ok(Json(CommitAck { commit_hash: hash }))
}

#[derive(Serialize)]
pub struct CommitAck {
    commit_hash: String,
}

pub async fn deploy_session(
    State(state): State<Arc<AppState>>,
    Path((_site_name, session_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    state.sessions.deploy(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn cancel_session(
    State(state): State<Arc<AppState>>,
    Path((_site_name, session_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    state.sessions.cancel(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
