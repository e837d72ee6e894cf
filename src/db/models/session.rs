//! Editing sessions (§3 EditingSession, §4.6 C6).

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Deploying,
    Inactive,
    Failed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Active => "active",
            SessionStatus::Deploying => "deploying",
            SessionStatus::Inactive => "inactive",
            SessionStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl From<String> for SessionStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "deploying" => SessionStatus::Deploying,
            "inactive" => SessionStatus::Inactive,
            "failed" => SessionStatus::Failed,
            _ => SessionStatus::Active,
        }
    }
}

/// A session tracks a live preview container bound to a single branch
/// checkout (§3, B5). `commits_count` is the running total of commits the
/// user has made through `sessions::commit`, not the full branch history.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EditingSession {
    pub id: String,
    pub user_id: String,
    pub site_name: String,
    pub branch_name: String,
    pub container_name: Option<String>,
    pub preview_port: Option<i64>,
    pub preview_url: Option<String>,
    pub status: String,
    pub base_commit: Option<String>,
    pub current_commit: Option<String>,
    pub commits_count: i64,
    pub created_at: String,
    pub last_activity: String,
    pub expires_at: String,
    pub auto_cleanup: bool,
}

impl EditingSession {
    pub fn status(&self) -> SessionStatus {
        SessionStatus::from(self.status.clone())
    }

    pub fn preview_container_name(&self) -> String {
        format!("{}-{}-preview", self.site_name, short_id(&self.id))
    }
}

fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionResponse {
    pub id: String,
    pub site_name: String,
    pub branch_name: String,
    pub preview_url: Option<String>,
    pub status: String,
    pub commits_count: i64,
    pub created_at: String,
    pub expires_at: String,
}

impl From<EditingSession> for SessionResponse {
    fn from(s: EditingSession) -> Self {
        Self {
            id: s.id,
            site_name: s.site_name,
            branch_name: s.branch_name,
            preview_url: s.preview_url,
            status: s.status,
            commits_count: s.commits_count,
            created_at: s.created_at,
            expires_at: s.expires_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StartSessionRequest {
    pub site_name: String,
    pub base_branch: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CommitRequest {
    pub message: Option<String>,
}
