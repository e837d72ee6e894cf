//! Registered sites (§3 Site, C7).

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Visibility::Public => write!(f, "public"),
            Visibility::Private => write!(f, "private"),
        }
    }
}

impl From<String> for Visibility {
    fn from(s: String) -> Self {
        match s.as_str() {
            "private" => Visibility::Private,
            _ => Visibility::Public,
        }
    }
}

/// Status of a site's production slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteStatus {
    Stopped,
    Building,
    Running,
    Failed,
}

impl fmt::Display for SiteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SiteStatus::Stopped => "stopped",
            SiteStatus::Building => "building",
            SiteStatus::Running => "running",
            SiteStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl From<String> for SiteStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "building" => SiteStatus::Building,
            "running" => SiteStatus::Running,
            "failed" => SiteStatus::Failed,
            _ => SiteStatus::Stopped,
        }
    }
}

/// A registered deployable unit. `path` is the absolute location of its
/// bare + checkout workspace on disk (C1); `env_vars` is a JSON object of
/// string -> string, values possibly `ENC:`-prefixed (see `crate::crypto`).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Site {
    pub id: String,
    pub name: String,
    pub path: String,
    pub git_url: Option<String>,
    pub owner_user_id: String,
    pub visibility: String,
    pub status: String,
    pub container_id: Option<String>,
    pub container_name: Option<String>,
    pub port: Option<i64>,
    pub env_vars: String,
    pub created_at: String,
    pub last_deployed_at: Option<String>,
}

impl Site {
    pub fn visibility(&self) -> Visibility {
        Visibility::from(self.visibility.clone())
    }

    pub fn status(&self) -> SiteStatus {
        SiteStatus::from(self.status.clone())
    }

    pub fn env_map(&self) -> HashMap<String, String> {
        serde_json::from_str(&self.env_vars).unwrap_or_default()
    }

    pub fn production_container_name(&self) -> String {
        format!("{}-production", self.name)
    }
}

/// API-facing projection; never carries raw env var values.
#[derive(Debug, Clone, Serialize)]
pub struct SiteResponse {
    pub id: String,
    pub name: String,
    pub visibility: String,
    pub status: String,
    pub port: Option<i64>,
    pub created_at: String,
    pub last_deployed_at: Option<String>,
}

impl From<Site> for SiteResponse {
    fn from(s: Site) -> Self {
        Self {
            id: s.id,
            name: s.name,
            visibility: s.visibility,
            status: s.status,
            port: s.port,
            created_at: s.created_at,
            last_deployed_at: s.last_deployed_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateSiteRequest {
    pub name: String,
    pub git_url: Option<String>,
    #[serde(default)]
    pub visibility: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateSiteRequest {
    pub visibility: Option<String>,
    pub env_vars: Option<HashMap<String, String>>,
}
