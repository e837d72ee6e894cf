//! Append-only audit trail linking a session commit to a branch (§3 BranchCommit).

use serde::Serialize;
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BranchCommit {
    pub id: String,
    pub session_id: String,
    pub site_name: String,
    pub branch: String,
    pub commit_hash: String,
    pub message: String,
    pub author: Option<String>,
    pub created_at: String,
}
