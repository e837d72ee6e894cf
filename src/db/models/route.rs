//! Persisted route table entries (C5/C7 overlap).
//!
//! The proxy's live `RouteTable` is in-memory (see `crate::proxy`); this row
//! exists so `discover()` can rebuild routes for sessions and sites that were
//! still active across a restart, without relying on container labels alone.

use serde::Serialize;
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DynamicRouteRow {
    pub subdomain: String,
    pub target_host: String,
    pub target_port: i64,
    pub session_id: Option<String>,
    pub site_name: String,
    pub created_at: String,
}
