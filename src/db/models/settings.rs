//! Single-row table of process-wide settings.

use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct Settings {
    pub id: i64,
    pub admin_password_hash: Option<String>,
}
