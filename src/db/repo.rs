//! Site Registry (§4.7 C7).
//!
//! Persistent CRUD for Sites, EditingSessions, BranchCommits, DynamicRoutes,
//! and Settings. Invariants not enforced by a `UNIQUE` constraint (at most
//! one `active` session per (user, site)) are enforced by the caller (C6)
//! inside a transaction. Multi-step state changes that span tables run in a
//! single transaction per the component's operation, not split across calls.

use anyhow::Result;
use std::collections::HashMap;
use uuid::Uuid;

use super::{BranchCommit, DynamicRouteRow, EditingSession, Settings, Site};
use crate::DbPool;

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

// ---------------------------------------------------------------------
// Sites
// ---------------------------------------------------------------------

pub struct NewSite {
    pub name: String,
    pub path: String,
    pub git_url: Option<String>,
    pub owner_user_id: String,
    pub visibility: String,
}

/// Insert a new site row. Fails with a unique-constraint violation if
/// `name` is already registered (§3 invariant).
pub async fn create_site(db: &DbPool, new: NewSite) -> Result<Site> {
    let id = Uuid::new_v4().to_string();
    let created_at = now();

    sqlx::query(
        "INSERT INTO sites (id, name, path, git_url, owner_user_id, visibility, status, env_vars, created_at)
         VALUES (?, ?, ?, ?, ?, ?, 'stopped', '{}', ?)",
    )
    .bind(&id)
    .bind(&new.name)
    .bind(&new.path)
    .bind(&new.git_url)
    .bind(&new.owner_user_id)
    .bind(&new.visibility)
    .bind(&created_at)
    .execute(db)
    .await?;

    get_site(db, &id).await?.ok_or_else(|| anyhow::anyhow!("site vanished after insert"))
}

pub async fn get_site(db: &DbPool, id: &str) -> Result<Option<Site>> {
    Ok(sqlx::query_as::<_, Site>("SELECT * FROM sites WHERE id = ?").bind(id).fetch_optional(db).await?)
}

pub async fn get_site_by_name(db: &DbPool, name: &str) -> Result<Option<Site>> {
    Ok(sqlx::query_as::<_, Site>("SELECT * FROM sites WHERE name = ?").bind(name).fetch_optional(db).await?)
}

pub async fn list_sites(db: &DbPool) -> Result<Vec<Site>> {
    Ok(sqlx::query_as::<_, Site>("SELECT * FROM sites ORDER BY created_at DESC").fetch_all(db).await?)
}

pub async fn update_site_status(
    db: &DbPool,
    name: &str,
    status: &str,
    container_id: Option<&str>,
    container_name: Option<&str>,
    port: Option<i64>,
) -> Result<()> {
    sqlx::query(
        "UPDATE sites SET status = ?, container_id = ?, container_name = ?, port = ? WHERE name = ?",
    )
    .bind(status)
    .bind(container_id)
    .bind(container_name)
    .bind(port)
    .bind(name)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn touch_last_deployed(db: &DbPool, name: &str) -> Result<()> {
    sqlx::query("UPDATE sites SET last_deployed_at = ? WHERE name = ?")
        .bind(now())
        .bind(name)
        .execute(db)
        .await?;
    Ok(())
}

pub async fn update_site_env(db: &DbPool, name: &str, env: &HashMap<String, String>) -> Result<()> {
    let json = serde_json::to_string(env)?;
    sqlx::query("UPDATE sites SET env_vars = ? WHERE name = ?")
        .bind(json)
        .bind(name)
        .execute(db)
        .await?;
    Ok(())
}

pub async fn update_site_visibility(db: &DbPool, name: &str, visibility: &str) -> Result<()> {
    sqlx::query("UPDATE sites SET visibility = ? WHERE name = ?")
        .bind(visibility)
        .bind(name)
        .execute(db)
        .await?;
    Ok(())
}

/// Delete a site row and every session/route/commit row that references it.
/// Callers are responsible for tearing down the live container and any
/// active session beforehand (C4/C6); this only clears persisted state,
/// all within one transaction.
pub async fn delete_site(db: &DbPool, name: &str) -> Result<()> {
    let mut tx = db.begin().await?;
    sqlx::query("DELETE FROM dynamic_routes WHERE site_name = ?").bind(name).execute(&mut *tx).await?;
    sqlx::query(
        "DELETE FROM branch_commits WHERE session_id IN (SELECT id FROM editing_sessions WHERE site_name = ?)",
    )
    .bind(name)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM editing_sessions WHERE site_name = ?").bind(name).execute(&mut *tx).await?;
    sqlx::query("DELETE FROM sites WHERE name = ?").bind(name).execute(&mut *tx).await?;
    tx.commit().await?;
    Ok(())
}

// ---------------------------------------------------------------------
// Editing sessions
// ---------------------------------------------------------------------

pub struct NewSession {
    pub user_id: String,
    pub site_name: String,
    pub branch_name: String,
    pub expires_at: String,
    pub base_commit: Option<String>,
}

pub async fn create_session(db: &DbPool, new: NewSession) -> Result<EditingSession> {
    let id = Uuid::new_v4().to_string();
    let created_at = now();

    sqlx::query(
        "INSERT INTO editing_sessions
            (id, user_id, site_name, branch_name, status, base_commit, commits_count,
             created_at, last_activity, expires_at, auto_cleanup)
         VALUES (?, ?, ?, ?, 'active', ?, 0, ?, ?, ?, 1)",
    )
    .bind(&id)
    .bind(&new.user_id)
    .bind(&new.site_name)
    .bind(&new.branch_name)
    .bind(&new.base_commit)
    .bind(&created_at)
    .bind(&created_at)
    .bind(&new.expires_at)
    .execute(db)
    .await?;

    get_session(db, &id).await?.ok_or_else(|| anyhow::anyhow!("session vanished after insert"))
}

pub async fn get_session(db: &DbPool, id: &str) -> Result<Option<EditingSession>> {
    Ok(sqlx::query_as::<_, EditingSession>("SELECT * FROM editing_sessions WHERE id = ?")
        .bind(id)
        .fetch_optional(db)
        .await?)
}

/// The at-most-one-active invariant (P2) is enforced here: callers check
/// this before inserting a new session for the same (user, site).
pub async fn get_active_session(db: &DbPool, user_id: &str, site_name: &str) -> Result<Option<EditingSession>> {
    Ok(sqlx::query_as::<_, EditingSession>(
        "SELECT * FROM editing_sessions WHERE user_id = ? AND site_name = ? AND status = 'active'",
    )
    .bind(user_id)
    .bind(site_name)
    .fetch_optional(db)
    .await?)
}

pub async fn list_active_sessions_for_user(db: &DbPool, user_id: &str) -> Result<Vec<EditingSession>> {
    Ok(sqlx::query_as::<_, EditingSession>(
        "SELECT * FROM editing_sessions WHERE user_id = ? AND status IN ('active', 'inactive') ORDER BY last_activity ASC",
    )
    .bind(user_id)
    .fetch_all(db)
    .await?)
}

pub async fn list_expired_sessions(db: &DbPool, now_str: &str) -> Result<Vec<EditingSession>> {
    Ok(sqlx::query_as::<_, EditingSession>(
        "SELECT * FROM editing_sessions WHERE status IN ('active', 'inactive') AND auto_cleanup = 1 AND expires_at < ?",
    )
    .bind(now_str)
    .fetch_all(db)
    .await?)
}

pub async fn set_session_container(
    db: &DbPool,
    id: &str,
    container_name: &str,
    preview_port: i64,
    preview_url: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE editing_sessions SET container_name = ?, preview_port = ?, preview_url = ? WHERE id = ?",
    )
    .bind(container_name)
    .bind(preview_port)
    .bind(preview_url)
    .bind(id)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn set_session_status(db: &DbPool, id: &str, status: &str) -> Result<()> {
    sqlx::query("UPDATE editing_sessions SET status = ? WHERE id = ?")
        .bind(status)
        .bind(id)
        .execute(db)
        .await?;
    Ok(())
}

pub async fn record_commit(
    db: &DbPool,
    session_id: &str,
    current_commit: &str,
    message: &str,
    author: Option<&str>,
) -> Result<()> {
    let mut tx = db.begin().await?;
    let now_str = now();

    sqlx::query(
        "UPDATE editing_sessions
         SET current_commit = ?, commits_count = commits_count + 1, last_activity = ?
         WHERE id = ?",
    )
    .bind(current_commit)
    .bind(&now_str)
    .bind(session_id)
    .execute(&mut *tx)
    .await?;

    let session: EditingSession = sqlx::query_as("SELECT * FROM editing_sessions WHERE id = ?")
        .bind(session_id)
        .fetch_one(&mut *tx)
        .await?;

    sqlx::query(
        "INSERT INTO branch_commits (id, session_id, site_name, branch, commit_hash, message, author, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(session_id)
    .bind(&session.site_name)
    .bind(&session.branch_name)
    .bind(current_commit)
    .bind(message)
    .bind(author)
    .bind(&now_str)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

pub async fn touch_session_activity(db: &DbPool, id: &str) -> Result<()> {
    sqlx::query("UPDATE editing_sessions SET last_activity = ? WHERE id = ?")
        .bind(now())
        .bind(id)
        .execute(db)
        .await?;
    Ok(())
}

pub async fn delete_session(db: &DbPool, id: &str) -> Result<()> {
    sqlx::query("DELETE FROM editing_sessions WHERE id = ?").bind(id).execute(db).await?;
    Ok(())
}

pub async fn list_commits_for_session(db: &DbPool, session_id: &str) -> Result<Vec<BranchCommit>> {
    Ok(sqlx::query_as::<_, BranchCommit>(
        "SELECT * FROM branch_commits WHERE session_id = ? ORDER BY created_at DESC",
    )
    .bind(session_id)
    .fetch_all(db)
    .await?)
}

// ---------------------------------------------------------------------
// Dynamic routes
// ---------------------------------------------------------------------

pub async fn upsert_dynamic_route(
    db: &DbPool,
    subdomain: &str,
    target_port: i64,
    session_id: Option<&str>,
    site_name: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO dynamic_routes (subdomain, target_host, target_port, session_id, site_name, created_at)
         VALUES (?, '127.0.0.1', ?, ?, ?, ?)
         ON CONFLICT(subdomain) DO UPDATE SET target_port = excluded.target_port, session_id = excluded.session_id",
    )
    .bind(subdomain)
    .bind(target_port)
    .bind(session_id)
    .bind(site_name)
    .bind(now())
    .execute(db)
    .await?;
    Ok(())
}

pub async fn remove_dynamic_route_for_session(db: &DbPool, session_id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM dynamic_routes WHERE session_id = ?")
        .bind(session_id)
        .execute(db)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn list_dynamic_routes(db: &DbPool) -> Result<Vec<DynamicRouteRow>> {
    Ok(sqlx::query_as::<_, DynamicRouteRow>("SELECT * FROM dynamic_routes").fetch_all(db).await?)
}

// ---------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------

pub async fn get_settings(db: &DbPool) -> Result<Settings> {
    Ok(sqlx::query_as::<_, Settings>("SELECT * FROM settings WHERE id = 1").fetch_one(db).await?)
}

pub async fn set_admin_password_hash(db: &DbPool, hash: &str) -> Result<()> {
    sqlx::query("UPDATE settings SET admin_password_hash = ? WHERE id = 1")
        .bind(hash)
        .execute(db)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_db() -> (TempDir, DbPool) {
        let dir = TempDir::new().unwrap();
        let db = crate::db::init(dir.path()).await.unwrap();
        (dir, db)
    }

    #[tokio::test]
    async fn create_and_fetch_site_round_trips() {
        let (_dir, db) = test_db().await;
        let site = create_site(
            &db,
            NewSite {
                name: "blog".to_string(),
                path: "/sites/blog".to_string(),
                git_url: None,
                owner_user_id: "local".to_string(),
                visibility: "public".to_string(),
            },
        )
        .await
        .unwrap();

        let fetched = get_site_by_name(&db, "blog").await.unwrap().unwrap();
        assert_eq!(fetched.id, site.id);
        assert_eq!(fetched.status, "stopped");
    }

    #[tokio::test]
    async fn duplicate_site_name_is_rejected() {
        let (_dir, db) = test_db().await;
        let make = || NewSite {
            name: "blog".to_string(),
            path: "/sites/blog".to_string(),
            git_url: None,
            owner_user_id: "local".to_string(),
            visibility: "public".to_string(),
        };
        create_site(&db, make()).await.unwrap();
        assert!(create_site(&db, make()).await.is_err());
    }

    #[tokio::test]
    async fn only_one_active_session_is_returned_per_user_site() {
        let (_dir, db) = test_db().await;
        create_site(
            &db,
            NewSite {
                name: "blog".to_string(),
                path: "/sites/blog".to_string(),
                git_url: None,
                owner_user_id: "local".to_string(),
                visibility: "public".to_string(),
            },
        )
        .await
        .unwrap();

        let session = create_session(
            &db,
            NewSession {
                user_id: "u1".to_string(),
                site_name: "blog".to_string(),
                branch_name: "edit-1".to_string(),
                expires_at: "2999-01-01T00:00:00Z".to_string(),
                base_commit: None,
            },
        )
        .await
        .unwrap();

        let active = get_active_session(&db, "u1", "blog").await.unwrap().unwrap();
        assert_eq!(active.id, session.id);
    }

    #[tokio::test]
    async fn record_commit_appends_audit_row_and_bumps_counter() {
        let (_dir, db) = test_db().await;
        create_site(
            &db,
            NewSite {
                name: "blog".to_string(),
                path: "/sites/blog".to_string(),
                git_url: None,
                owner_user_id: "local".to_string(),
                visibility: "public".to_string(),
            },
        )
        .await
        .unwrap();
        let session = create_session(
            &db,
            NewSession {
                user_id: "u1".to_string(),
                site_name: "blog".to_string(),
                branch_name: "edit-1".to_string(),
                expires_at: "2999-01-01T00:00:00Z".to_string(),
                base_commit: None,
            },
        )
        .await
        .unwrap();

        record_commit(&db, &session.id, "abc123", "Update index.html", Some("alice")).await.unwrap();

        let updated = get_session(&db, &session.id).await.unwrap().unwrap();
        assert_eq!(updated.commits_count, 1);
        assert_eq!(updated.current_commit.as_deref(), Some("abc123"));

        let commits = list_commits_for_session(&db, &session.id).await.unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].author.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn delete_site_cascades_sessions_and_routes() {
        let (_dir, db) = test_db().await;
        create_site(
            &db,
            NewSite {
                name: "blog".to_string(),
                path: "/sites/blog".to_string(),
                git_url: None,
                owner_user_id: "local".to_string(),
                visibility: "public".to_string(),
            },
        )
        .await
        .unwrap();
        let session = create_session(
            &db,
            NewSession {
                user_id: "u1".to_string(),
                site_name: "blog".to_string(),
                branch_name: "edit-1".to_string(),
                expires_at: "2999-01-01T00:00:00Z".to_string(),
                base_commit: None,
            },
        )
        .await
        .unwrap();
        upsert_dynamic_route(&db, "edit-1-blog.example.com", 4001, Some(&session.id), "blog")
            .await
            .unwrap();

        delete_site(&db, "blog").await.unwrap();

        assert!(get_site_by_name(&db, "blog").await.unwrap().is_none());
        assert!(get_session(&db, &session.id).await.unwrap().is_none());
        assert!(list_dynamic_routes(&db).await.unwrap().is_empty());
    }
}
