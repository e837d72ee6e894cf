//! Editing Session Manager (§4.6 C6).
//!
//! Owns the `(user, site) -> branch -> preview container -> dynamic route`
//! lifecycle. State transitions for a given session id serialize on that id;
//! different sessions progress fully in parallel (§5).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

use super::build_plan;
use super::ports::PortRole;
use super::supervisor::{ContainerRole, ContainerSupervisor, CreateRequest, SupervisorError};
use crate::config::{ProxyConfig, SessionsConfig};
use crate::db::repo::{self, NewSession};
use crate::db::{EditingSession, Site};
use crate::git::{GitWorkspace, RepoError};
use crate::proxy::orchestrator::{DynamicRoute, ProxyOrchestrator};
use crate::DbPool;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("site not found: {0}")]
    SiteNotFound(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("user already has an active session on this site")]
    AlreadyActive,
    #[error("too many active sessions for user (max {0})")]
    TooManySessions(u32),
    #[error("git error: {0}")]
    Git(#[from] RepoError),
    #[error("container error: {0}")]
    Container(#[from] SupervisorError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub struct SessionManager {
    db: DbPool,
    git: GitWorkspace,
    supervisor: Arc<ContainerSupervisor>,
    proxy: ProxyOrchestrator,
    proxy_config: ProxyConfig,
    sessions_config: SessionsConfig,
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl SessionManager {
    pub fn new(
        db: DbPool,
        git: GitWorkspace,
        supervisor: Arc<ContainerSupervisor>,
        proxy: ProxyOrchestrator,
        proxy_config: ProxyConfig,
        sessions_config: SessionsConfig,
    ) -> Self {
        Self {
            db,
            git,
            supervisor,
            proxy,
            proxy_config,
            sessions_config,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        self.locks.entry(session_id.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// §4.6 `start`: enforce the per-user cap, branch off main, launch a
    /// preview container, and register its route. Failures from step 5
    /// onward mark the session `failed` and best-effort clean it up rather
    /// than leaving a half-started session behind.
    pub async fn start(&self, user_id: &str, site_name: &str) -> Result<EditingSession, SessionError> {
        let site = repo::get_site_by_name(&self.db, site_name)
            .await?
            .ok_or_else(|| SessionError::SiteNotFound(site_name.to_string()))?;

        if repo::get_active_session(&self.db, user_id, site_name).await?.is_some() {
            return Err(SessionError::AlreadyActive);
        }

        let active = repo::list_active_sessions_for_user(&self.db, user_id).await?;
        if active.len() as u32 >= self.sessions_config.max_sessions_per_user {
            if let Some(oldest) = active.into_iter().min_by(|a, b| a.last_activity.cmp(&b.last_activity)) {
                warn!(user_id, session_id = %oldest.id, "per-user session cap reached, evicting oldest");
                self.cleanup(&oldest).await;
            } else {
                return Err(SessionError::TooManySessions(self.sessions_config.max_sessions_per_user));
            }
        }

        let site_path = Path::new(&site.path);
        self.git.initialize(site_path).await?;
        let branch = self.git.create_edit_branch(site_path, "edit").await?;

        let expires_at = (chrono::Utc::now() + chrono::Duration::seconds(self.sessions_config.ttl_secs as i64))
            .to_rfc3339();
        let status = self.git.status(site_path).await?;

        let session = repo::create_session(
            &self.db,
            NewSession {
                user_id: user_id.to_string(),
                site_name: site_name.to_string(),
                branch_name: branch.clone(),
                expires_at,
                base_commit: Some(status.current_branch.clone()),
            },
        )
        .await?;

        match self.launch_preview(&site, &session, &branch).await {
            Ok(()) => {}
            Err(e) => {
                error!(session_id = %session.id, error = %e, "preview launch failed, marking session failed");
                repo::set_session_status(&self.db, &session.id, "failed").await?;
                self.cleanup_by_id(&session.id).await;
                return Err(e);
            }
        }

        repo::get_session(&self.db, &session.id)
            .await?
            .ok_or_else(|| SessionError::SessionNotFound(session.id.clone()))
    }

    async fn launch_preview(
        &self,
        site: &Site,
        session: &EditingSession,
        branch: &str,
    ) -> Result<(), SessionError> {
        let container_name = session.preview_container_name();
        let record = self
            .supervisor
            .create(CreateRequest {
                site_name: site.name.clone(),
                site_path: Path::new(&site.path).to_path_buf(),
                role: ContainerRole::Preview,
                port_role: PortRole::Session,
                container_name: Some(container_name.clone()),
                env: site.env_map().into_iter().collect(),
                mount_source: true,
            })
            .await?;

        self.supervisor.wait_healthy(record.port, Duration::from_secs(30)).await;

        let subdomain = self
            .proxy_config
            .subdomain_for(&format!("{}-{}", branch, site.name))
            .unwrap_or_else(|| format!("{}-{}", branch, site.name));
        let preview_url = format!("https://{}", subdomain);

        repo::set_session_container(&self.db, &session.id, &container_name, record.port as i64, &preview_url)
            .await?;

        self.proxy.add_route(
            session.id.clone(),
            DynamicRoute {
                subdomain: subdomain.clone(),
                target_port: record.port,
                session_id: Some(session.id.clone()),
                site_name: site.name.clone(),
                created_at: chrono::Utc::now().timestamp(),
            },
        );
        repo::upsert_dynamic_route(&self.db, &subdomain, record.port as i64, Some(&session.id), &site.name)
            .await?;

        Ok(())
    }

    /// §4.6 `commit`: stage and commit whatever changed in the session's
    /// checkout. An empty diff is a no-op that returns `""` (L2).
    pub async fn commit(
        &self,
        session_id: &str,
        message: Option<&str>,
        author: Option<&str>,
    ) -> Result<String, SessionError> {
        let _guard = self.lock_for(session_id).lock().await;
        let session = repo::get_session(&self.db, session_id)
            .await?
            .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))?;
        let site = repo::get_site_by_name(&self.db, &session.site_name)
            .await?
            .ok_or_else(|| SessionError::SiteNotFound(session.site_name.clone()))?;

        let site_path = Path::new(&site.path);
        self.git.checkout(site_path, &session.branch_name).await?;
        let hash = self.git.commit(site_path, message, author).await?;

        if hash.is_empty() {
            return Ok(hash);
        }

        repo::record_commit(&self.db, session_id, &hash, message.unwrap_or("Update"), author).await?;
        repo::touch_session_activity(&self.db, session_id).await?;

        if self.sessions_config.restart_on_save {
            if let Some(container_name) = session.container_name.as_deref() {
                self.restart_preview(&site, &session, container_name).await;
            }
        }

        Ok(hash)
    }

    async fn restart_preview(&self, site: &Site, session: &EditingSession, container_name: &str) {
        let result = self
            .supervisor
            .restart(CreateRequest {
                site_name: site.name.clone(),
                site_path: Path::new(&site.path).to_path_buf(),
                role: ContainerRole::Preview,
                port_role: PortRole::Session,
                container_name: Some(container_name.to_string()),
                env: site.env_map().into_iter().collect(),
                mount_source: true,
            })
            .await;

        match result {
            Ok(record) => {
                self.supervisor.wait_healthy(record.port, Duration::from_secs(30)).await;
            }
            Err(e) => warn!(session_id = %session.id, error = %e, "preview restart after commit failed"),
        }
    }

    /// Whether saving `relative_path` in an active session needs a preview
    /// restart. The package manifest always restarts; anything else only
    /// restarts when the site has no dev-server watcher of its own.
    pub async fn on_file_saved(&self, session_id: &str, relative_path: &str) -> Result<(), SessionError> {
        let session = repo::get_session(&self.db, session_id)
            .await?
            .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))?;
        repo::touch_session_activity(&self.db, session_id).await?;

        if !self.sessions_config.restart_on_save {
            return Ok(());
        }

        let site = repo::get_site_by_name(&self.db, &session.site_name)
            .await?
            .ok_or_else(|| SessionError::SiteNotFound(session.site_name.clone()))?;
        let site_path = Path::new(&site.path);

        let is_manifest = relative_path == "package.json";
        if !is_manifest && has_file_watching(site_path).await {
            return Ok(());
        }

        if let Some(container_name) = session.container_name.clone() {
            self.restart_preview(&site, &session, &container_name).await;
        }
        Ok(())
    }

    /// §4.6 `deploy`: merge the session's branch into main and rebuild the
    /// production container. Leaves the branch intact on failure so the
    /// user can retry without losing work.
    pub async fn deploy(&self, session_id: &str) -> Result<(), SessionError> {
        let _guard = self.lock_for(session_id).lock().await;
        let session = repo::get_session(&self.db, session_id)
            .await?
            .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))?;
        let site = repo::get_site_by_name(&self.db, &session.site_name)
            .await?
            .ok_or_else(|| SessionError::SiteNotFound(session.site_name.clone()))?;

        repo::set_session_status(&self.db, session_id, "deploying").await?;
        let site_path = Path::new(&site.path);

        let merge_result = self.git.merge_to_main(site_path, &session.branch_name).await;
        let merged_hash = match merge_result {
            Ok(hash) => hash,
            Err(e) => {
                error!(session_id, error = %e, "merge to main failed");
                repo::set_session_status(&self.db, session_id, "failed").await?;
                return Err(e.into());
            }
        };
        info!(session_id, hash = %merged_hash, site = %site.name, "merged edit branch to main");

        let build_result = self
            .supervisor
            .create(CreateRequest {
                site_name: site.name.clone(),
                site_path: site_path.to_path_buf(),
                role: ContainerRole::Production,
                port_role: PortRole::Production,
                container_name: Some(site.production_container_name()),
                env: site.env_map().into_iter().collect(),
                mount_source: false,
            })
            .await;

        match build_result {
            Ok(record) => {
                self.supervisor.wait_healthy(record.port, Duration::from_secs(30)).await;
                repo::update_site_status(
                    &self.db,
                    &site.name,
                    "running",
                    record.container_id.as_deref(),
                    Some(&record.name),
                    Some(record.port as i64),
                )
                .await?;
                repo::touch_last_deployed(&self.db, &site.name).await?;
            }
            Err(e) => {
                error!(session_id, error = %e, "production rebuild failed after merge");
                repo::update_site_status(&self.db, &site.name, "failed", None, None, None).await?;
                repo::set_session_status(&self.db, session_id, "failed").await?;
                return Err(e.into());
            }
        }

        self.cleanup_by_id(session_id).await;
        Ok(())
    }

    /// §4.6 `cancel`: the user walks away without deploying. Discards the
    /// branch once cleanup runs.
    pub async fn cancel(&self, session_id: &str) -> Result<(), SessionError> {
        let _guard = self.lock_for(session_id).lock().await;
        let session = repo::get_session(&self.db, session_id)
            .await?
            .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))?;
        repo::set_session_status(&self.db, session_id, "inactive").await?;
        self.cleanup(&session).await;
        Ok(())
    }

    async fn cleanup_by_id(&self, session_id: &str) {
        if let Ok(Some(session)) = repo::get_session(&self.db, session_id).await {
            self.cleanup(&session).await;
        }
    }

    /// §4.6 `cleanup`: deregister the route, stop the preview container,
    /// delete the branch, delete the session row. Every step is best-effort
    /// so one failure doesn't block the rest.
    async fn cleanup(&self, session: &EditingSession) {
        self.proxy.remove_route(&session.id);
        if let Err(e) = repo::remove_dynamic_route_for_session(&self.db, &session.id).await {
            warn!(session_id = %session.id, error = %e, "failed to remove persisted route");
        }

        if let Some(container_name) = session.container_name.as_deref() {
            if let Err(e) = self.supervisor.stop(container_name).await {
                warn!(session_id = %session.id, container_name, error = %e, "failed to stop preview container");
            }
        }

        if let Ok(Some(site)) = repo::get_site_by_name(&self.db, &session.site_name).await {
            let site_path = Path::new(&site.path);
            let force = matches!(session.status.as_str(), "inactive" | "failed");
            if let Err(e) = self.git.delete_branch(site_path, &session.branch_name, force).await {
                warn!(session_id = %session.id, branch = %session.branch_name, error = %e, "failed to delete session branch");
            }
        }

        if let Err(e) = repo::delete_session(&self.db, &session.id).await {
            warn!(session_id = %session.id, error = %e, "failed to delete session row");
        }
    }

    pub async fn update_activity(&self, session_id: &str) -> Result<(), SessionError> {
        repo::touch_session_activity(&self.db, session_id).await?;
        Ok(())
    }

    /// Runs every `sweep_interval_secs`: reclaims sessions past `expires_at`
    /// and purges stale proxy routes. Intended to be spawned once at
    /// startup and left running for the life of the process.
    pub async fn sweep_once(&self) -> usize {
        let now = chrono::Utc::now().to_rfc3339();
        let expired = match repo::list_expired_sessions(&self.db, &now).await {
            Ok(sessions) => sessions,
            Err(e) => {
                error!(error = %e, "sweeper failed to list expired sessions");
                return 0;
            }
        };

        let count = expired.len();
        for session in expired {
            info!(session_id = %session.id, "sweeper reclaiming expired session");
            self.cleanup(&session).await;
        }

        let purged = self.proxy.cleanup_expired(Duration::from_secs(self.sessions_config.ttl_secs * 2), chrono::Utc::now().timestamp());
        if purged > 0 {
            info!(purged, "sweeper purged stale proxy routes");
        }

        count
    }

    pub fn spawn_sweeper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_secs(self.sessions_config.sweep_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.sweep_once().await;
            }
        })
    }
}

/// Capability probe for the restart-on-save policy: does the site's own
/// tooling already watch the filesystem and hot-reload? We look for a
/// conventional `dev` script or a known watcher dependency rather than
/// actually inspecting the running process.
async fn has_file_watching(site_path: &Path) -> bool {
    let manifest_path = site_path.join("package.json");
    let Ok(content) = tokio::fs::read_to_string(&manifest_path).await else {
        return false;
    };
    let Ok(value) = serde_json::from_str::<serde_json::Value>(&content) else {
        return false;
    };

    if value.get("scripts").and_then(|s| s.get("dev")).is_some() {
        return true;
    }

    const WATCHERS: &[&str] = &["nodemon", "vite", "next", "nuxt", "webpack-dev-server"];
    for section in ["dependencies", "devDependencies"] {
        if let Some(deps) = value.get(section).and_then(|d| d.as_object()) {
            if WATCHERS.iter().any(|w| deps.contains_key(*w)) {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PortsConfig, ProxyConfig as PCfg, SessionsConfig as SCfg};
    use crate::db::repo::NewSite;
    use crate::engine::ports::PortAllocator;
    use crate::runtime::NoopRuntime;
    use tempfile::TempDir;

    async fn make_manager() -> (TempDir, TempDir, Arc<SessionManager>, DbPool) {
        let data_dir = TempDir::new().unwrap();
        let db = crate::db::init(data_dir.path()).await.unwrap();

        let site_dir = TempDir::new().unwrap();
        tokio::fs::write(site_dir.path().join("index.html"), "<html></html>").await.unwrap();

        let ports = PortAllocator::new(PortsConfig::default());
        let runtime = Arc::new(NoopRuntime);
        let supervisor = Arc::new(ContainerSupervisor::new(runtime, ports));
        let proxy_config = PCfg {
            base_domain: Some("example.test".to_string()),
            external_config_path: data_dir.path().join("Caddyfile"),
            ..Default::default()
        };
        let proxy = ProxyOrchestrator::new(proxy_config.clone(), 7000);
        let sessions_config = SCfg { max_sessions_per_user: 2, ..Default::default() };

        let manager = Arc::new(SessionManager::new(
            db.clone(),
            GitWorkspace::new(),
            supervisor,
            proxy,
            proxy_config,
            sessions_config,
        ));

        repo::create_site(
            &db,
            NewSite {
                name: "blog".to_string(),
                path: site_dir.path().to_string_lossy().to_string(),
                git_url: None,
                owner_user_id: "local".to_string(),
                visibility: "public".to_string(),
            },
        )
        .await
        .unwrap();

        (data_dir, site_dir, manager, db)
    }

    #[tokio::test]
    async fn start_creates_branch_and_preview_route() {
        let (_data_dir, _site_dir, manager, db) = make_manager().await;
        let session = manager.start("alice", "blog").await.unwrap();
        assert_eq!(session.status, "active");
        assert!(session.container_name.is_some());
        assert!(repo::get_active_session(&db, "alice", "blog").await.unwrap().is_some());
        assert_eq!(manager.proxy.routes().len(), 1);
    }

    #[tokio::test]
    async fn second_start_for_same_user_site_is_rejected() {
        let (_data_dir, _site_dir, manager, _db) = make_manager().await;
        manager.start("alice", "blog").await.unwrap();
        let err = manager.start("alice", "blog").await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyActive));
    }

    #[tokio::test]
    async fn cancel_tears_down_session_and_route() {
        let (_data_dir, _site_dir, manager, db) = make_manager().await;
        let session = manager.start("alice", "blog").await.unwrap();
        manager.cancel(&session.id).await.unwrap();
        assert!(repo::get_session(&db, &session.id).await.unwrap().is_none());
        assert!(manager.proxy.routes().is_empty());
    }

    #[tokio::test]
    async fn commit_with_no_changes_is_a_no_op() {
        let (_data_dir, _site_dir, manager, _db) = make_manager().await;
        let session = manager.start("alice", "blog").await.unwrap();
        let hash = manager.commit(&session.id, None, None).await.unwrap();
        assert_eq!(hash, "");
    }
}
