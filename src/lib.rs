pub mod api;
pub mod config;
pub mod crypto;
pub mod db;
pub mod engine;
pub mod git;
pub mod proxy;
pub mod runtime;
pub mod startup;

pub use db::DbPool;

use std::sync::Arc;

use config::Config;
use engine::sessions::SessionManager;
use engine::supervisor::ContainerSupervisor;
use git::GitWorkspace;
use proxy::ProxyOrchestrator;

/// Shared handles to the seven components, passed to every route handler.
pub struct AppState {
    pub config: Config,
    pub db: DbPool,
    pub git: GitWorkspace,
    pub supervisor: Arc<ContainerSupervisor>,
    pub proxy: ProxyOrchestrator,
    pub sessions: Arc<SessionManager>,
}
