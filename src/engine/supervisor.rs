//! Container Supervisor (§4.4 C4).
//!
//! Central state machine for every `Container`: build, run, health-probe,
//! stop, cleanup. Per-container operations serialize on a per-name mutex;
//! different containers run fully in parallel (§5). The authoritative
//! source for "is it running" is always the runtime, never the in-memory
//! table — the table is a cache rehydrated by `discover()` at startup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::process::Child;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

use super::build_plan::{self, SiteType, Strategy};
use super::ports::{PortAllocator, PortRole};
use crate::runtime::{BuildContext, ContainerRuntime, RunConfig};

const BUILD_TIMEOUT: Duration = Duration::from_secs(600);
const HEALTH_PROBE_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("build failed for {name}: {source}")]
    Build { name: String, #[source] source: anyhow::Error },
    #[error("runtime error for {name}: {source}")]
    Runtime { name: String, #[source] source: anyhow::Error },
    #[error("no port available for {name}")]
    NoPort { name: String },
    #[error("build timed out after {secs}s for {name}")]
    Timeout { name: String, secs: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRole {
    Production,
    Preview,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Building,
    Running,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ContainerRecord {
    pub name: String,
    pub site_path: String,
    pub role: ContainerRole,
    pub port: u16,
    pub status: ContainerStatus,
    pub strategy: Strategy,
    pub image_tag: Option<String>,
    pub container_id: Option<String>,
}

pub struct CreateRequest {
    pub site_name: String,
    pub site_path: PathBuf,
    pub role: ContainerRole,
    pub port_role: PortRole,
    /// Overrides the default `<name>-<role>` container naming (used for
    /// preview sessions: `<branch>-<site>-preview`).
    pub container_name: Option<String>,
    pub env: Vec<(String, String)>,
    pub mount_source: bool,
}

/// Tracks a spawned `basic`-strategy child process; has no container
/// identity to hand the runtime trait, so it's tracked one layer up here.
struct BasicProcess {
    child: Child,
}

pub struct ContainerSupervisor {
    runtime: Arc<dyn ContainerRuntime>,
    ports: PortAllocator,
    table: DashMap<String, ContainerRecord>,
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
    basic_processes: DashMap<String, BasicProcess>,
    http: reqwest::Client,
}

impl ContainerSupervisor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, ports: PortAllocator) -> Self {
        Self {
            runtime,
            ports,
            table: DashMap::new(),
            locks: DashMap::new(),
            basic_processes: DashMap::new(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(2))
                .build()
                .expect("reqwest client"),
        }
    }

    fn lock_for(&self, name: &str) -> Arc<AsyncMutex<()>> {
        self.locks.entry(name.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// Build and run a container for `req`. See §4.4 steps 1-6.
    pub async fn create(&self, req: CreateRequest) -> Result<ContainerRecord, SupervisorError> {
        let name = req
            .container_name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", req.site_name, role_suffix(req.role)));

        let lock = self.lock_for(&name);
        let _guard = lock.lock().await;

        self.table.insert(
            name.clone(),
            ContainerRecord {
                name: name.clone(),
                site_path: req.site_path.to_string_lossy().to_string(),
                role: req.role,
                port: 0,
                status: ContainerStatus::Building,
                strategy: Strategy::Basic,
                image_tag: None,
                container_id: None,
            },
        );

        // Best-effort stop+remove any pre-existing container of this name
        // before creating (§4.4 step 4); errors are logged and flow continues.
        // Runs under the guard already held above rather than through
        // `stop()`, which would re-enter this same per-name lock; it also
        // leaves the port allocation untouched so the allocate() call below
        // hands back the same port this name already held instead of racing
        // a concurrent create for a different name into it.
        self.stop_locked(&name).await;

        let port = self
            .ports
            .allocate(&name, req.port_role)
            .ok_or_else(|| SupervisorError::NoPort { name: name.clone() })?;

        let plan = build_plan::resolve(&req.site_path).await;
        let strategy = plan.strategy.unwrap_or(Strategy::Basic);

        let result = match strategy {
            Strategy::Docker => self.create_docker(&req, &name, port).await,
            Strategy::Plan => match self.create_plan(&req, &name, port, &plan).await {
                Ok(record) => Ok(record),
                Err(e) => {
                    warn!(name = %name, error = %e, "plan build failed, falling back to basic");
                    self.create_basic(&req, &name, port, &plan).await
                }
            },
            Strategy::Basic => self.create_basic(&req, &name, port, &plan).await,
        };

        match result {
            Ok(record) => {
                self.table.insert(name.clone(), record.clone());
                Ok(record)
            }
            Err(e) => {
                self.table.alter(&name, |_, mut r| {
                    r.status = ContainerStatus::Failed;
                    r
                });
                self.ports.release(&name);
                Err(e)
            }
        }
    }

    async fn create_docker(
        &self,
        req: &CreateRequest,
        name: &str,
        port: u16,
    ) -> Result<ContainerRecord, SupervisorError> {
        let image_tag = format!("deploy-{}:latest", name);

        let build_ctx = BuildContext {
            path: req.site_path.to_string_lossy().to_string(),
            dockerfile: "Dockerfile".to_string(),
            tag: image_tag.clone(),
            build_args: vec![],
            build_target: None,
            custom_options: None,
            cpu_limit: None,
            memory_limit: None,
        };

        let build = tokio::time::timeout(BUILD_TIMEOUT, self.runtime.build(&build_ctx)).await;
        match build {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(SupervisorError::Build { name: name.to_string(), source: e }),
            Err(_) => {
                return Err(SupervisorError::Timeout {
                    name: name.to_string(),
                    secs: BUILD_TIMEOUT.as_secs(),
                })
            }
        }

        let run_config = self.run_config(req, name, port, &image_tag);
        let container_id = self
            .runtime
            .run(&run_config)
            .await
            .map_err(|e| SupervisorError::Runtime { name: name.to_string(), source: e })?;

        Ok(ContainerRecord {
            name: name.to_string(),
            site_path: req.site_path.to_string_lossy().to_string(),
            role: req.role,
            port,
            status: ContainerStatus::Running,
            strategy: Strategy::Docker,
            image_tag: Some(image_tag),
            container_id: Some(container_id),
        })
    }

    async fn create_plan(
        &self,
        req: &CreateRequest,
        name: &str,
        port: u16,
        plan: &build_plan::BuildPlan,
    ) -> Result<ContainerRecord, SupervisorError> {
        let image_tag = format!("deploy-{}:latest", name);

        if let Some(install) = &plan.install_cmd {
            run_shell(&req.site_path, install).await.map_err(|e| SupervisorError::Build {
                name: name.to_string(),
                source: e,
            })?;
        }
        if let Some(build_cmd) = &plan.build_cmd {
            run_shell(&req.site_path, build_cmd).await.map_err(|e| SupervisorError::Build {
                name: name.to_string(),
                source: e,
            })?;
        }

        // Nixpacks/railpack emit an image from the phases graph; building via
        // the generic docker path keeps one code path for "image produced,
        // now run it" regardless of which plan tool generated it.
        let build_ctx = BuildContext {
            path: req.site_path.to_string_lossy().to_string(),
            dockerfile: String::new(),
            tag: image_tag.clone(),
            build_args: vec![],
            build_target: None,
            custom_options: None,
            cpu_limit: None,
            memory_limit: None,
        };
        let built = self.runtime.build(&build_ctx).await;
        if built.is_err() {
            return Err(SupervisorError::Build {
                name: name.to_string(),
                source: anyhow::anyhow!("plan-based image build failed"),
            });
        }

        let run_config = self.run_config(req, name, port, &image_tag);
        let container_id = self
            .runtime
            .run(&run_config)
            .await
            .map_err(|e| SupervisorError::Runtime { name: name.to_string(), source: e })?;

        Ok(ContainerRecord {
            name: name.to_string(),
            site_path: req.site_path.to_string_lossy().to_string(),
            role: req.role,
            port,
            status: ContainerStatus::Running,
            strategy: Strategy::Plan,
            image_tag: Some(image_tag),
            container_id: Some(container_id),
        })
    }

    /// `basic` strategy: no image, an inline process serving the site
    /// directly (a static file server, or the site's declared start
    /// command), tracked in the same table so callers of `is_running`/`stop`
    /// don't need to distinguish it from a container.
    async fn create_basic(
        &self,
        req: &CreateRequest,
        name: &str,
        port: u16,
        plan: &build_plan::BuildPlan,
    ) -> Result<ContainerRecord, SupervisorError> {
        if let Some(install) = &plan.install_cmd {
            if plan.site_type != Some(SiteType::Static) {
                let _ = run_shell(&req.site_path, install).await;
            }
        }
        if let Some(build_cmd) = &plan.build_cmd {
            run_shell(&req.site_path, build_cmd).await.map_err(|e| SupervisorError::Build {
                name: name.to_string(),
                source: e,
            })?;
        }

        let serve_dir = plan
            .publish_dir
            .as_ref()
            .map(|d| req.site_path.join(d))
            .filter(|p| p.is_dir())
            .unwrap_or_else(|| req.site_path.clone());

        let start_cmd = plan.start_cmd.clone().unwrap_or_else(|| {
            format!("python3 -m http.server {} --directory {}", port, serve_dir.display())
        });

        let mut parts = start_cmd.split_whitespace();
        let program = parts.next().ok_or_else(|| SupervisorError::Build {
            name: name.to_string(),
            source: anyhow::anyhow!("empty start command"),
        })?;

        let child = tokio::process::Command::new(program)
            .args(parts)
            .current_dir(&req.site_path)
            .envs(req.env.iter().cloned())
            .env("PORT", port.to_string())
            .env("NODE_ENV", node_env_for(req.role))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::Runtime { name: name.to_string(), source: e.into() })?;

        self.basic_processes.insert(name.to_string(), BasicProcess { child });

        Ok(ContainerRecord {
            name: name.to_string(),
            site_path: req.site_path.to_string_lossy().to_string(),
            role: req.role,
            port,
            status: ContainerStatus::Running,
            strategy: Strategy::Basic,
            image_tag: None,
            container_id: None,
        })
    }

    fn run_config(&self, req: &CreateRequest, name: &str, port: u16, image: &str) -> RunConfig {
        let mut env = req.env.clone();
        env.push(("PORT".to_string(), port.to_string()));
        env.push(("NODE_ENV".to_string(), node_env_for(req.role).to_string()));
        if req.role == ContainerRole::Preview {
            env.push(("SITE_PREVIEW".to_string(), "1".to_string()));
        }

        let binds = if req.mount_source {
            vec![format!("{}:/app:rw", req.site_path.display())]
        } else {
            vec![]
        };

        RunConfig {
            image: image.to_string(),
            name: name.to_string(),
            port,
            env,
            memory_limit: None,
            cpu_limit: None,
            port_mappings: vec![],
            network_aliases: vec![],
            extra_hosts: vec![],
            labels: HashMap::from([("deploy.role".to_string(), role_suffix(req.role).to_string())]),
            binds,
        }
    }

    /// SIGTERM-equivalent stop with a 5s grace period, then force kill.
    /// Idempotent: stopping an unknown name is a no-op.
    pub async fn stop(&self, name: &str) -> Result<(), SupervisorError> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;
        self.stop_locked(name).await;
        self.ports.release(name);
        Ok(())
    }

    /// Stop+remove whatever is running under `name`, without acquiring
    /// `name`'s lock or releasing its port. Callers must already hold the
    /// per-name guard (from `lock_for`) before calling this.
    async fn stop_locked(&self, name: &str) {
        if let Some((_, mut proc)) = self.basic_processes.remove(name) {
            let _ = proc.child.start_kill();
            let _ = tokio::time::timeout(Duration::from_secs(5), proc.child.wait()).await;
        } else if let Some(record) = self.table.get(name) {
            if let Some(container_id) = &record.container_id {
                let _ = self.runtime.stop(container_id).await;
                let _ = self.runtime.remove(container_id).await;
            } else {
                let _ = self.runtime.stop(name).await;
                let _ = self.runtime.remove(name).await;
            }
        }

        if let Some(mut record) = self.table.get_mut(name) {
            record.status = ContainerStatus::Stopped;
        }
    }

    /// `stop` followed by `create` with the same request.
    pub async fn restart(&self, req: CreateRequest) -> Result<ContainerRecord, SupervisorError> {
        let name = req
            .container_name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", req.site_name, role_suffix(req.role)));
        self.stop(&name).await?;
        self.create(req).await
    }

    /// Authoritative liveness: always asks the runtime (or the process
    /// table for `basic`), never trusts the cached status alone.
    pub async fn is_running(&self, name: &str) -> bool {
        if let Some(mut proc) = self.basic_processes.get_mut(name) {
            return matches!(proc.child.try_wait(), Ok(None));
        }
        if let Some(record) = self.table.get(name) {
            if let Some(container_id) = &record.container_id {
                if let Ok(info) = self.runtime.inspect(container_id).await {
                    return info.running;
                }
            }
        }
        false
    }

    /// Poll `GET http://127.0.0.1:<port>/` until any response is received
    /// (2xx/3xx, or anything at all — liveness only) or `timeout` elapses.
    pub async fn wait_healthy(&self, port: u16, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let url = format!("http://127.0.0.1:{}/", port);

        loop {
            if self.http.get(&url).send().await.is_ok() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(HEALTH_PROBE_INTERVAL).await;
        }
    }

    /// Enumerate containers whose names end in `-production` or `-preview`
    /// and rehydrate the in-memory table from their port bindings. Runs
    /// once at startup (§4.4).
    pub async fn discover(&self) -> anyhow::Result<usize> {
        let mut found = 0;
        for suffix in ["-production", "-preview"] {
            let containers = self.runtime.list_containers("").await.unwrap_or_default();
            for container in containers.into_iter().filter(|c| c.name.ends_with(suffix)) {
                let Some(port) = container.port else { continue };
                let role = if suffix == "-production" {
                    ContainerRole::Production
                } else {
                    ContainerRole::Preview
                };
                self.table.insert(
                    container.name.clone(),
                    ContainerRecord {
                        name: container.name.clone(),
                        site_path: String::new(),
                        role,
                        port,
                        status: ContainerStatus::Running,
                        strategy: Strategy::Docker,
                        image_tag: None,
                        container_id: Some(container.id),
                    },
                );
                found += 1;
            }
        }
        info!(count = found, "container supervisor discovery complete");
        Ok(found)
    }

    pub fn get(&self, name: &str) -> Option<ContainerRecord> {
        self.table.get(name).map(|r| r.clone())
    }
}

fn role_suffix(role: ContainerRole) -> &'static str {
    match role {
        ContainerRole::Production => "production",
        ContainerRole::Preview => "preview",
    }
}

fn node_env_for(role: ContainerRole) -> &'static str {
    match role {
        ContainerRole::Production => "production",
        ContainerRole::Preview => "development",
    }
}

async fn run_shell(dir: &std::path::Path, cmd: &str) -> anyhow::Result<()> {
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .current_dir(dir)
        .output()
        .await?;
    if !output.status.success() {
        anyhow::bail!(
            "command `{}` failed: {}",
            cmd,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortsConfig;
    use crate::runtime::NoopRuntime;

    fn supervisor() -> ContainerSupervisor {
        ContainerSupervisor::new(Arc::new(NoopRuntime), PortAllocator::new(PortsConfig::default()))
    }

    #[tokio::test]
    async fn create_basic_static_site_spawns_a_server_and_is_running() {
        let dir = tempfile::TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("index.html"), "<h1>hi</h1>").await.unwrap();

        let sup = supervisor();
        let record = sup
            .create(CreateRequest {
                site_name: "blog".to_string(),
                site_path: dir.path().to_path_buf(),
                role: ContainerRole::Production,
                port_role: PortRole::Production,
                container_name: None,
                env: vec![],
                mount_source: false,
            })
            .await
            .unwrap();

        assert_eq!(record.strategy, Strategy::Basic);
        assert!(sup.is_running("blog-production").await);
        sup.stop("blog-production").await.unwrap();
        assert!(!sup.is_running("blog-production").await);
    }

    #[tokio::test]
    async fn stop_is_idempotent_on_unknown_name() {
        let sup = supervisor();
        sup.stop("nonexistent-production").await.unwrap();
        sup.stop("nonexistent-production").await.unwrap();
    }
}
