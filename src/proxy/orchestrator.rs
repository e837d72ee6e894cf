//! Proxy Orchestrator (§4.5 C5).
//!
//! Maintains the dynamic route set and serializes it, together with a fixed
//! base block, into the fronting proxy's configuration file (a Caddyfile).
//! Traffic itself is never proxied by this process — TLS termination and
//! request forwarding are the fronting proxy's job; we only write its
//! config and trigger a reload (§1 Non-goals, §6).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::config::ProxyConfig;

const RELOAD_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to write proxy config: {0}")]
    Write(#[source] std::io::Error),
    #[error("reload command failed: {0}")]
    ReloadFailed(String),
    #[error("reload timed out after {0}s")]
    Timeout(u64),
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DynamicRoute {
    pub subdomain: String,
    pub target_port: u16,
    pub session_id: Option<String>,
    pub site_name: String,
    pub created_at: i64,
}

struct Inner {
    routes: DashMap<String, DynamicRoute>,
    config: ProxyConfig,
    control_plane_port: u16,
    /// Serializes reload attempts; a caller arriving mid-reload awaits the
    /// one in flight instead of racing a second write (§4.5 debounce).
    reload_lock: Mutex<()>,
    pending: Mutex<bool>,
    notify: Notify,
}

/// Maintains and atomically reloads the fronting proxy's dynamic route set.
/// Cheaply cloneable; all clones share the same route table and debounce
/// state.
#[derive(Clone)]
pub struct ProxyOrchestrator {
    inner: Arc<Inner>,
}

impl ProxyOrchestrator {
    pub fn new(config: ProxyConfig, control_plane_port: u16) -> Self {
        let orchestrator = Self {
            inner: Arc::new(Inner {
                routes: DashMap::new(),
                config,
                control_plane_port,
                reload_lock: Mutex::new(()),
                pending: Mutex::new(false),
                notify: Notify::new(),
            }),
        };
        orchestrator.spawn_debounce_task();
        orchestrator
    }

    /// Insert a route by `session_id` key (or the site name for base
    /// production routes) and schedule a debounced reload.
    pub fn add_route(&self, key: String, route: DynamicRoute) {
        info!(key = %key, subdomain = %route.subdomain, port = route.target_port, "adding dynamic route");
        self.inner.routes.insert(key, route);
        self.schedule_reload();
    }

    pub fn remove_route(&self, key: &str) -> bool {
        let removed = self.inner.routes.remove(key).is_some();
        if removed {
            info!(key = %key, "removing dynamic route");
            self.schedule_reload();
        }
        removed
    }

    pub fn routes(&self) -> Vec<DynamicRoute> {
        self.inner.routes.iter().map(|r| r.value().clone()).collect()
    }

    /// Purge routes older than `max_age`; returns the count removed.
    pub fn cleanup_expired(&self, max_age: Duration, now: i64) -> usize {
        let cutoff = now - max_age.as_secs() as i64;
        let stale: Vec<String> = self
            .inner
            .routes
            .iter()
            .filter(|r| r.value().created_at < cutoff)
            .map(|r| r.key().clone())
            .collect();
        let count = stale.len();
        for key in stale {
            self.inner.routes.remove(&key);
        }
        if count > 0 {
            self.schedule_reload();
        }
        count
    }

    fn schedule_reload(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            *inner.pending.lock().await = true;
            inner.notify.notify_one();
        });
    }

    /// Debounce loop: wait for a mutation signal, then sleep the quiet
    /// period; if nothing new arrived, fire exactly one reload.
    fn spawn_debounce_task(&self) {
        let inner = self.inner.clone();
        let debounce = Duration::from_millis(inner.config.reload_debounce_ms);
        tokio::spawn(async move {
            loop {
                inner.notify.notified().await;
                loop {
                    tokio::time::sleep(debounce).await;
                    let mut pending = inner.pending.lock().await;
                    if *pending {
                        *pending = false;
                        drop(pending);
                        continue;
                    }
                    break;
                }
                let orchestrator = ProxyOrchestrator { inner: inner.clone() };
                if let Err(e) = orchestrator.reload().await {
                    error!(error = %e, "debounced proxy reload failed");
                }
            }
        });
    }

    /// Regenerate the config to a tempfile, fsync, rename into place, then
    /// reload the proxy. Atomic: on any failure the previous config remains
    /// live (§4.5, §9).
    pub async fn reload(&self) -> Result<(), ProxyError> {
        let _guard = self.inner.reload_lock.lock().await;

        let contents = self.render();
        let target = &self.inner.config.external_config_path;
        let tmp_path = target.with_extension("tmp");

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(ProxyError::Write)?;
        }

        let mut file = tokio::fs::File::create(&tmp_path).await.map_err(ProxyError::Write)?;
        use tokio::io::AsyncWriteExt;
        file.write_all(contents.as_bytes()).await.map_err(ProxyError::Write)?;
        file.sync_all().await.map_err(ProxyError::Write)?;
        drop(file);

        tokio::fs::rename(&tmp_path, target).await.map_err(ProxyError::Write)?;

        let reload = self.invoke_reload();
        match tokio::time::timeout(RELOAD_TIMEOUT, reload).await {
            Ok(Ok(())) => {
                debug!(path = %target.display(), "proxy config reloaded");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProxyError::Timeout(RELOAD_TIMEOUT.as_secs())),
        }
    }

    async fn invoke_reload(&self) -> Result<(), ProxyError> {
        let Some(command) = &self.inner.config.external_reload_command else {
            // No reload command configured: the file write alone is the
            // "reload" (tests, or a proxy that watches the file itself).
            return Ok(());
        };

        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|e| ProxyError::ReloadFailed(e.to_string()))?;

        if output.status.success() {
            return Ok(());
        }

        // Graceful reload failed; fall back to a plain reload signal before
        // giving up, per §4.5.
        warn!(command = %command, "graceful proxy reload failed, retrying once");
        let retry = tokio::process::Command::new("sh").arg("-c").arg(command).output().await;
        match retry {
            Ok(out) if out.status.success() => Ok(()),
            Ok(out) => Err(ProxyError::ReloadFailed(String::from_utf8_lossy(&out.stderr).to_string())),
            Err(e) => Err(ProxyError::ReloadFailed(e.to_string())),
        }
    }

    /// Ask the proxy if it's alive by probing its admin port.
    pub async fn health(&self) -> bool {
        let Some(base) = &self.inner.config.base_domain else { return true };
        let url = format!("http://{}/health", base);
        reqwest::Client::new()
            .get(&url)
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    /// Render the full Caddyfile: base block, root-domain route, wildcard
    /// fallback, then one block per dynamic route, sorted by subdomain for
    /// deterministic output (L3).
    fn render(&self) -> String {
        let config = &self.inner.config;
        let mut out = String::new();

        out.push_str(&render_base_block(config));
        out.push('\n');

        if let Some(base_domain) = &config.base_domain {
            out.push_str(&render_control_plane_block(base_domain, self.inner.control_plane_port));
            out.push('\n');
            out.push_str(&render_wildcard_block(base_domain, self.inner.control_plane_port));
            out.push('\n');
        }

        let mut sorted: BTreeMap<String, DynamicRoute> = BTreeMap::new();
        for r in self.inner.routes.iter() {
            sorted.insert(r.value().subdomain.clone(), r.value().clone());
        }

        for (_, route) in sorted {
            out.push_str(&render_dynamic_block(&route, config));
            out.push('\n');
        }

        out
    }
}

fn render_base_block(config: &ProxyConfig) -> String {
    format!(
        "{{\n\tadmin localhost:2019\n\tstorage file_system {{\n\t\troot {}\n\t}}\n\tlog {{\n\t\toutput stdout\n\t\tformat json\n\t}}\n}}\n",
        config.external_config_path.parent().unwrap_or(&PathBuf::from(".")).display()
    )
}

fn render_control_plane_block(base_domain: &str, control_plane_port: u16) -> String {
    format!(
        "{domain} {{\n{tls}\tencode gzip\n\theader {{\n\t\tX-Frame-Options DENY\n\t\tX-Content-Type-Options nosniff\n\t}}\n\treverse_proxy localhost:{port} {{\n\t\theader_up Host {{host}}\n\t\thealth_uri /healthz\n\t\thealth_interval 30s\n\t}}\n}}\n",
        domain = base_domain,
        tls = "",
        port = control_plane_port,
    )
}

fn render_wildcard_block(base_domain: &str, control_plane_port: u16) -> String {
    format!(
        "*.{domain} {{\n\tencode gzip\n\theader {{\n\t\tX-Frame-Options DENY\n\t\tX-Content-Type-Options nosniff\n\t}}\n\treverse_proxy localhost:{port} {{\n\t\theader_up Host {{host}}\n\t\thealth_uri /healthz\n\t\thealth_interval 30s\n\t}}\n}}\n",
        domain = base_domain,
        port = control_plane_port,
    )
}

fn render_dynamic_block(route: &DynamicRoute, config: &ProxyConfig) -> String {
    let tls_block = match (&config.tls_cert_path, &config.tls_key_path) {
        (Some(cert), Some(key)) => format!("\ttls {} {}\n", cert.display(), key.display()),
        _ => String::new(),
    };

    let csp = if route.session_id.is_some() {
        let base_domain = config.base_domain.as_deref().unwrap_or("localhost");
        format!(
            "\t\tContent-Security-Policy \"frame-ancestors 'self' https://editor.{}\"\n",
            base_domain
        )
    } else {
        String::new()
    };

    format!(
        "{subdomain} {{\n{tls}\tencode gzip\n\theader {{\n\t\tX-Frame-Options DENY\n\t\tX-Content-Type-Options nosniff\n{csp}\t}}\n\treverse_proxy localhost:{port} {{\n\t\theader_up Host {{host}}\n\t\thealth_uri /\n\t\thealth_interval 10s\n\t}}\n}}\n",
        subdomain = route.subdomain,
        tls = tls_block,
        csp = csp,
        port = route.target_port,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> ProxyConfig {
        let mut config = ProxyConfig::default();
        config.base_domain = Some("apps.example.com".to_string());
        config.external_config_path = dir.join("Caddyfile");
        config.reload_debounce_ms = 20;
        config
    }

    #[tokio::test]
    async fn reload_writes_base_and_wildcard_blocks() {
        let dir = tempfile::TempDir::new().unwrap();
        let orchestrator = ProxyOrchestrator::new(test_config(dir.path()), 8080);
        orchestrator.reload().await.unwrap();

        let contents = tokio::fs::read_to_string(dir.path().join("Caddyfile")).await.unwrap();
        assert!(contents.contains("apps.example.com"));
        assert!(contents.contains("*.apps.example.com"));
    }

    #[tokio::test]
    async fn add_route_then_remove_restores_config_modulo_ordering() {
        let dir = tempfile::TempDir::new().unwrap();
        let orchestrator = ProxyOrchestrator::new(test_config(dir.path()), 8080);
        orchestrator.reload().await.unwrap();
        let before = tokio::fs::read_to_string(dir.path().join("Caddyfile")).await.unwrap();

        orchestrator.add_route(
            "session-1".to_string(),
            DynamicRoute {
                subdomain: "edit-1-blog.apps.example.com".to_string(),
                target_port: 24001,
                session_id: Some("session-1".to_string()),
                site_name: "blog".to_string(),
                created_at: 1000,
            },
        );
        orchestrator.reload().await.unwrap();
        let during = tokio::fs::read_to_string(dir.path().join("Caddyfile")).await.unwrap();
        assert!(during.contains("edit-1-blog.apps.example.com"));
        assert!(during.contains("frame-ancestors"));

        orchestrator.remove_route("session-1");
        orchestrator.reload().await.unwrap();
        let after = tokio::fs::read_to_string(dir.path().join("Caddyfile")).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn rapid_route_churn_coalesces_into_final_state() {
        let dir = tempfile::TempDir::new().unwrap();
        let orchestrator = ProxyOrchestrator::new(test_config(dir.path()), 8080);

        for i in 0..3 {
            orchestrator.add_route(
                format!("session-{i}"),
                DynamicRoute {
                    subdomain: format!("s{i}.apps.example.com"),
                    target_port: 24000 + i,
                    session_id: Some(format!("session-{i}")),
                    site_name: "blog".to_string(),
                    created_at: 1000,
                },
            );
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        let contents = tokio::fs::read_to_string(dir.path().join("Caddyfile")).await.unwrap();
        for i in 0..3u16 {
            assert!(contents.contains(&format!("s{i}.apps.example.com")));
        }
    }

    #[test]
    fn cleanup_expired_purges_only_stale_routes() {
        let orchestrator = ProxyOrchestrator::new(
            {
                let mut c = ProxyConfig::default();
                c.base_domain = Some("apps.example.com".to_string());
                c
            },
            8080,
        );
        orchestrator.inner.routes.insert(
            "old".to_string(),
            DynamicRoute {
                subdomain: "old.apps.example.com".to_string(),
                target_port: 1,
                session_id: None,
                site_name: "x".to_string(),
                created_at: 0,
            },
        );
        orchestrator.inner.routes.insert(
            "new".to_string(),
            DynamicRoute {
                subdomain: "new.apps.example.com".to_string(),
                target_port: 2,
                session_id: None,
                site_name: "x".to_string(),
                created_at: 1000,
            },
        );
        let removed = orchestrator.cleanup_expired(Duration::from_secs(100), 1000);
        assert_eq!(removed, 1);
        assert!(orchestrator.routes().iter().any(|r| r.site_name == "x" && r.target_port == 2));
    }
}
