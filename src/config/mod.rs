use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub ports: PortsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,
    #[serde(default = "default_proxy_https_port")]
    pub proxy_https_port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// External base URL used to compose preview/site URLs when the host
    /// isn't reachable at its bind address (e.g. behind a fronting proxy).
    #[serde(default)]
    pub external_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            api_port: default_api_port(),
            proxy_port: default_proxy_port(),
            proxy_https_port: default_proxy_https_port(),
            data_dir: default_data_dir(),
            external_url: None,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_proxy_port() -> u16 {
    80
}

fn default_proxy_https_port() -> u16 {
    443
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Bearer token required on the admin API. Generated at random on first
    /// boot if not set, and logged once so it can be captured.
    #[serde(default = "default_admin_token")]
    pub admin_token: String,
    /// Key used to encrypt site environment variables at rest. If unset,
    /// env vars are stored in plaintext (`crate::crypto::encrypt_if_key_available`
    /// degrades gracefully).
    pub encryption_key: Option<String>,
    /// Plaintext admin password to hash into the settings row on first boot
    /// (only takes effect while that row's hash is still unset). Meant for
    /// bootstrapping a fresh data dir from an env var, not ongoing use.
    pub initial_admin_password: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            admin_token: default_admin_token(),
            encryption_key: None,
            initial_admin_password: None,
        }
    }
}

fn default_admin_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_runtime_type")]
    pub runtime_type: RuntimeType,
    #[serde(default = "default_docker_socket")]
    pub docker_socket: String,
    /// CPU limit applied to build containers (e.g. "2").
    #[serde(default = "default_build_cpu_limit")]
    pub build_cpu_limit: String,
    /// Memory limit applied to build containers (e.g. "2g").
    #[serde(default = "default_build_memory_limit")]
    pub build_memory_limit: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            runtime_type: default_runtime_type(),
            docker_socket: default_docker_socket(),
            build_cpu_limit: default_build_cpu_limit(),
            build_memory_limit: default_build_memory_limit(),
        }
    }
}

fn default_build_cpu_limit() -> String {
    "2".to_string()
}

fn default_build_memory_limit() -> String {
    "2g".to_string()
}

fn default_runtime_type() -> RuntimeType {
    RuntimeType::Auto
}

fn default_docker_socket() -> String {
    if cfg!(windows) {
        "npipe:////./pipe/docker_engine".to_string()
    } else {
        "/var/run/docker.sock".to_string()
    }
}

/// Which container engine backs the `docker`/`plan` build-plan strategies.
/// `basic` (spawned child process) is handled above this layer and doesn't
/// need a runtime at all.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    Auto,
    Docker,
    Podman,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout: u64,
    #[serde(default = "default_health_check_threshold")]
    pub health_check_threshold: u32,
    /// Base domain new sites/sessions get subdomains under (e.g.
    /// "apps.example.com" -> "my-site.apps.example.com").
    pub base_domain: Option<String>,
    /// Dev-mode TLS certificate/key, self-signed or provided. Production
    /// certificate acquisition is the fronting proxy's responsibility.
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    /// Path to the externally-consumed reverse-proxy config file this
    /// process regenerates whenever the route table changes.
    #[serde(default = "default_external_config_path")]
    pub external_config_path: PathBuf,
    /// Shell command run after a debounced external config rewrite, e.g.
    /// `"systemctl reload caddy"`. Left unset, only the file is rewritten.
    pub external_reload_command: Option<String>,
    /// Debounce window between a route-table change and the external
    /// config file being rewritten + reloaded.
    #[serde(default = "default_reload_debounce_ms")]
    pub reload_debounce_ms: u64,
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_health_check_timeout() -> u64 {
    5
}

fn default_health_check_threshold() -> u32 {
    3
}

fn default_external_config_path() -> PathBuf {
    PathBuf::from("./data/Caddyfile")
}

fn default_reload_debounce_ms() -> u64 {
    500
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            health_check_interval: default_health_check_interval(),
            health_check_timeout: default_health_check_timeout(),
            health_check_threshold: default_health_check_threshold(),
            base_domain: None,
            tls_cert_path: None,
            tls_key_path: None,
            external_config_path: default_external_config_path(),
            external_reload_command: None,
            reload_debounce_ms: default_reload_debounce_ms(),
        }
    }
}

impl ProxyConfig {
    /// Compose the public subdomain for a named site or session, if a base
    /// domain is configured.
    pub fn subdomain_for(&self, name: &str) -> Option<String> {
        self.base_domain.as_ref().map(|base| format!("{}.{}", name, base))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// C6 Editing Session Manager tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionsConfig {
    /// How long an editing session lives without activity before the
    /// sweeper reclaims it.
    #[serde(default = "default_session_ttl_secs")]
    pub ttl_secs: u64,
    /// Maximum concurrent active sessions a single user may hold (S6).
    #[serde(default = "default_max_sessions_per_user")]
    pub max_sessions_per_user: u32,
    /// Interval between sweeper passes.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Restart the preview container automatically after a commit so the
    /// running process picks up the new checkout.
    #[serde(default = "default_restart_on_save")]
    pub restart_on_save: bool,
}

fn default_session_ttl_secs() -> u64 {
    4 * 3600
}

fn default_max_sessions_per_user() -> u32 {
    5
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_restart_on_save() -> bool {
    true
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl_secs(),
            max_sessions_per_user: default_max_sessions_per_user(),
            sweep_interval_secs: default_sweep_interval_secs(),
            restart_on_save: default_restart_on_save(),
        }
    }
}

/// C3 Port Allocator ranges. Keeping production, preview, and session
/// allocations in disjoint bands means a leaked allocation in one role can
/// never collide with another's.
#[derive(Debug, Clone, Deserialize)]
pub struct PortsConfig {
    #[serde(default = "default_production_base")]
    pub production_base: u16,
    #[serde(default = "default_preview_base")]
    pub preview_base: u16,
    #[serde(default = "default_session_base")]
    pub session_base: u16,
    #[serde(default = "default_range_size")]
    pub range_size: u16,
}

fn default_production_base() -> u16 {
    20000
}

fn default_preview_base() -> u16 {
    24000
}

fn default_session_base() -> u16 {
    28000
}

fn default_range_size() -> u16 {
    4000
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            production_base: default_production_base(),
            preview_base: default_preview_base(),
            session_base: default_session_base(),
            range_size: default_range_size(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| "Failed to parse configuration file")?;
            Ok(config)
        } else {
            info!("No config file found, using defaults");
            Ok(Config::default())
        }
    }

    pub fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            runtime: RuntimeConfig::default(),
            proxy: ProxyConfig::default(),
            logging: LoggingConfig::default(),
            sessions: SessionsConfig::default(),
            ports: PortsConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_disjoint_port_ranges() {
        let ports = PortsConfig::default();
        assert!(ports.production_base + ports.range_size <= ports.preview_base);
        assert!(ports.preview_base + ports.range_size <= ports.session_base);
    }

    #[test]
    fn subdomain_for_requires_base_domain() {
        let mut proxy = ProxyConfig::default();
        assert_eq!(proxy.subdomain_for("my-site"), None);
        proxy.base_domain = Some("apps.example.com".to_string());
        assert_eq!(
            proxy.subdomain_for("my-site"),
            Some("my-site.apps.example.com".to_string())
        );
    }

    #[test]
    fn load_falls_back_to_defaults_when_missing() {
        let cfg = Config::load(Path::new("/nonexistent/portside.toml")).unwrap();
        assert_eq!(cfg.server.api_port, 8080);
    }
}
