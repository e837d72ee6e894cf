//! Startup self-checks module
//!
//! Performs system verification before the server starts accepting requests:
//! - Database connectivity and schema
//! - Container runtime availability (Docker or Podman)
//! - Data directory exists and is writable

use anyhow::Result;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::{Config, RuntimeType};
use crate::runtime::{ContainerRuntime, DockerRuntime, PodmanRuntime};
use crate::DbPool;

/// Result of a single startup check
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    /// Whether failure should abort startup
    pub critical: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl CheckResult {
    pub fn pass(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            critical: false,
            message: message.into(),
            details: None,
        }
    }

    pub fn fail(name: impl Into<String>, message: impl Into<String>, critical: bool) -> Self {
        Self {
            name: name.into(),
            passed: false,
            critical,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StartupCheckReport {
    pub checks: Vec<CheckResult>,
    pub all_critical_passed: bool,
    pub all_passed: bool,
    pub summary: String,
}

impl StartupCheckReport {
    pub fn new(checks: Vec<CheckResult>) -> Self {
        let all_critical_passed = checks.iter().filter(|c| c.critical).all(|c| c.passed);
        let all_passed = checks.iter().all(|c| c.passed);
        let failed_critical = checks.iter().filter(|c| c.critical && !c.passed).count();
        let failed_non_critical = checks.iter().filter(|c| !c.critical && !c.passed).count();
        let total = checks.len();
        let passed = checks.iter().filter(|c| c.passed).count();

        let summary = if all_passed {
            format!("All {} startup checks passed", total)
        } else if all_critical_passed {
            format!(
                "{}/{} checks passed ({} non-critical warnings)",
                passed, total, failed_non_critical
            )
        } else {
            format!(
                "{}/{} checks passed ({} critical failures)",
                passed, total, failed_critical
            )
        };

        Self {
            checks,
            all_critical_passed,
            all_passed,
            summary,
        }
    }
}

pub async fn run_startup_checks(config: &Config, db: &DbPool) -> StartupCheckReport {
    info!("Running startup self-checks...");

    let checks = vec![
        check_database_connectivity(db).await,
        check_database_schema(db).await,
        check_container_runtime(config).await,
        check_required_directories(config),
        check_directory_writability(config),
    ];

    let report = StartupCheckReport::new(checks);

    for check in &report.checks {
        if check.passed {
            info!(check = %check.name, message = %check.message, "Startup check PASSED");
        } else if check.critical {
            error!(check = %check.name, message = %check.message, details = ?check.details, "Startup check FAILED (CRITICAL)");
        } else {
            warn!(check = %check.name, message = %check.message, details = ?check.details, "Startup check FAILED (non-critical)");
        }
    }

    info!(
        summary = %report.summary,
        all_passed = report.all_passed,
        all_critical_passed = report.all_critical_passed,
        "Startup checks completed"
    );

    report
}

async fn check_database_connectivity(db: &DbPool) -> CheckResult {
    match sqlx::query("SELECT 1").fetch_one(db).await {
        Ok(_) => CheckResult::pass("database_connectivity", "Database connection successful"),
        Err(e) => {
            CheckResult::fail("database_connectivity", "Failed to connect to database", true)
                .with_details(e.to_string())
        }
    }
}

async fn check_database_schema(db: &DbPool) -> CheckResult {
    let result: Result<Vec<(String,)>, _> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'")
            .fetch_all(db)
            .await;

    match result {
        Ok(tables) => {
            let table_names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
            let essential = ["sites", "editing_sessions", "branch_commits", "dynamic_routes", "settings"];
            let missing: Vec<&str> = essential
                .iter()
                .filter(|t| !table_names.contains(*t))
                .copied()
                .collect();

            if missing.is_empty() {
                CheckResult::pass(
                    "database_schema",
                    format!("Database schema valid ({} tables)", tables.len()),
                )
                .with_details(format!("Tables: {}", table_names.join(", ")))
            } else {
                CheckResult::fail("database_schema", "Missing essential database tables", true)
                    .with_details(format!("Missing: {}", missing.join(", ")))
            }
        }
        Err(e) => {
            CheckResult::fail("database_schema", "Failed to query database schema", true)
                .with_details(e.to_string())
        }
    }
}

async fn check_container_runtime(config: &Config) -> CheckResult {
    match config.runtime.runtime_type {
        RuntimeType::Docker => check_docker_runtime(&config.runtime.docker_socket).await,
        RuntimeType::Podman => check_podman_runtime().await,
        RuntimeType::Auto => {
            let docker_result = check_docker_runtime(&config.runtime.docker_socket).await;
            if docker_result.passed {
                return docker_result;
            }
            let podman_result = check_podman_runtime().await;
            if podman_result.passed {
                return podman_result;
            }
            CheckResult::fail(
                "container_runtime",
                "No container runtime available (Docker or Podman)",
                false,
            )
            .with_details("Install Docker or Podman to enable deployments")
        }
    }
}

async fn check_docker_runtime(docker_socket: &str) -> CheckResult {
    match DockerRuntime::new(docker_socket) {
        Ok(runtime) => {
            if runtime.is_available().await {
                CheckResult::pass("container_runtime", "Docker runtime available")
                    .with_details(format!("Socket: {}", docker_socket))
            } else {
                CheckResult::fail("container_runtime", "Docker daemon not responding", false)
                    .with_details(format!("Socket: {}", docker_socket))
            }
        }
        Err(e) => CheckResult::fail("container_runtime", "Failed to connect to Docker", false)
            .with_details(e.to_string()),
    }
}

async fn check_podman_runtime() -> CheckResult {
    let runtime = PodmanRuntime::new();
    if runtime.is_available().await {
        CheckResult::pass("container_runtime", "Podman runtime available")
    } else {
        CheckResult::fail("container_runtime", "Podman not available", false)
            .with_details("Podman command not found or not responding")
    }
}

fn check_required_directories(config: &Config) -> CheckResult {
    let data_dir = &config.server.data_dir;
    if data_dir.exists() {
        CheckResult::pass("required_directories", "Required directories exist")
            .with_details(format!("Data dir: {}", data_dir.display()))
    } else {
        CheckResult::fail("required_directories", "Missing required directories", true)
            .with_details(format!("Missing: {}", data_dir.display()))
    }
}

fn check_directory_writability(config: &Config) -> CheckResult {
    let data_dir = &config.server.data_dir;
    let test_file = data_dir.join(".portside_write_test");

    match std::fs::write(&test_file, "test") {
        Ok(_) => {
            let _ = std::fs::remove_file(&test_file);
            CheckResult::pass("directory_writability", "Data directory is writable")
                .with_details(format!("Path: {}", data_dir.display()))
        }
        Err(e) => CheckResult::fail("directory_writability", "Data directory is not writable", true)
            .with_details(format!("{}: {}", data_dir.display(), e)),
    }
}

/// Detailed system health status, served by `GET /api/health`.
pub async fn get_system_health(config: &Config, db: &DbPool) -> SystemHealthStatus {
    let db_check = check_database_connectivity(db).await;
    let database_healthy = db_check.passed;

    let runtime_check = check_container_runtime(config).await;
    let runtime_healthy = runtime_check.passed;

    let dir_check = check_directory_writability(config);

    SystemHealthStatus {
        healthy: database_healthy,
        database_healthy,
        runtime_healthy,
        checks: vec![db_check, runtime_check, dir_check],
        version: env!("CARGO_PKG_VERSION").to_string(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemHealthStatus {
    pub healthy: bool,
    pub database_healthy: bool,
    pub runtime_healthy: bool,
    pub checks: Vec<CheckResult>,
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_result_pass() {
        let result = CheckResult::pass("test", "Test passed");
        assert!(result.passed);
        assert!(!result.critical);
        assert_eq!(result.name, "test");
    }

    #[test]
    fn test_check_result_fail() {
        let result = CheckResult::fail("test", "Test failed", true);
        assert!(!result.passed);
        assert!(result.critical);
    }

    #[test]
    fn test_startup_check_report_all_passed() {
        let checks = vec![CheckResult::pass("check1", "ok"), CheckResult::pass("check2", "ok")];
        let report = StartupCheckReport::new(checks);
        assert!(report.all_passed);
        assert!(report.all_critical_passed);
    }

    #[test]
    fn test_startup_check_report_critical_failure() {
        let checks = vec![CheckResult::pass("check1", "ok"), CheckResult::fail("check2", "fail", true)];
        let report = StartupCheckReport::new(checks);
        assert!(!report.all_passed);
        assert!(!report.all_critical_passed);
    }

    #[test]
    fn test_startup_check_report_non_critical_failure() {
        let checks = vec![CheckResult::pass("check1", "ok"), CheckResult::fail("check2", "warn", false)];
        let report = StartupCheckReport::new(checks);
        assert!(!report.all_passed);
        assert!(report.all_critical_passed);
    }
}
