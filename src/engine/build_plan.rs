//! Build Plan Resolver (§4.2 C2).
//!
//! Inspects a site directory and produces a `BuildPlan` describing how to
//! build and start it. Side-effect-free and idempotent: no file in the site
//! directory is ever written by this module.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::nixpacks;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SiteType {
    Static,
    StaticBuild,
    Dynamic,
}

/// How a container's image/process gets produced for a resolved plan (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Docker,
    Plan,
    Basic,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildPlan {
    pub site_type: Option<SiteType>,
    pub strategy: Option<Strategy>,
    pub framework: Option<String>,
    pub install_cmd: Option<String>,
    pub build_cmd: Option<String>,
    pub start_cmd: Option<String>,
    pub runtime_versions: Vec<(String, String)>,
    pub publish_dir: Option<String>,
}

impl BuildPlan {
    fn dockerfile(path_hint: Option<&str>) -> Self {
        Self {
            site_type: Some(SiteType::Dynamic),
            strategy: Some(Strategy::Docker),
            framework: path_hint.map(|s| s.to_string()),
            ..Default::default()
        }
    }
}

/// Marker file -> (framework, site_type, build_cmd, start_cmd, publish_dir).
/// SSG markers precede SSR markers precede plain index files, per §4.2 step 3.
const MARKERS: &[(&str, &str, SiteType, Option<&str>, Option<&str>, Option<&str>)] = &[
    ("astro.config.mjs", "astro", SiteType::StaticBuild, Some("npm run build"), None, Some("dist")),
    ("astro.config.ts", "astro", SiteType::StaticBuild, Some("npm run build"), None, Some("dist")),
    ("vite.config.ts", "vite", SiteType::StaticBuild, Some("npm run build"), None, Some("dist")),
    ("vite.config.js", "vite", SiteType::StaticBuild, Some("npm run build"), None, Some("dist")),
    ("gatsby-config.js", "gatsby", SiteType::StaticBuild, Some("npm run build"), None, Some("public")),
    ("next.config.js", "next", SiteType::Dynamic, Some("npm run build"), Some("npm run start"), None),
    ("next.config.mjs", "next", SiteType::Dynamic, Some("npm run build"), Some("npm run start"), None),
    ("nuxt.config.ts", "nuxt", SiteType::Dynamic, Some("npm run build"), Some("npm run start"), None),
    ("remix.config.js", "remix", SiteType::Dynamic, Some("npm run build"), Some("npm run start"), None),
    ("svelte.config.js", "sveltekit", SiteType::Dynamic, Some("npm run build"), Some("node build"), None),
];

/// Inspect `path` and resolve a `BuildPlan`. Order: explicit Dockerfile,
/// then an external plan tool (nixpacks), then the marker-file heuristic,
/// then bare `index.html`, then `package.json` scripts, else dynamic.
pub async fn resolve(path: &Path) -> BuildPlan {
    if path.join("Dockerfile").is_file() || path.join("Containerfile").is_file() {
        debug!(dir = %path.display(), "build plan: explicit Dockerfile");
        return BuildPlan::dockerfile(None);
    }

    if nixpacks::is_available().await {
        if let Ok(plan) = nixpacks::generate_plan(path).await {
            if let Some(resolved) = parse_nixpacks_plan(&plan) {
                debug!(dir = %path.display(), "build plan: resolved via nixpacks");
                return resolved;
            }
        }
    }

    for (marker, framework, site_type, build_cmd, start_cmd, publish_dir) in MARKERS {
        if path.join(marker).is_file() {
            debug!(dir = %path.display(), marker, "build plan: marker match");
            return BuildPlan {
                site_type: Some(*site_type),
                strategy: Some(if *site_type == SiteType::Dynamic {
                    Strategy::Plan
                } else {
                    Strategy::Basic
                }),
                framework: Some(framework.to_string()),
                install_cmd: Some(detect_install_cmd(path).await),
                build_cmd: build_cmd.map(|s| s.to_string()),
                start_cmd: start_cmd.map(|s| s.to_string()),
                publish_dir: publish_dir.map(|s| s.to_string()),
                runtime_versions: vec![],
            };
        }
    }

    if path.join("index.html").is_file() && !path.join("package.json").is_file() {
        debug!(dir = %path.display(), "build plan: bare index.html");
        return BuildPlan {
            site_type: Some(SiteType::Static),
            strategy: Some(Strategy::Basic),
            ..Default::default()
        };
    }

    if let Ok(contents) = tokio::fs::read_to_string(path.join("package.json")).await {
        if let Ok(pkg) = serde_json::from_str::<serde_json::Value>(&contents) {
            let scripts = pkg.get("scripts").cloned().unwrap_or_default();
            let build_cmd = scripts.get("build").and_then(|v| v.as_str());
            let start_cmd = scripts.get("start").and_then(|v| v.as_str());

            let site_type = if start_cmd.is_some() {
                SiteType::Dynamic
            } else if build_cmd.is_some() {
                SiteType::StaticBuild
            } else {
                SiteType::Dynamic
            };

            debug!(dir = %path.display(), ?site_type, "build plan: package.json scripts");
            return BuildPlan {
                site_type: Some(site_type),
                strategy: Some(if site_type == SiteType::Dynamic {
                    Strategy::Plan
                } else {
                    Strategy::Basic
                }),
                install_cmd: Some(detect_install_cmd(path).await),
                build_cmd: build_cmd.map(|_| "npm run build".to_string()),
                start_cmd: start_cmd.map(|_| "npm start".to_string()),
                publish_dir: Some("dist".to_string()),
                ..Default::default()
            };
        }
    }

    debug!(dir = %path.display(), "build plan: default dynamic");
    BuildPlan {
        site_type: Some(SiteType::Dynamic),
        strategy: Some(Strategy::Plan),
        ..Default::default()
    }
}

/// Package-manager precedence (§4.2): runtime-config file > bun lockfile >
/// yarn lockfile > pnpm lockfile > default npm.
async fn detect_install_cmd(path: &Path) -> String {
    if path.join(".nvmrc").is_file() || path.join(".node-version").is_file() {
        return "npm ci".to_string();
    }
    if path.join("bun.lockb").is_file() || path.join("bun.lock").is_file() {
        return "bun install".to_string();
    }
    if path.join("yarn.lock").is_file() {
        return "yarn install --frozen-lockfile".to_string();
    }
    if path.join("pnpm-lock.yaml").is_file() {
        return "pnpm install --frozen-lockfile".to_string();
    }
    "npm ci".to_string()
}

/// Best-effort parse of a nixpacks `plan --format json` document into a
/// `BuildPlan`. Nixpacks plans are keyed by phase name (`install`, `build`)
/// plus a top-level `start` command; absent or malformed fields fall back
/// to letting the caller continue down the heuristic chain.
fn parse_nixpacks_plan(json: &str) -> Option<BuildPlan> {
    let value: serde_json::Value = serde_json::from_str(json).ok()?;

    let phases = value.get("phases")?.as_object()?;
    let install_cmd = phase_cmd(phases, "install");
    let build_cmd = phase_cmd(phases, "build");
    let start_cmd = value
        .get("start")
        .and_then(|s| s.get("cmd"))
        .and_then(|c| c.as_str())
        .map(|s| s.to_string());

    let framework = phases.keys().find(|k| !matches!(k.as_str(), "install" | "build" | "setup")).cloned();

    // start_cmd referencing a server binary -> dynamic; build_cmd only ->
    // static-build; a start_cmd naming a reverse proxy (nginx/caddy/serve)
    // still counts as static-build since nothing dynamic is running.
    let site_type = match &start_cmd {
        Some(cmd) if is_static_server(cmd) => SiteType::StaticBuild,
        Some(_) => SiteType::Dynamic,
        None if build_cmd.is_some() => SiteType::StaticBuild,
        None => return None,
    };

    Some(BuildPlan {
        site_type: Some(site_type),
        strategy: Some(Strategy::Plan),
        framework,
        install_cmd,
        build_cmd,
        start_cmd,
        runtime_versions: vec![],
        publish_dir: None,
    })
}

fn phase_cmd(phases: &serde_json::Map<String, serde_json::Value>, name: &str) -> Option<String> {
    phases
        .get(name)?
        .get("cmds")?
        .as_array()?
        .iter()
        .filter_map(|c| c.as_str())
        .collect::<Vec<_>>()
        .first()
        .map(|s| s.to_string())
}

fn is_static_server(cmd: &str) -> bool {
    ["nginx", "caddy", "serve ", "http-server"].iter().any(|bin| cmd.contains(bin))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn dockerfile_wins_over_everything() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("Dockerfile"), "FROM scratch").await.unwrap();
        tokio::fs::write(dir.path().join("astro.config.mjs"), "").await.unwrap();
        let plan = resolve(dir.path()).await;
        assert_eq!(plan.site_type, Some(SiteType::Dynamic));
        assert_eq!(plan.strategy, Some(Strategy::Docker));
    }

    #[tokio::test]
    async fn bare_index_html_is_static() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("index.html"), "<h1>hi</h1>").await.unwrap();
        let plan = resolve(dir.path()).await;
        assert_eq!(plan.site_type, Some(SiteType::Static));
        assert_eq!(plan.strategy, Some(Strategy::Basic));
    }

    #[tokio::test]
    async fn ssg_marker_precedes_package_json_scripts() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("astro.config.mjs"), "").await.unwrap();
        tokio::fs::write(dir.path().join("package.json"), r#"{"scripts":{"start":"node server.js"}}"#)
            .await
            .unwrap();
        let plan = resolve(dir.path()).await;
        assert_eq!(plan.framework.as_deref(), Some("astro"));
        assert_eq!(plan.site_type, Some(SiteType::StaticBuild));
    }

    #[tokio::test]
    async fn package_json_with_start_script_is_dynamic() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(
            dir.path().join("package.json"),
            r#"{"scripts":{"build":"tsc","start":"node server.js"}}"#,
        )
        .await
        .unwrap();
        let plan = resolve(dir.path()).await;
        assert_eq!(plan.site_type, Some(SiteType::Dynamic));
    }

    #[tokio::test]
    async fn package_json_build_only_is_static_build() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("package.json"), r#"{"scripts":{"build":"vite build"}}"#)
            .await
            .unwrap();
        let plan = resolve(dir.path()).await;
        assert_eq!(plan.site_type, Some(SiteType::StaticBuild));
    }

    #[tokio::test]
    async fn empty_directory_falls_back_to_dynamic() {
        let dir = TempDir::new().unwrap();
        let plan = resolve(dir.path()).await;
        assert_eq!(plan.site_type, Some(SiteType::Dynamic));
    }

    #[tokio::test]
    async fn install_cmd_prefers_bun_lockfile_over_yarn() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("bun.lockb"), "").await.unwrap();
        tokio::fs::write(dir.path().join("yarn.lock"), "").await.unwrap();
        assert_eq!(detect_install_cmd(dir.path()).await, "bun install");
    }
}
